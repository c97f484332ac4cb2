//! Self-update subsystem.
//!
//! [`VersionChecker`] asks the release source whether a newer build exists,
//! [`UpdateInstaller`] downloads, verifies and atomically applies it while
//! reporting on a per-attempt [`DownloadEvent`] channel, and
//! [`RestartCoordinator`] runs shutdown hooks before relaunching.
//! [`UpdateStateMachine`] sequences all three and is the only component
//! that owns [`UpdateState`].

pub mod checker;
pub mod events;
pub mod installer;
pub mod restart;
pub mod state;
pub mod watcher;

pub use checker::{
    Artifact, HttpUpdateSource, ReleaseManifest, UpdateMetadata, UpdateSource, VersionChecker,
};
pub use events::{
    AttemptEvent, AttemptId, DownloadEvent, DownloadEventReceiver, DownloadEventSender,
    INSTALL_EVENT_CHANNEL, ProgressSender, download_channel,
};
pub use installer::{
    ArtifactFetcher, ChunkStream, HttpArtifactFetcher, InstalledUpdate, Payload, StagedUpdate,
    UpdateInstaller,
};
pub use restart::{
    ChildProcessHook, ChildSlot, HookReport, ProcessRelauncher, Relaunch, RestartCoordinator,
    ShutdownHook,
};
pub use state::{UpdateState, UpdateStateKind, UpdateStateMachine};
pub use watcher::UpdateWatcher;
