//! app-updater: self-update subsystem for desktop applications.
//!
//! Checks a release endpoint for a newer build, streams and verifies the
//! artifact while reporting progress, swaps it in atomically, and restarts
//! the process after running registered shutdown hooks.
//!
//! # Architecture
//!
//! - **Checker**: fetches the release manifest and compares versions (`semver`)
//! - **Installer**: streams the artifact via `reqwest`, verifies size and
//!   SHA-256, and renames it over the installed build
//! - **Restart**: runs shutdown hooks with per-hook timeouts, then relaunches
//! - **State machine**: the single owner of update state; every operation
//!   goes through it
//! - **Host**: versioned JSON envelopes over stdin/stdout for a native shell

pub mod app_dirs;
pub mod config;
pub mod error;
pub mod host;
pub mod update;

pub use config::UpdaterConfig;
pub use error::{CheckError, InstallError, RestartError, Result, TransitionError, UpdaterError};
pub use update::{
    DownloadEvent, UpdateMetadata, UpdateState, UpdateStateMachine, VersionChecker,
};
