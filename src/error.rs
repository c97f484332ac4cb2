//! Error types for the self-update subsystem.
//!
//! Each stage has its own error enum so callers can match on the exact
//! failure class. [`UpdaterError`] wraps all of them for code that only
//! needs to propagate.

use crate::update::state::UpdateStateKind;

/// Failure to determine whether a newer build exists.
///
/// Never fatal: the state machine returns to `Idle` and the check can be
/// retried immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    /// Network or service failure on every configured endpoint.
    #[error("update source unreachable: {0}")]
    Unreachable(String),

    /// The source answered, but the manifest was unusable.
    #[error("invalid update manifest: {0}")]
    InvalidManifest(String),
}

/// Failure while downloading, verifying or applying an update.
///
/// Whatever the variant, the previously installed build is left intact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallError {
    /// Transfer failed or was interrupted before the payload was complete.
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// Payload was complete but did not match the expected size or digest.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Payload could not be moved over the installed build.
    #[error("apply failed: {0}")]
    ApplyFailed(String),

    /// Attempt was cancelled before the apply phase began.
    #[error("install cancelled")]
    Cancelled,
}

/// Diagnostic failures raised while restarting.
///
/// Hook failures are logged and never block the restart.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestartError {
    #[error("shutdown hook `{hook}` failed: {reason}")]
    HookFailed { hook: String, reason: String },

    #[error("shutdown hook `{hook}` timed out")]
    HookTimedOut { hook: String },

    /// The new process image could not be launched.
    #[error("relaunch failed: {0}")]
    RelaunchFailed(String),
}

/// An operation was invoked from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{operation}` is not allowed while {state}")]
pub struct TransitionError {
    pub operation: &'static str,
    pub state: UpdateStateKind,
}

/// Top-level error type for the updater crate.
#[derive(Debug, thiserror::Error)]
pub enum UpdaterError {
    #[error(transparent)]
    Check(#[from] CheckError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Restart(#[from] RestartError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpdaterError>;
