//! Update state machine.
//!
//! Owns the single [`UpdateState`] for the process and mediates every call
//! into the checker, installer and restart coordinator. Transitions are
//! compare-and-set under a short lock that is never held across an
//! `.await`, so concurrent callers sharing an `Arc` see exactly one winner
//! and everyone else gets a [`TransitionError`].
//!
//! ```text
//! Idle ─check─▶ Checking ─▶ UpToDate | Available ─install─▶ Downloading ─▶ Installing ─▶ Restarting
//!   ▲              │                       ▲                    │               │
//!   └── failure ───┘                       └─ download failed ──┘               ▼
//!   ▲                                          / cancelled                   Failed
//!   └──────────────────────── retry ────────────────────────────────────────────┘
//! ```

use crate::config::UpdaterConfig;
use crate::error::{InstallError, Result, TransitionError, UpdaterError};
use crate::update::checker::{HttpUpdateSource, UpdateMetadata, VersionChecker};
use crate::update::events::{AttemptEvent, AttemptId, DownloadEvent, download_channel};
use crate::update::installer::UpdateInstaller;
use crate::update::restart::{ProcessRelauncher, RestartCoordinator};
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where the update flow currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Checking,
    UpToDate,
    Available(UpdateMetadata),
    /// `downloaded` is the running sum of chunk lengths for this attempt.
    Downloading {
        downloaded: u64,
        total: Option<u64>,
    },
    Installing,
    Restarting,
    /// Recoverable; `retry_from_failed` returns to `Idle`.
    Failed(String),
}

impl UpdateState {
    #[must_use]
    pub fn kind(&self) -> UpdateStateKind {
        match self {
            Self::Idle => UpdateStateKind::Idle,
            Self::Checking => UpdateStateKind::Checking,
            Self::UpToDate => UpdateStateKind::UpToDate,
            Self::Available(_) => UpdateStateKind::Available,
            Self::Downloading { .. } => UpdateStateKind::Downloading,
            Self::Installing => UpdateStateKind::Installing,
            Self::Restarting => UpdateStateKind::Restarting,
            Self::Failed(_) => UpdateStateKind::Failed,
        }
    }

    /// An install attempt is in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Checking | Self::Downloading { .. } | Self::Installing | Self::Restarting
        )
    }
}

/// [`UpdateState`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStateKind {
    Idle,
    Checking,
    UpToDate,
    Available,
    Downloading,
    Installing,
    Restarting,
    Failed,
}

impl fmt::Display for UpdateStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::UpToDate => "up to date",
            Self::Available => "update available",
            Self::Downloading => "downloading",
            Self::Installing => "installing",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

struct Inner {
    state: UpdateState,
    attempt: AttemptId,
    /// Metadata of the in-flight attempt, restored on a retryable failure.
    pending: Option<UpdateMetadata>,
    cancel: Option<CancellationToken>,
    /// One unbounded queue per observer so no event is ever dropped.
    download_subscribers: Vec<mpsc::UnboundedSender<AttemptEvent>>,
}

/// Orchestrates checking, installing and restarting.
pub struct UpdateStateMachine {
    checker: VersionChecker,
    installer: UpdateInstaller,
    restart: Arc<RestartCoordinator>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<UpdateState>,
}

impl UpdateStateMachine {
    pub fn new(
        checker: VersionChecker,
        installer: UpdateInstaller,
        restart: Arc<RestartCoordinator>,
    ) -> Self {
        let (state_tx, _) = watch::channel(UpdateState::Idle);
        Self {
            checker,
            installer,
            restart,
            inner: Mutex::new(Inner {
                state: UpdateState::Idle,
                attempt: 0,
                pending: None,
                cancel: None,
                download_subscribers: Vec::new(),
            }),
            state_tx,
        }
    }

    /// Production wiring: HTTP source and fetcher, process relauncher.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP clients cannot be built.
    pub fn from_config(config: Arc<UpdaterConfig>) -> Result<Self> {
        let source = Arc::new(HttpUpdateSource::new(&config)?);
        let checker = VersionChecker::new(Arc::clone(&config), source);
        let installer = UpdateInstaller::http(Arc::clone(&config))?;
        let restart = Arc::new(RestartCoordinator::new(
            config.hook_timeout(),
            Arc::new(ProcessRelauncher::default()),
        ));
        Ok(Self::new(checker, installer, restart))
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> UpdateState {
        self.lock().state.clone()
    }

    /// Version of the running build.
    #[must_use]
    pub fn current_version(&self) -> &str {
        self.checker.current_version()
    }

    /// Id of the most recent install attempt (0 before the first).
    #[must_use]
    pub fn attempt(&self) -> AttemptId {
        self.lock().attempt
    }

    /// Register shutdown hooks here.
    #[must_use]
    pub fn restart_coordinator(&self) -> &Arc<RestartCoordinator> {
        &self.restart
    }

    /// Observe every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.state_tx.subscribe()
    }

    /// Observe accepted download events, stamped with their attempt.
    ///
    /// Every event accepted after this call is delivered in order; a slow
    /// observer only delays itself.
    #[must_use]
    pub fn subscribe_downloads(&self) -> mpsc::UnboundedReceiver<AttemptEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().download_subscribers.push(tx);
        rx
    }

    /// `Idle | UpToDate | Available → Checking → UpToDate | Available`.
    ///
    /// A failed check returns to `Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::Transition`] when called from any other state,
    /// or [`UpdaterError::Check`] when the check itself fails.
    pub async fn check_for_update(&self) -> Result<Option<UpdateMetadata>> {
        let attempt = {
            let mut inner = self.lock();
            match inner.state {
                UpdateState::Idle | UpdateState::UpToDate | UpdateState::Available(_) => {}
                ref other => return Err(reject("check_for_update", other)),
            }
            self.set_state(&mut inner, UpdateState::Checking);
            inner.attempt
        };
        let _guard = AbandonGuard {
            machine: self,
            attempt,
        };

        let result = self.checker.check_for_update().await;

        let mut inner = self.lock();
        match result {
            Ok(Some(metadata)) => {
                self.set_state(&mut inner, UpdateState::Available(metadata.clone()));
                Ok(Some(metadata))
            }
            Ok(None) => {
                self.set_state(&mut inner, UpdateState::UpToDate);
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "update check failed");
                self.set_state(&mut inner, UpdateState::Idle);
                Err(e.into())
            }
        }
    }

    /// `Available → Downloading → Installing → Restarting`, then restart.
    ///
    /// Does not return on success: the process is replaced.
    ///
    /// A download failure or cancellation returns to `Available`; a
    /// verification or apply failure moves to `Failed`. Either way the
    /// previously installed build stays active.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::Transition`] unless an update is available and
    /// no other attempt is in flight, [`UpdaterError::Install`] when the
    /// attempt fails, or [`UpdaterError::Restart`] if the relaunch fails.
    pub async fn install(&self) -> Result<Infallible> {
        let (metadata, attempt, cancel) = {
            let mut inner = self.lock();
            let metadata = match &inner.state {
                UpdateState::Available(metadata) => metadata.clone(),
                other => return Err(reject("install", other)),
            };
            inner.attempt += 1;
            let cancel = CancellationToken::new();
            inner.pending = Some(metadata.clone());
            inner.cancel = Some(cancel.clone());
            let total = metadata.artifact.size;
            self.set_state(
                &mut inner,
                UpdateState::Downloading {
                    downloaded: 0,
                    total,
                },
            );
            (metadata, inner.attempt, cancel)
        };
        let _guard = AbandonGuard {
            machine: self,
            attempt,
        };

        info!(attempt, version = %metadata.version, "install attempt started");
        let (events, mut receiver) = download_channel(attempt);
        let consume = async {
            while let Some(event) = receiver.recv().await {
                self.apply_download_event(attempt, event);
            }
        };
        let (downloaded, ()) =
            tokio::join!(self.installer.download(&metadata, events, &cancel), consume);

        let result = match downloaded {
            Ok(staged) => match self.begin_apply(attempt, &cancel) {
                Ok(()) => self.installer.apply(staged).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(installed) => {
                {
                    let mut inner = self.lock();
                    inner.pending = None;
                    inner.cancel = None;
                    self.set_state(&mut inner, UpdateState::Restarting);
                }
                info!(
                    attempt,
                    version = %installed.version,
                    path = %installed.path.display(),
                    "update installed; restarting"
                );
                self.restart_now().await
            }
            Err(e) => {
                self.fail_attempt(attempt, &e);
                Err(e.into())
            }
        }
    }

    /// Abort the in-flight download. Only possible before `Installing`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] unless the state is `Downloading`.
    pub fn cancel(&self) -> std::result::Result<(), TransitionError> {
        let inner = self.lock();
        match (&inner.state, &inner.cancel) {
            (UpdateState::Downloading { .. }, Some(token)) => {
                info!(attempt = inner.attempt, "cancelling download");
                token.cancel();
                Ok(())
            }
            (other, _) => Err(TransitionError {
                operation: "cancel",
                state: other.kind(),
            }),
        }
    }

    /// `Failed → Idle`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] unless the state is `Failed`.
    pub fn retry_from_failed(&self) -> std::result::Result<(), TransitionError> {
        let mut inner = self.lock();
        match inner.state {
            UpdateState::Failed(_) => {
                self.set_state(&mut inner, UpdateState::Idle);
                Ok(())
            }
            ref other => Err(TransitionError {
                operation: "retry_from_failed",
                state: other.kind(),
            }),
        }
    }

    /// Commit to the apply phase, unless a cancel got in first.
    ///
    /// `cancel` takes the same lock and only succeeds while `Downloading`,
    /// so exactly one of them wins.
    fn begin_apply(
        &self,
        attempt: AttemptId,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), InstallError> {
        let mut inner = self.lock();
        if attempt != inner.attempt || cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        inner.cancel = None;
        if !matches!(inner.state, UpdateState::Installing) {
            self.set_state(&mut inner, UpdateState::Installing);
        }
        Ok(())
    }

    /// Restart on explicit request, outside the install flow.
    ///
    /// Allowed whenever no check or install is in flight. Does not return
    /// on success.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::Transition`] while busy, or
    /// [`UpdaterError::Restart`] if the relaunch fails.
    pub async fn graceful_restart(&self) -> Result<Infallible> {
        let attempt = {
            let mut inner = self.lock();
            if inner.state.is_busy() {
                return Err(reject("graceful_restart", &inner.state));
            }
            self.set_state(&mut inner, UpdateState::Restarting);
            inner.attempt
        };
        let _guard = AbandonGuard {
            machine: self,
            attempt,
        };
        self.restart_now().await
    }

    /// Fold one download event into the state.
    ///
    /// Events from any attempt other than the current one are ignored.
    /// Returns whether the event was accepted.
    pub(crate) fn apply_download_event(&self, attempt: AttemptId, event: DownloadEvent) -> bool {
        let mut inner = self.lock();
        if attempt != inner.attempt {
            warn!(
                attempt,
                current = inner.attempt,
                ?event,
                "ignoring download event from a stale attempt"
            );
            return false;
        }

        let next = match (&inner.state, event) {
            (UpdateState::Downloading { total, .. }, DownloadEvent::Started { content_length }) => {
                UpdateState::Downloading {
                    downloaded: 0,
                    total: content_length.or(*total),
                }
            }
            (
                UpdateState::Downloading { downloaded, total },
                DownloadEvent::Progress { chunk_length },
            ) => UpdateState::Downloading {
                downloaded: downloaded.saturating_add(chunk_length),
                total: *total,
            },
            (UpdateState::Downloading { .. }, DownloadEvent::Finished) => UpdateState::Installing,
            (state, event) => {
                warn!(attempt, state = %state.kind(), ?event, "ignoring out-of-place download event");
                return false;
            }
        };

        if matches!(next, UpdateState::Installing) {
            self.set_state(&mut inner, next);
        } else {
            // Progress is too frequent for the transition log.
            inner.state = next.clone();
            self.state_tx.send_replace(next);
        }
        let stamped = AttemptEvent { attempt, event };
        inner
            .download_subscribers
            .retain(|tx| tx.send(stamped).is_ok());
        true
    }

    fn fail_attempt(&self, attempt: AttemptId, error: &InstallError) {
        let mut inner = self.lock();
        if attempt != inner.attempt {
            return;
        }
        inner.cancel = None;
        let pending = inner.pending.take();
        let next = match (error, pending) {
            (InstallError::DownloadFailed(_) | InstallError::Cancelled, Some(metadata)) => {
                warn!(attempt, error = %error, "download did not complete; update still available");
                UpdateState::Available(metadata)
            }
            _ => {
                warn!(attempt, error = %error, "install failed; keeping current version");
                UpdateState::Failed(error.to_string())
            }
        };
        self.set_state(&mut inner, next);
    }

    /// Put the state back when an operation's future is dropped before it
    /// could settle. Settled operations leave nothing to undo.
    fn abandon(&self, attempt: AttemptId) {
        let mut inner = self.lock();
        if attempt != inner.attempt {
            return;
        }
        let from = inner.state.kind();
        let next = match from {
            UpdateStateKind::Checking => UpdateState::Idle,
            UpdateStateKind::Downloading => match inner.pending.take() {
                Some(metadata) => UpdateState::Available(metadata),
                None => UpdateState::Idle,
            },
            UpdateStateKind::Installing | UpdateStateKind::Restarting => {
                UpdateState::Failed("update interrupted before restart".to_owned())
            }
            _ => return,
        };
        if let Some(token) = inner.cancel.take() {
            token.cancel();
        }
        inner.pending = None;
        warn!(attempt, %from, "update operation abandoned");
        self.set_state(&mut inner, next);
    }

    async fn restart_now(&self) -> Result<Infallible> {
        self.restart.graceful_restart().await.map_err(|e| {
            let mut inner = self.lock();
            self.set_state(&mut inner, UpdateState::Failed(e.to_string()));
            e.into()
        })
    }

    fn set_state(&self, inner: &mut Inner, next: UpdateState) {
        info!(from = %inner.state.kind(), to = %next.kind(), "update state changed");
        inner.state = next.clone();
        self.state_tx.send_replace(next);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs [`UpdateStateMachine::abandon`] when an operation's future ends,
/// however it ends.
struct AbandonGuard<'a> {
    machine: &'a UpdateStateMachine,
    attempt: AttemptId,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        self.machine.abandon(self.attempt);
    }
}

fn reject(operation: &'static str, state: &UpdateState) -> UpdaterError {
    warn!(operation, state = %state.kind(), "rejected update operation");
    TransitionError {
        operation,
        state: state.kind(),
    }
    .into()
}
