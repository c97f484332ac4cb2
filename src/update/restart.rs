//! Orderly shutdown and relaunch after an update has been applied.
//!
//! Shutdown hooks run in registration order, each bounded by the configured
//! timeout. A hook that fails or overruns is logged and skipped; it never
//! blocks the restart.

use crate::error::RestartError;
use async_trait::async_trait;
use std::convert::Infallible;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Cleanup action run before the process is replaced.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Release held resources. The error text is logged only.
    async fn shutdown(&self) -> Result<(), String>;
}

/// Replaces the running process with a fresh instance.
pub trait Relaunch: Send + Sync {
    /// Does not return on success.
    fn relaunch(&self) -> Result<Infallible, RestartError>;
}

/// Outcome of one shutdown hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookReport {
    pub hook: String,
    pub outcome: Result<(), RestartError>,
}

/// Relaunches the executable at `exe` (default: the running one) with the
/// current arguments.
#[derive(Debug, Clone, Default)]
pub struct ProcessRelauncher {
    exe: Option<PathBuf>,
}

impl ProcessRelauncher {
    #[must_use]
    pub fn new(exe: Option<PathBuf>) -> Self {
        Self { exe }
    }
}

impl Relaunch for ProcessRelauncher {
    fn relaunch(&self) -> Result<Infallible, RestartError> {
        let exe = match &self.exe {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| {
                RestartError::RelaunchFailed(format!("cannot determine executable path: {e}"))
            })?,
        };
        let args: Vec<OsString> = std::env::args_os().skip(1).collect();
        info!(exe = %exe.display(), "relaunching");

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;

            // exec() only returns on failure.
            let err = std::process::Command::new(&exe).args(&args).exec();
            Err(RestartError::RelaunchFailed(format!(
                "exec {} failed: {err}",
                exe.display()
            )))
        }

        #[cfg(windows)]
        {
            std::process::Command::new(&exe)
                .args(&args)
                .spawn()
                .map_err(|e| {
                    RestartError::RelaunchFailed(format!("spawn {} failed: {e}", exe.display()))
                })?;
            std::process::exit(0);
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = args;
            Err(RestartError::RelaunchFailed(
                "relaunch is not supported on this platform".to_owned(),
            ))
        }
    }
}

/// Shared slot for a managed child process (e.g. a sidecar server).
pub type ChildSlot = Arc<tokio::sync::Mutex<Option<tokio::process::Child>>>;

/// Kills the child held in a [`ChildSlot`], if any.
pub struct ChildProcessHook {
    name: String,
    child: ChildSlot,
}

impl ChildProcessHook {
    pub fn new(name: impl Into<String>, child: ChildSlot) -> Self {
        Self {
            name: name.into(),
            child,
        }
    }
}

#[async_trait]
impl ShutdownHook for ChildProcessHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<(), String> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if let Ok(Some(status)) = child.try_wait() {
            info!(hook = %self.name, %status, "child process already exited");
            return Ok(());
        }
        child
            .kill()
            .await
            .map_err(|e| format!("cannot kill child process: {e}"))?;
        info!(hook = %self.name, "child process killed");
        Ok(())
    }
}

/// Runs shutdown hooks and relaunches the process.
pub struct RestartCoordinator {
    hooks: Mutex<Vec<Arc<dyn ShutdownHook>>>,
    hook_timeout: Duration,
    relauncher: Arc<dyn Relaunch>,
}

impl RestartCoordinator {
    pub fn new(hook_timeout: Duration, relauncher: Arc<dyn Relaunch>) -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            hook_timeout,
            relauncher,
        }
    }

    /// Add a hook. Hooks run in the order they were registered.
    pub fn register(&self, hook: Arc<dyn ShutdownHook>) {
        info!(hook = hook.name(), "shutdown hook registered");
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    #[must_use]
    pub fn hook_count(&self) -> usize {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run every hook once, in order, waiting for each to finish or time out.
    pub async fn run_shutdown_hooks(&self) -> Vec<HookReport> {
        let hooks: Vec<Arc<dyn ShutdownHook>> = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut reports = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let name = hook.name().to_owned();
            let outcome = match tokio::time::timeout(self.hook_timeout, hook.shutdown()).await {
                Ok(Ok(())) => {
                    info!(hook = %name, "shutdown hook completed");
                    Ok(())
                }
                Ok(Err(reason)) => {
                    warn!(hook = %name, %reason, "shutdown hook failed; continuing restart");
                    Err(RestartError::HookFailed {
                        hook: name.clone(),
                        reason,
                    })
                }
                Err(_) => {
                    warn!(
                        hook = %name,
                        timeout_ms = self.hook_timeout.as_millis() as u64,
                        "shutdown hook timed out; continuing restart"
                    );
                    Err(RestartError::HookTimedOut { hook: name.clone() })
                }
            };
            reports.push(HookReport {
                hook: name,
                outcome,
            });
        }
        reports
    }

    /// Run the shutdown hooks, then replace the process.
    ///
    /// Does not return on success.
    ///
    /// # Errors
    ///
    /// Returns [`RestartError::RelaunchFailed`] if the new process could not
    /// be started. Hook failures are never returned.
    pub async fn graceful_restart(&self) -> Result<Infallible, RestartError> {
        info!("graceful restart requested");
        let reports = self.run_shutdown_hooks().await;
        let failed = reports.iter().filter(|r| r.outcome.is_err()).count();
        info!(hooks = reports.len(), failed, "shutdown hooks finished");

        self.relauncher.relaunch().inspect_err(|e| {
            error!(error = %e, "relaunch failed");
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingHook {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        behaviour: Behaviour,
    }

    enum Behaviour {
        Succeed,
        Fail,
        Hang,
    }

    #[async_trait]
    impl ShutdownHook for RecordingHook {
        fn name(&self) -> &str {
            self.name
        }

        async fn shutdown(&self) -> Result<(), String> {
            self.log.lock().unwrap().push(self.name);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err("resource busy".to_owned()),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            }
        }
    }

    #[derive(Default)]
    struct CountingRelauncher {
        calls: AtomicUsize,
    }

    impl Relaunch for CountingRelauncher {
        fn relaunch(&self) -> Result<Infallible, RestartError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RestartError::RelaunchFailed("test relauncher".to_owned()))
        }
    }

    fn hook(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        behaviour: Behaviour,
    ) -> Arc<dyn ShutdownHook> {
        Arc::new(RecordingHook {
            name,
            log: Arc::clone(log),
            behaviour,
        })
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let coordinator =
            RestartCoordinator::new(Duration::from_secs(1), Arc::new(CountingRelauncher::default()));
        coordinator.register(hook("first", &log, Behaviour::Succeed));
        coordinator.register(hook("second", &log, Behaviour::Succeed));
        coordinator.register(hook("third", &log, Behaviour::Succeed));

        let reports = coordinator.run_shutdown_hooks().await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
        assert!(reports.iter().all(|r| r.outcome.is_ok()));
        assert_eq!(coordinator.hook_count(), 3);
    }

    #[tokio::test]
    async fn failing_and_hanging_hooks_do_not_block_restart() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let relauncher = Arc::new(CountingRelauncher::default());
        let coordinator = RestartCoordinator::new(Duration::from_millis(50), relauncher.clone());
        coordinator.register(hook("broken", &log, Behaviour::Fail));
        coordinator.register(hook("stuck", &log, Behaviour::Hang));
        coordinator.register(hook("last", &log, Behaviour::Succeed));

        let reports = coordinator.run_shutdown_hooks().await;
        assert_eq!(
            reports[0].outcome,
            Err(RestartError::HookFailed {
                hook: "broken".into(),
                reason: "resource busy".into()
            })
        );
        assert_eq!(
            reports[1].outcome,
            Err(RestartError::HookTimedOut {
                hook: "stuck".into()
            })
        );
        assert_eq!(reports[2].outcome, Ok(()));

        let result = coordinator.graceful_restart().await;
        assert!(matches!(result, Err(RestartError::RelaunchFailed(_))));
        assert_eq!(relauncher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_without_hooks_goes_straight_to_relaunch() {
        let relauncher = Arc::new(CountingRelauncher::default());
        let coordinator = RestartCoordinator::new(Duration::from_secs(1), relauncher.clone());
        let _ = coordinator.graceful_restart().await;
        assert_eq!(relauncher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_child_slot_is_a_no_op() {
        let slot: ChildSlot = Arc::new(tokio::sync::Mutex::new(None));
        let hook = ChildProcessHook::new("sidecar", slot);
        assert_eq!(hook.shutdown().await, Ok(()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_process_hook_kills_running_child() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let slot: ChildSlot = Arc::new(tokio::sync::Mutex::new(Some(child)));
        let hook = ChildProcessHook::new("sidecar", Arc::clone(&slot));

        assert_eq!(hook.shutdown().await, Ok(()));
        assert!(slot.lock().await.is_none());
    }

    #[test]
    fn relaunching_a_missing_binary_fails() {
        let relauncher = ProcessRelauncher::new(Some(PathBuf::from(
            "/nonexistent/app-updater-test-binary",
        )));
        assert!(matches!(
            relauncher.relaunch(),
            Err(RestartError::RelaunchFailed(_))
        ));
    }
}
