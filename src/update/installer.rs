//! Download, verify and apply an update.
//!
//! 1. Streams the artifact into a temp file next to the installed build,
//!    hashing as it goes and reporting each chunk on the attempt channel
//! 2. Verifies size and SHA-256, then emits `finished`
//! 3. Atomically renames the temp file over the installed build
//!
//! Until step 3 the installed build is never touched, and the temp file is
//! removed on every failure path. Steps 1 and 2 are [`UpdateInstaller::download`]
//! and honour cancellation; step 3 is [`UpdateInstaller::apply`] and does not.

use crate::config::UpdaterConfig;
use crate::error::InstallError;
use crate::update::checker::{Artifact, UpdateMetadata};
use crate::update::events::DownloadEventSender;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Payload bytes as they arrive.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// An opened artifact download.
pub struct Payload {
    /// Transport-reported length, if any.
    pub content_length: Option<u64>,
    pub chunks: ChunkStream,
}

/// Opens artifact downloads.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Start downloading `artifact`.
    async fn fetch(&self, artifact: &Artifact) -> Result<Payload, InstallError>;
}

/// Downloads artifacts over HTTP(S).
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    /// # Errors
    ///
    /// Returns [`crate::UpdaterError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &UpdaterConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.download_timeout())
            .build()
            .map_err(|e| crate::UpdaterError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, artifact: &Artifact) -> Result<Payload, InstallError> {
        let resp = self
            .client
            .get(&artifact.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| InstallError::DownloadFailed(format!("{}: {e}", artifact.url)))?;

        let content_length = resp.content_length();
        let chunks = resp.bytes_stream().map(|chunk| chunk.map_err(|e| e.to_string()));
        Ok(Payload {
            content_length,
            chunks: Box::pin(chunks),
        })
    }
}

/// An update that has been applied and is waiting for a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledUpdate {
    pub version: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// A verified payload staged next to the installed build.
///
/// Dropping it removes the staged file.
pub struct StagedUpdate {
    version: String,
    target: PathBuf,
    file: NamedTempFile,
    bytes: u64,
}

impl StagedUpdate {
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Drives the download-and-apply sequence for one attempt at a time.
#[derive(Clone)]
pub struct UpdateInstaller {
    config: Arc<UpdaterConfig>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl UpdateInstaller {
    pub fn new(config: Arc<UpdaterConfig>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self { config, fetcher }
    }

    /// Installer backed by [`HttpArtifactFetcher`].
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn http(config: Arc<UpdaterConfig>) -> crate::Result<Self> {
        let fetcher = Arc::new(HttpArtifactFetcher::new(&config)?);
        Ok(Self::new(config, fetcher))
    }

    /// Download, verify and apply `metadata`, reporting on `events`.
    ///
    /// # Errors
    ///
    /// - [`InstallError::DownloadFailed`] if the transfer fails or is cut short
    /// - [`InstallError::VerificationFailed`] if size or digest do not match
    /// - [`InstallError::ApplyFailed`] if the build cannot be replaced
    /// - [`InstallError::Cancelled`] if `cancel` fires before the apply phase
    ///
    /// In every case the previously installed build is left in place.
    pub async fn install(
        &self,
        metadata: &UpdateMetadata,
        events: DownloadEventSender,
        cancel: &CancellationToken,
    ) -> Result<InstalledUpdate, InstallError> {
        let staged = self.download(metadata, events, cancel).await?;
        self.apply(staged).await
    }

    /// Stream the artifact into a staged file and verify it.
    ///
    /// Emits `finished` only once the payload has passed verification.
    ///
    /// # Errors
    ///
    /// Same as [`install`](Self::install), minus [`InstallError::ApplyFailed`]
    /// for the replace itself.
    pub async fn download(
        &self,
        metadata: &UpdateMetadata,
        events: DownloadEventSender,
        cancel: &CancellationToken,
    ) -> Result<StagedUpdate, InstallError> {
        let target = self
            .config
            .resolved_install_path()
            .map_err(|e| InstallError::ApplyFailed(format!("cannot locate installed build: {e}")))?;
        let install_dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        info!(
            attempt = events.attempt(),
            version = %metadata.version,
            url = %metadata.artifact.url,
            target = %target.display(),
            "downloading update"
        );

        let file = tempfile::Builder::new()
            .prefix(".app-updater-")
            .suffix(".part")
            .tempfile_in(&install_dir)
            .map_err(|e| {
                InstallError::ApplyFailed(format!(
                    "cannot stage update in {}: {e}",
                    install_dir.display()
                ))
            })?;
        let writer = file
            .as_file()
            .try_clone()
            .map_err(|e| InstallError::ApplyFailed(format!("cannot open staged file: {e}")))?;

        let bytes = self
            .stream_payload(metadata, tokio::fs::File::from_std(writer), events, cancel)
            .await?;

        Ok(StagedUpdate {
            version: metadata.version.clone(),
            target,
            file,
            bytes,
        })
    }

    /// Move a verified payload over the installed build.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::ApplyFailed`] if the build cannot be replaced;
    /// the previous build is then still in place.
    pub async fn apply(&self, staged: StagedUpdate) -> Result<InstalledUpdate, InstallError> {
        let StagedUpdate {
            version,
            target,
            file,
            bytes,
        } = staged;

        let apply_target = target.clone();
        tokio::task::spawn_blocking(move || apply_staged(file, &apply_target))
            .await
            .map_err(|e| InstallError::ApplyFailed(format!("apply task failed: {e}")))??;

        info!(version = %version, bytes, "update applied");
        Ok(InstalledUpdate {
            version,
            path: target,
            bytes,
        })
    }

    /// Write the payload to `staged`, hash it and verify it.
    async fn stream_payload(
        &self,
        metadata: &UpdateMetadata,
        mut staged: tokio::fs::File,
        events: DownloadEventSender,
        cancel: &CancellationToken,
    ) -> Result<u64, InstallError> {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InstallError::Cancelled),
            payload = self.fetcher.fetch(&metadata.artifact) => payload?,
        };

        let expected_len = metadata.artifact.size.or(payload.content_length);
        let mut progress = events.started(expected_len);
        let mut chunks = payload.chunks;
        let mut hasher = Sha256::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(attempt = progress.attempt(), "download cancelled");
                    return Err(InstallError::Cancelled);
                }
                next = chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| {
                warn!(
                    attempt = progress.attempt(),
                    transferred = progress.transferred(),
                    error = %e,
                    "download interrupted"
                );
                InstallError::DownloadFailed(format!(
                    "interrupted after {} bytes: {e}",
                    progress.transferred()
                ))
            })?;

            staged
                .write_all(&chunk)
                .await
                .map_err(|e| InstallError::DownloadFailed(format!("cannot write payload: {e}")))?;
            hasher.update(&chunk);
            progress.progress(chunk.len() as u64);
            debug!(
                attempt = progress.attempt(),
                transferred = progress.transferred(),
                "download progress"
            );
        }

        staged
            .flush()
            .await
            .map_err(|e| InstallError::DownloadFailed(format!("cannot flush payload: {e}")))?;
        staged
            .sync_all()
            .await
            .map_err(|e| InstallError::DownloadFailed(format!("cannot flush payload: {e}")))?;

        let digest = format!("{:x}", hasher.finalize());
        verify_payload(
            progress.transferred(),
            expected_len,
            &digest,
            metadata.artifact.sha256.as_deref(),
        )?;

        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        let bytes = progress.transferred();
        debug!(attempt = progress.attempt(), bytes, "payload verified");
        progress.finished();
        Ok(bytes)
    }
}

/// Check a completed payload against what the manifest promised.
fn verify_payload(
    received: u64,
    expected_len: Option<u64>,
    actual_sha256: &str,
    expected_sha256: Option<&str>,
) -> Result<(), InstallError> {
    if received == 0 {
        return Err(InstallError::VerificationFailed("payload is empty".into()));
    }
    if let Some(expected) = expected_len
        && expected != received
    {
        return Err(InstallError::VerificationFailed(format!(
            "expected {expected} bytes, received {received}"
        )));
    }
    if let Some(expected) = expected_sha256
        && !expected.eq_ignore_ascii_case(actual_sha256)
    {
        warn!(expected, actual = %actual_sha256, "update checksum mismatch");
        return Err(InstallError::VerificationFailed(format!(
            "sha256 mismatch: expected {expected}, got {actual_sha256}"
        )));
    }
    Ok(())
}

/// Move the verified payload over the installed build.
fn apply_staged(staged: NamedTempFile, target: &Path) -> Result<(), InstallError> {
    set_executable(staged.path(), target)?;

    #[cfg(target_os = "windows")]
    let backup = move_running_binary_aside(target)?;

    if let Err(e) = staged.persist(target) {
        #[cfg(target_os = "windows")]
        {
            if let Some(backup) = &backup {
                let _ = std::fs::rename(backup, target);
            }
        }
        return Err(InstallError::ApplyFailed(format!(
            "cannot replace {}: {}",
            target.display(),
            e.error
        )));
    }

    #[cfg(target_os = "macos")]
    {
        let _ = std::process::Command::new("xattr")
            .args(["-d", "com.apple.quarantine", &target.to_string_lossy()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }

    info!(target = %target.display(), "installed build replaced");
    Ok(())
}

/// Give the staged payload the installed build's mode, or 0o755 for a fresh install.
fn set_executable(staged: &Path, target: &Path) -> Result<(), InstallError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(target)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(0o755);
        std::fs::set_permissions(staged, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            InstallError::ApplyFailed(format!(
                "cannot set permissions on {}: {e}",
                staged.display()
            ))
        })?;
    }
    let _ = (staged, target);
    Ok(())
}

/// A running executable cannot be overwritten on Windows, but it can be renamed.
#[cfg(target_os = "windows")]
fn move_running_binary_aside(target: &Path) -> Result<Option<PathBuf>, InstallError> {
    if !target.exists() {
        return Ok(None);
    }
    let backup = target.with_extension("old");
    let _ = std::fs::remove_file(&backup);
    std::fs::rename(target, &backup).map_err(|e| {
        InstallError::ApplyFailed(format!("cannot move {} aside: {e}", target.display()))
    })?;
    Ok(Some(backup))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::update::events::{DownloadEvent, download_channel};
    use futures_util::stream;

    struct ScriptedFetcher {
        content_length: Option<u64>,
        chunks: Vec<Result<&'static str, &'static str>>,
        stall_after: bool,
    }

    #[async_trait]
    impl ArtifactFetcher for ScriptedFetcher {
        async fn fetch(&self, _artifact: &Artifact) -> Result<Payload, InstallError> {
            let items: Vec<Result<Bytes, String>> = self
                .chunks
                .iter()
                .map(|c| match *c {
                    Ok(text) => Ok(Bytes::from_static(text.as_bytes())),
                    Err(e) => Err(e.to_owned()),
                })
                .collect();
            let chunks: ChunkStream = if self.stall_after {
                Box::pin(stream::iter(items).chain(stream::pending()))
            } else {
                Box::pin(stream::iter(items))
            };
            Ok(Payload {
                content_length: self.content_length,
                chunks,
            })
        }
    }

    fn sha256_of(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn setup(
        fetcher: ScriptedFetcher,
    ) -> (tempfile::TempDir, PathBuf, UpdateInstaller) {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app");
        std::fs::write(&target, b"old-build").unwrap();
        let config = Arc::new(UpdaterConfig {
            install_path: Some(target.clone()),
            ..Default::default()
        });
        let installer = UpdateInstaller::new(config, Arc::new(fetcher));
        (dir, target, installer)
    }

    fn metadata(size: Option<u64>, sha256: Option<String>) -> UpdateMetadata {
        UpdateMetadata {
            version: "1.3.0".into(),
            current_version: "1.2.0".into(),
            notes: None,
            pub_date: None,
            artifact: Artifact {
                url: "https://updates.example.com/app".into(),
                sha256,
                size,
            },
        }
    }

    fn leftover_parts(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .count()
    }

    async fn collect(mut rx: crate::update::events::DownloadEventReceiver) -> Vec<DownloadEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn successful_install_replaces_build_and_reports_progress() {
        let (dir, target, installer) = setup(ScriptedFetcher {
            content_length: None,
            chunks: vec![Ok("new-"), Ok("build")],
            stall_after: false,
        });
        let (tx, rx) = download_channel(1);
        let meta = metadata(Some(9), Some(sha256_of(b"new-build")));

        let installed = installer
            .install(&meta, tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(installed.bytes, 9);
        assert_eq!(installed.path, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"new-build");
        assert_eq!(leftover_parts(dir.path()), 0);

        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![
                DownloadEvent::Started {
                    content_length: Some(9)
                },
                DownloadEvent::Progress { chunk_length: 4 },
                DownloadEvent::Progress { chunk_length: 5 },
                DownloadEvent::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn download_stages_payload_without_touching_build() {
        let (dir, target, installer) = setup(ScriptedFetcher {
            content_length: None,
            chunks: vec![Ok("new-"), Ok("build")],
            stall_after: false,
        });
        let (tx, rx) = download_channel(1);
        let meta = metadata(Some(9), Some(sha256_of(b"new-build")));

        let staged = installer
            .download(&meta, tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(staged.bytes(), 9);
        assert_eq!(std::fs::read(&target).unwrap(), b"old-build");
        assert_eq!(leftover_parts(dir.path()), 1);
        assert_eq!(collect(rx).await.last(), Some(&DownloadEvent::Finished));

        let installed = installer.apply(staged).await.unwrap();
        assert_eq!(installed.version, "1.3.0");
        assert_eq!(std::fs::read(&target).unwrap(), b"new-build");
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[tokio::test]
    async fn dropped_staged_update_is_removed() {
        let (dir, target, installer) = setup(ScriptedFetcher {
            content_length: None,
            chunks: vec![Ok("unused")],
            stall_after: false,
        });
        let (tx, _rx) = download_channel(1);
        let staged = installer
            .download(&metadata(None, None), tx, &CancellationToken::new())
            .await
            .unwrap();
        drop(staged);
        assert_eq!(leftover_parts(dir.path()), 0);
        assert_eq!(std::fs::read(&target).unwrap(), b"old-build");
    }

    #[tokio::test]
    async fn transport_length_is_used_when_manifest_has_no_size() {
        let (_dir, _target, installer) = setup(ScriptedFetcher {
            content_length: Some(3),
            chunks: vec![Ok("abc")],
            stall_after: false,
        });
        let (tx, rx) = download_channel(1);
        installer
            .install(&metadata(None, None), tx, &CancellationToken::new())
            .await
            .unwrap();
        let events = collect(rx).await;
        assert_eq!(
            events[0],
            DownloadEvent::Started {
                content_length: Some(3)
            }
        );
    }

    #[tokio::test]
    async fn interrupted_download_leaves_build_intact() {
        let (dir, target, installer) = setup(ScriptedFetcher {
            content_length: None,
            chunks: vec![Ok("aa"), Ok("bb"), Err("connection reset")],
            stall_after: false,
        });
        let (tx, rx) = download_channel(1);

        let err = installer
            .install(&metadata(Some(10), None), tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::DownloadFailed(_)));
        assert_eq!(std::fs::read(&target).unwrap(), b"old-build");
        assert_eq!(leftover_parts(dir.path()), 0);

        let events = collect(rx).await;
        assert_eq!(events.len(), 3);
        assert!(!events.contains(&DownloadEvent::Finished));
    }

    #[tokio::test]
    async fn digest_mismatch_fails_verification() {
        let (dir, target, installer) = setup(ScriptedFetcher {
            content_length: None,
            chunks: vec![Ok("tampered")],
            stall_after: false,
        });
        let (tx, rx) = download_channel(1);
        let meta = metadata(None, Some(sha256_of(b"genuine")));

        let err = installer
            .install(&meta, tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::VerificationFailed(_)));
        assert_eq!(std::fs::read(&target).unwrap(), b"old-build");
        assert_eq!(leftover_parts(dir.path()), 0);
        assert!(!collect(rx).await.contains(&DownloadEvent::Finished));
    }

    #[tokio::test]
    async fn short_payload_fails_verification() {
        let (_dir, target, installer) = setup(ScriptedFetcher {
            content_length: None,
            chunks: vec![Ok("12345")],
            stall_after: false,
        });
        let (tx, _rx) = download_channel(1);
        let err = installer
            .install(&metadata(Some(10), None), tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::VerificationFailed(_)));
        assert_eq!(std::fs::read(&target).unwrap(), b"old-build");
    }

    #[tokio::test]
    async fn empty_payload_fails_verification() {
        let (_dir, _target, installer) = setup(ScriptedFetcher {
            content_length: None,
            chunks: vec![],
            stall_after: false,
        });
        let (tx, _rx) = download_channel(1);
        let err = installer
            .install(&metadata(None, None), tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::VerificationFailed(_)));
    }

    #[tokio::test]
    async fn cancellation_during_download_aborts_cleanly() {
        let (dir, target, installer) = setup(ScriptedFetcher {
            content_length: None,
            chunks: vec![Ok("partial")],
            stall_after: true,
        });
        let (tx, _rx) = download_channel(1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = installer
            .install(&metadata(None, None), tx, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, InstallError::Cancelled);
        assert_eq!(std::fs::read(&target).unwrap(), b"old-build");
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[tokio::test]
    async fn missing_install_dir_fails_apply() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(UpdaterConfig {
            install_path: Some(dir.path().join("missing").join("app")),
            ..Default::default()
        });
        let installer = UpdateInstaller::new(
            config,
            Arc::new(ScriptedFetcher {
                content_length: None,
                chunks: vec![Ok("x")],
                stall_after: false,
            }),
        );
        let (tx, _rx) = download_channel(1);
        let err = installer
            .install(&metadata(None, None), tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::ApplyFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn installed_build_keeps_existing_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, target, installer) = setup(ScriptedFetcher {
            content_length: None,
            chunks: vec![Ok("#!/bin/sh\necho new")],
            stall_after: false,
        });
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o750)).unwrap();

        let (tx, _rx) = download_channel(1);
        installer
            .install(&metadata(None, None), tx, &CancellationToken::new())
            .await
            .unwrap();
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn verify_payload_accepts_matching_digest_case_insensitively() {
        let digest = sha256_of(b"abc");
        assert!(verify_payload(3, Some(3), &digest, Some(&digest.to_uppercase())).is_ok());
        assert!(verify_payload(3, None, &digest, None).is_ok());
    }
}
