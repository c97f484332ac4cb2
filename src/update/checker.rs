//! Release manifest checker.
//!
//! Fetches the published release manifest from the configured endpoints,
//! compares its version against the running build using semver, and
//! produces [`UpdateMetadata`] when a newer build exists for this platform.

use crate::config::UpdaterConfig;
use crate::error::CheckError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Published release manifest served by an update endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseManifest {
    /// Published version, optionally prefixed with `v`.
    pub version: String,
    /// Changelog text.
    #[serde(default)]
    pub notes: Option<String>,
    /// Publication timestamp (RFC 3339).
    #[serde(default)]
    pub pub_date: Option<DateTime<Utc>>,
    /// Downloadable builds keyed by platform (`"linux-x86_64"`, ...).
    #[serde(default)]
    pub platforms: HashMap<String, Artifact>,
}

/// A downloadable build for one platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub url: String,
    /// Lowercase hex SHA-256 of the payload.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Payload size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
}

/// Result of a successful check that found a newer build.
///
/// Immutable once produced; superseded by the next check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMetadata {
    pub version: String,
    pub current_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_date: Option<DateTime<Utc>>,
    /// Build to download; not part of the wire shape.
    #[serde(skip)]
    pub artifact: Artifact,
}

/// Where release manifests come from.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Fetch the latest manifest.
    ///
    /// `Ok(None)` means the source explicitly reported that nothing is
    /// published (HTTP 204).
    async fn fetch_manifest(&self) -> Result<Option<ReleaseManifest>, CheckError>;
}

/// Fetches manifests over HTTP(S), trying each endpoint in order.
pub struct HttpUpdateSource {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpUpdateSource {
    /// Build a source from the configured endpoints and timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`crate::UpdaterError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &UpdaterConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| crate::UpdaterError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoints: config.endpoints.clone(),
        })
    }

    async fn fetch_from(&self, endpoint: &str) -> Result<Option<ReleaseManifest>, CheckError> {
        let resp = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| CheckError::Unreachable(format!("{endpoint}: {e}")))?;

        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let resp = resp
            .error_for_status()
            .map_err(|e| CheckError::Unreachable(format!("{endpoint}: {e}")))?;

        let body = resp
            .bytes()
            .await
            .map_err(|e| CheckError::Unreachable(format!("{endpoint}: {e}")))?;

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| CheckError::InvalidManifest(format!("{endpoint}: {e}")))
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn fetch_manifest(&self) -> Result<Option<ReleaseManifest>, CheckError> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            debug!(endpoint, "fetching release manifest");
            match self.fetch_from(endpoint).await {
                Ok(manifest) => return Ok(manifest),
                Err(e) => {
                    warn!(endpoint, error = %e, "update endpoint failed; trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| CheckError::Unreachable("no update endpoints configured".into())))
    }
}

/// Compares the published release against the running build.
#[derive(Clone)]
pub struct VersionChecker {
    config: Arc<UpdaterConfig>,
    source: Arc<dyn UpdateSource>,
}

impl VersionChecker {
    pub fn new(config: Arc<UpdaterConfig>, source: Arc<dyn UpdateSource>) -> Self {
        Self { config, source }
    }

    /// Version of the running build.
    #[must_use]
    pub fn current_version(&self) -> &str {
        &self.config.current_version
    }

    /// Query the update source and decide whether a newer build exists.
    ///
    /// Holds no state between calls, so concurrent checks are safe.
    ///
    /// # Errors
    ///
    /// Returns [`CheckError`] if the source cannot be reached or its manifest
    /// is unusable.
    pub async fn check_for_update(&self) -> Result<Option<UpdateMetadata>, CheckError> {
        let Some(manifest) = self.source.fetch_manifest().await? else {
            info!(current = %self.config.current_version, "update source reports no release");
            return Ok(None);
        };
        evaluate_manifest(&self.config, manifest)
    }
}

/// Turn a manifest into metadata for this build, if it is an update.
fn evaluate_manifest(
    config: &UpdaterConfig,
    manifest: ReleaseManifest,
) -> Result<Option<UpdateMetadata>, CheckError> {
    let remote = parse_version(&manifest.version).map_err(|e| {
        CheckError::InvalidManifest(format!("version `{}`: {e}", manifest.version))
    })?;
    let current = parse_version(&config.current_version).map_err(|e| {
        CheckError::InvalidManifest(format!(
            "current version `{}`: {e}",
            config.current_version
        ))
    })?;

    if !is_update(&remote, &current, config.allow_downgrade) {
        info!(%current, %remote, "already on the latest version");
        return Ok(None);
    }

    let artifact = manifest
        .platforms
        .get(&config.target)
        .cloned()
        .ok_or_else(|| {
            CheckError::InvalidManifest(format!(
                "release {remote} has no build for `{}`",
                config.target
            ))
        })?;

    if let Some(digest) = &artifact.sha256
        && !is_sha256_hex(digest)
    {
        return Err(CheckError::InvalidManifest(format!(
            "release {remote} has a malformed sha256 `{digest}`"
        )));
    }

    info!(%current, %remote, target = %config.target, "update available");
    Ok(Some(UpdateMetadata {
        version: remote.to_string(),
        current_version: config.current_version.clone(),
        notes: manifest.notes,
        pub_date: manifest.pub_date,
        artifact,
    }))
}

/// Parse a version string, tolerating a leading `v`.
pub(crate) fn parse_version(raw: &str) -> Result<semver::Version, semver::Error> {
    let trimmed = raw.trim();
    semver::Version::parse(trimmed.strip_prefix('v').unwrap_or(trimmed))
}

/// Equal versions are never an update. Build metadata does not count.
fn is_update(remote: &semver::Version, current: &semver::Version, allow_downgrade: bool) -> bool {
    match remote.cmp_precedence(current) {
        Ordering::Greater => true,
        Ordering::Less => allow_downgrade,
        Ordering::Equal => false,
    }
}

fn is_sha256_hex(digest: &str) -> bool {
    digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
}
