//! Configuration for the updater.
//!
//! Loaded once at startup and shared by reference (`Arc<UpdaterConfig>`)
//! with the checker and installer, so the running version is never read
//! ad hoc.

use crate::error::{Result, UpdaterError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level updater configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Version of the running build.
    pub current_version: String,
    /// Manifest URLs, tried in order until one answers.
    pub endpoints: Vec<String>,
    /// Platform key used to pick an artifact from the manifest
    /// (e.g. `"linux-x86_64"`).
    pub target: String,
    /// File replaced when an update is applied (None = running executable).
    pub install_path: Option<PathBuf>,
    /// Offer any differing remote version, not just newer ones.
    pub allow_downgrade: bool,
    /// Timeout for a single manifest request.
    pub request_timeout_secs: u64,
    /// Timeout for the whole artifact download.
    pub download_timeout_secs: u64,
    /// Budget for each shutdown hook before restart proceeds without it.
    pub hook_timeout_ms: u64,
    /// Run one check as soon as the host starts.
    pub check_on_startup: bool,
    /// Interval for background checks (None = disabled).
    pub check_interval_secs: Option<u64>,
    /// HTTP `User-Agent` header.
    pub user_agent: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            current_version: env!("CARGO_PKG_VERSION").to_owned(),
            endpoints: Vec::new(),
            target: default_target(),
            install_path: None,
            allow_downgrade: false,
            request_timeout_secs: 30,
            download_timeout_secs: 600,
            hook_timeout_ms: 5_000,
            check_on_startup: true,
            check_interval_secs: None,
            user_agent: format!("app-updater/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Platform key for the running build: `{os}-{arch}`.
#[must_use]
pub fn default_target() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

impl UpdaterConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| UpdaterError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdaterError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path (`config_dir()/config.toml`).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::app_dirs::config_file()
    }

    /// Check the fields that cannot be expressed in the type.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        crate::update::checker::parse_version(&self.current_version).map_err(|e| {
            UpdaterError::Config(format!(
                "current_version `{}` is not a semantic version: {e}",
                self.current_version
            ))
        })?;

        for endpoint in &self.endpoints {
            let url = url::Url::parse(endpoint)
                .map_err(|e| UpdaterError::Config(format!("endpoint `{endpoint}`: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(UpdaterError::Config(format!(
                    "endpoint `{endpoint}` must use http or https"
                )));
            }
        }

        if self.target.trim().is_empty() {
            return Err(UpdaterError::Config("target cannot be empty".to_owned()));
        }
        if self.request_timeout_secs == 0 || self.download_timeout_secs == 0 {
            return Err(UpdaterError::Config(
                "request and download timeouts must be non-zero".to_owned(),
            ));
        }
        if self.hook_timeout_ms == 0 {
            return Err(UpdaterError::Config(
                "hook_timeout_ms must be non-zero".to_owned(),
            ));
        }
        if self.check_interval_secs == Some(0) {
            return Err(UpdaterError::Config(
                "check_interval_secs must be non-zero when set".to_owned(),
            ));
        }
        Ok(())
    }

    /// Path of the build that an update replaces.
    ///
    /// # Errors
    ///
    /// Returns an error if no `install_path` is configured and the running
    /// executable cannot be located.
    pub fn resolved_install_path(&self) -> Result<PathBuf> {
        match &self.install_path {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = UpdaterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.current_version, env!("CARGO_PKG_VERSION"));
        assert!(config.endpoints.is_empty());
        assert!(config.target.contains('-'));
        assert!(config.check_on_startup);
        assert!(config.check_interval_secs.is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = UpdaterConfig {
            current_version: "1.2.0".to_owned(),
            endpoints: vec!["https://updates.example.com/latest.json".to_owned()],
            hook_timeout_ms: 250,
            check_interval_secs: Some(3600),
            ..Default::default()
        };

        config.save_to_file(&path).unwrap();
        let loaded = UpdaterConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: UpdaterConfig = toml::from_str(r#"current_version = "0.9.1""#).unwrap();
        assert_eq!(config.current_version, "0.9.1");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.target, default_target());
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = UpdaterConfig::from_file(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "endpoints = [[[").unwrap();
        let result = UpdaterConfig::from_file(&path);
        assert!(matches!(result, Err(UpdaterError::Config(_))));
    }

    #[test]
    fn validate_rejects_bad_version() {
        let config = UpdaterConfig {
            current_version: "one.two".to_owned(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(UpdaterError::Config(_))));
    }

    #[test]
    fn validate_rejects_non_http_endpoint() {
        let config = UpdaterConfig {
            endpoints: vec!["ftp://updates.example.com/latest.json".to_owned()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = UpdaterConfig {
            endpoints: vec!["not a url".to_owned()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_hook_timeout() {
        let config = UpdaterConfig {
            hook_timeout_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("hook_timeout_ms"));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let config = UpdaterConfig {
            check_interval_secs: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolved_install_path_prefers_configured_path() {
        let config = UpdaterConfig {
            install_path: Some(PathBuf::from("/opt/app/bin/app")),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_install_path().unwrap(),
            PathBuf::from("/opt/app/bin/app")
        );

        let config = UpdaterConfig::default();
        assert!(config.resolved_install_path().unwrap().exists());
    }
}
