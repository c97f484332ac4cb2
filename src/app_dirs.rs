//! Platform directories for the updater host.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Config | `~/Library/Application Support/app-updater/` | `~/.config/app-updater/` |
//!
//! Set `APP_UPDATER_CONFIG_DIR` to override the config directory.

use std::path::PathBuf;

const APP_DIR_NAME: &str = "app-updater";

/// Updater config directory.
///
/// Resolves to `dirs::config_dir()/app-updater/` by default. Override with
/// the `APP_UPDATER_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("APP_UPDATER_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| std::env::temp_dir().join("app-updater-config"))
}

/// Config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_dir_is_nonempty() {
        assert!(!config_dir().as_os_str().is_empty());
    }

    #[test]
    fn config_file_ends_with_config_toml() {
        let path = config_file();
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("config.toml")
        );
        assert!(path.starts_with(config_dir()));
    }
}
