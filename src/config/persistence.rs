use std::path::Path;

use crate::config::paths::*;
use crate::config::schema::*;
use crate::error::{FuseError, Result};

/// Load the configuration from `explicit`, or from the default location.
///
/// An explicitly named file must exist. A missing default file yields the
/// defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config = match explicit {
        Some(path) => read_config(path)?,
        None => {
            let path = get_config_path()?;
            if path.exists() {
                read_config(&path)?
            } else {
                tracing::debug!("No config at {}, using defaults", path.display());
                Config::default()
            }
        }
    };

    validate_config(&config)?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<Config> {
    let toml_content = std::fs::read_to_string(path).map_err(|e| {
        FuseError::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    parse_config(&toml_content)
}

pub fn parse_config(toml_content: &str) -> Result<Config> {
    toml::from_str(toml_content)
        .map_err(|e| FuseError::Config(format!("Failed to parse config: {}", e)))
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            FuseError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| FuseError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, toml_str)
        .map_err(|e| FuseError::Config(format!("Failed to write config file: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.mount.debug = true;
        config.fs.negative_timeout = 0.5;
        config.pathfs.client_inodes = true;
        save_config(&config, &path).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert!(loaded.mount.debug);
        assert_eq!(loaded.fs.negative_timeout, 0.5);
        assert!(loaded.pathfs.client_inodes);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, FuseError::Config(_)));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse_config("[mount]\nmax_write = 131072\n").unwrap();
        assert_eq!(config.mount.max_write, 131072);
        assert_eq!(config.mount.max_background, 12);
        assert_eq!(config.fs.entry_timeout, 1.0);
        assert!(config.fs.portable_inodes);
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        assert!(matches!(
            parse_config("[mount\nmax_write = "),
            Err(FuseError::Config(_))
        ));
    }
}
