use crate::error::{FuseError, Result};
use crate::raw::PAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Session level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Largest write the kernel may send in one request.
    pub max_write: usize,
    /// Number of requests the kernel keeps in flight.
    pub max_background: usize,
    pub buffer_pooling: bool,
    /// Record per-operation latencies.
    pub latency: bool,
    /// Log every request and reply.
    pub debug: bool,
    pub fs_name: String,
    pub allow_other: bool,
    /// Extra `-o` options passed to fusermount.
    pub options: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            max_write: super::default_max_write(),
            max_background: super::default_max_background(),
            buffer_pooling: true,
            latency: false,
            debug: false,
            fs_name: super::default_fs_name(),
            allow_other: false,
            options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Per-mount settings of a node filesystem. Timeouts are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemOptions {
    pub entry_timeout: f64,
    pub attr_timeout: f64,
    /// Cache failed lookups for this long. Zero disables negative entries.
    pub negative_timeout: f64,
    /// Report every node as owned by this user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
    /// Use table handles. Without it node ids are addresses.
    pub portable_inodes: bool,
}

impl Default for FileSystemOptions {
    fn default() -> Self {
        Self {
            entry_timeout: super::default_timeout(),
            attr_timeout: super::default_timeout(),
            negative_timeout: 0.0,
            owner: None,
            portable_inodes: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathNodeFsOptions {
    /// Use the backend's inode numbers to recognize hard links.
    pub client_inodes: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mount: MountOptions,
    #[serde(default)]
    pub fs: FileSystemOptions,
    #[serde(default)]
    pub pathfs: PathNodeFsOptions,
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.mount.max_write < PAGE_SIZE {
        return Err(FuseError::Config(format!(
            "max_write ({}) must be at least one page ({} bytes)",
            config.mount.max_write, PAGE_SIZE
        )));
    }

    for (name, value) in [
        ("entry_timeout", config.fs.entry_timeout),
        ("attr_timeout", config.fs.attr_timeout),
        ("negative_timeout", config.fs.negative_timeout),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(FuseError::Config(format!(
                "{} must be a non-negative number of seconds, got {}",
                name, value
            )));
        }
    }

    if config.mount.max_background > u16::MAX as usize {
        tracing::warn!(
            "max_background ({}) exceeds {}, the kernel will see {}",
            config.mount.max_background,
            u16::MAX,
            u16::MAX
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mount.max_write, 65536);
        assert_eq!(config.mount.max_background, 12);
        assert!(config.mount.buffer_pooling);
        assert_eq!(config.mount.fs_name, "nodefuse");
        assert_eq!(config.fs.negative_timeout, 0.0);
        assert!(config.fs.owner.is_none());
        assert!(!config.pathfs.client_inodes);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_small_max_write_rejected() {
        let mut config = Config::default();
        config.mount.max_write = 1024;
        assert!(matches!(validate_config(&config), Err(FuseError::Config(_))));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let mut config = Config::default();
        config.fs.attr_timeout = -1.0;
        assert!(validate_config(&config).is_err());
    }
}
