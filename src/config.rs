//! Configuration management for upperfs

use crate::error::{Error, Result};
use crate::quota::parse_size;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Entry/attribute timeout for `cache=always`: one day
pub const ALWAYS_TIMEOUT_SECS: u64 = 86_400;

/// Entry/attribute timeout for `cache=auto`
pub const AUTO_TIMEOUT_SECS: u64 = 1;

/// Directory name of the attribute database under the data directory
pub const XATTR_DB_NAME: &str = "xattr.db";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// Quota configuration
    pub quota: QuotaConfig,

    /// Extended attribute store configuration
    pub xattr: XattrConfig,

    /// Path to the data directory
    pub data_dir: PathBuf,
}

/// How long the kernel may cache entries and attributes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Revalidate on every access
    Never,
    /// Short timeout
    #[default]
    Auto,
    /// The source tree is only changed through the mount
    Always,
}

impl CacheMode {
    pub fn ttl(self) -> Duration {
        match self {
            CacheMode::Never => Duration::ZERO,
            CacheMode::Auto => Duration::from_secs(AUTO_TIMEOUT_SECS),
            CacheMode::Always => Duration::from_secs(ALWAYS_TIMEOUT_SECS),
        }
    }
}

impl FromStr for CacheMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "never" => Ok(CacheMode::Never),
            "auto" => Ok(CacheMode::Auto),
            "always" => Ok(CacheMode::Always),
            other => Err(Error::InvalidArgument(format!(
                "cache mode must be never, auto or always, got {:?}",
                other
            ))),
        }
    }
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Directory being mirrored
    pub source: PathBuf,

    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Mount read-only
    pub read_only: bool,

    /// Kernel cache policy
    pub cache: CacheMode,

    /// Explicit cache timeout in seconds, overrides `cache`
    pub timeout: Option<f64>,
}

/// Quota configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Size limit such as `"10GiB"`; unset means unlimited
    pub limit: Option<String>,

    /// Subdirectory of the source the limit applies to; unset means all of it
    pub path: Option<PathBuf>,
}

/// Extended attribute store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XattrConfig {
    /// Serve extended attributes from the store
    pub enabled: bool,

    /// Database directory; defaults to `<data_dir>/xattr.db`
    pub db_dir: Option<PathBuf>,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            source: PathBuf::new(),
            mount_point: PathBuf::from("/mnt/upperfs"),
            allow_other: false,
            read_only: false,
            cache: CacheMode::default(),
            timeout: None,
        }
    }
}

impl Default for XattrConfig {
    fn default() -> Self {
        XattrConfig {
            enabled: true,
            db_dir: None,
        }
    }
}

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("upperfs")
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

impl Config {
    /// Configuration for mirroring `source` at `mount_point`
    pub fn new(source: impl Into<PathBuf>, mount_point: impl Into<PathBuf>) -> Self {
        Config {
            mount: MountConfig {
                source: source.into(),
                mount_point: mount_point.into(),
                ..MountConfig::default()
            },
            data_dir: default_data_dir(),
            ..Config::default()
        }
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        if config.data_dir.as_os_str().is_empty() {
            config.data_dir = default_data_dir();
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(quota) = std::env::var("UPPERFS_QUOTA") {
            let quota = quota.trim().to_string();
            if !quota.is_empty() {
                self.quota.limit = Some(quota);
            }
        }

        if let Ok(db) = std::env::var("UPPERFS_XATTR_DB") {
            let db = db.trim();
            if !db.is_empty() {
                self.xattr.db_dir = Some(PathBuf::from(db));
            }
        }

        if let Ok(timeout) = std::env::var("UPPERFS_TIMEOUT") {
            if let Ok(secs) = timeout.trim().parse::<f64>() {
                self.mount.timeout = Some(secs);
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Parsed quota limit in bytes
    pub fn quota_limit(&self) -> Result<Option<u64>> {
        self.quota.limit.as_deref().map(parse_size).transpose()
    }

    /// Directory the quota is enforced on
    pub fn quota_root(&self) -> PathBuf {
        match &self.quota.path {
            Some(sub) => self.mount.source.join(sub),
            None => self.mount.source.clone(),
        }
    }

    /// Attribute database directory
    pub fn xattr_db_dir(&self) -> PathBuf {
        self.xattr
            .db_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(XATTR_DB_NAME))
    }

    /// Kernel entry/attribute timeout
    pub fn ttl(&self) -> Result<Duration> {
        match self.mount.timeout {
            Some(secs) => Duration::try_from_secs_f64(secs).map_err(|_| {
                Error::InvalidConfig(format!("Timeout {} is out of range", secs))
            }),
            None => Ok(self.mount.cache.ttl()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.mount.source.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "Source {:?} is not a directory",
                self.mount.source
            )));
        }

        if let Some(secs) = self.mount.timeout {
            if !secs.is_finite() || secs < 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(Error::InvalidConfig(format!(
                    "Timeout must be a non-negative number of seconds, got {}",
                    secs
                )));
            }
        }

        self.quota_limit()?;

        if let Some(sub) = &self.quota.path {
            let escapes = sub
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                return Err(Error::InvalidConfig(format!(
                    "Quota path {:?} must be relative and stay inside the source",
                    sub
                )));
            }
            if !self.quota_root().is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "Quota path {:?} is not a directory",
                    self.quota_root()
                )));
            }
        }

        if self.xattr.enabled {
            let source = absolute(&self.mount.source)?;
            let db = absolute(&self.xattr_db_dir())?;
            if db.starts_with(&source) {
                return Err(Error::InvalidConfig(format!(
                    "Attribute database {:?} must not live inside the source {:?}",
                    db, source
                )));
            }
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if self.xattr.enabled {
            std::fs::create_dir_all(self.xattr_db_dir())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> Config {
        let source = dir.join("source");
        std::fs::create_dir_all(&source).unwrap();
        let mut config = Config::new(&source, dir.join("mnt"));
        config.data_dir = dir.join("data");
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::new("/srv", "/mnt/x");
        assert_eq!(config.mount.cache, CacheMode::Auto);
        assert_eq!(config.ttl().unwrap(), Duration::from_secs(1));
        assert!(config.xattr.enabled);
        assert_eq!(config.quota_limit().unwrap(), None);
        assert_eq!(config.quota_root(), PathBuf::from("/srv"));
        assert!(config.xattr_db_dir().ends_with(XATTR_DB_NAME));
    }

    #[test]
    fn test_cache_modes() {
        assert_eq!("never".parse::<CacheMode>().unwrap().ttl(), Duration::ZERO);
        assert_eq!(
            "always".parse::<CacheMode>().unwrap().ttl(),
            Duration::from_secs(ALWAYS_TIMEOUT_SECS)
        );
        assert!("sometimes".parse::<CacheMode>().is_err());

        let mut config = Config::new("/srv", "/mnt/x");
        config.mount.cache = CacheMode::Always;
        config.mount.timeout = Some(2.5);
        assert_eq!(config.ttl().unwrap(), Duration::from_millis(2500));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.quota.limit = Some("10MiB".to_string());
        config.mount.cache = CacheMode::Never;

        let path = dir.path().join("config.json");
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.mount.source, config.mount.source);
        assert_eq!(loaded.mount.cache, CacheMode::Never);
        assert_eq!(loaded.quota_limit().unwrap(), Some(10 * 1024 * 1024));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"mount": {"source": "/srv"}}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.mount.source, PathBuf::from("/srv"));
        assert!(config.xattr.enabled);
        assert!(!config.data_dir.as_os_str().is_empty());
    }

    #[test]
    fn test_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        config.validate().unwrap();

        let mut missing = config.clone();
        missing.mount.source = dir.path().join("nope");
        assert!(missing.validate().is_err());

        let mut inside = config.clone();
        inside.xattr.db_dir = Some(config.mount.source.join(".xattr"));
        assert!(inside.validate().is_err());
        inside.xattr.enabled = false;
        inside.validate().unwrap();

        let mut bad_size = config.clone();
        bad_size.quota.limit = Some("lots".to_string());
        assert!(bad_size.validate().is_err());

        let mut escaping = config.clone();
        escaping.quota.path = Some(PathBuf::from("../elsewhere"));
        assert!(escaping.validate().is_err());

        let mut negative = config.clone();
        negative.mount.timeout = Some(-1.0);
        assert!(negative.validate().is_err());

        let mut huge = config;
        huge.mount.timeout = Some(1e20);
        assert!(huge.validate().is_err());
        assert!(huge.ttl().is_err());
    }

    #[test]
    fn test_quota_subdirectory() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        std::fs::create_dir(config.mount.source.join("home")).unwrap();
        config.quota.path = Some(PathBuf::from("home"));

        config.validate().unwrap();
        assert_eq!(config.quota_root(), config.mount.source.join("home"));
    }
}
