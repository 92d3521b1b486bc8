//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::constants::MAX_ACCESS_THREADS;
use crate::rebuild::RecoveryOptions;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxipmemConfig {
    /// Engine configuration.
    pub engine: Option<EngineConfigSpec>,
    /// Recovery configuration.
    pub recovery: Option<RecoveryConfigSpec>,
}

impl OxipmemConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIPMEM_CONFIG` env var (if set),
    /// then apply `OXIPMEM__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXIPMEM_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIPMEM__") {
                continue;
            }
            let path = key["OXIPMEM__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["engine", "max_access_threads"] => {
                    self.engine_mut().max_access_threads = Some(parse_value(&key, &value)?);
                }
                ["recovery", "segment_based_rebuild"] => {
                    self.recovery_mut().segment_based_rebuild = Some(parse_value(&key, &value)?);
                }
                ["recovery", "num_rebuild_threads"] => {
                    self.recovery_mut().num_rebuild_threads = Some(parse_value(&key, &value)?);
                }
                ["recovery", "restore_skiplist_stride"] => {
                    self.recovery_mut().restore_skiplist_stride = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build `RecoveryOptions` using defaults plus overrides.
    pub fn to_recovery_options(&self) -> RecoveryOptions {
        let mut options = RecoveryOptions::default();
        if let Some(engine) = &self.engine {
            engine.apply_to(&mut options);
        }
        if let Some(recovery) = &self.recovery {
            recovery.apply_to(&mut options);
        }
        options
    }

    fn engine_mut(&mut self) -> &mut EngineConfigSpec {
        if self.engine.is_none() {
            self.engine = Some(EngineConfigSpec::default());
        }
        self.engine.as_mut().expect("engine config")
    }

    fn recovery_mut(&mut self) -> &mut RecoveryConfigSpec {
        if self.recovery.is_none() {
            self.recovery = Some(RecoveryConfigSpec::default());
        }
        self.recovery.as_mut().expect("recovery config")
    }
}

/// Engine configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfigSpec {
    /// Maximum number of concurrent access threads.
    pub max_access_threads: Option<usize>,
}

impl EngineConfigSpec {
    fn apply_to(&self, options: &mut RecoveryOptions) {
        if let Some(value) = self.max_access_threads {
            options.max_access_threads = value.clamp(1, MAX_ACCESS_THREADS);
        }
    }
}

/// Recovery configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecoveryConfigSpec {
    /// Whether to use the segment-partitioned parallel rebuild.
    pub segment_based_rebuild: Option<bool>,
    /// Number of rebuild worker threads.
    pub num_rebuild_threads: Option<usize>,
    /// Spacing between candidate recovery-segment starts.
    pub restore_skiplist_stride: Option<u64>,
}

impl RecoveryConfigSpec {
    fn apply_to(&self, options: &mut RecoveryOptions) {
        if let Some(value) = self.segment_based_rebuild {
            options.segment_based_rebuild = value;
        }
        if let Some(value) = self.num_rebuild_threads {
            options.num_rebuild_threads = value.max(1);
        }
        if let Some(value) = self.restore_skiplist_stride {
            options.restore_skiplist_stride = value.max(1);
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RESTORE_SKIPLIST_STRIDE;
    use std::io::Write;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = OxipmemConfig::default();
        let options = config.to_recovery_options();
        assert!(options.segment_based_rebuild);
        assert_eq!(options.num_rebuild_threads, 8);
        assert_eq!(options.restore_skiplist_stride, RESTORE_SKIPLIST_STRIDE);
        assert_eq!(options.max_access_threads, 64);
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\nmax_access_threads = 16\n\n[recovery]\nsegment_based_rebuild = false\nnum_rebuild_threads = 4\nrestore_skiplist_stride = 100\n"
        )
        .unwrap();

        let config = OxipmemConfig::load_from_path(file.path()).unwrap();
        let options = config.to_recovery_options();
        assert!(!options.segment_based_rebuild);
        assert_eq!(options.num_rebuild_threads, 4);
        assert_eq!(options.restore_skiplist_stride, 100);
        assert_eq!(options.max_access_threads, 16);
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("OXIPMEM__recovery__num_rebuild_threads", "2");
        env::set_var("OXIPMEM__engine__max_access_threads", "4");

        let mut config = OxipmemConfig::default();
        config.apply_env_overrides().unwrap();

        env::remove_var("OXIPMEM__recovery__num_rebuild_threads");
        env::remove_var("OXIPMEM__engine__max_access_threads");

        let options = config.to_recovery_options();
        assert_eq!(options.num_rebuild_threads, 2);
        assert_eq!(options.max_access_threads, 4);
    }

    #[test]
    fn test_env_override_invalid_value() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("OXIPMEM__recovery__num_rebuild_threads", "lots");
        let mut config = OxipmemConfig::default();
        let result = config.apply_env_overrides();
        env::remove_var("OXIPMEM__recovery__num_rebuild_threads");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let result = OxipmemConfig::load_from_path("/nonexistent/oxipmem.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "test_key".to_string(),
            value: "bad_value".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("invalid value"));
        assert!(display.contains("test_key"));
    }
}
