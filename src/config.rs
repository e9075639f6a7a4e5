//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::index::{GrowConfig, MemHashIndexConfig};

/// Environment variable naming the TOML settings file.
pub const CONFIG_PATH_ENV: &str = "TAGINDEX_CONFIG";

/// Prefix of `TAGINDEX__section__field` overrides.
const OVERRIDE_PREFIX: &str = "TAGINDEX__";

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
///
/// ```toml
/// [index]
/// table_size = 65536
/// resize_chunk_size = 4096
///
/// [grow]
/// auto_grow = true
/// max_load_factor = 0.8
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexSettings {
    /// Table layout settings.
    pub index: Option<TableSettings>,
    /// Growth policy settings.
    pub grow: Option<GrowSettings>,
}

impl IndexSettings {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `TAGINDEX_CONFIG` env var (if set),
    /// then apply `TAGINDEX__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_PATH_ENV).ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix(OVERRIDE_PREFIX) else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim();

            match parts.as_slice() {
                ["index", "table_size"] => {
                    self.index_mut().table_size = Some(parse_value(&key, value)?);
                }
                ["index", "alignment"] => {
                    self.index_mut().alignment = Some(parse_value(&key, value)?);
                }
                ["index", "resize_chunk_size"] => {
                    self.index_mut().resize_chunk_size = Some(parse_value(&key, value)?);
                }
                ["index", "max_overflow_pages"] => {
                    self.index_mut().max_overflow_pages = Some(parse_value(&key, value)?);
                }
                ["grow", "max_load_factor"] => {
                    self.grow_mut().max_load_factor = Some(parse_value(&key, value)?);
                }
                ["grow", "growth_factor"] => {
                    self.grow_mut().growth_factor = Some(parse_value(&key, value)?);
                }
                ["grow", "auto_grow"] => {
                    self.grow_mut().auto_grow = Some(parse_value(&key, value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build a `MemHashIndexConfig` using defaults plus overrides.
    ///
    /// Sizes are not validated here; `MemHashIndex::initialize` rejects bad ones.
    pub fn to_index_config(&self) -> MemHashIndexConfig {
        let mut config = MemHashIndexConfig::default();
        if let Some(index) = &self.index {
            index.apply_to(&mut config);
        }
        config
    }

    /// Build a `GrowConfig` using defaults plus overrides.
    pub fn to_grow_config(&self) -> GrowConfig {
        let mut config = GrowConfig::default();
        if let Some(grow) = &self.grow {
            grow.apply_to(&mut config);
        }
        config
    }

    fn index_mut(&mut self) -> &mut TableSettings {
        self.index.get_or_insert_with(TableSettings::default)
    }

    fn grow_mut(&mut self) -> &mut GrowSettings {
        self.grow.get_or_insert_with(GrowSettings::default)
    }
}

/// Table layout overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableSettings {
    /// Initial hash table size in buckets.
    pub table_size: Option<u64>,
    /// Bucket array alignment in bytes.
    pub alignment: Option<usize>,
    /// Old-table buckets per resize chunk.
    pub resize_chunk_size: Option<u64>,
    /// Overflow allocator page-table capacity.
    pub max_overflow_pages: Option<usize>,
}

impl TableSettings {
    fn apply_to(&self, config: &mut MemHashIndexConfig) {
        if let Some(value) = self.table_size {
            config.table_size = value;
        }
        if let Some(value) = self.alignment {
            config.alignment = value;
        }
        if let Some(value) = self.resize_chunk_size {
            config.resize_chunk_size = value.max(1);
        }
        if let Some(value) = self.max_overflow_pages {
            config.max_overflow_pages = value.max(1);
        }
    }
}

/// Growth policy overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrowSettings {
    /// Load factor at which growth is suggested.
    pub max_load_factor: Option<f64>,
    /// Size multiplier per growth step.
    pub growth_factor: Option<u64>,
    /// Whether `should_grow` may report true.
    pub auto_grow: Option<bool>,
}

impl GrowSettings {
    fn apply_to(&self, config: &mut GrowConfig) {
        let mut updated = config.clone();
        if let Some(value) = self.max_load_factor {
            updated = updated.with_max_load_factor(value);
        }
        if let Some(value) = self.growth_factor {
            updated = updated.with_growth_factor(value);
        }
        if let Some(value) = self.auto_grow {
            updated = updated.with_auto_grow(value);
        }
        *config = updated;
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
