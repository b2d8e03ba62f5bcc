//! Pipeline configuration.
//!
//! One explicit struct handed to [`crate::ImagePipeline::new`]; nothing here
//! is process-global. Durations are written as (fractional) seconds in TOML.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{
    constants::{disk, memory, network, presentation},
    error::ConfigError,
    units::ByteSize,
};

/// Upper bound on `retry_count`; keeps `delay * 2^attempt` finite.
pub const MAX_RETRY_COUNT: u32 = 16;

/// Scheduling hint for pipeline work.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    #[default]
    UserInitiated,
    Utility,
    /// Prefetch yields to the scheduler between items.
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheLimits {
    #[serde(with = "secs")]
    pub ttl: Duration,
    pub max_bytes: ByteSize,
}

impl DiskCacheLimits {
    pub const fn defaults() -> Self {
        Self {
            ttl: disk::DEFAULT_TTL,
            max_bytes: disk::DEFAULT_MAX_BYTES,
        }
    }

    /// Apply the floors: ttl at least a minute, budget at least 1 MiB.
    pub fn clamped(self) -> Self {
        Self {
            ttl: self.ttl.max(disk::MIN_TTL),
            max_bytes: self.max_bytes.max(disk::MIN_MAX_BYTES),
        }
    }
}

impl Default for DiskCacheLimits {
    fn default() -> Self {
        Self::defaults()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheLimits {
    pub max_entries: usize,
    pub max_cost: ByteSize,
}

impl Default for MemoryCacheLimits {
    fn default() -> Self {
        Self {
            max_entries: memory::DEFAULT_MAX_ENTRIES,
            max_cost: memory::DEFAULT_MAX_COST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: network::REQUEST_TIMEOUT,
            connect_timeout: network::CONNECT_TIMEOUT,
            pool_max_idle_per_host: network::POOL_MAX_IDLE_PER_HOST,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Retry attempts after the first try.
    pub retry_count: u32,
    /// Base backoff; attempt `n` waits `retry_delay * 2^n`.
    #[serde(with = "secs")]
    pub retry_delay: Duration,
    pub task_priority: TaskPriority,
    /// Presentation hint for UI layers; the pipeline never reads it.
    #[serde(with = "secs")]
    pub fade_in_duration: Duration,
    /// Falls back to the platform cache directory when unset.
    pub cache_dir: Option<PathBuf>,
    pub disk: DiskCacheLimits,
    pub memory: MemoryCacheLimits,
    pub http: HttpConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_count: network::DEFAULT_RETRY_COUNT,
            retry_delay: network::DEFAULT_RETRY_DELAY,
            task_priority: TaskPriority::default(),
            fade_in_duration: presentation::DEFAULT_FADE_IN,
            cache_dir: None,
            disk: DiskCacheLimits::default(),
            memory: MemoryCacheLimits::default(),
            http: HttpConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_count > MAX_RETRY_COUNT {
            return Err(ConfigError::Invalid {
                field: "retry_count",
                reason: format!(
                    "{} exceeds the maximum of {MAX_RETRY_COUNT}",
                    self.retry_count
                ),
            });
        }
        if self.memory.max_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "memory.max_entries",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn resolve_cache_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_cache_dir(),
        }
    }
}

/// `<platform cache dir>/images`, e.g. `~/.cache/softcover-images/images`.
pub fn default_cache_dir() -> anyhow::Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("", "softcover", "softcover-images")
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve ProjectDirs"))?;
    Ok(proj_dirs.cache_dir().join("images"))
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
