use thiserror::Error;

/// Transport failure or a non-success HTTP status.
///
/// One coalesced fetch hands the same value to every waiter.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("HTTP {status}: {url}")]
    Status { status: u16, url: String },

    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("fetch task for {url} aborted: {message}")]
    Aborted { url: String, message: String },

    #[error("request for {0} cancelled")]
    Cancelled(String),
}

impl NetworkError {
    pub fn transport(url: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Bytes could not be interpreted as an image.
#[derive(Debug, Clone, Error)]
#[error("decode error: {0}")]
pub struct DecodeError(pub String);

/// Disk I/O failure inside the persistent cache.
///
/// Never leaves the cache: callers only ever observe a miss.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] image::ImageError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What a consumer sees in [`crate::loader::LoadPhase::Failure`].
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
