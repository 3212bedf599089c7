use thiserror::Error;

/// Crate-wide result type.
pub type AmiResult<T> = std::result::Result<T, AmiError>;

#[derive(Debug, Error)]
pub enum AmiError {
    // =========
    // Config / startup
    // =========
    #[error("configuration file IO error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse TOML config: {0}")]
    ConfigToml(#[from] toml::de::Error),

    #[error("missing configuration field: {0}")]
    MissingConfig(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========
    // Redis transport
    // =========
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to provision shard stream/group: {0}")]
    Bootstrap(String),

    #[error("malformed stream entry: {0}")]
    Malformed(String),

    // =========
    // Lifecycle
    // =========
    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("internal error: {0}")]
    Internal(String),

    // =========
    // Metrics / Prometheus
    // =========
    #[cfg(feature = "metrics")]
    #[error("prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),
}
