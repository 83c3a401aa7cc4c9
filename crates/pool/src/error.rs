use thiserror::Error;

/// Errors surfaced by the pool dispatch layer.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The submitter's local wait elapsed before a worker replied.
    /// The queued entry, if any, is dropped lazily at match time.
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The queue manager is not running (never started, or already gone).
    #[error("queue manager is not running")]
    ManagerGone,

    /// The queue manager terminated while this call was still pending.
    #[error("queue shutdown: {0}")]
    QueueShutdown(String),

    /// Introspection was asked about a pool the registry does not know.
    #[error("invalid pool: {0}")]
    InvalidPool(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}
