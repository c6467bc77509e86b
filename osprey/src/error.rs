//! A single error type shared across the daemon.

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while mediating between the protocol
/// layer, the key-value store and the engine process.
///
/// Preference problems (`Config`) are expected and surfaced to the client
/// as scan errors; `Internal` marks a broken invariant and is fatal for the
/// affected scan but never for the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid scan preferences supplied by the client.
    #[error("invalid scan configuration: {0}")]
    Config(String),

    /// The key-value store could not be reached or rejected an operation.
    #[error("key-value store unavailable: {0}")]
    KvUnavailable(String),

    /// Every numbered database is already claimed.
    #[error("no free kb database available")]
    NoFreeDb,

    /// The engine executable could not be spawned.
    #[error("engine launch failed: {0}")]
    EngineLaunch(String),

    /// The engine exited abnormally while a scan was running.
    #[error("engine stopped unexpectedly: {0}")]
    EngineCrashed(String),

    /// The feed could not be located, parsed or refreshed.
    #[error("feed unavailable: {0}")]
    FeedUnavailable(String),

    /// Broken invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for Error {
    fn from(value: redis::RedisError) -> Self {
        Self::KvUnavailable(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Internal(value.to_string())
    }
}
