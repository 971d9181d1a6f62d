use std::time::Duration;

/// Errors raised while loading or validating agent configuration.
///
/// # Examples
///
/// ```rust
/// use oxmon_agent::error::ConfigError;
///
/// let err = ConfigError::Invalid("agent_id must not be empty".to_string());
/// assert!(err.to_string().contains("agent_id"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the agent's schedulers, publication boundary and
/// instance supervisor.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// An item whose timeout exceeds its interval is never scheduled.
    #[error("item '{name}': timeout {timeout:?} exceeds interval {interval:?}")]
    TimeoutExceedsInterval {
        name: String,
        timeout: Duration,
        interval: Duration,
    },

    #[error("item '{name}': interval must be greater than zero")]
    ZeroInterval { name: String },

    /// `start` was called on an executor or scheduler that already ran.
    #[error("{0} was already started")]
    AlreadyStarted(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind webserver on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The publication boundary did not accept a snapshot in time.
    #[error("snapshot publication timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("publication boundary is closed")]
    PublishClosed,

    /// Even the `{"error": ...}` fallback document could not be encoded.
    #[error("failed to serialize snapshot: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The instance control loop is no longer running.
    #[error("agent instance is not running")]
    Stopped,
}

/// Convenience `Result` alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
