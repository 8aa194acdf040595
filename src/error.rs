use thiserror::Error;

/// Main error type for the servman supervision engine
#[derive(Debug, Error)]
pub enum ServmanError {
    // Server lookup / declaration errors
    #[error("Server not configured: {0}")]
    NotConfigured(String),

    #[error("No executable found for server {0}")]
    ExecutableNotFound(String),

    #[error("Server {0} has no running or discoverable process")]
    NotRunning(String),

    // Process lifecycle errors
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Failed to stop server {0}: {1}")]
    StopError(String, String),

    #[error("{remaining} processes remaining under {server}")]
    ProcessesRemaining { server: String, remaining: usize },

    // Update engine errors
    #[error("Update already running for {0}")]
    UpdateInProgress(String),

    #[error("Update timed out after {0} minutes")]
    UpdateTimeout(u64),

    #[error("Update tool not found at {0}")]
    UpdateToolMissing(String),

    #[error("Update rejected: {0}")]
    UpdateRejected(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // PID cache errors
    #[error("PID cache error: {0}")]
    CacheError(String),

    // System errors
    #[error("System error: {0}")]
    SystemError(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for servman operations
pub type Result<T> = std::result::Result<T, ServmanError>;
