use thiserror::Error;

/// Stable error taxonomy surfaced to callers of the client orchestrator and transports.
#[derive(Error, Debug)]
pub enum UtcpError {
    #[error("Invalid provider: {0}")]
    InvalidProvider(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("No transport registered for provider kind: {0}")]
    NoTransport(String),

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Failed to encode request: {0}")]
    EncodeFailed(String),

    #[error("Failed to decode response: {0}")]
    DecodeFailed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Remote error {code}: {message}")]
    RemoteError { code: i64, message: String },

    #[error("Stream error {code:?}: {message}")]
    StreamError {
        code: Option<i64>,
        message: String,
    },

    #[error("Command injection rejected: {0}")]
    CommandInjection(String),

    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("Invalid extension: {0}")]
    InvalidExtension(String),

    #[error("Connection pool exhausted for key: {0}")]
    PoolExhausted(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UtcpError {
    /// Whether this error should be retried with exponential backoff by a transport-level
    /// caller. `ConnectFailed` and 5xx-shaped `RemoteError`s are retried; decode/validation
    /// failures and 4xx-shaped remote errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            UtcpError::ConnectFailed(_) => true,
            UtcpError::RemoteError { code, .. } => (500..600).contains(code),
            _ => false,
        }
    }

    /// Wrap an error with the name of the orchestrator step that failed, per the
    /// propagation policy in the error handling design: callers see
    /// "Failed to discover tools: ..." rather than a bare transport error.
    pub fn wrap_step(step: &str, err: impl std::fmt::Display) -> UtcpError {
        UtcpError::Other(anyhow::anyhow!("Failed to {step}: {err}"))
    }
}
