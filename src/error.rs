use thiserror::Error;

/// Failures the gateway can encounter while serving traffic.
///
/// Backend-side variants never escape to a client connection: the forwarder
/// recovers every one of them into an HTTP error response whose JSON body is
/// the variant's display string. `Config` is the only fatal variant and
/// surfaces as exit code 1 at startup.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("Failed to connect to backend")]
    PoolExhausted { backend: String },
    #[error("Backend connection failed: {0}")]
    BackendUnreachable(String),
    #[error("Backend request timed out")]
    BackendTimeout,
    #[error("Backend protocol error: {0}")]
    BackendProtocol(String),
    #[error("No healthy backends available")]
    NoHealthyBackends,
    #[error("client disconnected")]
    ClientDisconnect,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status the forwarder reports for this failure.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::PoolExhausted { .. } => 502,
            GatewayError::BackendUnreachable(_) => 502,
            GatewayError::BackendTimeout => 504,
            GatewayError::BackendProtocol(_) => 502,
            GatewayError::NoHealthyBackends => 503,
            GatewayError::Config(_) | GatewayError::ClientDisconnect | GatewayError::Io(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
