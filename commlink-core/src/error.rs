use thiserror::Error;

/// Main error type for commlink configuration and I/O plumbing
///
/// Transport lifecycle operations (`open`, `send`, `close`, ...) never hand
/// this type back to the application; they turn it into a status event and a
/// `bool`. It is returned by the configuration-time API: validation, parsing
/// and parameter persistence.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Parameter store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Serial port error: {0}")]
    Serial(String),
}

/// Result type alias for commlink operations
pub type CommResult<T> = Result<T, CommError>;
