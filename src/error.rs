use http::StatusCode;
use thiserror::Error;

/// Unified error type for the Tamper proxy
#[derive(Error, Debug)]
pub enum TamperError {
    // Origin transport errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Connection closed before response was complete")]
    PrematureClose,

    #[error("Operation timed out")]
    Timeout,

    // Tunnel errors
    #[error("Tunnel error: {0}")]
    TunnelError(String),

    // Certificate errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Proxy authentication failed")]
    AuthenticationFailed,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for Tamper operations
pub type Result<T> = std::result::Result<T, TamperError>;

impl TamperError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            TamperError::InvalidRequest(_) | TamperError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }

            // 407 Proxy Authentication Required
            TamperError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 502 Bad Gateway
            TamperError::ConnectionFailed(_)
            | TamperError::Tls(_)
            | TamperError::MalformedResponse(_)
            | TamperError::PrematureClose
            | TamperError::TunnelError(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            TamperError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            TamperError::Certificate(_) | TamperError::Io(_) | TamperError::Http(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether this error happened while contacting the origin.
    ///
    /// All of these are recorded on the context and surfaced to response filters as one
    /// kind; none of them is retried.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TamperError::ConnectionFailed(_)
                | TamperError::Tls(_)
                | TamperError::MalformedResponse(_)
                | TamperError::PrematureClose
                | TamperError::Timeout
                | TamperError::Io(_)
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for TamperError {
    fn from(err: hyper::Error) -> Self {
        TamperError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for TamperError {
    fn from(err: url::ParseError) -> Self {
        TamperError::InvalidConfig(err.to_string())
    }
}

impl From<httparse::Error> for TamperError {
    fn from(err: httparse::Error) -> Self {
        TamperError::MalformedResponse(err.to_string())
    }
}
