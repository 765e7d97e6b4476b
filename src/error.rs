use hyper::StatusCode;
use thiserror::Error;

/// In-band status for "no usable entry in the chosen shard".
pub const POOL_EXHAUSTED_STATUS: u16 = 552;

/// Phrases that mark a verification failure as a rate-limit (and therefore
/// retriable) condition.
const RATE_LIMIT_PHRASES: &[&str] = &[
    "too many requests",
    "rate limit",
    "429",
    "try again later",
    "timed out",
    "timeout",
];

/// Unified error type for the Carousel core
#[derive(Error, Debug)]
pub enum CarouselError {
    // Routing errors
    #[error("pool exhausted")]
    PoolExhausted,

    #[error("all attempts failed for serial {serial} after {attempts} attempts")]
    AllAttemptsFailed { serial: u64, attempts: u64 },

    #[error("transient proxy failure: {0}")]
    TransientProxyFailure(String),

    #[error("proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    // Identifier errors
    #[error("invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Request errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timeout")]
    RequestTimeout,

    #[error("operation timed out")]
    Timeout,

    // Actor plumbing
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Persistence errors
    #[error("persistence error: {0}")]
    Persistence(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for Carousel operations
pub type Result<T> = std::result::Result<T, CarouselError>;

impl CarouselError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // In-band pool statuses
            CarouselError::PoolExhausted => {
                StatusCode::from_u16(POOL_EXHAUSTED_STATUS).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            CarouselError::AllAttemptsFailed { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 400 Bad Request
            CarouselError::InvalidRequest(_)
            | CarouselError::InvalidProxyAddress(_)
            | CarouselError::UnsupportedProtocol(_)
            | CarouselError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 502 Bad Gateway
            CarouselError::TransientProxyFailure(_) | CarouselError::ProxyConnectionFailed(_) => {
                StatusCode::BAD_GATEWAY
            }

            // Timeouts
            CarouselError::RequestTimeout | CarouselError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            CarouselError::ChannelClosed(_)
            | CarouselError::Persistence(_)
            | CarouselError::Io(_)
            | CarouselError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error reports itself as a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CarouselError::Timeout | CarouselError::RequestTimeout)
    }
}

// Convert from hyper errors
impl From<hyper::Error> for CarouselError {
    fn from(err: hyper::Error) -> Self {
        CarouselError::Http(err.to_string())
    }
}

impl From<http::Error> for CarouselError {
    fn from(err: http::Error) -> Self {
        CarouselError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for CarouselError {
    fn from(err: url::ParseError) -> Self {
        CarouselError::InvalidProxyAddress(err.to_string())
    }
}

/// Verification failure reported by a `Checker` collaborator.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct CheckError {
    pub message: String,
    temporary: bool,
    timed_out: bool,
}

impl CheckError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            temporary: false,
            timed_out: false,
        }
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            temporary: true,
            timed_out: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            message: "check timed out".to_string(),
            temporary: true,
            timed_out: true,
        }
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Temporary failures re-enter the reverify loop instead of the blacklist.
    /// Besides self-reported temporariness this matches the message against
    /// known rate-limit phrases.
    pub fn is_temporary(&self) -> bool {
        if self.temporary || self.timed_out {
            return true;
        }
        let lower = self.message.to_lowercase();
        RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            CarouselError::PoolExhausted.status_code().as_u16(),
            POOL_EXHAUSTED_STATUS
        );
        assert_eq!(
            CarouselError::AllAttemptsFailed {
                serial: 1,
                attempts: 10
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            CarouselError::InvalidProxyAddress("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CarouselError::TransientProxyFailure("bad".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            CarouselError::Timeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            CarouselError::ChannelClosed("shard").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_is_timeout() {
        assert!(CarouselError::Timeout.is_timeout());
        assert!(CarouselError::RequestTimeout.is_timeout());
        assert!(!CarouselError::PoolExhausted.is_timeout());
    }

    #[test]
    fn test_check_error_classification() {
        assert!(CheckError::timeout().is_temporary());
        assert!(CheckError::timeout().timed_out());
        assert!(CheckError::temporary("slow down").is_temporary());
        assert!(!CheckError::permanent("bad gateway").is_temporary());

        // Rate-limit phrases make otherwise permanent failures temporary.
        assert!(CheckError::permanent("HTTP 429 Too Many Requests").is_temporary());
        assert!(CheckError::permanent("source rate limit reached").is_temporary());
        assert!(CheckError::permanent("connection timed out").is_temporary());
    }
}
