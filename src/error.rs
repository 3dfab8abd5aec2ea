use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },
    #[error("client error (status {status}): {message}")]
    Client { status: u16, message: String },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("json encode error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FeedError {
    /// Errors worth another attempt: transient transport faults and 5xx
    /// responses. 4xx responses and validation errors fail immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Server { .. } | Self::Timeout(_)
        )
    }

    /// Errors that indicate the remote side is unreachable, used to drive
    /// the offline flag in the status snapshot.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return Self::Timeout(value.to_string());
        }
        if let Some(status) = value.status() {
            if status.is_client_error() {
                return Self::Client {
                    status: status.as_u16(),
                    message: value.to_string(),
                };
            }
            return Self::Server {
                status: status.as_u16(),
                message: value.to_string(),
            };
        }
        Self::Network(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_and_network_errors_are_retryable() {
        assert!(FeedError::Network("connection refused".to_string()).is_retryable());
        assert!(FeedError::Server {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_retryable());
        assert!(FeedError::Timeout("deadline elapsed".to_string()).is_retryable());
    }

    #[test]
    fn client_and_validation_errors_are_not_retryable() {
        assert!(!FeedError::Client {
            status: 422,
            message: "bad params".to_string()
        }
        .is_retryable());
        assert!(!FeedError::InvalidArgument("bad symbol".to_string()).is_retryable());
        assert!(!FeedError::QuotaExceeded.is_retryable());
    }

    #[test]
    fn only_transport_failures_count_as_offline() {
        assert!(FeedError::Network("dns failure".to_string()).is_network());
        assert!(FeedError::Timeout("deadline elapsed".to_string()).is_network());
        assert!(!FeedError::Server {
            status: 500,
            message: "boom".to_string()
        }
        .is_network());
    }
}
