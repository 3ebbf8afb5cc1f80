//! Error kinds carried on the tunnel channel and their public HTTP mapping.

use serde::{Deserialize, Serialize};

/// Failure categories a tunnel peer may report for a correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    UpstreamError,
    InvalidRequest,
    ServerError,
    RateLimited,
}

impl ErrorCode {
    /// Status code presented to the public client for this error kind.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Timeout => 504,
            ErrorCode::UpstreamError => 502,
            ErrorCode::InvalidRequest => 400,
            ErrorCode::ServerError => 500,
            ErrorCode::RateLimited => 429,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::UpstreamError => write!(f, "UPSTREAM_ERROR"),
            ErrorCode::InvalidRequest => write!(f, "INVALID_REQUEST"),
            ErrorCode::ServerError => write!(f, "SERVER_ERROR"),
            ErrorCode::RateLimited => write!(f, "RATE_LIMITED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
        assert_eq!(ErrorCode::UpstreamError.http_status(), 502);
        assert_eq!(ErrorCode::InvalidRequest.http_status(), 400);
        assert_eq!(ErrorCode::ServerError.http_status(), 500);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
    }

    #[test]
    fn wire_names_are_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::UpstreamError).unwrap();
        assert_eq!(json, "\"UPSTREAM_ERROR\"");
        let back: ErrorCode = serde_json::from_str("\"RATE_LIMITED\"").unwrap();
        assert_eq!(back, ErrorCode::RateLimited);
    }
}
