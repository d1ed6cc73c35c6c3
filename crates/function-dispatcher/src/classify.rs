//! Transient-vs-permanent failure classification (spec §4.7).

use turnflow_core::error::DispatchError;

/// Classify an HTTP status code.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> DispatchError {
    match status.as_u16() {
        408 | 429 => DispatchError::Transient(format!("HTTP {status}: {body}")),
        500..=599 => DispatchError::Transient(format!("HTTP {status}: {body}")),
        _ => DispatchError::Permanent(format!("HTTP {status}: {body}")),
    }
}

/// Classify a transport-level (pre-response) error.
pub fn classify_reqwest_error(err: &reqwest::Error) -> DispatchError {
    if err.is_timeout() || err.is_connect() {
        DispatchError::Transient(err.to_string())
    } else {
        DispatchError::Permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_429_as_transient() {
        assert!(classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
    }

    #[test]
    fn classifies_503_as_transient() {
        assert!(classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
    }

    #[test]
    fn classifies_400_as_permanent() {
        assert!(!classify_status(reqwest::StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn classifies_401_as_permanent() {
        assert!(!classify_status(reqwest::StatusCode::UNAUTHORIZED, "").is_retryable());
    }
}
