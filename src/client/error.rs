use thiserror::Error;

use crate::domain::VehicleSnapshot;

/// Classification of an upstream failure, derived from the error message
/// the way the vendor SDK surfaces them (no structured codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    Auth,
    VehicleNotFound,
    Network,
    ServiceUnavailable,
    VehicleOffline,
    PartialPayload,
    Unknown,
}

/// Classify a vendor error message by phrase matching.
pub fn classify_message(message: &str) -> ErrorKind {
    let msg = message.to_lowercase();
    let contains_any = |phrases: &[&str]| phrases.iter().any(|p| msg.contains(p));

    if contains_any(&["vehiclestatus"]) {
        // Known-missing subfield in the response; recovered via the
        // backend's cached-state call rather than surfaced.
        return ErrorKind::PartialPayload;
    }
    if contains_any(&[
        "rate limit",
        "too many requests",
        "quota exceeded",
        "throttled",
        "429",
        "limit exceeded",
        "quota",
    ]) {
        return ErrorKind::RateLimit;
    }
    if contains_any(&[
        "unauthorized",
        "401",
        "authentication",
        "invalid credentials",
        "login failed",
        "token expired",
        "forbidden",
        "403",
    ]) {
        return ErrorKind::Auth;
    }
    if contains_any(&["vehicle not found", "no vehicles", "invalid vehicle"]) {
        return ErrorKind::VehicleNotFound;
    }
    if contains_any(&[
        "connection",
        "timeout",
        "timed out",
        "network",
        "unreachable",
        "ssl",
        "certificate",
        "handshake",
    ]) {
        return ErrorKind::Network;
    }
    if contains_any(&[
        "service unavailable",
        "503",
        "maintenance",
        "temporarily unavailable",
        "500",
        "server error",
        "502",
        "bad gateway",
    ]) {
        return ErrorKind::ServiceUnavailable;
    }
    if contains_any(&[
        "vehicle offline",
        "cannot reach vehicle",
        "vehicle communication",
        "remote command failed",
        "vehicle not responding",
    ]) {
        return ErrorKind::VehicleOffline;
    }
    ErrorKind::Unknown
}

/// Failure surfaced by [`super::VehicleClient::fetch`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// The daily quota is spent, locally (governor said no) or remotely
    /// (the vendor rejected the call). Carries the best stale snapshot
    /// when one exists, tagged `is_cached`.
    #[error("{message}")]
    QuotaExhausted {
        message: String,
        stale: Option<Box<VehicleSnapshot>>,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("vendor service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("vehicle unreachable: {0}")]
    VehicleOffline(String),

    #[error("vehicle not found: {0}")]
    VehicleNotFound(String),

    #[error("incomplete vendor payload: {0}")]
    PartialPayload(String),

    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl FetchError {
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::RateLimit => FetchError::QuotaExhausted { message, stale: None },
            ErrorKind::Auth => FetchError::Auth(message),
            ErrorKind::Network => FetchError::Network(message),
            ErrorKind::ServiceUnavailable => FetchError::ServiceUnavailable(message),
            ErrorKind::VehicleOffline => FetchError::VehicleOffline(message),
            ErrorKind::VehicleNotFound => FetchError::VehicleNotFound(message),
            ErrorKind::PartialPayload => FetchError::PartialPayload(message),
            ErrorKind::Unknown => FetchError::Unknown(message),
        }
    }

    /// Tag used in persisted error records and API responses.
    pub fn error_type(&self) -> &'static str {
        match self {
            FetchError::QuotaExhausted { .. } => "rate_limit",
            FetchError::Auth(_) => "auth",
            FetchError::Network(_) => "network",
            FetchError::ServiceUnavailable(_) => "service_unavailable",
            FetchError::VehicleOffline(_) => "vehicle_offline",
            FetchError::VehicleNotFound(_) => "vehicle_not_found",
            FetchError::PartialPayload(_) => "partial_payload",
            FetchError::Unknown(_) => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("API rate limit reached, try later", ErrorKind::RateLimit)]
    #[case("HTTP 429 Too Many Requests", ErrorKind::RateLimit)]
    #[case("daily quota exceeded", ErrorKind::RateLimit)]
    #[case("401 Unauthorized", ErrorKind::Auth)]
    #[case("login failed for user", ErrorKind::Auth)]
    #[case("token expired", ErrorKind::Auth)]
    #[case("vehicle not found in account", ErrorKind::VehicleNotFound)]
    #[case("connection reset by peer", ErrorKind::Network)]
    #[case("request timed out", ErrorKind::Network)]
    #[case("SSL handshake error", ErrorKind::Network)]
    #[case("503 Service Unavailable", ErrorKind::ServiceUnavailable)]
    #[case("scheduled maintenance window", ErrorKind::ServiceUnavailable)]
    #[case("cannot reach vehicle", ErrorKind::VehicleOffline)]
    #[case("missing key 'vehicleStatus'", ErrorKind::PartialPayload)]
    #[case("something else entirely", ErrorKind::Unknown)]
    fn classifies_by_phrase(#[case] message: &str, #[case] expected: ErrorKind) {
        assert_eq!(classify_message(message), expected);
    }

    #[test]
    fn error_type_tags_match_taxonomy() {
        assert_eq!(
            FetchError::QuotaExhausted { message: "x".into(), stale: None }.error_type(),
            "rate_limit"
        );
        assert_eq!(FetchError::Auth("x".into()).error_type(), "auth");
        assert_eq!(FetchError::Network("x".into()).error_type(), "network");
        assert_eq!(
            FetchError::ServiceUnavailable("x".into()).error_type(),
            "service_unavailable"
        );
    }
}
