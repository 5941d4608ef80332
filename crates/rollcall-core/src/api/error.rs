use thiserror::Error;

use crate::models::{EventKind, RejectReason};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - session may be expired or revoked")]
    SessionExpired,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Party has expired: {0}")]
    Expired(String),

    #[error("Already a member of this party")]
    AlreadyMember,

    #[error("Request rejected: {0}")]
    Validation(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 | 422 => ApiError::Validation(truncated),
            401 => ApiError::SessionExpired,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            408 => ApiError::Timeout,
            409 => Self::from_conflict(truncated),
            410 => ApiError::Expired(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// 409 bodies name the conflict, e.g. `{"error":"already_member"}`.
    fn from_conflict(body: String) -> Self {
        if body.contains("already_member") {
            ApiError::AlreadyMember
        } else if body.contains("expired") {
            ApiError::Expired(body)
        } else {
            ApiError::Validation(body)
        }
    }

    /// Worth retrying with backoff. Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::RateLimited
            | ApiError::ServerError(_)
            | ApiError::Timeout
            | ApiError::InvalidResponse(_) => true,
            ApiError::NetworkError(e) => !(e.is_decode() || e.is_builder()),
            _ => false,
        }
    }

    /// User-facing reason for a permanent failure of an event of `kind`.
    /// Not-found and expired only name the party for party events.
    pub fn reject_reason(&self, kind: EventKind) -> RejectReason {
        let party = kind != EventKind::CheckIn;
        match self {
            ApiError::SessionExpired => RejectReason::SessionExpired,
            ApiError::AccessDenied(_) => RejectReason::AccessDenied,
            ApiError::NotFound(_) if party => RejectReason::PartyNotFound,
            ApiError::Expired(_) if party => RejectReason::PartyExpired,
            ApiError::AlreadyMember => RejectReason::AlreadyMember,
            other => RejectReason::Validation(other.to_string()),
        }
    }
}
