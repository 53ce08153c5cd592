use thiserror::Error;

/// Errors surfaced to API callers. Each variant maps to a stable kind string
/// and an HTTP status; the transport layer does the serialization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("authentication required")]
    AuthRequired,

    #[error("invalid credentials or session")]
    AuthInvalid,

    #[error("forbidden")]
    Forbidden,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("day is not open for bidding")]
    DayNotOpen,

    #[error("slot is reserved by policy")]
    Reserved,

    #[error("insufficient credit")]
    InsufficientCredit,

    #[error("caller does not own this slot")]
    NotOwner,

    #[error("slot starts too soon to release")]
    TooLateToRelease,

    #[error("undo conflicts with another user's bid")]
    Conflict,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ApiError::NotFound(what.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError::Internal(msg.into())
    }

    /// Stable machine-readable kind, part of the API contract.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth-required",
            ApiError::AuthInvalid => "auth-invalid",
            ApiError::Forbidden => "forbidden",
            ApiError::BadRequest(_) => "bad-request",
            ApiError::NotFound(_) => "not-found",
            ApiError::DayNotOpen => "day-not-open",
            ApiError::Reserved => "reserved",
            ApiError::InsufficientCredit => "insufficient-credit",
            ApiError::NotOwner => "not-owner",
            ApiError::TooLateToRelease => "too-late-to-release",
            ApiError::Conflict => "conflict",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ApiError::AuthRequired | ApiError::AuthInvalid => 401,
            ApiError::Forbidden | ApiError::NotOwner | ApiError::Reserved => 403,
            ApiError::NotFound(_) => 404,
            ApiError::BadRequest(_)
            | ApiError::DayNotOpen
            | ApiError::InsufficientCredit
            | ApiError::TooLateToRelease
            | ApiError::Conflict => 400,
            ApiError::Internal(_) => 500,
        }
    }
}
