//! Error types surfaced to callers of the authenticated client

use uuid::Uuid;

/// Errors from the request pipeline and refresh coordinator.
///
/// The first three variants are refresh-level outcomes: each one has already
/// cleared the credential store and logged the session out by the time a
/// caller sees it. `ReplayFailed` concerns only the request that carries it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no refresh credential available")]
    NoRefreshCredential,

    #[error("refresh attempts exhausted after {attempts} attempts")]
    RefreshAttemptsExhausted { attempts: u32 },

    #[error("refresh exchange failed: {0}")]
    RefreshExchangeFailed(#[source] session_auth::Error),

    #[error("replayed request failed: {0}")]
    ReplayFailed(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] session_auth::Error),

    #[error("request {0} was dropped by the refresh coordinator")]
    Dropped(Uuid),
}

impl Error {
    /// Whether this error ended the session (store cleared, logout invoked).
    pub fn is_session_ended(&self) -> bool {
        matches!(
            self,
            Error::NoRefreshCredential
                | Error::RefreshAttemptsExhausted { .. }
                | Error::RefreshExchangeFailed(_)
        )
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
