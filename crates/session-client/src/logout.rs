//! Logout collaborator
//!
//! The coordinator calls out to the host application when it gives up on a
//! session. What "logged out" means there (drop UI state, navigate to a login
//! page, print a hint) is the host's business; the coordinator only decides
//! when.

/// Why the coordinator abandoned the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// A 401 arrived and no refresh credential was stored.
    NoRefreshCredential,
    /// The attempt budget was already spent.
    AttemptsExhausted,
    /// The refresh exchange itself failed.
    RefreshFailed,
}

impl LogoutReason {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            LogoutReason::NoRefreshCredential => "no_refresh_credential",
            LogoutReason::AttemptsExhausted => "attempts_exhausted",
            LogoutReason::RefreshFailed => "refresh_failed",
        }
    }
}

/// Action invoked when refresh is abandoned.
///
/// Called after the credential store has been cleared, outside every internal
/// lock, so implementations may call back into the client.
pub trait LogoutHandler: Send + Sync {
    fn logout(&self);
}

impl<F> LogoutHandler for F
where
    F: Fn() + Send + Sync,
{
    fn logout(&self) {
        self()
    }
}

/// Handler for hosts with no session UI to tear down.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogout;

impl LogoutHandler for NoopLogout {
    fn logout(&self) {}
}
