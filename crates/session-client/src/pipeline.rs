//! Request pipeline
//!
//! Pre-send: attach `Authorization: Bearer <access>` from the credential
//! store. Post-receive: pass everything through except a 401 on a request
//! that has not been retried, which goes to the refresh coordinator.

use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use tracing::{debug, warn};

use common::Secret;
use session_auth::{AuthGateway, CredentialKind, CredentialPair, CredentialStore};

use crate::coordinator::{RefreshCoordinator, RefreshPolicy};
use crate::error::{Error, Result};
use crate::logout::LogoutHandler;
use crate::request::{AuthRequest, TrackedRequest};

/// How the pipeline treats a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Not an error status; returned as-is.
    Success,
    /// 401; eligible for one refresh-and-replay.
    Unauthorized,
    /// Any other 4xx/5xx; returned as-is.
    Failure,
}

/// 403 is a permission decision, not an expired credential, so only 401
/// triggers a refresh.
pub fn classify_status(status: StatusCode) -> ResponseClass {
    if status == StatusCode::UNAUTHORIZED {
        ResponseClass::Unauthorized
    } else if status.is_client_error() || status.is_server_error() {
        ResponseClass::Failure
    } else {
        ResponseClass::Success
    }
}

/// Sends an `AuthRequest` with a given access credential.
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    http: reqwest::Client,
}

impl Dispatcher {
    pub(crate) fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// A caller-supplied `Authorization` header is replaced when an access
    /// credential is present and kept otherwise.
    pub(crate) async fn send(
        &self,
        request: &AuthRequest,
        access: Option<&Secret<String>>,
    ) -> reqwest::Result<reqwest::Response> {
        let mut headers = request.headers.clone();
        if access.is_some() {
            headers.remove(AUTHORIZATION);
        }

        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .headers(headers);
        if let Some(access) = access {
            builder = builder.bearer_auth(access.expose());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder.send().await
    }
}

/// HTTP client that keeps the session's access credential valid.
///
/// Clones share the credential store and refresh coordinator.
#[derive(Clone)]
pub struct AuthClient {
    coordinator: Arc<RefreshCoordinator>,
}

impl AuthClient {
    /// `http` is used for API calls and replays; the gateway carries its own
    /// client for the authorization server.
    pub fn new(
        http: reqwest::Client,
        gateway: AuthGateway,
        store: Arc<CredentialStore>,
        logout: Arc<dyn LogoutHandler>,
        policy: RefreshPolicy,
    ) -> Self {
        let coordinator =
            RefreshCoordinator::new(store, gateway, Dispatcher::new(http), logout, policy);
        Self {
            coordinator: Arc::new(coordinator),
        }
    }

    /// Send a request through the pipeline.
    ///
    /// Non-401 responses come back unchanged, error statuses included. A 401
    /// is resolved by the coordinator: the replayed response if the refresh
    /// succeeded, a refresh-level error if the session ended.
    pub async fn send(&self, request: AuthRequest) -> Result<reqwest::Response> {
        let mut tracked = TrackedRequest::new(request);
        tracked.record_access(self.coordinator.store().get(CredentialKind::Access));

        let response = self
            .coordinator
            .dispatcher()
            .send(tracked.request(), tracked.sent_with())
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        match classify_status(status) {
            ResponseClass::Unauthorized if !tracked.is_retried() => {
                debug!(
                    request_id = %tracked.id(),
                    url = %tracked.request().url,
                    "401 received, handing to refresh coordinator"
                );
                tracked.mark_retried();
                drop(response);
                self.coordinator.handle_unauthorized(tracked).await
            }
            _ => Ok(response),
        }
    }

    pub async fn get(&self, url: impl Into<String>) -> Result<reqwest::Response> {
        self.send(AuthRequest::get(url)).await
    }

    /// Password login. Stores the issued pair and clears any exhausted state.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let pair = self.coordinator.gateway().login(username, password).await?;
        self.establish(pair)
    }

    /// Adopt a pair obtained elsewhere (registration, OAuth callback).
    ///
    /// Takes precedence over a refresh exchange still in flight.
    pub fn establish(&self, pair: CredentialPair) -> Result<()> {
        self.coordinator.reset_session(Some(&pair))?;
        debug!("session established");
        Ok(())
    }

    /// User-initiated logout.
    ///
    /// Revocation is best effort: the local store is cleared even if the
    /// server can't be reached. The logout collaborator is not invoked; the
    /// caller already knows.
    pub async fn logout(&self) -> Result<()> {
        if let Some(access) = self.coordinator.store().get(CredentialKind::Access) {
            if let Err(e) = self.coordinator.gateway().revoke(access.expose()).await {
                warn!(error = %e, "server-side logout failed, clearing local credentials anyway");
            }
        }
        self.coordinator.reset_session(None)?;
        debug!("session logged out by user");
        Ok(())
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.coordinator.store()
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }
}
