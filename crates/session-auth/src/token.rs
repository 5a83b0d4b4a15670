//! Authorization server calls
//!
//! Handles the three token endpoint interactions:
//! 1. Password login (initial credential pair)
//! 2. Refresh exchange (called by the refresh coordinator on 401)
//! 3. Logout (server-side revocation of every refresh credential)
//!
//! Every call makes exactly one outbound request. Retrying is the caller's
//! decision; this module never loops.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::Secret;

use crate::constants::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH};
use crate::credentials::CredentialPair;
use crate::error::{Error, Result};

/// Response from the login and refresh endpoints.
///
/// Both token fields are optional on the wire so an incomplete success body
/// is reported as a `TokenExchange` error instead of a JSON decode failure.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Convert to a credential pair.
    ///
    /// A missing or empty access token fails; a stale access credential must
    /// never be reused as if the exchange had produced it. An empty refresh
    /// token counts as "not rotated".
    pub fn into_pair(self) -> Result<CredentialPair> {
        let access = self
            .access_token
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::TokenExchange("response carried no access token".into()))?;
        let refresh = self.refresh_token.filter(|r| !r.is_empty());
        Ok(CredentialPair {
            access: Secret::new(access),
            refresh: refresh.map(Secret::new),
        })
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Client for the authorization server.
///
/// Cheap to clone; `reqwest::Client` is reference counted internally.
#[derive(Debug, Clone)]
pub struct AuthGateway {
    client: reqwest::Client,
    base_url: String,
}

impl AuthGateway {
    /// `base_url` is the auth prefix the endpoint paths hang off, e.g.
    /// `http://localhost:8000/api/v1/auth`.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Exchange a refresh credential for a new pair.
    ///
    /// 401/403 means the refresh credential is invalid, revoked, or already
    /// rotated away and maps to `InvalidCredentials`.
    pub async fn refresh(&self, refresh: &str) -> Result<CredentialPair> {
        let response = self
            .client
            .post(self.endpoint(REFRESH_PATH))
            .json(&RefreshRequest {
                refresh_token: refresh,
            })
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(Error::InvalidCredentials(format!(
                    "refresh token rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "token refresh returned {status}: {body}"
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;
        let pair = token.into_pair()?;
        debug!(rotated = pair.refresh.is_some(), "refresh exchange succeeded");
        Ok(pair)
    }

    /// Password login. The endpoint follows the OAuth2 password flow and
    /// takes form fields, with the email going in `username`.
    pub async fn login(&self, username: &str, password: &str) -> Result<CredentialPair> {
        let response = self
            .client
            .post(self.endpoint(LOGIN_PATH))
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::BAD_REQUEST {
                return Err(Error::InvalidCredentials(format!(
                    "login rejected ({status}): {body}"
                )));
            }
            return Err(Error::TokenExchange(format!(
                "login returned {status}: {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid login response: {e}")))?
            .into_pair()
    }

    /// Revoke every refresh credential the server holds for the bearer's user.
    pub async fn revoke(&self, access: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(LOGOUT_PATH))
            .bearer_auth(access)
            .send()
            .await
            .map_err(|e| Error::Http(format!("logout request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::InvalidCredentials(format!(
                "logout rejected ({status})"
            )));
        }
        Err(Error::TokenExchange(format!("logout returned {status}")))
    }
}
