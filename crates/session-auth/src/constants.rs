//! Authorization server endpoint paths
//!
//! Paths are appended to the configured auth base URL, e.g.
//! `http://localhost:8000/api/v1/auth` + `/refresh`.

/// Refresh exchange: JSON body `{"refresh_token": ...}`
pub const REFRESH_PATH: &str = "/refresh";

/// Password login: form fields `username` and `password`
pub const LOGIN_PATH: &str = "/login";

/// Server-side revocation of every refresh credential for the bearer's user
pub const LOGOUT_PATH: &str = "/logout";
