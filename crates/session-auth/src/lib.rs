//! Session credential library
//!
//! Holds the two opaque credentials a client session needs (access and
//! refresh) and talks to the authorization server's token endpoints. This
//! crate has no knowledge of request replay or single-flight coordination;
//! that lives in `session-client`.
//!
//! Credential flow:
//! 1. Client calls `AuthGateway::login()` (or receives a pair from an OAuth callback)
//! 2. Pair stored via `CredentialStore::store_pair()`
//! 3. A protected call fails with 401, the coordinator calls `AuthGateway::refresh()`
//! 4. Rotated pair saved via `CredentialStore::store_pair()`
//! 5. User logout calls `AuthGateway::revoke()` then `CredentialStore::clear()`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{CredentialKind, CredentialPair, CredentialStore};
pub use error::{Error, Result};
pub use token::{AuthGateway, TokenResponse};
