//! Authenticated HTTP client with single-flight credential refresh
//!
//! Every request goes through the pipeline in `pipeline.rs`: the current
//! access credential is attached as a bearer header before sending, and a 401
//! on the way back is handed to the `RefreshCoordinator`. The coordinator runs
//! at most one refresh exchange at a time, queues every other request that
//! fails while it is in flight, and then either replays the queue with the new
//! credential or rejects it and logs the session out.
//!
//! Session lifecycle:
//! 1. `AuthClient::login()` / `establish()` stores a pair and resets the session
//! 2. Requests carry `Authorization: Bearer <access>`
//! 3. First 401 → one refresh exchange, later 401s wait in the queue
//! 4. Exchange succeeds → pair rotated, queue replayed FIFO
//! 5. Exchange fails, no refresh credential, or budget spent → store cleared,
//!    logout collaborator invoked, queued callers rejected
//! 6. `AuthClient::logout()` revokes server-side and clears the store
//!
//! Steps 1 and 6 start a new session epoch, so an exchange still in flight
//! when they run cannot write its pair back afterwards.

pub mod coordinator;
pub mod error;
pub mod logout;
pub mod metrics;
pub mod pipeline;
pub mod request;

pub use coordinator::{DEFAULT_MAX_ATTEMPTS, RefreshCoordinator, RefreshPolicy, RefreshState};
pub use error::{Error, Result};
pub use logout::{LogoutHandler, LogoutReason, NoopLogout};
pub use pipeline::{AuthClient, ResponseClass, classify_status};
pub use request::{AuthRequest, TrackedRequest};
