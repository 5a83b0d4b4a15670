//! Single-flight refresh coordinator
//!
//! State machine over one process-wide `SessionState`:
//!
//! ```text
//! Idle ──401──▶ Refreshing ──exchange ok──▶ Idle (queue replayed FIFO)
//!                   │
//!                   └──exchange failed──▶ Idle (store cleared, queue rejected, logout)
//!
//! Idle ──401, attempt_count >= max──▶ Exhausted (store cleared, logout)
//! Exhausted ──login / establish──▶ Idle
//! ```
//!
//! Login, establish and logout bump a session epoch. An exchange that started
//! under an older epoch settles without writing the store, and a 401 for a
//! request sent with an access credential the store no longer holds is
//! replayed directly with the current one.
//!
//! While a refresh is in flight every other request that sees a 401 joins the
//! queue instead of starting a second exchange. The exchange and the replays
//! run in a spawned task, so a caller that stops waiting can never leave
//! `in_progress` stuck at true.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::Secret;
use session_auth::{AuthGateway, CredentialKind, CredentialPair, CredentialStore};

use crate::error::{Error, Result};
use crate::logout::{LogoutHandler, LogoutReason};
use crate::metrics::{self, ExchangeOutcome};
use crate::pipeline::Dispatcher;
use crate::request::{AuthRequest, TrackedRequest};

/// Refresh exchanges allowed between two successful ones.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub max_attempts: u32,
}

impl RefreshPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    /// No exchange in flight, budget left.
    Idle,
    /// An exchange is in flight; failing requests are queued.
    Refreshing,
    /// Budget spent; every 401 logs out until fresh credentials arrive.
    Exhausted,
}

impl RefreshState {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshState::Idle => "idle",
            RefreshState::Refreshing => "refreshing",
            RefreshState::Exhausted => "exhausted",
        }
    }
}

type Reply = oneshot::Sender<Result<reqwest::Response>>;

/// A request parked until the in-flight exchange settles.
struct Waiter {
    id: Uuid,
    request: AuthRequest,
    reply: Reply,
}

#[derive(Default)]
struct SessionState {
    in_progress: bool,
    attempt_count: u32,
    /// Set when the session is abandoned. The logout collaborator runs only
    /// on the transition to true, so a cascade of 401s logs out once.
    logged_out: bool,
    /// Bumped by `reset_session`. An exchange started under an older epoch
    /// never writes the store.
    epoch: u64,
    queue: VecDeque<Waiter>,
}

impl SessionState {
    fn enqueue(&mut self, id: Uuid, request: AuthRequest) -> oneshot::Receiver<Result<reqwest::Response>> {
        let (reply, rx) = oneshot::channel();
        self.queue.push_back(Waiter { id, request, reply });
        rx
    }
}

enum Admission {
    /// Exchange already in flight; wait for it.
    Queued(oneshot::Receiver<Result<reqwest::Response>>),
    /// This request started the exchange.
    Leader {
        rx: oneshot::Receiver<Result<reqwest::Response>>,
        refresh: Secret<String>,
        attempt: u32,
        epoch: u64,
    },
    /// The store moved on since the request was sent; replay with this.
    Superseded(Secret<String>),
    /// Session abandoned without an exchange.
    Rejected { error: Error, notify: bool, reason: LogoutReason },
}

/// Coordinates refresh exchanges for every request sharing one credential store.
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    gateway: AuthGateway,
    dispatcher: Dispatcher,
    logout: Arc<dyn LogoutHandler>,
    policy: RefreshPolicy,
    state: Mutex<SessionState>,
}

impl RefreshCoordinator {
    pub(crate) fn new(
        store: Arc<CredentialStore>,
        gateway: AuthGateway,
        dispatcher: Dispatcher,
        logout: Arc<dyn LogoutHandler>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            dispatcher,
            logout,
            policy,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Resolve a request that came back 401 and has not been retried yet.
    ///
    /// Returns the replayed response (whatever its status), or the
    /// refresh-level error that ended the session.
    pub async fn handle_unauthorized(
        self: &Arc<Self>,
        tracked: TrackedRequest,
    ) -> Result<reqwest::Response> {
        let id = tracked.id();
        let admission = self.admit(&tracked);

        let rx = match admission {
            Admission::Queued(rx) => {
                debug!(request_id = %id, "refresh in flight, request queued");
                rx
            }
            Admission::Leader {
                rx,
                refresh,
                attempt,
                epoch,
            } => {
                info!(
                    request_id = %id,
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    "starting refresh exchange"
                );
                tokio::spawn(self.clone().run_refresh(refresh, epoch));
                rx
            }
            Admission::Superseded(access) => {
                debug!(request_id = %id, "credentials changed since send, replaying directly");
                return self.replay(id, tracked.request(), Some(&access)).await;
            }
            Admission::Rejected {
                error,
                notify,
                reason,
            } => {
                warn!(request_id = %id, reason = reason.label(), "refresh abandoned");
                if notify {
                    self.notify_logout(reason);
                }
                return Err(error);
            }
        };

        let _guard = QueueGuard {
            coordinator: self,
            id,
        };
        rx.await.unwrap_or(Err(Error::Dropped(id)))
    }

    fn admit(&self, tracked: &TrackedRequest) -> Admission {
        let mut state = self.lock();

        if state.in_progress {
            return Admission::Queued(state.enqueue(tracked.id(), tracked.request().clone()));
        }

        // A refresh (or login) settled between this request's send and its 401.
        if let Some(current) = self.store.get(CredentialKind::Access) {
            if tracked.sent_with() != Some(&current) {
                return Admission::Superseded(current);
            }
        }

        let Some(refresh) = self.store.get(CredentialKind::Refresh) else {
            let notify = self.abandon(&mut state);
            return Admission::Rejected {
                error: Error::NoRefreshCredential,
                notify,
                reason: LogoutReason::NoRefreshCredential,
            };
        };

        // Abandoning clears the store, so a refresh credential here was seeded
        // after the last logout and starts a new cascade.
        state.logged_out = false;

        if state.attempt_count >= self.policy.max_attempts {
            let attempts = state.attempt_count;
            let notify = self.abandon(&mut state);
            return Admission::Rejected {
                error: Error::RefreshAttemptsExhausted { attempts },
                notify,
                reason: LogoutReason::AttemptsExhausted,
            };
        }

        state.in_progress = true;
        state.attempt_count += 1;
        let attempt = state.attempt_count;
        let rx = state.enqueue(tracked.id(), tracked.request().clone());
        Admission::Leader {
            rx,
            refresh,
            attempt,
            epoch: state.epoch,
        }
    }

    async fn run_refresh(self: Arc<Self>, refresh: Secret<String>, epoch: u64) {
        match self.gateway.refresh(refresh.expose()).await {
            Ok(pair) => self.complete(pair, epoch).await,
            Err(e) => self.fail(e, epoch).await,
        }
    }

    async fn complete(&self, pair: CredentialPair, epoch: u64) {
        metrics::record_exchange(ExchangeOutcome::Success);

        let (waiters, access, stale) = {
            let mut state = self.lock();
            state.in_progress = false;
            let waiters = std::mem::take(&mut state.queue);
            if state.epoch != epoch {
                (waiters, self.store.get(CredentialKind::Access), true)
            } else {
                if let Err(e) = self.store.store_pair(&pair) {
                    warn!(error = %e, "failed to persist refreshed credentials");
                }
                state.attempt_count = 0;
                state.logged_out = false;
                (waiters, Some(pair.access.clone()), false)
            }
        };

        if stale {
            info!(
                queued = waiters.len(),
                "session replaced during refresh, discarding refreshed pair"
            );
        } else {
            info!(
                queued = waiters.len(),
                rotated = pair.refresh.is_some(),
                "refresh exchange succeeded, replaying queue"
            );
        }

        self.replay_all(waiters, access).await;
    }

    async fn fail(&self, error: session_auth::Error, epoch: u64) {
        metrics::record_exchange(ExchangeOutcome::Failure);

        let (waiters, notify, current) = {
            let mut state = self.lock();
            state.in_progress = false;
            let waiters = std::mem::take(&mut state.queue);
            if state.epoch != epoch {
                (waiters, false, Some(self.store.get(CredentialKind::Access)))
            } else {
                let notify = self.abandon(&mut state);
                (waiters, notify, None)
            }
        };

        // The failed exchange belonged to a session that was replaced; the
        // queue gets the current session's credential instead.
        if let Some(access) = current {
            info!(
                error = %error,
                queued = waiters.len(),
                "refresh failed after session was replaced, replaying queue"
            );
            self.replay_all(waiters, access).await;
            return;
        }

        warn!(
            error = %error,
            rejected = waiters.len(),
            "refresh exchange failed, ending session"
        );

        for waiter in waiters {
            let _ = waiter
                .reply
                .send(Err(Error::RefreshExchangeFailed(error.clone())));
        }

        if notify {
            self.notify_logout(LogoutReason::RefreshFailed);
        }
    }

    /// Replay drained waiters one at a time, in arrival order.
    async fn replay_all(&self, waiters: VecDeque<Waiter>, access: Option<Secret<String>>) {
        for waiter in waiters {
            if waiter.reply.is_closed() {
                debug!(request_id = %waiter.id, "caller gone, skipping replay");
                continue;
            }
            let result = self
                .replay(waiter.id, &waiter.request, access.as_ref())
                .await;
            // Receiver may have been dropped mid-replay.
            let _ = waiter.reply.send(result);
        }
    }

    async fn replay(
        &self,
        id: Uuid,
        request: &AuthRequest,
        access: Option<&Secret<String>>,
    ) -> Result<reqwest::Response> {
        let result = self
            .dispatcher
            .send(request, access)
            .await
            .map_err(|e| Error::ReplayFailed(e.to_string()));
        metrics::record_replay();
        match &result {
            Ok(response) => debug!(request_id = %id, status = %response.status(), "replayed"),
            Err(e) => warn!(request_id = %id, error = %e, "replay failed"),
        }
        result
    }

    /// Clear the store and latch `logged_out`. Returns whether this call made
    /// the transition, i.e. whether the collaborator should run.
    fn abandon(&self, state: &mut SessionState) -> bool {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear credential store");
        }
        !std::mem::replace(&mut state.logged_out, true)
    }

    fn notify_logout(&self, reason: LogoutReason) {
        metrics::record_logout(reason);
        info!(reason = reason.label(), "session logged out");
        self.logout.logout();
    }

    /// Replace the session from outside the refresh cycle: store `pair`, or
    /// clear the store when there is none. Attempt history and the logout
    /// latch start over. An exchange still in flight settles without writing
    /// the store, and its queue is replayed with whatever the store holds then.
    pub fn reset_session(&self, pair: Option<&CredentialPair>) -> session_auth::Result<()> {
        let mut state = self.lock();
        state.epoch += 1;
        state.attempt_count = 0;
        state.logged_out = false;
        debug!(epoch = state.epoch, in_flight = state.in_progress, "session reset");
        match pair {
            Some(pair) => self.store.store_pair(pair),
            None => self.store.clear(),
        }
    }

    pub fn state(&self) -> RefreshState {
        let state = self.lock();
        if state.in_progress {
            RefreshState::Refreshing
        } else if state.attempt_count >= self.policy.max_attempts {
            RefreshState::Exhausted
        } else {
            RefreshState::Idle
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.lock().attempt_count
    }

    /// Requests currently waiting on the in-flight exchange.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub(crate) fn gateway(&self) -> &AuthGateway {
        &self.gateway
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // Every mutation is a field assignment; a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a queued waiter whose caller stopped waiting.
struct QueueGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    id: Uuid,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.coordinator.lock();
        let before = state.queue.len();
        state.queue.retain(|w| w.id != self.id);
        if state.queue.len() != before {
            debug!(request_id = %self.id, "cancelled request removed from queue");
        }
    }
}
