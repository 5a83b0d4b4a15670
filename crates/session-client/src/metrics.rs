//! Session metrics
//!
//! - `session_refresh_exchanges_total` (counter): label `outcome` (`success` | `failure`)
//! - `session_requests_replayed_total` (counter)
//! - `session_logouts_total` (counter): label `reason`
//!
//! With no recorder installed these are no-ops.

use crate::logout::LogoutReason;

/// Outcome label for a finished refresh exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Success,
    Failure,
}

impl ExchangeOutcome {
    fn label(&self) -> &'static str {
        match self {
            ExchangeOutcome::Success => "success",
            ExchangeOutcome::Failure => "failure",
        }
    }
}

pub fn record_exchange(outcome: ExchangeOutcome) {
    metrics::counter!("session_refresh_exchanges_total", "outcome" => outcome.label())
        .increment(1);
}

pub fn record_replay() {
    metrics::counter!("session_requests_replayed_total").increment(1);
}

pub fn record_logout(reason: LogoutReason) {
    metrics::counter!("session_logouts_total", "reason" => reason.label()).increment(1);
}
