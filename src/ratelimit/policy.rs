//! What to do when the limiter cannot decide.
//!
//! The facade reports store failures as errors. Request handlers feed those
//! results through an [`OutageGuard`], which applies the configured
//! fail-open / fail-closed policy and keeps count of every degraded decision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::bucket::Decision;
use super::limiter::LimiterError;

/// How long an outage may last before `FailOpenThenClosed` starts rejecting.
const DEFAULT_FAIL_CLOSED_AFTER_SECS: u64 = 30;

/// Behaviour while the store is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutageMode {
    /// Admit every request
    FailOpen,
    /// Reject every request
    FailClosed,
    /// Admit until the outage has lasted `fail_closed_after`, then reject
    FailOpenThenClosed,
}

/// Outage policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutagePolicy {
    #[serde(default = "default_mode")]
    pub mode: OutageMode,

    /// Outage length after which `FailOpenThenClosed` fails closed
    #[serde(default = "default_fail_closed_after_secs")]
    pub fail_closed_after_secs: u64,
}

impl Default for OutagePolicy {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            fail_closed_after_secs: default_fail_closed_after_secs(),
        }
    }
}

fn default_mode() -> OutageMode {
    OutageMode::FailOpenThenClosed
}

fn default_fail_closed_after_secs() -> u64 {
    DEFAULT_FAIL_CLOSED_AFTER_SECS
}

impl OutagePolicy {
    pub fn fail_closed_after(&self) -> Duration {
        Duration::from_secs(self.fail_closed_after_secs)
    }
}

/// The handler-facing result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The bucket had enough tokens
    Allowed { tokens_remaining: f64 },
    /// The bucket did not have enough tokens
    RateLimited { tokens_remaining: f64 },
    /// The store was unavailable and the policy admitted the request anyway
    FailedOpen,
    /// The store was unavailable and the policy rejected the request
    Unavailable,
    /// The call itself was invalid; a bug or bad configuration on our side
    Misconfigured(String),
}

impl Admission {
    /// Whether the request should proceed.
    pub fn proceeds(&self) -> bool {
        matches!(self, Admission::Allowed { .. } | Admission::FailedOpen)
    }

    /// HTTP status code a handler should respond with when the request does
    /// not proceed (200 when it does).
    pub fn status_code(&self) -> u16 {
        match self {
            Admission::Allowed { .. } | Admission::FailedOpen => 200,
            Admission::RateLimited { .. } => 429,
            Admission::Unavailable => 503,
            Admission::Misconfigured(_) => 500,
        }
    }
}

/// Counters of degraded decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutageStats {
    pub failed_open: u64,
    pub failed_closed: u64,
}

/// Applies an [`OutagePolicy`] to limiter results and tracks outage duration.
///
/// Shared by all handlers of a process; an outage starts at the first store
/// failure and ends at the next successful decision.
#[derive(Debug)]
pub struct OutageGuard {
    policy: OutagePolicy,
    outage_started: Mutex<Option<Instant>>,
    failed_open: AtomicU64,
    failed_closed: AtomicU64,
}

impl OutageGuard {
    /// Create a new guard.
    pub fn new(policy: OutagePolicy) -> Self {
        Self {
            policy,
            outage_started: Mutex::new(None),
            failed_open: AtomicU64::new(0),
            failed_closed: AtomicU64::new(0),
        }
    }

    /// Map a limiter result to an admission.
    pub fn resolve(&self, result: Result<Decision, LimiterError>) -> Admission {
        self.resolve_at(result, Instant::now())
    }

    /// Like [`OutageGuard::resolve`] with an explicit current instant.
    pub fn resolve_at(&self, result: Result<Decision, LimiterError>, now: Instant) -> Admission {
        match result {
            Ok(decision) => {
                self.end_outage(now);
                if decision.admitted {
                    Admission::Allowed {
                        tokens_remaining: decision.tokens_remaining,
                    }
                } else {
                    Admission::RateLimited {
                        tokens_remaining: decision.tokens_remaining,
                    }
                }
            }
            Err(LimiterError::Unavailable(e)) => {
                let outage = self.outage_duration(now);
                if self.fails_open(outage) {
                    self.failed_open.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        error = %e,
                        outage_ms = outage.as_millis() as u64,
                        "Rate limiter unavailable, admitting request"
                    );
                    Admission::FailedOpen
                } else {
                    self.failed_closed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        error = %e,
                        outage_ms = outage.as_millis() as u64,
                        "Rate limiter unavailable, rejecting request"
                    );
                    Admission::Unavailable
                }
            }
            Err(e) => {
                error!(error = %e, "Invalid rate limit call");
                Admission::Misconfigured(e.to_string())
            }
        }
    }

    /// Snapshot of the degraded-decision counters.
    pub fn stats(&self) -> OutageStats {
        OutageStats {
            failed_open: self.failed_open.load(Ordering::Relaxed),
            failed_closed: self.failed_closed.load(Ordering::Relaxed),
        }
    }

    /// Whether an outage is currently in progress.
    pub fn in_outage(&self) -> bool {
        self.outage_started.lock().is_some()
    }

    fn fails_open(&self, outage: Duration) -> bool {
        match self.policy.mode {
            OutageMode::FailOpen => true,
            OutageMode::FailClosed => false,
            OutageMode::FailOpenThenClosed => outage < self.policy.fail_closed_after(),
        }
    }

    fn outage_duration(&self, now: Instant) -> Duration {
        let mut started = self.outage_started.lock();
        let start = *started.get_or_insert(now);
        now.saturating_duration_since(start)
    }

    fn end_outage(&self, now: Instant) {
        if let Some(start) = self.outage_started.lock().take() {
            info!(
                outage_ms = now.saturating_duration_since(start).as_millis() as u64,
                "Rate limiter recovered"
            );
        }
    }
}
