//! Circuit breaker guarding writes to a failing dependency.
//!
//! CLOSED passes everything through. `threshold` consecutive failures trip
//! the breaker OPEN; while OPEN all calls are refused until `reset_timeout`
//! has elapsed, at which point a single probe is let through (HALF-OPEN).
//! One probe success closes the breaker, a probe failure re-opens it.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name,
            threshold,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .map(|i| i.state)
            .unwrap_or(BreakerState::Open)
    }

    /// Whether a call may proceed right now. Transitions OPEN → HALF-OPEN
    /// when the reset timeout has elapsed; the caller that gets `true` in
    /// that window is the probe.
    pub fn allow(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!(breaker = self.name, "probing (half-open)");
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.state != BreakerState::Closed {
            info!(breaker = self.name, "closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = self.name, "probe failed, re-opening");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed if inner.consecutive_failures >= self.threshold => {
                warn!(
                    breaker = self.name,
                    failures = inner.consecutive_failures,
                    "tripped open"
                );
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {}
        }
    }
}
