//! Circuit breaker
//!
//! `closed` counts consecutive failures. Reaching the threshold opens the
//! circuit: calls fail fast until the cooldown has passed. The first caller
//! after the cooldown becomes the single half-open probe; everyone else keeps
//! failing fast until the probe reports back.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Operator-facing snapshot of one resource's circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    /// Time left before a probe is allowed, while open
    pub retry_after: Option<Duration>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            retry_after: None,
        }
    }
}

/// What the breaker granted a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Normal,
    Probe,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub(crate) fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn remaining_cooldown(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|opened| (opened + self.cooldown).saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Admit a call, or return how long the caller should wait
    pub(crate) fn admit(&mut self, now: Instant) -> Result<Admission, Duration> {
        match self.status {
            CircuitStatus::Closed => Ok(Admission::Normal),
            CircuitStatus::Open => {
                let remaining = self.remaining_cooldown(now);
                if remaining.is_zero() {
                    self.status = CircuitStatus::HalfOpen;
                    self.probe_in_flight = true;
                    Ok(Admission::Probe)
                } else {
                    Err(remaining)
                }
            }
            CircuitStatus::HalfOpen => {
                if self.probe_in_flight {
                    Err(Duration::ZERO)
                } else {
                    self.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Record a successful call. Returns true if this closed the circuit.
    pub(crate) fn on_success(&mut self, admission: Admission) -> bool {
        match (self.status, admission) {
            (CircuitStatus::HalfOpen, Admission::Probe) => {
                self.close();
                true
            }
            (CircuitStatus::Closed, _) => {
                self.consecutive_failures = 0;
                false
            }
            // a call admitted before the circuit opened does not close it
            _ => false,
        }
    }

    /// Record a failed call. Returns true if this opened the circuit.
    pub(crate) fn on_failure(&mut self, admission: Admission, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match (self.status, admission) {
            (CircuitStatus::HalfOpen, Admission::Probe) => {
                self.open(now);
                true
            }
            (CircuitStatus::Closed, _) if self.consecutive_failures >= self.threshold => {
                self.open(now);
                true
            }
            _ => false,
        }
    }

    /// A probe that never reached the upstream hands the slot back
    pub(crate) fn release_probe(&mut self) {
        if self.status == CircuitStatus::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    pub(crate) fn close(&mut self) {
        self.status = CircuitStatus::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    fn open(&mut self, now: Instant) {
        self.status = CircuitStatus::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    pub(crate) fn snapshot(&self, now: Instant) -> CircuitState {
        CircuitState {
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            retry_after: (self.status == CircuitStatus::Open).then(|| self.remaining_cooldown(now)),
        }
    }
}
