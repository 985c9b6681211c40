//! Backoff schedule and the per-delivery retry state machine.
//!
//! The machine is pure bookkeeping: the caller performs HTTP calls and
//! token refreshes, feeds each classified result into
//! [`DeliveryAttempt::record`], and obeys the returned [`NextStep`].
//! Attempts for one payload are strictly sequential, which keeps
//! backpressure on a struggling control plane instead of amplifying load.

use std::time::Duration;

use rand::Rng;

use super::classify::OutcomeClass;
use super::DeliveryOutcome;

/// Backoff schedule for control-plane deliveries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Ceiling on HTTP attempts per delivery, first try included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles with each failure.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Fractional jitter applied to each delay (`0.1` = up to +/-10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay scheduled after `failed_attempts` transient failures: doubles
    /// from the base, capped at the maximum, then jittered.
    #[must_use]
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let uncapped = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(exponent));
        self.apply_jitter(uncapped.min(self.max_delay))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let mut rng = rand::rng();
        let factor = 1.0 + self.jitter * rng.random_range(-1.0..=1.0);
        delay.mul_f64(factor.max(0.0))
    }
}

/// What the delivery loop must do after one classified attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Refresh the bearer token, then retry immediately.
    Reauthenticate,
    /// Sleep this long, then retry.
    Backoff(Duration),
    /// Delivery reached a terminal outcome.
    Done(DeliveryOutcome),
}

/// Retry state for a single payload.
///
/// Counts every HTTP call in `attempts` (carried into the terminal
/// outcome) and transient failures separately, so the one retry granted
/// after a 401 token refresh does not eat into the transient budget.
#[derive(Debug)]
pub struct DeliveryAttempt {
    policy: RetryPolicy,
    attempts: u32,
    transient_failures: u32,
    reauthenticated: bool,
}

impl DeliveryAttempt {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            transient_failures: 0,
            reauthenticated: false,
        }
    }

    /// HTTP calls made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records one classified HTTP result and decides the next step.
    ///
    /// Must not be called again after it returns [`NextStep::Done`].
    pub fn record(&mut self, class: OutcomeClass) -> NextStep {
        self.attempts += 1;
        match class {
            OutcomeClass::Success => NextStep::Done(DeliveryOutcome::Accepted {
                attempts: self.attempts,
            }),
            OutcomeClass::Rejected { reason } => NextStep::Done(DeliveryOutcome::Rejected {
                reason,
                attempts: self.attempts,
            }),
            OutcomeClass::AuthExpired => {
                if self.reauthenticated {
                    // Second 401 for the same payload: the refreshed token
                    // was not the problem.
                    NextStep::Done(DeliveryOutcome::Rejected {
                        reason: "authentication rejected after token refresh".to_string(),
                        attempts: self.attempts,
                    })
                } else {
                    self.reauthenticated = true;
                    NextStep::Reauthenticate
                }
            }
            OutcomeClass::Transient {
                retry_after,
                reason,
            } => {
                self.transient_failures += 1;
                if self.transient_failures >= self.policy.max_attempts {
                    NextStep::Done(DeliveryOutcome::Unreachable {
                        attempts: self.attempts,
                        last_error: reason,
                    })
                } else {
                    let delay = retry_after
                        .unwrap_or_else(|| self.policy.delay_for(self.transient_failures));
                    NextStep::Backoff(delay)
                }
            }
        }
    }
}
