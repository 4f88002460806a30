//! When the client dials the gateway again after losing it.
//!
//! [`ReconnectBackoff`] is the configured policy; [`Reconnector`] is the
//! per-client schedule that walks it.  A session that got as far as
//! `connection_status` counts as a success and restarts the schedule.  A
//! `wake()` cuts the current wait short and restarts the schedule, and a
//! 4401 close redials at once with a fresh token.

use std::time::Duration;

use rand::Rng;

/// Controls how the client reconnects after a connection drop.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Upper bound of the first delay.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
    /// Consecutive failures before giving up.  `0` means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: 0,
        }
    }
}

impl ReconnectBackoff {
    /// Capped exponential ceiling for failure number `failures` (0-indexed).
    fn ceiling(&self, failures: u32) -> Duration {
        let exp = failures.min(i32::MAX as u32) as i32;
        let ms = self.initial_delay.as_millis() as f64 * self.backoff_factor.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// What the connection loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAttempt {
    /// Sleep this long, then dial.
    After(Duration),
    /// The policy's attempt limit is used up.
    GiveUp { failures: u32 },
}

/// Reconnect schedule for one client.
#[derive(Debug)]
pub struct Reconnector {
    policy: ReconnectBackoff,
    failures: u32,
    immediate: bool,
}

impl Reconnector {
    pub fn new(policy: ReconnectBackoff) -> Self {
        Self {
            policy,
            failures: 0,
            immediate: false,
        }
    }

    /// Consecutive failed attempts since the last success or wake.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// A session opened; the next drop starts from the shortest delay.
    pub fn connected(&mut self) {
        self.failures = 0;
        self.immediate = false;
    }

    /// The gateway closed with 4401.  The next dial carries a refreshed
    /// token and does not wait.
    pub fn credential_expired(&mut self) {
        self.immediate = true;
    }

    /// The app asked to reconnect now; the caller has already stopped
    /// waiting.
    pub fn woken(&mut self) {
        self.failures = 0;
    }

    /// An attempt failed before `connection_status`.
    pub fn failed(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.immediate = false;
    }

    /// Delay before the next dial.  Jitter is drawn from the upper half of
    /// the capped exponential ceiling so clients dropped together spread out.
    pub fn next_attempt(&mut self) -> NextAttempt {
        if self.policy.max_attempts > 0 && self.failures >= self.policy.max_attempts {
            return NextAttempt::GiveUp {
                failures: self.failures,
            };
        }
        if std::mem::take(&mut self.immediate) {
            return NextAttempt::After(Duration::ZERO);
        }
        let ceiling = self.policy.ceiling(self.failures).as_millis() as u64;
        let ms = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        NextAttempt::After(Duration::from_millis(ms))
    }
}
