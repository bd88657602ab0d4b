//! Reconnect backoff policy.
//!
//! Delays grow exponentially from 1 s to a 60 s cap, with plus or minus 20 % jitter so a
//! rack of blasters lost to one switch outage does not reconnect in
//! lockstep.

use std::time::Duration;

use rand::Rng;

/// Initial delay before the first reconnect attempt.
const INITIAL: Duration = Duration::from_secs(1);

/// Upper bound on the reconnect delay.
const MAX: Duration = Duration::from_secs(60);

/// Growth factor applied after each failed attempt.
const FACTOR: u32 = 2;

/// Jitter applied to each delay, as a fraction of the delay.
const JITTER: f64 = 0.2;

/// Exponential reconnect backoff with jitter.
#[derive(Debug)]
pub struct Backoff {
    next: Duration,
}

impl Backoff {
    /// Start a fresh backoff at the initial delay.
    pub fn new() -> Self {
        Backoff { next: INITIAL }
    }

    /// Reset to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.next = INITIAL;
    }

    /// Take the next delay and advance the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (base * FACTOR).min(MAX);
        let jitter = rand::thread_rng().gen_range(-JITTER..=JITTER);
        base.mul_f64(1.0 + jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
