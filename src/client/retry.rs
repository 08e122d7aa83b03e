//! Reconnection delay computation: base delay, optional exponential backoff,
//! optional subtractive jitter, and a reset once a connection has stayed
//! healthy for long enough.

use std::time::{Duration, Instant};

/// Exponential backoff policy: `base * 2^attempt`, capped at `max`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Backoff {
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(max: Duration) -> Self {
        Backoff { max }
    }

    fn delay(&self, base: Duration, attempt: u32) -> Duration {
        let factor = if attempt >= 31 {
            u32::MAX
        } else {
            1u32 << attempt
        };
        base.saturating_mul(factor).min(self.max)
    }
}

/// Jitter policy: subtracts a uniformly random fraction in `[0, ratio)` of
/// the computed delay.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Jitter {
    ratio: f64,
}

impl Jitter {
    /// The default jitter ratio: delays are reduced by up to 50%.
    pub(crate) const DEFAULT_RATIO: f64 = 0.5;

    pub(crate) fn new(ratio: f64) -> Self {
        Jitter { ratio }
    }

    pub(crate) fn apply(&self, delay: Duration) -> Duration {
        delay.mul_f64(1.0 - self.ratio * rand::random::<f64>())
    }
}

/// Computes successive reconnection delays for a stream.
///
/// Each call to [`next_retry_delay`](RetryDelayStrategy::next_retry_delay)
/// advances the attempt counter. Marking a connection good via
/// [`set_good_since`](RetryDelayStrategy::set_good_since) arms the reset:
/// once the connection has been good for at least `reset_interval`, the next
/// delay starts over from the base.
pub(crate) struct RetryDelayStrategy {
    base: Duration,
    reset_interval: Duration,
    backoff: Option<Backoff>,
    jitter: Option<Jitter>,
    attempt: u32,
    good_since: Option<Instant>,
}

impl RetryDelayStrategy {
    pub(crate) fn new(
        base: Duration,
        reset_interval: Duration,
        backoff: Option<Backoff>,
        jitter: Option<Jitter>,
    ) -> Self {
        RetryDelayStrategy {
            base,
            reset_interval,
            backoff,
            jitter,
            attempt: 0,
            good_since: None,
        }
    }

    /// Compute the delay before the next connection attempt and advance the
    /// attempt counter.
    pub(crate) fn next_retry_delay(&mut self, now: Instant) -> Duration {
        if let Some(good_since) = self.good_since.take() {
            if !self.reset_interval.is_zero()
                && now.saturating_duration_since(good_since) >= self.reset_interval
            {
                self.attempt = 0;
            }
        }
        let mut delay = match self.backoff {
            Some(backoff) => backoff.delay(self.base, self.attempt),
            None => self.base,
        };
        if let Some(jitter) = self.jitter {
            delay = jitter.apply(delay);
        }
        self.attempt += 1;
        delay
    }

    /// Replace the base delay. Used when the server advertises a `retry:`
    /// value.
    pub(crate) fn set_base_delay(&mut self, base: Duration) {
        self.base = base;
    }

    /// Mark the moment the current connection became healthy.
    pub(crate) fn set_good_since(&mut self, when: Instant) {
        self.good_since = Some(when);
    }

    #[cfg(test)]
    fn has_jitter(&self) -> bool {
        self.jitter.is_some()
    }
}
