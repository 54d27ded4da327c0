//! A single bounded geometric retry primitive, reused by dial, balloon-poll and
//! guest readiness instead of reimplementing the same loop three times.

use std::time::Duration;

/// `delay_ms` levels, each retried `attempts_per_delay` times with that delay between
/// attempts. The default matches the reference runtime's dial loop: delays of
/// `{1, 2, 4, 8, 16}` ms, 100 attempts per level, worst case ~3.1s.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    delays_ms: &'static [u64],
    attempts_per_delay: usize,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            delays_ms: &[1, 2, 4, 8, 16],
            attempts_per_delay: 100,
        }
    }
}

impl RetrySchedule {
    pub fn new(delays_ms: &'static [u64], attempts_per_delay: usize) -> Self {
        Self {
            delays_ms,
            attempts_per_delay,
        }
    }

    /// Repeatedly invoke `attempt` until it returns `Some(value)` or the schedule is
    /// exhausted, in which case `None` is returned. `attempt` is a predicate, not a
    /// `Result`-returning closure, so this primitive stays agnostic of the caller's
    /// error type.
    pub async fn run<F, Fut, T>(&self, mut attempt: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Option<T>>,
    {
        for &delay_ms in self.delays_ms {
            let delay = Duration::from_millis(delay_ms);
            for _ in 0..self.attempts_per_delay {
                if let Some(value) = attempt().await {
                    return Some(value);
                }
                tokio::time::sleep(delay).await;
            }
        }
        None
    }
}
