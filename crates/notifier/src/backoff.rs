use std::time::Duration;

/// Fibonacci spacing between fast retries: `fib(n - 1) * unit` after attempt `n`,
/// with `fib(0) = fib(1) = 1`. With the default 10s unit the sleeps after
/// attempts 1..=5 are 10s, 10s, 20s, 30s, 50s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastRetryBackoff {
    unit: Duration,
}

impl FastRetryBackoff {
    pub const DEFAULT_UNIT: Duration = Duration::from_secs(10);

    pub fn new(unit: Duration) -> Self {
        Self { unit }
    }

    /// Sleep after a failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(fibonacci(attempt.saturating_sub(1)))
    }

    /// Delays following attempts `1..=attempts`.
    pub fn schedule(&self, attempts: u32) -> Vec<Duration> {
        (1..=attempts).map(|n| self.delay_after(n)).collect()
    }
}

impl Default for FastRetryBackoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_UNIT)
    }
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (1u32, 1u32);
    for _ in 0..n {
        (a, b) = (b, a.saturating_add(b));
    }
    a
}
