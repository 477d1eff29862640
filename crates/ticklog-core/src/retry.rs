//! Backoff policy for fetch failures.

use std::time::Duration;

/// Delay strategy applied between failed polls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Fixed delay after every failure.
    Fixed { delay: Duration },
    /// Exponential delay: `base * (factor ^ attempt)`, capped at `max`,
    /// with optional +/- 50% jitter so restarting fleets do not thunder.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay for a 0-based consecutive-failure attempt.
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let scale = factor.powi(attempt.min(31) as i32);
                let seconds = base.as_secs_f64() * scale;
                let capped = seconds.min(max.as_secs_f64());
                let mut delay = Duration::from_secs_f64(capped);

                if jitter {
                    let jitter_ms = (delay.as_millis() as f64 * 0.5) as u64;
                    let offset = fastrand::u64(0..=(jitter_ms * 2).max(1));
                    let total_ms =
                        delay.as_millis() as i64 + (offset as i64 - jitter_ms as i64);
                    delay = Duration::from_millis(total_ms.max(0) as u64);
                }

                delay
            }
        }
    }
}
