//! Reconnect delays for the signaling channel.

use std::time::Duration;

use backoff::exponential::{ExponentialBackoff, ExponentialBackoffBuilder};
use backoff::SystemClock;

/// Doubling delay from `base` towards `max`, jittered by ±50 %, retrying
/// forever.
pub fn reconnect_backoff(base: Duration, max: Duration) -> ExponentialBackoff<SystemClock> {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(base)
        .with_multiplier(2.0)
        .with_randomization_factor(0.5)
        .with_max_interval(max)
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff;

    use super::*;

    #[test]
    fn delays_grow_and_stay_capped() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let mut backoff = reconnect_backoff(base, max);

        let mut ceiling = base;
        for attempt in 0..20 {
            let delay = backoff.next_backoff().expect("retries never give up");
            // jitter is ±50 %, with slack for nanosecond rounding
            assert!(delay >= ceiling.mul_f64(0.49), "attempt {attempt}: {delay:?}");
            assert!(delay <= ceiling.mul_f64(1.51), "attempt {attempt}: {delay:?}");
            ceiling = (ceiling * 2).min(max);
        }
    }

    #[test]
    fn reset_starts_over() {
        let base = Duration::from_millis(100);
        let mut backoff = reconnect_backoff(base, Duration::from_secs(30));
        for _ in 0..5 {
            backoff.next_backoff();
        }
        backoff.reset();
        let delay = backoff.next_backoff().expect("retries never give up");
        assert!(delay <= base.mul_f64(1.51), "{delay:?}");
    }
}
