use std::time::Duration;

/// Simple back off delay, multiplies a base delay time
/// by some number of "misses", never exceeding `max_delay`.
/// For example if your base delay is 500ms and the max is 1200ms
/// the delay would progress:
///
/// 500ms, 1000ms, 1200ms, 1200ms ...
///
/// A `max_delay` equal to `base_delay` gives a fixed interval.
#[derive(Debug, Clone)]
pub struct BackOffDelay {
    base_delay: Duration,
    max_delay: Duration,

    misses: u32,
}

impl BackOffDelay {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        BackOffDelay {
            base_delay,
            max_delay: max_delay.max(base_delay),
            misses: 0,
        }
    }

    /// The delay the next call to `wait` will sleep for, without sleeping.
    pub fn next_delay(&self) -> Duration {
        let misses = self.misses.saturating_add(1);
        self.base_delay
            .checked_mul(misses)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub async fn wait(&mut self) -> Duration {
        let sleep_duration = self.next_delay();
        self.misses = self.misses.saturating_add(1);

        tokio::time::sleep(sleep_duration).await;

        sleep_duration
    }
}
