//! Linear backoff between reconnect attempts: floor, +step per failure, capped at ceiling.

use std::time::Duration;

/// Backoff parameters. Default: 1 s floor, 1 s step, 5 s ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub floor: Duration,
    pub step: Duration,
    pub ceiling: Duration,
}

impl BackoffConfig {
    pub const fn new(floor: Duration, step: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            step,
            ceiling,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }
}

/// Current delay of one reconnect sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.floor.min(config.ceiling),
            config,
        }
    }

    /// Delay the next failure will wait.
    pub fn delay(&self) -> Duration {
        self.current
    }

    /// Return the delay to sleep now and bump the following one by a step (capped).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if self.current < self.config.ceiling {
            self.current = (self.current + self.config.step).min(self.config.ceiling);
        }
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.floor.min(self.config.ceiling);
    }
}
