//! Combiner configuration.

use std::time::Duration;

const DEFAULT_IDLE_BACKOFF_MS: u64 = 10;

#[derive(Debug, Clone)]
pub struct CombinerConfig {
    /// Longest wait before re-checking an empty registry. A newly added slot
    /// wakes the loop sooner.
    pub idle_backoff: Duration,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_millis(
                std::env::var("COMBINER_IDLE_BACKOFF_MS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .filter(|ms| *ms > 0)
                    .unwrap_or(DEFAULT_IDLE_BACKOFF_MS),
            ),
        }
    }
}

impl CombinerConfig {
    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }
}
