use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub type Timestamp = DateTime<Utc>;

/// Wall-clock source used to stamp and judge lease records.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock anchored once and advanced by the runtime's monotonic clock.
///
/// Local wall-clock jumps after startup do not move lease expiry, and under a
/// paused tokio runtime the clock follows virtual time.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    wall: Timestamp,
    mono: Instant,
}

impl AnchoredClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall: Timestamp) -> Self {
        Self {
            wall,
            mono: Instant::now(),
        }
    }
}

impl Default for AnchoredClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> Timestamp {
        chrono::Duration::from_std(self.mono.elapsed())
            .ok()
            .and_then(|elapsed| self.wall.checked_add_signed(elapsed))
            .unwrap_or(self.wall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_anchored_clock_follows_runtime_time() {
        let start = Utc::now();
        let clock = AnchoredClock::starting_at(start);
        assert_eq!(clock.now(), start);

        tokio::time::sleep(Duration::from_secs(90)).await;

        let elapsed = clock.now().signed_duration_since(start);
        assert_eq!(elapsed.num_seconds(), 90);
    }
}
