//! Fixed-rate pacing between report downloads.

use std::time::Duration;

use tokio::time::sleep;

/// Pauses `item_pause` between items and `batch_pause` after every
/// `batch_size`-th item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    batch_size: usize,
    batch_pause: Duration,
    item_pause: Duration,
}

impl Throttle {
    pub fn new(batch_size: usize, batch_pause: Duration, item_pause: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_pause,
            item_pause,
        }
    }

    pub fn disabled() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Pause owed after `processed` items have been handled.
    pub fn pause_after(&self, processed: usize) -> Duration {
        if processed > 0 && processed % self.batch_size == 0 {
            self.batch_pause
        } else {
            self.item_pause
        }
    }

    pub async fn wait(&self, processed: usize) {
        let pause = self.pause_after(processed);
        if pause.is_zero() {
            return;
        }
        if pause == self.batch_pause && pause != self.item_pause {
            log::info!("processed {processed} reports, resting {}s", pause.as_secs());
        }
        sleep(pause).await;
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(10), Duration::from_secs(3))
    }
}
