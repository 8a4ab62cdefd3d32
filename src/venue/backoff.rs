// =============================================================================
// Capped exponential backoff shared by every retry site
// =============================================================================
//
// Centralising the delay policy means every REST retry loop and the depth
// stream reconnect cycle degrade identically: 1s, 2s, 4s, 8s, 16s, then a
// flat 30s ceiling until the next success resets the counter.
// =============================================================================

use std::time::Duration;

/// Initial delay in seconds.
const BASE_DELAY_SECS: u64 = 1;
/// Upper bound on any single delay, in seconds.
const MAX_DELAY_SECS: u64 = 30;

/// Doubling backoff with a fixed ceiling.
///
/// The sequence of delays produced by repeated [`Backoff::next_delay`] calls
/// is non-decreasing and never exceeds [`MAX_DELAY_SECS`].
#[derive(Debug, Clone)]
pub struct Backoff {
    current_secs: u64,
}

impl Backoff {
    /// Start a fresh backoff at the base delay.
    pub fn new() -> Self {
        Self {
            current_secs: BASE_DELAY_SECS,
        }
    }

    /// Return the delay to sleep for this failure and advance the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(self.current_secs);
        self.current_secs = (self.current_secs * 2).min(MAX_DELAY_SECS);
        delay
    }

    /// Reset to the base delay. Called after a successful attempt so the
    /// next failure starts the schedule over.
    pub fn reset(&mut self) {
        self.current_secs = BASE_DELAY_SECS;
    }

    /// Sleep for the next scheduled delay.
    pub async fn sleep(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_then_plateau_at_cap() {
        let mut b = Backoff::new();
        let secs: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn sequence_is_non_decreasing_and_bounded() {
        let mut b = Backoff::new();
        let mut prev = 0;
        for _ in 0..50 {
            let d = b.next_delay().as_secs();
            assert!(d >= prev);
            assert!(d <= MAX_DELAY_SECS);
            prev = d;
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut b = Backoff::new();
        b.next_delay();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay().as_secs(), 1);
        assert_eq!(b.next_delay().as_secs(), 2);
    }
}
