use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Bounded local health score in `[0, max]`. Zero means healthy.
pub struct Awareness {
    max: usize,
    score: AtomicUsize,
}

impl Awareness {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            score: AtomicUsize::new(0),
        }
    }

    pub fn score(&self) -> usize {
        self.score.load(Ordering::SeqCst)
    }

    /// Records a probe outcome: positive deltas for failures and timeouts,
    /// negative for successes. Clamped to `[0, max]`.
    pub fn apply_delta(&self, delta: i64) {
        let mut current = self.score.load(Ordering::SeqCst);
        loop {
            let next = (current as i64 + delta).clamp(0, self.max as i64) as usize;
            match self.score.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Stretches a configured interval or timeout by the current score.
    pub fn scale(&self, base: Duration) -> Duration {
        base * (1 + self.score() as u32)
    }
}
