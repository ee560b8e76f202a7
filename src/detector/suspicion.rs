use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::membership::types::NodeId;

/// Base suspicion timeout: `mult * ln(n + 1) * probe_interval`, scaling the
/// refutation window with expected gossip propagation delay.
pub fn suspicion_timeout(mult: u32, cluster_size: usize, probe_interval: Duration) -> Duration {
    let scale = (mult as f64) * ((cluster_size as f64) + 1.0).ln();
    probe_interval.mul_f64(scale.max(1.0))
}

/// Remaining total timeout once `confirmations` distinct peers have
/// corroborated, out of `cap` expected corroborators. Interpolates
/// logarithmically from `max` (no corroboration) down to `min` (full
/// corroboration).
pub fn corroborated_timeout(
    min: Duration,
    max: Duration,
    cap: usize,
    confirmations: usize,
) -> Duration {
    if cap == 0 || confirmations >= cap {
        return min;
    }
    let frac = ((confirmations as f64) + 1.0).ln() / ((cap as f64) + 1.0).ln();
    let range = max.saturating_sub(min);
    max.saturating_sub(range.mul_f64(frac.clamp(0.0, 1.0)))
}

/// One active suspicion: a deadline timer that accelerates as independent
/// corroboration arrives and runs a confirmation callback on natural expiry.
///
/// Cancellation is race-free against a concurrent expiry: the expiry callback
/// is expected to re-validate directory state, so a stale firing is a no-op.
pub struct Suspicion {
    /// Incarnation the node was suspected at; the Dead claim on expiry and
    /// refutation checks both key off this.
    pub incarnation: u64,
    confirmations: Mutex<HashSet<NodeId>>,
    cap: usize,
    min: Duration,
    max: Duration,
    started: Instant,
    deadline_tx: watch::Sender<Instant>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Suspicion {
    /// Starts the timer. `cap` is the number of independent corroborators
    /// that would drive the timeout all the way down to `min`; with `cap` of
    /// zero the timer starts there directly. `from` is the original accuser
    /// and counts as the first corroboration.
    pub fn spawn<F, Fut>(
        incarnation: u64,
        from: NodeId,
        cap: usize,
        min: Duration,
        max: Duration,
        on_expire: F,
    ) -> Arc<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let started = Instant::now();
        let initial = corroborated_timeout(min, max, cap, 0);
        let (deadline_tx, mut deadline_rx) = watch::channel(started + initial);

        let task = tokio::spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow_and_update();
                if Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => break,
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            on_expire().await;
        });

        let mut confirmations = HashSet::new();
        confirmations.insert(from);

        Arc::new(Self {
            incarnation,
            confirmations: Mutex::new(confirmations),
            cap,
            min,
            max,
            started,
            deadline_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Registers a corroborating suspicion from `from`. Duplicates from the
    /// same peer and corroborations past the cap are ignored. Returns whether
    /// the confirmation was new.
    pub fn confirm(&self, from: &NodeId) -> bool {
        let mut confirmations = self.confirmations.lock().expect("suspicion lock poisoned");
        if confirmations.contains(from) || confirmations.len() - 1 >= self.cap {
            return false;
        }
        confirmations.insert(from.clone());

        // First accuser is not independent corroboration, hence `- 1`.
        let corroborators = confirmations.len() - 1;
        let timeout = corroborated_timeout(self.min, self.max, self.cap, corroborators);
        let _ = self.deadline_tx.send(self.started + timeout);
        true
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline_tx.borrow()
    }

    /// Stops the timer without firing. Safe to call after expiry.
    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().expect("suspicion lock poisoned").take() {
            task.abort();
        }
    }
}

impl Drop for Suspicion {
    fn drop(&mut self) {
        self.cancel();
    }
}
