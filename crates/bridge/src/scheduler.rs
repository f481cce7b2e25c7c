//! Stoppable repeating tasks for the poll and push cycles.
//!
//! Each task runs its cycle to completion before waiting for the next tick,
//! so a slow device never causes overlapping cycles of the same kind. Ticks
//! missed while a cycle runs are not replayed; the schedule restarts from the
//! end of the slow cycle.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub struct RepeatingTask {
    name: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    /// Spawn a task that calls `cycle` immediately and then every `period`.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut cycle: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(task = name, period_sec = period.as_secs(), "task started");

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => cycle().await,
                }
            }

            info!(task = name, "task stopped");
        });

        Self {
            name,
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    /// Signal the task and wait for it to finish. A cycle that is already
    /// running completes first.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!(task = self.name, "task ended abnormally: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
