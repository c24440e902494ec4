//! Periodic polling of all running devices.
//!
//! Device operations block on daemon round trips, so each poll pass runs on
//! tokio's blocking pool. Passes never overlap: a slow pass delays the next
//! tick instead of stacking up.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::context::Context;

/// Drives [`Context::poll_all`] at a fixed period.
pub struct PollScheduler;

impl PollScheduler {
    /// Start polling `ctx` every `period` on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(ctx: Arc<Context>, period: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let passes = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&passes);

        info!("Polling devices every {:?}", period);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let ctx = Arc::clone(&ctx);
                        match tokio::task::spawn_blocking(move || ctx.poll_all()).await {
                            Ok(read) => trace!("Poll pass read {} devices", read),
                            Err(e) => warn!("Poll pass failed: {}", e),
                        }
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            debug!("Poll scheduler stopped");
        });

        SchedulerHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
            passes,
        }
    }
}

/// Handle to a running [`PollScheduler`].
pub struct SchedulerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    passes: Arc<AtomicU64>,
}

impl SchedulerHandle {
    /// Completed poll passes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Stop polling and wait for the current pass to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Poll scheduler task failed: {}", e);
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
