//! Background tier lifecycle task.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{KnowledgeStore, TierPolicy};

/// Periodically demotes aged chunks (hot→warm→cold).
pub struct TierLifecycle {
    store: Arc<dyn KnowledgeStore>,
    policy: TierPolicy,
    interval: Duration,
}

/// Handle for the running lifecycle task.
pub struct TierLifecycleHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TierLifecycleHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

impl TierLifecycle {
    pub fn new(store: Arc<dyn KnowledgeStore>, policy: TierPolicy, interval: Duration) -> Self {
        Self {
            store,
            policy,
            interval,
        }
    }

    pub fn spawn(self) -> TierLifecycleHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            tracing::debug!(interval = ?self.interval, "tier lifecycle task started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                match self.store.demote_tiers(self.policy, Utc::now()).await {
                    Ok(demotions) => {
                        tracing::debug!(
                            hot_to_warm = demotions.hot_to_warm,
                            warm_to_cold = demotions.warm_to_cold,
                            "tier lifecycle sweep finished"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "tier lifecycle sweep failed");
                    }
                }
            }
            tracing::debug!("tier lifecycle task stopped");
        });

        TierLifecycleHandle { shutdown_tx, task }
    }
}
