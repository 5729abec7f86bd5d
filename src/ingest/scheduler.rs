// src/ingest/scheduler.rs
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ingest::pipeline::Pipeline;

/// Run `pipeline.run_all()` every `interval` until `shutdown` resolves.
/// The first run starts immediately. A run still in flight at shutdown is
/// dropped, which cancels its network I/O and releases its rate-limit slots.
pub fn spawn_scheduler<F>(pipeline: Arc<Pipeline>, interval: Duration, shutdown: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            counter!("ingest_runs_total").increment(1);
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(target: "ingest", "shutdown during fetch run, run cancelled");
                    break;
                }
                res = pipeline.run_all() => {
                    if let Err(e) = res {
                        tracing::error!(target: "ingest", error = %e, "scheduled fetch run failed");
                    }
                }
            }
        }
        tracing::info!(target: "ingest", "ingest scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::config::IngestConfig;
    use crate::ingest::store::{MemoryRegistry, MemoryStore};

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let p = Arc::new(Pipeline::new(
            &IngestConfig::default(),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryStore::new()),
        ));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = spawn_scheduler(p, Duration::from_secs(60), async move {
            let _ = rx.await;
        });
        tokio::time::sleep(Duration::from_secs(125)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
