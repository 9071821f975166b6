use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::AuditConfig;
use crate::bus::types::AuditEntry;
use crate::bus::BusApi;

/// How many entries may sit in the buffer before the oldest are shed.
/// Bounds memory when the bus is unreachable for a long stretch.
const BUFFER_FACTOR: usize = 4;

/// In-memory audit buffer. Flushes when the batch fills, on the auto-flush
/// tick, and on shutdown. A failed flush re-queues the batch rather than
/// dropping it.
pub struct AuditBatcher {
    bus: Arc<dyn BusApi>,
    batch: Mutex<Vec<AuditEntry>>,
    batch_size: usize,
    flush_interval: Duration,
    max_buffer: usize,
}

impl AuditBatcher {
    pub fn new(bus: Arc<dyn BusApi>, config: &AuditConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        Self {
            bus,
            batch: Mutex::new(Vec::new()),
            batch_size,
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            max_buffer: batch_size * BUFFER_FACTOR,
        }
    }

    pub async fn record(&self, entry: AuditEntry) {
        let should_flush = {
            let Ok(mut batch) = self.batch.lock() else {
                return;
            };
            batch.push(entry);
            if batch.len() > self.max_buffer {
                let shed = batch.len() - self.max_buffer;
                batch.drain(..shed);
                tracing::warn!(shed, "audit buffer over capacity, shed oldest entries");
            }
            batch.len() >= self.batch_size
        };
        if should_flush {
            self.flush().await;
        }
    }

    /// Drain the buffer and post it. On failure the drained entries go back
    /// to the front so the next flush retries them in order.
    pub async fn flush(&self) {
        let drained: Vec<AuditEntry> = {
            let Ok(mut batch) = self.batch.lock() else {
                return;
            };
            std::mem::take(&mut *batch)
        };
        if drained.is_empty() {
            return;
        }

        if let Err(e) = self.bus.post_audit(&drained).await {
            tracing::warn!(error = %e, entries = drained.len(), "audit flush failed, re-queueing");
            if let Ok(mut batch) = self.batch.lock() {
                let mut restored = drained;
                restored.append(&mut batch);
                if restored.len() > self.max_buffer {
                    let shed = restored.len() - self.max_buffer;
                    restored.drain(..shed);
                    tracing::warn!(shed, "audit buffer over capacity, shed oldest entries");
                }
                *batch = restored;
            }
        }
    }

    /// Periodic flush loop; cancelled by aborting the returned handle.
    pub fn start_auto_flush(batcher: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(batcher.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                batcher.flush().await;
            }
        })
    }

    pub async fn shutdown(&self) {
        self.flush().await;
    }

    pub fn pending(&self) -> usize {
        self.batch.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingBus;

    fn config(batch_size: usize, flush_ms: u64) -> AuditConfig {
        AuditConfig { batch_size, flush_interval_ms: flush_ms }
    }

    fn entry(n: usize) -> AuditEntry {
        AuditEntry::allowed(&format!("actor-{n}"), "message", 1)
    }

    #[tokio::test]
    async fn test_flush_triggered_at_batch_size() {
        let bus = Arc::new(RecordingBus::new());
        let batcher = AuditBatcher::new(bus.clone(), &config(3, 60_000));

        batcher.record(entry(1)).await;
        batcher.record(entry(2)).await;
        assert!(bus.audit_batches().is_empty());
        batcher.record(entry(3)).await;

        let batches = bus.audit_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_batch() {
        let bus = Arc::new(RecordingBus::new());
        let batcher = AuditBatcher::new(bus.clone(), &config(10, 60_000));

        batcher.record(entry(1)).await;
        batcher.shutdown().await;
        assert_eq!(bus.audit_batches().len(), 1);
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_entries() {
        let bus = Arc::new(RecordingBus::new());
        bus.fail_audit(true);
        let batcher = AuditBatcher::new(bus.clone(), &config(2, 60_000));

        batcher.record(entry(1)).await;
        batcher.record(entry(2)).await;
        // Post failed; nothing delivered, nothing lost.
        assert!(bus.audit_batches().is_empty());
        assert_eq!(batcher.pending(), 2);

        bus.fail_audit(false);
        batcher.flush().await;
        assert_eq!(bus.audit_batches().len(), 1);
        assert_eq!(bus.audit_batches()[0].len(), 2);
    }

    #[tokio::test]
    async fn test_requeue_preserves_order() {
        let bus = Arc::new(RecordingBus::new());
        bus.fail_audit(true);
        let batcher = AuditBatcher::new(bus.clone(), &config(2, 60_000));

        batcher.record(entry(1)).await;
        batcher.record(entry(2)).await;
        batcher.record(entry(3)).await;
        bus.fail_audit(false);
        batcher.flush().await;

        let actors: Vec<String> = bus
            .audit_entries()
            .iter()
            .map(|e| e.actor_id.clone())
            .collect();
        assert_eq!(actors, vec!["actor-1", "actor-2", "actor-3"]);
    }

    #[tokio::test]
    async fn test_buffer_cap_sheds_oldest() {
        let bus = Arc::new(RecordingBus::new());
        bus.fail_audit(true);
        let batcher = AuditBatcher::new(bus.clone(), &config(2, 60_000));

        for n in 0..20 {
            batcher.record(entry(n)).await;
        }
        // Cap is batch_size * 4.
        assert!(batcher.pending() <= 8);
    }

    #[tokio::test]
    async fn test_auto_flush_tick_posts_partial_batch() {
        let bus = Arc::new(RecordingBus::new());
        let batcher = Arc::new(AuditBatcher::new(bus.clone(), &config(100, 20)));

        batcher.record(entry(1)).await;
        let handle = AuditBatcher::start_auto_flush(batcher.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.abort();

        assert!(!bus.audit_batches().is_empty());
        assert_eq!(batcher.pending(), 0);
    }
}
