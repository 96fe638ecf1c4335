//! Change notification fan-out for committed catalog mutations.
//!
//! A batch is the atomic unit of delivery: subscribers either see the whole
//! batch or none of it. In-process delivery rides a `tokio` broadcast channel
//! (one message per batch); other execution contexts attach behind the
//! `ChangeTransport` trait.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::broadcast;

use crate::protocol::ChangeRecord;

/// Ordered records of one committed transaction.
pub type ChangeBatch = Arc<Vec<ChangeRecord>>;

/// Bridge to another execution context (separate process, socket peer).
///
/// Delivery is best-effort: a context that is not alive at emission time
/// misses the batch and must reconcile by re-fetching. Batches are already
/// serde-serializable, so a transport only decides the wire.
pub trait ChangeTransport: Send + Sync {
    fn forward(&self, batch: &ChangeBatch);
}

pub struct ChangeBus {
    sender: broadcast::Sender<ChangeBatch>,
    transport: Option<Box<dyn ChangeTransport>>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            transport: None,
        }
    }

    pub fn with_transport(capacity: usize, transport: Box<dyn ChangeTransport>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            transport: Some(transport),
        }
    }

    /// Publishes one committed batch to every local subscriber and to the
    /// attached transport, if any. Empty batches are never emitted.
    pub fn publish(&self, records: Vec<ChangeRecord>) {
        if records.is_empty() {
            debug!("change bus: dropping empty batch");
            return;
        }
        let batch: ChangeBatch = Arc::new(records);
        if let Some(transport) = &self.transport {
            transport.forward(&batch);
        }
        // No live subscriber is fine; the store remains the source of truth.
        let _ = self.sender.send(batch);
    }

    /// Injects a batch received from another context. Fans out locally but
    /// never re-forwards, so two bridged contexts do not echo.
    pub fn publish_remote(&self, batch: ChangeBatch) {
        if batch.is_empty() {
            return;
        }
        let _ = self.sender.send(batch);
    }

    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

/// What a subscriber sees on one receive.
#[derive(Debug)]
pub enum BusEvent {
    Batch(ChangeBatch),
    /// The subscriber fell behind and `skipped` batches were dropped; it must
    /// reconcile by re-fetching instead of replay.
    Lagged(u64),
    Closed,
}

pub struct BusSubscription {
    receiver: broadcast::Receiver<ChangeBatch>,
}

impl BusSubscription {
    /// Blocks until the next batch. Intended for dedicated consumer threads.
    pub fn blocking_recv(&mut self) -> BusEvent {
        match self.receiver.blocking_recv() {
            Ok(batch) => BusEvent::Batch(batch),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("change bus subscriber lagged, skipped {skipped} batch(es)");
                BusEvent::Lagged(skipped)
            }
            Err(broadcast::error::RecvError::Closed) => BusEvent::Closed,
        }
    }

    /// Non-blocking poll; `None` when no batch is pending.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        match self.receiver.try_recv() {
            Ok(batch) => Some(BusEvent::Batch(batch)),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                Some(BusEvent::Lagged(skipped))
            }
            Err(broadcast::error::TryRecvError::Closed) => Some(BusEvent::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChangeRecord, RecordKey, StoreName};
    use std::sync::Mutex;

    fn delete_record(id: i64) -> ChangeRecord {
        ChangeRecord::deleted(StoreName::Tracks, RecordKey::Id(id))
    }

    #[test]
    fn test_batch_is_delivered_whole_and_in_order() {
        let bus = ChangeBus::new(16);
        let mut subscription = bus.subscribe();
        bus.publish(vec![delete_record(1), delete_record(2), delete_record(3)]);

        match subscription.try_recv() {
            Some(BusEvent::Batch(batch)) => {
                let ids: Vec<_> = batch.iter().map(|r| r.key).collect();
                assert_eq!(
                    ids,
                    vec![RecordKey::Id(1), RecordKey::Id(2), RecordKey::Id(3)]
                );
            }
            other => panic!("expected one whole batch, got {other:?}"),
        }
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn test_empty_batches_are_not_emitted() {
        let bus = ChangeBus::new(16);
        let mut subscription = bus.subscribe();
        bus.publish(Vec::new());
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn test_transport_receives_batch_but_remote_injection_does_not_echo() {
        struct Recorder(Arc<Mutex<Vec<usize>>>);
        impl ChangeTransport for Recorder {
            fn forward(&self, batch: &ChangeBatch) {
                self.0.lock().expect("lock").push(batch.len());
            }
        }

        let forwarded = Arc::new(Mutex::new(Vec::new()));
        let bus = ChangeBus::with_transport(16, Box::new(Recorder(forwarded.clone())));
        let mut subscription = bus.subscribe();
        bus.publish(vec![delete_record(7)]);
        assert!(matches!(subscription.try_recv(), Some(BusEvent::Batch(_))));
        assert_eq!(*forwarded.lock().expect("lock"), vec![1]);

        // A batch arriving from the remote side fans out locally only.
        bus.publish_remote(Arc::new(vec![delete_record(8)]));
        match subscription.try_recv() {
            Some(BusEvent::Batch(batch)) => assert_eq!(batch[0].key, RecordKey::Id(8)),
            other => panic!("expected injected batch, got {other:?}"),
        }
        assert_eq!(forwarded.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_slow_subscriber_sees_lag_marker() {
        let bus = ChangeBus::new(1);
        let mut subscription = bus.subscribe();
        bus.publish(vec![delete_record(1)]);
        bus.publish(vec![delete_record(2)]);
        assert!(matches!(
            subscription.try_recv(),
            Some(BusEvent::Lagged(_))
        ));
    }
}
