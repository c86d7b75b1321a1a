use crate::cdc::{CaptureHub, CapturePointer, ChangeCaptureRecord};
use crate::error::RemodbError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use uuid::Uuid;

/// Pull side of a capture subscription.
///
/// Yields replayed records first, then live ones. When nothing arrives within
/// the heartbeat interval an acknowledgement record is produced instead. After
/// an overrun the records already buffered are still delivered, followed by a
/// single `SubscriberOverrun` error.
pub struct Subscription {
    id: Uuid,
    hub: Arc<CaptureHub>,
    rx: mpsc::Receiver<ChangeCaptureRecord>,
    backlog: VecDeque<ChangeCaptureRecord>,
    overrun: Arc<AtomicBool>,
    heartbeat: Duration,
    capacity: usize,
    catalog: Option<String>,
    last_delivered: Option<(CapturePointer, u64)>,
    finished: bool,
}

impl Subscription {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: Uuid,
        hub: Arc<CaptureHub>,
        rx: mpsc::Receiver<ChangeCaptureRecord>,
        backlog: VecDeque<ChangeCaptureRecord>,
        overrun: Arc<AtomicBool>,
        heartbeat: Duration,
        capacity: usize,
        catalog: Option<String>,
    ) -> Self {
        Self {
            id,
            hub,
            rx,
            backlog,
            overrun,
            heartbeat,
            capacity,
            catalog,
            last_delivered: None,
            finished: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Pointer of the last change delivered; resume from the one after it.
    pub fn last_delivered(&self) -> Option<CapturePointer> {
        self.last_delivered.map(|(pointer, _)| pointer)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next record, or `None` once the subscription ended.
    pub async fn next(&mut self) -> Option<Result<ChangeCaptureRecord, RemodbError>> {
        if self.finished {
            return None;
        }
        if let Some(record) = self.backlog.pop_front() {
            return Some(Ok(self.delivered(record)));
        }
        match tokio::time::timeout(self.heartbeat, self.rx.recv()).await {
            Ok(Some(record)) => Some(Ok(self.delivered(record))),
            Ok(None) => self.end(),
            Err(_) => Some(Ok(self.acknowledgement())),
        }
    }

    /// Non-blocking variant of [`Subscription::next`] that never produces
    /// acknowledgements. `None` means nothing is ready right now.
    pub fn try_next(&mut self) -> Option<Result<ChangeCaptureRecord, RemodbError>> {
        if self.finished {
            return None;
        }
        if let Some(record) = self.backlog.pop_front() {
            return Some(Ok(self.delivered(record)));
        }
        match self.rx.try_recv() {
            Ok(record) => Some(Ok(self.delivered(record))),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.end(),
        }
    }

    /// Stops delivery. Records not yet pulled are discarded.
    pub fn cancel(&mut self) {
        if !self.finished {
            self.finished = true;
            self.hub.unsubscribe(self.id);
            self.rx.close();
            self.backlog.clear();
        }
    }

    fn delivered(&mut self, record: ChangeCaptureRecord) -> ChangeCaptureRecord {
        self.last_delivered = Some((record.pointer, record.transaction_id));
        if self.catalog.is_none() {
            self.catalog = Some(record.catalog.clone());
        }
        record
    }

    fn acknowledgement(&self) -> ChangeCaptureRecord {
        let (pointer, transaction_id) = self.last_delivered.unwrap_or_default();
        ChangeCaptureRecord::acknowledgement(
            self.catalog.clone().unwrap_or_default(),
            transaction_id,
            pointer,
        )
    }

    fn end(&mut self) -> Option<Result<ChangeCaptureRecord, RemodbError>> {
        self.finished = true;
        if self.overrun.load(Ordering::Acquire) {
            return Some(Err(RemodbError::SubscriberOverrun {
                subscription_id: self.id,
                capacity: self.capacity,
                last_delivered: self
                    .last_delivered
                    .map(|(p, _)| (p.catalog_version, p.index)),
            }));
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use crate::cdc::{CaptureCriteria, CaptureHub, CaptureResponseType, CaptureStart};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn idle_subscription_emits_acknowledgements() {
        let hub = Arc::new(CaptureHub::new(4, 4, Duration::from_millis(100)));
        let mut sub = hub
            .subscribe(CaptureCriteria::catalog("products"), CaptureStart::Now)
            .expect("subscribe");
        let ack = sub.next().await.expect("ack").expect("ok");
        assert_eq!(ack.response_type, CaptureResponseType::Acknowledgement);
        assert_eq!(ack.catalog, "products");
        assert!(ack.mutation.is_none());
    }

    #[tokio::test]
    async fn cancel_and_drop_unsubscribe() {
        let hub = Arc::new(CaptureHub::new(4, 4, Duration::from_secs(60)));
        let mut first = hub
            .subscribe(CaptureCriteria::default(), CaptureStart::Now)
            .expect("subscribe");
        let second = hub
            .subscribe(CaptureCriteria::default(), CaptureStart::Now)
            .expect("subscribe");
        assert_eq!(hub.subscriber_count(), 2);
        first.cancel();
        assert!(first.next().await.is_none());
        drop(second);
        assert_eq!(hub.subscriber_count(), 0);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("catalog", &self.catalog)
            .field("capacity", &self.capacity)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
