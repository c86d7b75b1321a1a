mod criteria;
mod ring;
mod subscription;

pub use criteria::CaptureCriteria;
pub use subscription::Subscription;

use crate::catalog::types::TargetIdentity;
use crate::commit::mutation::Mutation;
use crate::error::RemodbError;
use parking_lot::Mutex;
use ring::CaptureRing;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CaptureResponseType {
    Acknowledgement,
    Change,
}

/// Position of a record in a catalog's capture stream: the commit-ordered
/// catalog version plus the mutation's index inside that transaction.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct CapturePointer {
    pub catalog_version: u64,
    pub index: u32,
}

impl CapturePointer {
    pub fn new(catalog_version: u64, index: u32) -> Self {
        Self {
            catalog_version,
            index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeCaptureRecord {
    pub catalog: String,
    pub transaction_id: u64,
    pub pointer: CapturePointer,
    pub response_type: CaptureResponseType,
    /// Absent on acknowledgements.
    pub target: Option<TargetIdentity>,
    /// Absent on acknowledgements.
    pub mutation: Option<Mutation>,
}

impl ChangeCaptureRecord {
    pub fn acknowledgement(catalog: String, transaction_id: u64, pointer: CapturePointer) -> Self {
        Self {
            catalog,
            transaction_id,
            pointer,
            response_type: CaptureResponseType::Acknowledgement,
            target: None,
            mutation: None,
        }
    }

    pub fn is_change(&self) -> bool {
        self.response_type == CaptureResponseType::Change
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CaptureStart {
    /// Only records released after subscribing.
    Now,
    /// Retained records from this pointer on, then live ones.
    Since(CapturePointer),
}

struct SubscriberSlot {
    criteria: CaptureCriteria,
    tx: mpsc::Sender<ChangeCaptureRecord>,
    overrun: Arc<AtomicBool>,
    resume_from: Option<CapturePointer>,
}

#[derive(Default)]
struct HubInner {
    rings: HashMap<String, CaptureRing>,
    staged: HashMap<String, BTreeMap<u64, Vec<ChangeCaptureRecord>>>,
    subscribers: HashMap<Uuid, SubscriberSlot>,
}

/// Turns committed mutations into ordered, filterable record streams.
///
/// Records are staged under the catalog's commit lock in commit order and
/// released once their transaction is visible. Release fans out onto bounded
/// per-subscriber channels with `try_send`; a full channel drops the
/// subscriber and flags the overrun. A per-catalog ring keeps recently
/// released records for resumption.
pub struct CaptureHub {
    inner: Mutex<HubInner>,
    ring_capacity: usize,
    subscriber_capacity: usize,
    heartbeat: Duration,
}

impl CaptureHub {
    pub fn new(ring_capacity: usize, subscriber_capacity: usize, heartbeat: Duration) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            ring_capacity: ring_capacity.max(1),
            subscriber_capacity: subscriber_capacity.max(1),
            heartbeat,
        }
    }

    /// Starts the catalog's history right after `visible_version`.
    pub fn register_catalog(&self, catalog: &str, visible_version: u64) {
        let mut inner = self.inner.lock();
        inner.rings.insert(
            catalog.to_string(),
            CaptureRing::new(
                self.ring_capacity,
                CapturePointer::new(visible_version + 1, 0),
            ),
        );
    }

    pub(crate) fn forget_catalog(&self, catalog: &str) {
        let mut inner = self.inner.lock();
        inner.rings.remove(catalog);
        inner.staged.remove(catalog);
    }

    /// Holds a committed transaction's records until it becomes visible.
    pub(crate) fn stage(
        &self,
        catalog: &str,
        catalog_version: u64,
        records: Vec<ChangeCaptureRecord>,
    ) {
        if records.is_empty() {
            return;
        }
        self.inner
            .lock()
            .staged
            .entry(catalog.to_string())
            .or_default()
            .insert(catalog_version, records);
    }

    /// Releases staged records up to `catalog_version` to the ring and to
    /// every matching subscriber.
    pub(crate) fn release(&self, catalog: &str, catalog_version: u64) {
        let mut inner = self.inner.lock();
        let ready: Vec<ChangeCaptureRecord> = match inner.staged.get_mut(catalog) {
            Some(staged) => {
                let later = staged.split_off(&(catalog_version + 1));
                let ready = std::mem::replace(staged, later);
                ready.into_values().flatten().collect()
            }
            None => return,
        };
        if ready.is_empty() {
            return;
        }

        let ring_capacity = self.ring_capacity;
        let ring = inner.rings.entry(catalog.to_string()).or_insert_with(|| {
            CaptureRing::new(ring_capacity, ready[0].pointer)
        });
        for record in &ready {
            ring.push(record.clone());
        }

        let mut dropped = Vec::new();
        for (id, slot) in inner.subscribers.iter() {
            for record in &ready {
                if !slot.criteria.matches(record)
                    || slot.resume_from.is_some_and(|from| record.pointer < from)
                {
                    continue;
                }
                match slot.tx.try_send(record.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        slot.overrun.store(true, Ordering::Release);
                        warn!(
                            subscription = %id,
                            capacity = self.subscriber_capacity,
                            "capture subscriber overran its buffer, dropping it"
                        );
                        dropped.push(*id);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        dropped.push(*id);
                        break;
                    }
                }
            }
        }
        for id in dropped {
            inner.subscribers.remove(&id);
        }
    }

    /// Discards staged records of transactions after `catalog_version`.
    pub(crate) fn forget_after(&self, catalog: &str, catalog_version: u64) -> usize {
        let mut inner = self.inner.lock();
        let Some(staged) = inner.staged.get_mut(catalog) else {
            return 0;
        };
        let aborted = staged.split_off(&(catalog_version + 1));
        let count = aborted.values().map(Vec::len).sum();
        if count > 0 {
            debug!(catalog, after = catalog_version, count, "staged capture records forgotten");
        }
        count
    }

    pub fn subscribe(
        self: &Arc<Self>,
        criteria: CaptureCriteria,
        start: CaptureStart,
    ) -> Result<Subscription, RemodbError> {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let overrun = Arc::new(AtomicBool::new(false));
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock();

        let (backlog, resume_from) = match start {
            CaptureStart::Now => (VecDeque::new(), None),
            CaptureStart::Since(pointer) => {
                let Some(catalog) = criteria.catalog.as_deref() else {
                    return Err(RemodbError::Validation(
                        "resuming a capture stream requires a catalog".into(),
                    ));
                };
                let ring = inner.rings.get(catalog).ok_or_else(|| {
                    RemodbError::CatalogNotFound {
                        catalog: catalog.to_string(),
                    }
                })?;
                let backlog: VecDeque<_> = ring
                    .since(pointer)?
                    .into_iter()
                    .filter(|r| criteria.matches(r))
                    .collect();
                (backlog, Some(pointer))
            }
        };

        inner.subscribers.insert(
            id,
            SubscriberSlot {
                criteria: criteria.clone(),
                tx,
                overrun: Arc::clone(&overrun),
                resume_from,
            },
        );
        drop(inner);
        debug!(subscription = %id, backlog = backlog.len(), "capture subscription opened");

        Ok(Subscription::new(
            id,
            Arc::clone(self),
            rx,
            backlog,
            overrun,
            self.heartbeat,
            self.subscriber_capacity,
            criteria.catalog,
        ))
    }

    pub(crate) fn unsubscribe(&self, id: Uuid) -> bool {
        self.inner.lock().subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn staged_count(&self, catalog: &str) -> usize {
        self.inner
            .lock()
            .staged
            .get(catalog)
            .map(|s| s.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}
