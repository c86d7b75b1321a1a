use crate::cdc::{CapturePointer, ChangeCaptureRecord};
use crate::error::RemodbError;
use std::collections::VecDeque;

/// Bounded history of released records of one catalog, used to resume
/// subscriptions. `start` is the oldest pointer that can still be served.
#[derive(Debug)]
pub(crate) struct CaptureRing {
    records: VecDeque<ChangeCaptureRecord>,
    capacity: usize,
    start: CapturePointer,
}

impl CaptureRing {
    pub(crate) fn new(capacity: usize, start: CapturePointer) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
            start,
        }
    }

    pub(crate) fn push(&mut self, record: ChangeCaptureRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
            if let Some(front) = self.records.front() {
                self.start = front.pointer;
            } else {
                self.start = record.pointer;
            }
        }
        self.records.push_back(record);
    }

    pub(crate) fn start(&self) -> CapturePointer {
        self.start
    }

    /// Retained records at or after `pointer`, in release order.
    pub(crate) fn since(
        &self,
        pointer: CapturePointer,
    ) -> Result<Vec<ChangeCaptureRecord>, RemodbError> {
        if pointer < self.start {
            return Err(RemodbError::CaptureHistoryUnavailable {
                requested_version: pointer.catalog_version,
                oldest_version: self.start.catalog_version,
            });
        }
        Ok(self
            .records
            .iter()
            .filter(|r| r.pointer >= pointer)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::CaptureRing;
    use crate::cdc::{CapturePointer, CaptureResponseType, ChangeCaptureRecord};
    use crate::error::RemodbError;

    fn record(version: u64, index: u32) -> ChangeCaptureRecord {
        ChangeCaptureRecord {
            catalog: "products".into(),
            transaction_id: version,
            pointer: CapturePointer::new(version, index),
            response_type: CaptureResponseType::Change,
            target: None,
            mutation: None,
        }
    }

    #[test]
    fn eviction_moves_the_start_pointer() {
        let mut ring = CaptureRing::new(2, CapturePointer::new(1, 0));
        ring.push(record(1, 0));
        ring.push(record(1, 1));
        assert_eq!(ring.since(CapturePointer::new(1, 0)).expect("all").len(), 2);

        ring.push(record(2, 0));
        assert_eq!(ring.start(), CapturePointer::new(1, 1));
        let err = ring
            .since(CapturePointer::new(1, 0))
            .expect_err("evicted");
        assert!(matches!(
            err,
            RemodbError::CaptureHistoryUnavailable {
                requested_version: 1,
                oldest_version: 1
            }
        ));
        let tail = ring.since(CapturePointer::new(2, 0)).expect("tail");
        assert_eq!(tail.len(), 1);
        assert!(ring.since(CapturePointer::new(9, 0)).expect("future").is_empty());
    }
}
