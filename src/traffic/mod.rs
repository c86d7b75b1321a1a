use crate::error::RemodbError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficRecordingSettings {
    /// Only traffic of this catalog is recorded when set.
    pub catalog: Option<String>,
    /// Percentage of eligible traffic kept, 1 to 100.
    pub sampling_rate: u8,
    pub max_duration_ms: Option<u64>,
    pub max_records: Option<u64>,
}

impl Default for TrafficRecordingSettings {
    fn default() -> Self {
        Self {
            catalog: None,
            sampling_rate: 100,
            max_duration_ms: None,
            max_records: None,
        }
    }
}

impl TrafficRecordingSettings {
    pub fn validate(&self) -> Result<(), RemodbError> {
        if !(1..=100).contains(&self.sampling_rate) {
            return Err(RemodbError::Validation(format!(
                "sampling rate must be between 1 and 100, got {}",
                self.sampling_rate
            )));
        }
        if self.max_records == Some(0) {
            return Err(RemodbError::Validation(
                "max_records must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStatus {
    pub task_id: Uuid,
    pub state: TaskState,
    pub settings: TrafficRecordingSettings,
    pub started_at_micros: u64,
    pub finished_at_micros: Option<u64>,
    pub recorded: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TrafficRecordType {
    Query,
    Fetch,
    Enrichment,
    Mutation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficRecord {
    pub source_query_id: Uuid,
    pub session_id: Uuid,
    pub catalog: String,
    pub query: String,
    pub record_type: TrafficRecordType,
    pub returned_records: u64,
    pub total_records: u64,
    pub labels: Vec<(String, String)>,
    pub recorded_at_micros: u64,
    pub duration_micros: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficCriteria {
    pub catalog: Option<String>,
    pub session_id: Option<Uuid>,
    pub record_types: Vec<TrafficRecordType>,
    /// Every pair must be present on the record.
    pub labels: Vec<(String, String)>,
    pub since_micros: Option<u64>,
}

impl TrafficCriteria {
    pub fn matches(&self, record: &TrafficRecord) -> bool {
        if self.catalog.as_ref().is_some_and(|c| *c != record.catalog) {
            return false;
        }
        if self.session_id.is_some_and(|id| id != record.session_id) {
            return false;
        }
        if !self.record_types.is_empty() && !self.record_types.contains(&record.record_type) {
            return false;
        }
        if self
            .since_micros
            .is_some_and(|since| record.recorded_at_micros < since)
        {
            return false;
        }
        self.labels
            .iter()
            .all(|pair| record.labels.iter().any(|l| l == pair))
    }
}

struct ActiveTask {
    status: TaskStatus,
    accumulator: u32,
}

impl ActiveTask {
    fn expired(&self, now: u64) -> bool {
        let duration_hit = self.status.settings.max_duration_ms.is_some_and(|ms| {
            now.saturating_sub(self.status.started_at_micros) >= ms.saturating_mul(1_000)
        });
        let records_hit = self
            .status
            .settings
            .max_records
            .is_some_and(|max| self.status.recorded >= max);
        duration_hit || records_hit
    }
}

/// Finished task statuses kept for `status` and `stop_recording` lookups.
const FINISHED_TASK_HISTORY: usize = 64;

#[derive(Default)]
struct RecorderInner {
    active: Option<ActiveTask>,
    finished: HashMap<Uuid, TaskStatus>,
    finished_order: VecDeque<Uuid>,
    records: VecDeque<TrafficRecord>,
    source_ids: HashSet<Uuid>,
    labels: BTreeMap<String, BTreeMap<String, u64>>,
}

impl RecorderInner {
    fn finish_active(&mut self, now: u64) -> Option<TaskStatus> {
        let mut task = self.active.take()?;
        task.status.state = TaskState::Finished;
        task.status.finished_at_micros = Some(now);
        info!(
            task_id = %task.status.task_id,
            recorded = task.status.recorded,
            skipped = task.status.skipped,
            "traffic recording finished"
        );
        if self.finished_order.len() == FINISHED_TASK_HISTORY
            && let Some(oldest) = self.finished_order.pop_front()
        {
            self.finished.remove(&oldest);
        }
        self.finished_order.push_back(task.status.task_id);
        self.finished
            .insert(task.status.task_id, task.status.clone());
        Some(task.status)
    }

    fn finish_if_expired(&mut self, now: u64) {
        if self.active.as_ref().is_some_and(|t| t.expired(now)) {
            self.finish_active(now);
        }
    }

    fn index_labels(&mut self, record: &TrafficRecord) {
        for (name, value) in &record.labels {
            *self
                .labels
                .entry(name.clone())
                .or_default()
                .entry(value.clone())
                .or_insert(0) += 1;
        }
    }

    fn unindex_labels(&mut self, record: &TrafficRecord) {
        for (name, value) in &record.labels {
            let Some(values) = self.labels.get_mut(name) else {
                continue;
            };
            if let Some(count) = values.get_mut(value) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    values.remove(value);
                }
            }
            if values.is_empty() {
                self.labels.remove(name);
            }
        }
    }
}

/// On-demand traffic recording. One task may run at a time; while it runs,
/// reported queries are sampled into a bounded buffer that also indexes the
/// label names and values seen so far.
pub struct TrafficRecorder {
    inner: Mutex<RecorderInner>,
    capacity: usize,
}

impl TrafficRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RecorderInner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn start_recording(
        &self,
        settings: TrafficRecordingSettings,
    ) -> Result<TaskStatus, RemodbError> {
        settings.validate()?;
        let now = now_micros();
        let mut inner = self.inner.lock();
        inner.finish_if_expired(now);
        if let Some(active) = &inner.active {
            return Err(RemodbError::Validation(format!(
                "traffic recording {} is already running",
                active.status.task_id
            )));
        }
        let status = TaskStatus {
            task_id: Uuid::new_v4(),
            state: TaskState::Running,
            settings,
            started_at_micros: now,
            finished_at_micros: None,
            recorded: 0,
            skipped: 0,
        };
        info!(task_id = %status.task_id, sampling_rate = status.settings.sampling_rate, "traffic recording started");
        inner.active = Some(ActiveTask {
            status: status.clone(),
            accumulator: 0,
        });
        Ok(status)
    }

    /// Stops the task. Stopping a finished task returns its final status.
    pub fn stop_recording(&self, task_id: Uuid) -> Result<TaskStatus, RemodbError> {
        let now = now_micros();
        let mut inner = self.inner.lock();
        if inner
            .active
            .as_ref()
            .is_some_and(|t| t.status.task_id == task_id)
        {
            if let Some(status) = inner.finish_active(now) {
                return Ok(status);
            }
        }
        inner
            .finished
            .get(&task_id)
            .cloned()
            .ok_or_else(|| RemodbError::Validation(format!("unknown recording task {task_id}")))
    }

    pub fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        let mut inner = self.inner.lock();
        inner.finish_if_expired(now_micros());
        match &inner.active {
            Some(active) if active.status.task_id == task_id => Some(active.status.clone()),
            _ => inner.finished.get(&task_id).cloned(),
        }
    }

    pub fn active_task(&self) -> Option<TaskStatus> {
        let mut inner = self.inner.lock();
        inner.finish_if_expired(now_micros());
        inner.active.as_ref().map(|t| t.status.clone())
    }

    /// Offers a record to the running task. Returns whether it was kept.
    pub fn record(&self, record: TrafficRecord) -> bool {
        let mut inner = self.inner.lock();
        inner.finish_if_expired(now_micros());
        let Some(active) = inner.active.as_mut() else {
            return false;
        };
        if active
            .status
            .settings
            .catalog
            .as_ref()
            .is_some_and(|c| *c != record.catalog)
        {
            return false;
        }
        active.accumulator += u32::from(active.status.settings.sampling_rate);
        if active.accumulator < 100 {
            active.status.skipped += 1;
            return false;
        }
        active.accumulator -= 100;
        if inner.source_ids.contains(&record.source_query_id) {
            debug!(source_query_id = %record.source_query_id, "duplicate traffic record ignored");
            return false;
        }

        if inner.records.len() == self.capacity {
            if let Some(evicted) = inner.records.pop_front() {
                inner.source_ids.remove(&evicted.source_query_id);
                inner.unindex_labels(&evicted);
            }
        }
        inner.index_labels(&record);
        inner.source_ids.insert(record.source_query_id);
        inner.records.push_back(record);
        if let Some(active) = inner.active.as_mut() {
            active.status.recorded += 1;
        }
        inner.finish_if_expired(now_micros());
        true
    }

    /// Newest matching records first.
    pub fn list(&self, limit: usize, criteria: &TrafficCriteria) -> Vec<TrafficRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .iter()
            .rev()
            .filter(|r| criteria.matches(r))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn list_label_names(&self, limit: usize) -> Vec<String> {
        let inner = self.inner.lock();
        inner.labels.keys().take(limit).cloned().collect()
    }

    pub fn list_label_values(
        &self,
        label_name: &str,
        limit: usize,
        value_starts_with: Option<&str>,
    ) -> Vec<String> {
        let inner = self.inner.lock();
        let Some(values) = inner.labels.get(label_name) else {
            return Vec::new();
        };
        values
            .keys()
            .filter(|v| value_starts_with.is_none_or(|prefix| v.starts_with(prefix)))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(catalog: &str, labels: &[(&str, &str)]) -> TrafficRecord {
        TrafficRecord {
            source_query_id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            catalog: catalog.into(),
            query: "query(collection('product'))".into(),
            record_type: TrafficRecordType::Query,
            returned_records: 1,
            total_records: 1,
            labels: labels
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            recorded_at_micros: now_micros(),
            duration_micros: 10,
        }
    }

    #[test]
    fn nothing_is_recorded_without_a_task() {
        let recorder = TrafficRecorder::new(8);
        assert!(!recorder.record(record("products", &[])));
        assert!(recorder.is_empty());
    }

    #[test]
    fn only_one_task_runs_and_stop_is_idempotent() {
        let recorder = TrafficRecorder::new(8);
        let task = recorder
            .start_recording(TrafficRecordingSettings::default())
            .expect("start");
        assert!(matches!(
            recorder.start_recording(TrafficRecordingSettings::default()),
            Err(RemodbError::Validation(_))
        ));
        let stopped = recorder.stop_recording(task.task_id).expect("stop");
        assert_eq!(stopped.state, TaskState::Finished);
        let again = recorder.stop_recording(task.task_id).expect("stop again");
        assert_eq!(again, stopped);
        assert!(recorder.stop_recording(Uuid::new_v4()).is_err());
    }

    #[test]
    fn sampling_keeps_the_configured_share() {
        let recorder = TrafficRecorder::new(100);
        recorder
            .start_recording(TrafficRecordingSettings {
                sampling_rate: 25,
                ..TrafficRecordingSettings::default()
            })
            .expect("start");
        let kept = (0..40)
            .filter(|_| recorder.record(record("products", &[])))
            .count();
        assert_eq!(kept, 10);
        let status = recorder.active_task().expect("running");
        assert_eq!(status.recorded, 10);
        assert_eq!(status.skipped, 30);
    }

    #[test]
    fn max_records_finishes_the_task() {
        let recorder = TrafficRecorder::new(100);
        let task = recorder
            .start_recording(TrafficRecordingSettings {
                max_records: Some(2),
                ..TrafficRecordingSettings::default()
            })
            .expect("start");
        assert!(recorder.record(record("products", &[])));
        assert!(recorder.record(record("products", &[])));
        assert!(!recorder.record(record("products", &[])));
        let status = recorder.status(task.task_id).expect("status");
        assert_eq!(status.state, TaskState::Finished);
        assert_eq!(status.recorded, 2);
    }

    #[test]
    fn duplicates_are_ignored_and_oldest_entries_evicted() {
        let recorder = TrafficRecorder::new(2);
        recorder
            .start_recording(TrafficRecordingSettings::default())
            .expect("start");
        let first = record("products", &[("client", "web")]);
        assert!(recorder.record(first.clone()));
        assert!(!recorder.record(first.clone()));
        assert!(recorder.record(record("products", &[("client", "app")])));
        assert!(recorder.record(record("products", &[("region", "eu")])));
        assert_eq!(recorder.len(), 2);
        assert_eq!(recorder.list_label_values("client", 10, None), vec!["app"]);
        assert_eq!(recorder.list_label_names(10), vec!["client", "region"]);
    }

    #[test]
    fn list_filters_and_orders_newest_first() {
        let recorder = TrafficRecorder::new(10);
        recorder
            .start_recording(TrafficRecordingSettings::default())
            .expect("start");
        let a = record("products", &[("client", "web")]);
        let b = record("orders", &[("client", "web")]);
        let c = record("products", &[("client", "warehouse")]);
        for r in [&a, &b, &c] {
            assert!(recorder.record(r.clone()));
        }
        let all = recorder.list(10, &TrafficCriteria::default());
        assert_eq!(all[0].source_query_id, c.source_query_id);
        assert_eq!(all[2].source_query_id, a.source_query_id);

        let products = recorder.list(
            10,
            &TrafficCriteria {
                catalog: Some("products".into()),
                labels: vec![("client".into(), "web".into())],
                ..TrafficCriteria::default()
            },
        );
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].source_query_id, a.source_query_id);
        assert_eq!(recorder.list(1, &TrafficCriteria::default()).len(), 1);
        assert_eq!(
            recorder.list_label_values("client", 10, Some("w")),
            vec!["warehouse", "web"]
        );
    }

    #[test]
    fn only_recent_finished_tasks_are_remembered() {
        let recorder = TrafficRecorder::new(8);
        let first = recorder
            .start_recording(TrafficRecordingSettings::default())
            .expect("start");
        recorder.stop_recording(first.task_id).expect("stop");
        for _ in 0..FINISHED_TASK_HISTORY {
            let task = recorder
                .start_recording(TrafficRecordingSettings::default())
                .expect("start");
            recorder.stop_recording(task.task_id).expect("stop");
        }
        assert!(recorder.status(first.task_id).is_none());
        assert!(recorder.stop_recording(first.task_id).is_err());
        assert_eq!(recorder.inner.lock().finished.len(), FINISHED_TASK_HISTORY);
    }
}
