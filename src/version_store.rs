use crate::catalog::types::VersionedEntity;
use crate::error::RemodbError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone)]
struct Version {
    /// Catalog commit version that produced this snapshot.
    seq: u64,
    snapshot: VersionedEntity,
    created_at: Instant,
    ref_count: Arc<AtomicU64>,
}

/// History of one target's snapshots ordered by commit version.
///
/// The back of the queue is the write head that optimistic checks compare
/// against. Entries above the catalog's visible version are pending: they
/// are installed but not yet observable by readers.
#[derive(Debug, Clone)]
pub struct VersionStore {
    versions: VecDeque<Version>,
    max_versions: usize,
    min_version_age_ms: u64,
}

#[derive(Debug)]
pub struct ReadViewGuard {
    seq: u64,
    snapshot: VersionedEntity,
    ref_count: Arc<AtomicU64>,
}

impl Drop for ReadViewGuard {
    fn drop(&mut self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ReadViewGuard {
    pub fn snapshot(&self) -> &VersionedEntity {
        &self.snapshot
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn to_snapshot(&self) -> VersionedEntity {
        self.snapshot.clone()
    }
}

impl VersionStore {
    pub fn new(max_versions: usize, min_version_age_ms: u64) -> Self {
        Self {
            versions: VecDeque::new(),
            max_versions: max_versions.max(1),
            min_version_age_ms,
        }
    }

    pub fn bootstrap(&mut self, seq: u64, snapshot: VersionedEntity) {
        self.versions.clear();
        self.versions.push_back(new_version(seq, snapshot));
    }

    pub fn write_head(&self) -> Option<&VersionedEntity> {
        self.versions.back().map(|v| &v.snapshot)
    }

    /// Installs a pending snapshot produced by commit `seq`.
    pub fn publish(&mut self, seq: u64, snapshot: VersionedEntity, visible_seq: u64) {
        self.versions.push_back(new_version(seq, snapshot));
        self.gc(visible_seq);
    }

    /// Newest snapshot whose commit is visible.
    pub fn acquire_visible(&self, visible_seq: u64) -> Result<ReadViewGuard, RemodbError> {
        let version = self
            .versions
            .iter()
            .rev()
            .find(|v| v.seq <= visible_seq)
            .ok_or_else(|| RemodbError::Validation("no visible version retained".into()))?;
        Ok(acquire(version))
    }

    /// Visible snapshot carrying the given target version, for readers that
    /// pinned an older version.
    pub fn acquire_at_version(
        &self,
        version: u64,
        visible_seq: u64,
    ) -> Result<ReadViewGuard, RemodbError> {
        let visible = self.versions.iter().filter(|v| v.seq <= visible_seq);
        if let Some(found) = visible.clone().find(|v| v.snapshot.version() == version) {
            return Ok(acquire(found));
        }
        let oldest = visible
            .clone()
            .map(|v| v.snapshot.version())
            .min()
            .unwrap_or(0);
        let newest = visible.map(|v| v.snapshot.version()).max().unwrap_or(0);
        if version < oldest {
            return Err(RemodbError::Validation(format!(
                "requested version {version} has been garbage collected (oldest retained version: {oldest})"
            )));
        }
        if version > newest {
            return Err(RemodbError::Validation(format!(
                "requested version {version} is not yet visible (latest visible version: {newest})"
            )));
        }
        Err(RemodbError::Validation(format!(
            "requested version {version} not found in version store"
        )))
    }

    /// Drops pending snapshots from commits after `seq`. Returns true when the
    /// store ended up empty.
    pub fn truncate_after(&mut self, seq: u64) -> bool {
        while self.versions.back().is_some_and(|v| v.seq > seq) {
            self.versions.pop_back();
        }
        self.versions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Prunes old snapshots. Pending ones, the newest visible one and any a
    /// reader still holds are kept.
    pub fn gc(&mut self, visible_seq: u64) {
        while self.versions.len() > self.max_versions {
            let newest_visible_idx = self.versions.iter().rposition(|v| v.seq <= visible_seq);
            let can_remove = self.versions.front().is_some_and(|v| {
                newest_visible_idx.is_some_and(|idx| idx > 0)
                    && v.seq <= visible_seq
                    && v.ref_count.load(Ordering::Acquire) == 0
                    && v.created_at.elapsed().as_millis() >= u128::from(self.min_version_age_ms)
            });
            if !can_remove {
                break;
            }
            self.versions.pop_front();
        }
    }
}

fn new_version(seq: u64, snapshot: VersionedEntity) -> Version {
    Version {
        seq,
        snapshot,
        created_at: Instant::now(),
        ref_count: Arc::new(AtomicU64::new(0)),
    }
}

fn acquire(version: &Version) -> ReadViewGuard {
    version.ref_count.fetch_add(1, Ordering::AcqRel);
    ReadViewGuard {
        seq: version.seq,
        snapshot: version.snapshot.clone(),
        ref_count: Arc::clone(&version.ref_count),
    }
}

#[cfg(test)]
mod tests {
    use super::VersionStore;
    use crate::catalog::types::{Entity, VersionedEntity};
    use std::sync::Arc;

    fn entity(version: u64) -> VersionedEntity {
        let mut entity = Entity::empty("product", 1);
        entity.version = version;
        VersionedEntity::Entity {
            catalog: "products".into(),
            entity: Arc::new(entity),
        }
    }

    #[test]
    fn pending_versions_are_invisible_until_released() {
        let mut store = VersionStore::new(8, 0);
        store.bootstrap(0, entity(1));
        store.publish(1, entity(2), 0);
        assert_eq!(store.write_head().map(VersionedEntity::version), Some(2));
        let view = store.acquire_visible(0).expect("visible");
        assert_eq!(view.snapshot().version(), 1);
        let view = store.acquire_visible(1).expect("visible");
        assert_eq!(view.snapshot().version(), 2);
    }

    #[test]
    fn truncate_drops_aborted_pending_versions() {
        let mut store = VersionStore::new(8, 0);
        store.bootstrap(0, entity(1));
        store.publish(1, entity(2), 0);
        store.publish(2, entity(3), 0);
        assert!(!store.truncate_after(0));
        assert_eq!(store.write_head().map(VersionedEntity::version), Some(1));
    }

    #[test]
    fn gc_keeps_pinned_and_newest_visible() {
        let mut store = VersionStore::new(1, 0);
        store.bootstrap(0, entity(1));
        let pinned = store.acquire_visible(0).expect("pin");
        store.publish(1, entity(2), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.acquire_at_version(1, 1).expect("old").snapshot().version(),
            1
        );
        drop(pinned);
        store.gc(1);
        assert_eq!(store.len(), 1);
        assert!(store.acquire_at_version(1, 1).is_err());
    }
}
