use crate::commit::tx::CommitBehaviour;
use crate::error::RemodbError;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Runtime configuration for a remodb instance.
#[derive(Debug, Clone)]
pub struct RemodbConfig {
    pub default_commit_behaviour: CommitBehaviour,
    pub commit_queue_capacity: usize,
    pub commit_timeout_ms: u64,
    pub max_versions: usize,
    pub min_version_age_ms: u64,
    pub version_gc_interval_ms: u64,
    pub capture_ring_capacity: usize,
    pub subscriber_buffer_capacity: usize,
    pub capture_heartbeat_interval_ms: u64,
    pub session_inactivity_timeout_ms: u64,
    pub session_sweep_interval_ms: u64,
    pub traffic_buffer_capacity: usize,
    pub max_backup_bytes: u64,
    /// HMAC key used to sign backup archives. Wrapped in Arc<Zeroizing<>> so the
    /// key is wiped from memory when the last reference is dropped.
    pub backup_signing_key: Option<Arc<Zeroizing<Vec<u8>>>>,
}

impl Default for RemodbConfig {
    fn default() -> Self {
        Self {
            default_commit_behaviour: CommitBehaviour::WaitForChangesVisible,
            commit_queue_capacity: 1024,
            commit_timeout_ms: 5_000,
            max_versions: 64,
            min_version_age_ms: 1_000,
            version_gc_interval_ms: 1_000,
            capture_ring_capacity: 4_096,
            subscriber_buffer_capacity: 256,
            capture_heartbeat_interval_ms: 5_000,
            session_inactivity_timeout_ms: 60_000,
            session_sweep_interval_ms: 1_000,
            traffic_buffer_capacity: 10_000,
            max_backup_bytes: 512 * 1024 * 1024,
            backup_signing_key: None,
        }
    }
}

impl RemodbConfig {
    pub fn production(signing_key: [u8; 32]) -> Self {
        Self {
            default_commit_behaviour: CommitBehaviour::WaitForWalPersistence,
            backup_signing_key: Some(Arc::new(Zeroizing::new(signing_key.to_vec()))),
            ..Self::default()
        }
    }

    pub fn development() -> Self {
        Self {
            default_commit_behaviour: CommitBehaviour::WaitForChangesVisible,
            capture_heartbeat_interval_ms: 500,
            session_inactivity_timeout_ms: 10 * 60_000,
            ..Self::default()
        }
    }

    /// Acknowledges commits once conflicts are resolved. Use
    /// `commit_with_behaviour(.., CommitBehaviour::WaitForWalPersistence)` for
    /// flows that must wait for durability.
    pub fn low_latency() -> Self {
        Self {
            default_commit_behaviour: CommitBehaviour::WaitForConflictResolution,
            commit_queue_capacity: 8_192,
            subscriber_buffer_capacity: 1_024,
            ..Self::default()
        }
    }

    pub fn with_signing_key(mut self, key: Vec<u8>) -> Self {
        self.backup_signing_key = Some(Arc::new(Zeroizing::new(key)));
        self
    }

    pub fn signing_key(&self) -> Option<&[u8]> {
        self.backup_signing_key
            .as_ref()
            .map(|key| key.as_slice())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.capture_heartbeat_interval_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), RemodbError> {
        let positive = [
            ("commit_queue_capacity", self.commit_queue_capacity),
            ("max_versions", self.max_versions),
            ("capture_ring_capacity", self.capture_ring_capacity),
            ("subscriber_buffer_capacity", self.subscriber_buffer_capacity),
            ("traffic_buffer_capacity", self.traffic_buffer_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RemodbError::InvalidConfig {
                    message: format!("{name} must be > 0"),
                });
            }
        }
        if self.capture_heartbeat_interval_ms == 0 {
            return Err(RemodbError::InvalidConfig {
                message: "capture_heartbeat_interval_ms must be > 0".into(),
            });
        }
        if self.commit_timeout_ms == 0 {
            return Err(RemodbError::InvalidConfig {
                message: "commit_timeout_ms must be > 0".into(),
            });
        }
        if self.session_sweep_interval_ms == 0 || self.version_gc_interval_ms == 0 {
            return Err(RemodbError::InvalidConfig {
                message: "background intervals must be > 0".into(),
            });
        }
        if self.signing_key().is_some_and(|key| key.len() < 16) {
            return Err(RemodbError::InvalidConfig {
                message: "backup_signing_key must be at least 16 bytes".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::RemodbConfig;
    use crate::commit::tx::CommitBehaviour;

    #[test]
    fn profiles_validate() {
        RemodbConfig::default().validate().expect("default");
        RemodbConfig::development().validate().expect("development");
        RemodbConfig::low_latency().validate().expect("low latency");
        let prod = RemodbConfig::production([7u8; 32]);
        prod.validate().expect("production");
        assert_eq!(
            prod.default_commit_behaviour,
            CommitBehaviour::WaitForWalPersistence
        );
        assert_eq!(prod.signing_key().map(<[u8]>::len), Some(32));
    }

    #[test]
    fn zero_capacities_are_rejected() {
        let config = RemodbConfig {
            subscriber_buffer_capacity: 0,
            ..RemodbConfig::default()
        };
        let err = config.validate().expect_err("zero buffer");
        assert!(err.to_string().contains("subscriber_buffer_capacity"));

        let short_key = RemodbConfig::default().with_signing_key(vec![1, 2, 3]);
        assert!(short_key.validate().is_err());
    }
}
