use crate::catalog::{CatalogHandle, CatalogState};
use crate::commit::tx::{CommitBehaviour, Transaction};
use crate::error::RemodbError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SessionType {
    ReadOnly,
    #[default]
    ReadWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionOptions {
    pub session_type: SessionType,
    /// Falls back to the instance default when unset.
    pub commit_behaviour: Option<CommitBehaviour>,
    /// Every commit of a dry-run session is rolled back.
    pub dry_run: bool,
}

impl SessionOptions {
    pub fn read_only() -> Self {
        Self {
            session_type: SessionType::ReadOnly,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self::default()
    }

    pub fn with_commit_behaviour(mut self, behaviour: CommitBehaviour) -> Self {
        self.commit_behaviour = Some(behaviour);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub catalog: String,
    pub session_type: SessionType,
    pub commit_behaviour: CommitBehaviour,
    pub dry_run: bool,
    pub catalog_state_at_open: String,
    pub catalog_version_at_open: u64,
    pub open_transaction: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenTransactionResponse {
    pub transaction_id: u64,
    pub already_opened_before: bool,
}

#[derive(Debug)]
enum SessionState {
    Open,
    TransactionOpen(Transaction),
    Committing { transaction_id: u64 },
    Closed,
}

struct SessionInner {
    state: SessionState,
    last_activity: Instant,
}

/// A client session bound to one catalog, holding at most one open
/// transaction. State changes happen under the session's own mutex, which is
/// never held across an `.await`.
pub struct Session {
    id: Uuid,
    catalog: Arc<CatalogHandle>,
    session_type: SessionType,
    commit_behaviour: CommitBehaviour,
    dry_run: bool,
    catalog_state_at_open: CatalogState,
    catalog_version_at_open: u64,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn open(
        catalog: Arc<CatalogHandle>,
        options: SessionOptions,
        default_behaviour: CommitBehaviour,
    ) -> Result<Self, RemodbError> {
        let state = catalog.state();
        if state != CatalogState::Alive {
            return Err(RemodbError::CatalogInWrongState {
                catalog: catalog.name().to_string(),
                state: state.to_string(),
                expected: CatalogState::Alive.to_string(),
            });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            catalog_version_at_open: catalog.visible_version(),
            catalog,
            session_type: options.session_type,
            commit_behaviour: options.commit_behaviour.unwrap_or(default_behaviour),
            dry_run: options.dry_run,
            catalog_state_at_open: state,
            inner: Mutex::new(SessionInner {
                state: SessionState::Open,
                last_activity: Instant::now(),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn catalog(&self) -> &Arc<CatalogHandle> {
        &self.catalog
    }

    pub fn commit_behaviour(&self) -> CommitBehaviour {
        self.commit_behaviour
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn is_read_only(&self) -> bool {
        self.session_type == SessionType::ReadOnly
    }

    pub fn info(&self) -> SessionInfo {
        let open_transaction = match &self.inner.lock().state {
            SessionState::TransactionOpen(txn) => Some(txn.id()),
            SessionState::Committing { transaction_id } => Some(*transaction_id),
            _ => None,
        };
        SessionInfo {
            id: self.id,
            catalog: self.catalog.name().to_string(),
            session_type: self.session_type,
            commit_behaviour: self.commit_behaviour,
            dry_run: self.dry_run,
            catalog_state_at_open: self.catalog_state_at_open.to_string(),
            catalog_version_at_open: self.catalog_version_at_open,
            open_transaction,
        }
    }

    fn ensure_writable(&self) -> Result<(), RemodbError> {
        if self.is_read_only() {
            return Err(RemodbError::SessionReadOnly {
                session_id: self.id,
            });
        }
        Ok(())
    }

    fn not_found(&self) -> RemodbError {
        RemodbError::SessionNotFound {
            session_id: self.id,
        }
    }

    /// Opens a transaction, or reports the one already open.
    pub fn open_transaction(&self) -> Result<OpenTransactionResponse, RemodbError> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        match &inner.state {
            SessionState::Closed => Err(self.not_found()),
            SessionState::TransactionOpen(txn) => Ok(OpenTransactionResponse {
                transaction_id: txn.id(),
                already_opened_before: true,
            }),
            SessionState::Committing { transaction_id } => Err(RemodbError::Validation(format!(
                "transaction {transaction_id} is still committing"
            ))),
            SessionState::Open => {
                let txn = Transaction::new(self.catalog.next_transaction_id(), self.catalog.name());
                let transaction_id = txn.id();
                inner.state = SessionState::TransactionOpen(txn);
                Ok(OpenTransactionResponse {
                    transaction_id,
                    already_opened_before: false,
                })
            }
        }
    }

    pub fn transaction_id(&self) -> Option<u64> {
        match &self.inner.lock().state {
            SessionState::TransactionOpen(txn) => Some(txn.id()),
            _ => None,
        }
    }

    /// Runs `f` against the open transaction. Without one, `f` runs on a fresh
    /// implicit transaction which is handed back for the caller to commit and
    /// then release with [`Session::finish_commit`].
    pub(crate) fn with_transaction<R>(
        &self,
        f: impl FnOnce(&mut Transaction) -> Result<R, RemodbError>,
    ) -> Result<(R, Option<Transaction>), RemodbError> {
        self.ensure_writable()?;
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        match &mut inner.state {
            SessionState::Closed => Err(self.not_found()),
            SessionState::Committing { transaction_id } => Err(RemodbError::Validation(format!(
                "transaction {transaction_id} is still committing"
            ))),
            SessionState::TransactionOpen(txn) => Ok((f(txn)?, None)),
            SessionState::Open => {
                let mut txn =
                    Transaction::new(self.catalog.next_transaction_id(), self.catalog.name());
                let out = f(&mut txn)?;
                inner.state = SessionState::Committing {
                    transaction_id: txn.id(),
                };
                Ok((out, Some(txn)))
            }
        }
    }

    pub fn set_rollback_only(&self) -> Result<(), RemodbError> {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        match &mut inner.state {
            SessionState::TransactionOpen(txn) => {
                txn.set_rollback_only();
                Ok(())
            }
            SessionState::Closed => Err(self.not_found()),
            _ => Err(RemodbError::TransactionAlreadyClosed {
                transaction_id: None,
            }),
        }
    }

    /// Moves the open transaction out for committing.
    pub(crate) fn take_for_commit(&self) -> Result<Transaction, RemodbError> {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        match std::mem::replace(&mut inner.state, SessionState::Open) {
            SessionState::TransactionOpen(txn) => {
                inner.state = SessionState::Committing {
                    transaction_id: txn.id(),
                };
                Ok(txn)
            }
            SessionState::Closed => {
                inner.state = SessionState::Closed;
                Err(self.not_found())
            }
            SessionState::Committing { transaction_id } => {
                inner.state = SessionState::Committing { transaction_id };
                Err(RemodbError::TransactionAlreadyClosed {
                    transaction_id: Some(transaction_id),
                })
            }
            SessionState::Open => Err(RemodbError::TransactionAlreadyClosed {
                transaction_id: None,
            }),
        }
    }

    /// Returns the session to `Open` after a commit finished either way.
    pub(crate) fn finish_commit(&self) {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        if matches!(inner.state, SessionState::Committing { .. }) {
            inner.state = SessionState::Open;
        }
    }

    /// Discards the open transaction and returns its id.
    pub fn rollback(&self) -> Result<u64, RemodbError> {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        match std::mem::replace(&mut inner.state, SessionState::Open) {
            SessionState::TransactionOpen(txn) => Ok(txn.id()),
            SessionState::Closed => {
                inner.state = SessionState::Closed;
                Err(self.not_found())
            }
            SessionState::Committing { transaction_id } => {
                inner.state = SessionState::Committing { transaction_id };
                Err(RemodbError::TransactionAlreadyClosed {
                    transaction_id: Some(transaction_id),
                })
            }
            SessionState::Open => Err(RemodbError::TransactionAlreadyClosed {
                transaction_id: None,
            }),
        }
    }

    /// Closes the session. Returns the id of a transaction that was
    /// implicitly rolled back.
    pub(crate) fn close(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.state, SessionState::Closed) {
            SessionState::TransactionOpen(txn) => Some(txn.id()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.inner.lock().state, SessionState::Closed)
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let inner = self.inner.lock();
        if matches!(inner.state, SessionState::Committing { .. }) {
            return Duration::ZERO;
        }
        now.saturating_duration_since(inner.last_activity)
    }
}

/// Live sessions by id.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions
            .write()
            .insert(session.id(), Arc::clone(&session));
        session
    }

    pub fn get(&self, session_id: Uuid) -> Result<Arc<Session>, RemodbError> {
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(RemodbError::SessionNotFound { session_id })
    }

    pub(crate) fn remove(&self, session_id: Uuid) -> Result<Arc<Session>, RemodbError> {
        self.sessions
            .write()
            .remove(&session_id)
            .ok_or(RemodbError::SessionNotFound { session_id })
    }

    /// Ids of sessions idle for at least `timeout`.
    pub(crate) fn expired(&self, timeout: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        self.sessions
            .read()
            .values()
            .filter(|s| s.idle_for(now) >= timeout)
            .map(|s| s.id())
            .collect()
    }

    /// Ids of every session bound to `catalog`.
    pub(crate) fn for_catalog(&self, catalog: &str) -> Vec<Uuid> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.catalog().name() == catalog)
            .map(|s| s.id())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }
}
