use crate::backup::{RestoreHandle, RestoreResult, UploadChunk, UploadResponse};
use crate::catalog::types::{Entity, TargetIdentity};
use crate::cdc::{CaptureCriteria, CaptureStart, ChangeCaptureRecord, Subscription};
use crate::commit::CommitOutcome;
use crate::commit::mutation::Mutation;
use crate::commit::tx::CommitBehaviour;
use crate::error::RemodbError;
use crate::session::{OpenTransactionResponse, SessionInfo, SessionOptions};
use crate::{MutationResponse, RemodbInstance};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use uuid::Uuid;

pub fn block_on_remodb<F, T>(rt: &Handle, f: F) -> T
where
    F: Future<Output = T>,
{
    match Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(|| rt.block_on(f)),
        Err(_) => rt.block_on(f),
    }
}

/// Blocking facade for callers outside async code.
pub struct RemodbSync {
    inner: Arc<RemodbInstance>,
    rt: Handle,
}

impl RemodbSync {
    pub fn new(inner: Arc<RemodbInstance>, rt: Handle) -> Self {
        Self { inner, rt }
    }

    pub fn instance(&self) -> &Arc<RemodbInstance> {
        &self.inner
    }

    pub fn define_catalog(&self, name: &str) -> Result<(), RemodbError> {
        self.inner.define_catalog(name)
    }

    pub fn open_session(
        &self,
        catalog: &str,
        options: SessionOptions,
    ) -> Result<SessionInfo, RemodbError> {
        self.inner.open_session(catalog, options)
    }

    pub fn close_session(&self, session_id: Uuid) -> Result<Option<u64>, RemodbError> {
        self.inner.close_session(session_id)
    }

    pub fn open_transaction(
        &self,
        session_id: Uuid,
    ) -> Result<OpenTransactionResponse, RemodbError> {
        self.inner.open_transaction(session_id)
    }

    pub fn apply_mutations(
        &self,
        session_id: Uuid,
        target: TargetIdentity,
        mutations: Vec<Mutation>,
        expected_version: u64,
    ) -> Result<MutationResponse, RemodbError> {
        block_on_remodb(
            &self.rt,
            self.inner
                .apply_mutations(session_id, target, mutations, expected_version),
        )
    }

    pub fn commit(&self, session_id: Uuid) -> Result<CommitOutcome, RemodbError> {
        block_on_remodb(&self.rt, self.inner.commit(session_id))
    }

    pub fn commit_with_behaviour(
        &self,
        session_id: Uuid,
        behaviour: CommitBehaviour,
    ) -> Result<CommitOutcome, RemodbError> {
        block_on_remodb(
            &self.rt,
            self.inner.commit_with_behaviour(session_id, behaviour),
        )
    }

    pub fn rollback(&self, session_id: Uuid) -> Result<u64, RemodbError> {
        self.inner.rollback(session_id)
    }

    pub fn get_entity(
        &self,
        session_id: Uuid,
        entity_type: &str,
        primary_key: u32,
    ) -> Result<Option<Arc<Entity>>, RemodbError> {
        self.inner.get_entity(session_id, entity_type, primary_key)
    }

    pub fn subscribe(
        &self,
        criteria: CaptureCriteria,
        start: CaptureStart,
    ) -> Result<Subscription, RemodbError> {
        let _enter = self.rt.enter();
        self.inner.subscribe(criteria, start)
    }

    /// Blocks for the next capture record, or an acknowledgement after the
    /// heartbeat interval.
    pub fn next_record(
        &self,
        subscription: &mut Subscription,
    ) -> Option<Result<ChangeCaptureRecord, RemodbError>> {
        block_on_remodb(&self.rt, subscription.next())
    }

    pub fn upload_backup_chunk(&self, chunk: UploadChunk) -> Result<UploadResponse, RemodbError> {
        let _enter = self.rt.enter();
        self.inner.upload_backup_chunk(chunk)
    }

    pub fn finish_restore(&self, handle: RestoreHandle) -> Result<RestoreResult, RemodbError> {
        block_on_remodb(&self.rt, handle.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::RemodbSync;
    use crate::catalog::schema::AttributeSchema;
    use crate::catalog::types::{TargetIdentity, Value, ValueType};
    use crate::commit::mutation::{Mutation, SchemaMutation};
    use crate::session::SessionOptions;
    use crate::{RemodbConfig, RemodbInstance};
    use std::sync::Arc;

    #[test]
    fn blocking_facade_commits_outside_the_runtime() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        let db = {
            let _enter = rt.enter();
            Arc::new(RemodbInstance::open_in_memory(RemodbConfig::development()).expect("open"))
        };
        let sync = RemodbSync::new(Arc::clone(&db), rt.handle().clone());
        sync.define_catalog("products").expect("define");
        let session = sync
            .open_session("products", SessionOptions::read_write())
            .expect("session");

        let schema_target = TargetIdentity::schema("products");
        sync.apply_mutations(
            session.id,
            schema_target,
            vec![
                Mutation::Schema(SchemaMutation::CreateEntitySchema {
                    entity_type: "product".into(),
                }),
                Mutation::Schema(SchemaMutation::ModifyEntitySchema {
                    entity_type: "product".into(),
                    mutations: vec![SchemaMutation::CreateAttribute(AttributeSchema::new(
                        "name",
                        ValueType::Text,
                    ))],
                }),
            ],
            1,
        )
        .expect("schema");

        let response = sync
            .apply_mutations(
                session.id,
                TargetIdentity::entity("products", "product", 1),
                vec![Mutation::set_attribute("name", Value::text("Widget"))],
                0,
            )
            .expect("mutate");
        assert_eq!(response.next_version, 1);
        assert!(response.commit.expect("implicit").committed);
        let entity = sync
            .get_entity(session.id, "product", 1)
            .expect("read")
            .expect("present");
        assert_eq!(entity.attribute("name", None), Some(&Value::text("Widget")));
    }
}
