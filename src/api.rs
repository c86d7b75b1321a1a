use crate::backup::{RestoreHandle, UploadChunk, UploadProgress};
use crate::catalog::types::{Entity, TargetIdentity};
use crate::cdc::{CaptureCriteria, CaptureStart, Subscription};
use crate::commit::CommitOutcome;
use crate::commit::mutation::Mutation;
use crate::commit::tx::CommitBehaviour;
use crate::error::RemodbError;
use crate::session::{OpenTransactionResponse, SessionInfo, SessionOptions};
use crate::traffic::{TaskStatus, TrafficCriteria, TrafficRecord, TrafficRecordingSettings};
use crate::{MutationResponse, RemodbInstance};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Echoed back on the response so clients can correlate.
    pub id: String,
    #[serde(flatten)]
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RequestPayload {
    DefineCatalog {
        name: String,
    },
    OpenSession {
        catalog: String,
        #[serde(default)]
        options: SessionOptions,
    },
    CloseSession {
        session_id: Uuid,
    },
    OpenTransaction {
        session_id: Uuid,
    },
    CommitTransaction {
        session_id: Uuid,
        #[serde(default)]
        behaviour: Option<CommitBehaviour>,
    },
    RollbackTransaction {
        session_id: Uuid,
    },
    ApplyMutations {
        session_id: Uuid,
        target: TargetIdentity,
        mutations: Vec<Mutation>,
        expected_version: u64,
    },
    GetEntity {
        session_id: Uuid,
        entity_type: String,
        primary_key: u32,
    },
    StartTrafficRecording {
        settings: TrafficRecordingSettings,
    },
    StopTrafficRecording {
        task_id: Uuid,
    },
    ListTraffic {
        limit: usize,
        #[serde(default)]
        criteria: TrafficCriteria,
    },
    ListTrafficLabelNames {
        limit: usize,
    },
    ListTrafficLabelValues {
        label_name: String,
        limit: usize,
        #[serde(default)]
        value_starts_with: Option<String>,
    },
    BackupCatalog {
        name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&RemodbError> for ErrorResponse {
    fn from(err: &RemodbError) -> Self {
        Self {
            code: err.code_str().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ResponsePayload {
    CatalogDefined { name: String },
    SessionOpened(SessionInfo),
    SessionClosed { rolled_back_transaction: Option<u64> },
    TransactionOpened(OpenTransactionResponse),
    Committed(CommitOutcome),
    RolledBack { transaction_id: u64 },
    MutationsApplied(MutationResponse),
    Entity(Option<Entity>),
    TrafficTask(TaskStatus),
    TrafficRecords(Vec<TrafficRecord>),
    LabelNames(Vec<String>),
    LabelValues(Vec<String>),
    Backup { bytes: Vec<u8> },
    UploadProgress(UploadProgress),
    Error(ErrorResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub criteria: CaptureCriteria,
    pub start: CaptureStart,
}

/// Dispatches JSON-friendly requests onto a [`RemodbInstance`]. Capture
/// subscriptions and backup uploads answer with a handle the transport
/// streams from, so they have their own entry points.
pub struct ApiHandler {
    instance: Arc<RemodbInstance>,
}

impl ApiHandler {
    pub fn new(instance: Arc<RemodbInstance>) -> Self {
        Self { instance }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let payload = match self.dispatch(request.payload).await {
            Ok(payload) => payload,
            Err(err) => ResponsePayload::Error(ErrorResponse::from(&err)),
        };
        Response {
            id: request.id,
            payload,
        }
    }

    async fn dispatch(&self, payload: RequestPayload) -> Result<ResponsePayload, RemodbError> {
        let db = &self.instance;
        Ok(match payload {
            RequestPayload::DefineCatalog { name } => {
                db.define_catalog(&name)?;
                ResponsePayload::CatalogDefined { name }
            }
            RequestPayload::OpenSession { catalog, options } => {
                ResponsePayload::SessionOpened(db.open_session(&catalog, options)?)
            }
            RequestPayload::CloseSession { session_id } => ResponsePayload::SessionClosed {
                rolled_back_transaction: db.close_session(session_id)?,
            },
            RequestPayload::OpenTransaction { session_id } => {
                ResponsePayload::TransactionOpened(db.open_transaction(session_id)?)
            }
            RequestPayload::CommitTransaction {
                session_id,
                behaviour,
            } => {
                let outcome = match behaviour {
                    Some(behaviour) => db.commit_with_behaviour(session_id, behaviour).await?,
                    None => db.commit(session_id).await?,
                };
                ResponsePayload::Committed(outcome)
            }
            RequestPayload::RollbackTransaction { session_id } => ResponsePayload::RolledBack {
                transaction_id: db.rollback(session_id)?,
            },
            RequestPayload::ApplyMutations {
                session_id,
                target,
                mutations,
                expected_version,
            } => ResponsePayload::MutationsApplied(
                db.apply_mutations(session_id, target, mutations, expected_version)
                    .await?,
            ),
            RequestPayload::GetEntity {
                session_id,
                entity_type,
                primary_key,
            } => ResponsePayload::Entity(
                db.get_entity(session_id, &entity_type, primary_key)?
                    .map(|e| (*e).clone()),
            ),
            RequestPayload::StartTrafficRecording { settings } => {
                ResponsePayload::TrafficTask(db.start_traffic_recording(settings)?)
            }
            RequestPayload::StopTrafficRecording { task_id } => {
                ResponsePayload::TrafficTask(db.stop_traffic_recording(task_id)?)
            }
            RequestPayload::ListTraffic { limit, criteria } => {
                ResponsePayload::TrafficRecords(db.list_traffic(limit, &criteria))
            }
            RequestPayload::ListTrafficLabelNames { limit } => {
                ResponsePayload::LabelNames(db.list_traffic_label_names(limit))
            }
            RequestPayload::ListTrafficLabelValues {
                label_name,
                limit,
                value_starts_with,
            } => ResponsePayload::LabelValues(db.list_traffic_label_values(
                &label_name,
                limit,
                value_starts_with.as_deref(),
            )),
            RequestPayload::BackupCatalog { name } => ResponsePayload::Backup {
                bytes: db.backup_catalog(&name)?,
            },
        })
    }

    /// Opens a capture stream; the transport pulls records from it.
    pub fn subscribe(&self, request: SubscribeRequest) -> Result<Subscription, ErrorResponse> {
        self.instance
            .subscribe(request.criteria, request.start)
            .map_err(|e| ErrorResponse::from(&e))
    }

    /// Accepts a backup chunk. The restore handle is present on the chunk
    /// that completed the upload; the transport streams its outcomes.
    pub fn upload_chunk(&self, id: String, chunk: UploadChunk) -> (Response, Option<RestoreHandle>) {
        match self.instance.upload_backup_chunk(chunk) {
            Ok(response) => (
                Response {
                    id,
                    payload: ResponsePayload::UploadProgress(response.progress),
                },
                response.restore,
            ),
            Err(err) => (
                Response {
                    id,
                    payload: ResponsePayload::Error(ErrorResponse::from(&err)),
                },
                None,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiHandler, Request, RequestPayload, ResponsePayload};
    use crate::{RemodbConfig, RemodbInstance};
    use std::sync::Arc;

    #[test]
    fn requests_use_tagged_json() {
        let json = r#"{"id":"1","type":"DefineCatalog","payload":{"name":"products"}}"#;
        let request: Request = serde_json::from_str(json).expect("parse");
        assert_eq!(request.id, "1");
        assert!(matches!(
            request.payload,
            RequestPayload::DefineCatalog { ref name } if name == "products"
        ));
    }

    #[tokio::test]
    async fn errors_are_reported_with_stable_codes() {
        let db = Arc::new(RemodbInstance::open_in_memory(RemodbConfig::development()).expect("open"));
        let api = ApiHandler::new(db);
        let response = api
            .handle(Request {
                id: "7".into(),
                payload: RequestPayload::OpenSession {
                    catalog: "missing".into(),
                    options: Default::default(),
                },
            })
            .await;
        assert_eq!(response.id, "7");
        match response.payload {
            ResponsePayload::Error(err) => {
                assert_eq!(err.code, "catalog_not_found");
                assert!(!err.retryable);
            }
            other => panic!("unexpected response {other:?}"),
        }

        let defined = api
            .handle(Request {
                id: "8".into(),
                payload: RequestPayload::DefineCatalog {
                    name: "products".into(),
                },
            })
            .await;
        assert!(matches!(defined.payload, ResponsePayload::CatalogDefined { .. }));
        let json = serde_json::to_string(&defined).expect("encode");
        assert!(json.contains(r#""type":"CatalogDefined""#));
    }
}
