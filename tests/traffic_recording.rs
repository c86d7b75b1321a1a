use remodb::catalog::schema::AttributeSchema;
use remodb::catalog::types::ValueType;
use remodb::commit::mutation::SchemaMutation;
use remodb::traffic::{TaskState, TrafficCriteria, TrafficRecordType, TrafficRecordingSettings};
use remodb::{
    Mutation, RemodbConfig, RemodbError, RemodbInstance, SessionOptions, TargetIdentity, Value,
};
use std::time::Duration;
use uuid::Uuid;

async fn products_db() -> (RemodbInstance, Uuid) {
    let db = RemodbInstance::open_in_memory(RemodbConfig::development()).expect("open");
    db.define_catalog("products").expect("define");
    db.define_catalog("orders").expect("define");
    let session = db
        .open_session("products", SessionOptions::read_write())
        .expect("session")
        .id;
    db.apply_mutations(
        session,
        TargetIdentity::schema("products"),
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
    .await
    .expect("schema");
    (db, session)
}

fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn recording_captures_session_traffic() {
    let (db, session) = products_db().await;
    assert!(db.list_traffic(10, &TrafficCriteria::default()).is_empty());

    let task = db
        .start_traffic_recording(TrafficRecordingSettings {
            catalog: Some("products".into()),
            ..TrafficRecordingSettings::default()
        })
        .expect("start");
    assert_eq!(task.state, TaskState::Running);

    db.apply_mutations(
        session,
        TargetIdentity::entity("products", "product", 1),
        vec![Mutation::set_attribute("name", Value::text("lamp"))],
        0,
    )
    .await
    .expect("write");
    db.get_entity(session, "product", 1).expect("fetch");
    let query_id = Uuid::new_v4();
    assert!(
        db.record_query(
            session,
            query_id,
            "query product where name = 'lamp'",
            1,
            1,
            labels(&[("page", "search"), ("tenant", "acme")]),
            Duration::from_millis(3),
        )
        .expect("record")
    );
    // Same source query reported twice is kept once.
    assert!(
        !db.record_query(
            session,
            query_id,
            "query product where name = 'lamp'",
            1,
            1,
            Vec::new(),
            Duration::from_millis(3),
        )
        .expect("record")
    );

    let all = db.list_traffic(10, &TrafficCriteria::default());
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].record_type, TrafficRecordType::Query);
    assert_eq!(all[1].record_type, TrafficRecordType::Fetch);
    assert_eq!(all[2].record_type, TrafficRecordType::Mutation);
    assert!(all.iter().all(|r| r.session_id == session));

    let fetches = db.list_traffic(
        10,
        &TrafficCriteria {
            record_types: vec![TrafficRecordType::Fetch],
            ..TrafficCriteria::default()
        },
    );
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].returned_records, 1);

    let labelled = db.list_traffic(
        10,
        &TrafficCriteria {
            labels: labels(&[("tenant", "acme")]),
            ..TrafficCriteria::default()
        },
    );
    assert_eq!(labelled.len(), 1);
    assert_eq!(labelled[0].source_query_id, query_id);

    assert_eq!(
        db.list_traffic_label_names(10),
        vec!["page".to_string(), "tenant".to_string()]
    );
    assert_eq!(
        db.list_traffic_label_values("page", 10, Some("se")),
        vec!["search".to_string()]
    );
    assert!(db.list_traffic_label_values("page", 10, Some("zz")).is_empty());

    let stopped = db.stop_traffic_recording(task.task_id).expect("stop");
    assert_eq!(stopped.state, TaskState::Finished);
    assert_eq!(stopped.recorded, 3);
    assert!(
        !db.record_query(
            session,
            Uuid::new_v4(),
            "late",
            0,
            0,
            Vec::new(),
            Duration::ZERO,
        )
        .expect("record")
    );
    // Records survive the end of the task.
    assert_eq!(db.list_traffic(10, &TrafficCriteria::default()).len(), 3);
}

#[tokio::test]
async fn other_catalogs_are_not_recorded() {
    let (db, _) = products_db().await;
    let orders = db
        .open_session("orders", SessionOptions::read_only())
        .expect("session")
        .id;
    db.start_traffic_recording(TrafficRecordingSettings {
        catalog: Some("products".into()),
        ..TrafficRecordingSettings::default()
    })
    .expect("start");
    db.get_entity(orders, "order", 1).expect("fetch");
    assert!(db.list_traffic(10, &TrafficCriteria::default()).is_empty());
}

#[tokio::test]
async fn record_limit_finishes_the_task() {
    let (db, session) = products_db().await;
    let task = db
        .start_traffic_recording(TrafficRecordingSettings {
            max_records: Some(2),
            ..TrafficRecordingSettings::default()
        })
        .expect("start");
    let second = db.start_traffic_recording(TrafficRecordingSettings::default());
    assert!(matches!(second, Err(RemodbError::Validation(_))));

    for _ in 0..4 {
        db.get_entity(session, "product", 1).expect("fetch");
    }
    let status = db
        .traffic_recording_status(task.task_id)
        .expect("status");
    assert_eq!(status.state, TaskState::Finished);
    assert_eq!(status.recorded, 2);
    assert_eq!(db.list_traffic(10, &TrafficCriteria::default()).len(), 2);

    // A finished task no longer blocks a new one.
    db.start_traffic_recording(TrafficRecordingSettings::default())
        .expect("restart");
}

#[tokio::test]
async fn unknown_catalogs_and_bad_rates_are_rejected() {
    let (db, _) = products_db().await;
    let missing = db.start_traffic_recording(TrafficRecordingSettings {
        catalog: Some("missing".into()),
        ..TrafficRecordingSettings::default()
    });
    assert!(matches!(missing, Err(RemodbError::CatalogNotFound { .. })));
    let bad_rate = db.start_traffic_recording(TrafficRecordingSettings {
        sampling_rate: 0,
        ..TrafficRecordingSettings::default()
    });
    assert!(matches!(bad_rate, Err(RemodbError::Validation(_))));
}
