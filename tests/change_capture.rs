use remodb::catalog::schema::AttributeSchema;
use remodb::catalog::types::ValueType;
use remodb::commit::mutation::{MutationKind, SchemaMutation};
use remodb::{
    CaptureCriteria, CapturePointer, CaptureResponseType, CaptureStart, ChangeCaptureRecord,
    Mutation, RemodbConfig, RemodbError, RemodbInstance, SessionOptions, TargetIdentity, Value,
};
use std::time::Duration;
use uuid::Uuid;

async fn products_db(config: RemodbConfig) -> (RemodbInstance, Uuid) {
    let db = RemodbInstance::open_in_memory(config).expect("open");
    db.define_catalog("products").expect("define");
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
                mutations: vec![
                    SchemaMutation::CreateAttribute(AttributeSchema::new("name", ValueType::Text)),
                    SchemaMutation::CreateAttribute(AttributeSchema::new(
                        "stock",
                        ValueType::Integer,
                    )),
                ],
            }),
        ],
        1,
    )
    .await
    .expect("schema");
    (db, session)
}

fn product(pk: u32) -> TargetIdentity {
    TargetIdentity::entity("products", "product", pk)
}

fn drain(sub: &mut remodb::Subscription) -> Vec<ChangeCaptureRecord> {
    let mut out = Vec::new();
    while let Some(Ok(record)) = sub.try_next() {
        out.push(record);
    }
    out
}

#[tokio::test]
async fn records_arrive_in_commit_order() {
    let (db, session) = products_db(RemodbConfig::development()).await;
    let mut sub = db
        .subscribe(CaptureCriteria::catalog("products"), CaptureStart::Now)
        .expect("subscribe");

    db.open_transaction(session).expect("open");
    db.apply_mutations(
        session,
        product(1),
        vec![
            Mutation::set_attribute("name", Value::text("one")),
            Mutation::set_attribute("stock", Value::Integer(3)),
        ],
        0,
    )
    .await
    .expect("stage 1");
    db.apply_mutations(
        session,
        product(2),
        vec![Mutation::set_attribute("name", Value::text("two"))],
        0,
    )
    .await
    .expect("stage 2");
    let first = db.commit(session).await.expect("commit");
    db.apply_mutations(
        session,
        product(1),
        vec![Mutation::set_attribute("stock", Value::Integer(2))],
        1,
    )
    .await
    .expect("implicit");

    let records = drain(&mut sub);
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.response_type == CaptureResponseType::Change));
    assert!(
        records
            .windows(2)
            .all(|w| w[0].pointer < w[1].pointer && w[0].transaction_id <= w[1].transaction_id)
    );
    let first_version = first.catalog_version.expect("version");
    assert_eq!(records[0].pointer, CapturePointer::new(first_version, 0));
    assert_eq!(records[2].pointer, CapturePointer::new(first_version, 2));
    assert_eq!(records[3].pointer, CapturePointer::new(first_version + 1, 0));
    assert_eq!(records[2].target, Some(product(2)));
}

#[tokio::test]
async fn criteria_filter_by_kind_and_entity_type() {
    let (db, session) = products_db(RemodbConfig::development()).await;
    let mut schema_only = db
        .subscribe(
            CaptureCriteria::catalog("products").with_kind(MutationKind::Schema),
            CaptureStart::Now,
        )
        .expect("subscribe");
    let mut products_only = db
        .subscribe(
            CaptureCriteria::catalog("products").with_entity_type("product"),
            CaptureStart::Now,
        )
        .expect("subscribe");
    assert_eq!(db.subscriber_count(), 2);

    db.apply_mutations(
        session,
        product(1),
        vec![Mutation::set_attribute("name", Value::text("one"))],
        0,
    )
    .await
    .expect("entity write");
    let schema_version = db
        .catalog_schema(session)
        .expect("schema")
        .version;
    db.apply_mutations(
        session,
        TargetIdentity::schema("products"),
        vec![Mutation::Schema(SchemaMutation::CreateEntitySchema {
            entity_type: "category".into(),
        })],
        schema_version,
    )
    .await
    .expect("schema write");

    let schema_records = drain(&mut schema_only);
    assert_eq!(schema_records.len(), 1);
    assert_eq!(schema_records[0].target, Some(TargetIdentity::schema("products")));
    let product_records = drain(&mut products_only);
    assert_eq!(product_records.len(), 1);
    assert_eq!(product_records[0].target, Some(product(1)));
}

#[tokio::test]
async fn slow_subscriber_is_dropped_without_slowing_writers() {
    let config = RemodbConfig {
        subscriber_buffer_capacity: 2,
        ..RemodbConfig::development()
    };
    let (db, session) = products_db(config).await;
    let mut slow = db
        .subscribe(CaptureCriteria::catalog("products"), CaptureStart::Now)
        .expect("subscribe");

    for version in 0..5u64 {
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            db.apply_mutations(
                session,
                product(1),
                vec![Mutation::set_attribute("stock", Value::Integer(version as i64))],
                version,
            ),
        )
        .await
        .expect("writer never waits on subscribers")
        .expect("write");
        assert!(response.commit.expect("implicit").committed);
    }
    assert_eq!(db.subscriber_count(), 0);

    let first = slow.try_next().expect("buffered").expect("ok");
    let second = slow.try_next().expect("buffered").expect("ok");
    assert!(first.pointer < second.pointer);
    let overrun = slow.try_next().expect("overrun").expect_err("error");
    assert!(matches!(overrun, RemodbError::SubscriberOverrun { capacity: 2, .. }));
    assert!(slow.try_next().is_none());

    // Resume right after the last delivered record from the retained history.
    let last = slow.last_delivered().expect("delivered");
    let mut resumed = db
        .subscribe(
            CaptureCriteria::catalog("products"),
            CaptureStart::Since(CapturePointer::new(last.catalog_version, last.index + 1)),
        )
        .expect("resume");
    let replayed = drain(&mut resumed);
    assert_eq!(replayed.len(), 3);
    assert!(replayed.iter().all(|r| r.pointer > last));
    assert_eq!(
        replayed.last().and_then(|r| r.mutation.clone()),
        Some(Mutation::set_attribute("stock", Value::Integer(4)))
    );
}

#[tokio::test]
async fn resuming_before_retained_history_fails() {
    let config = RemodbConfig {
        capture_ring_capacity: 2,
        ..RemodbConfig::development()
    };
    let (db, session) = products_db(config).await;
    for version in 0..4u64 {
        db.apply_mutations(
            session,
            product(1),
            vec![Mutation::set_attribute("stock", Value::Integer(version as i64))],
            version,
        )
        .await
        .expect("write");
    }
    let err = db
        .subscribe(
            CaptureCriteria::catalog("products"),
            CaptureStart::Since(CapturePointer::new(1, 0)),
        )
        .err()
        .expect("history gone");
    assert!(matches!(err, RemodbError::CaptureHistoryUnavailable { .. }));

    let err = db
        .subscribe(CaptureCriteria::default(), CaptureStart::Since(CapturePointer::new(1, 0)))
        .err()
        .expect("needs a catalog");
    assert!(matches!(err, RemodbError::Validation(_)));

    let err = db
        .subscribe(CaptureCriteria::catalog("missing"), CaptureStart::Now)
        .err()
        .expect("unknown catalog");
    assert!(matches!(err, RemodbError::CatalogNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn idle_streams_emit_acknowledgements() {
    let (db, session) = products_db(RemodbConfig::development()).await;
    let mut sub = db
        .subscribe(CaptureCriteria::catalog("products"), CaptureStart::Now)
        .expect("subscribe");
    db.apply_mutations(
        session,
        product(1),
        vec![Mutation::set_attribute("name", Value::text("one"))],
        0,
    )
    .await
    .expect("write");
    let change = sub.next().await.expect("change").expect("ok");
    assert!(change.is_change());
    let ack = sub.next().await.expect("ack").expect("ok");
    assert_eq!(ack.response_type, CaptureResponseType::Acknowledgement);
    assert_eq!(ack.pointer, change.pointer);
    assert_eq!(ack.transaction_id, change.transaction_id);
    assert!(ack.mutation.is_none());
}
