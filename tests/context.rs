mod common;

use common::fixtures::{leader_context, params, paths, seeded_store};
use serde_json::json;
use std::sync::Arc;
use wardmill::context::{ContextError, ContextRecord, GuardianContext, Operation, OperationStatus};
use wardmill::graph::{GraphStatus, Session};
use wardmill::message::{Message, MessageTag, ParamMap};
use wardmill::store::StateStore;

#[tokio::test]
async fn context_roundtrips_through_the_store() {
    let store = seeded_store().await;
    let mut ctx = leader_context(&store).await;

    ctx.backlog.push(Message::Sensed {
        operation_id: "op1".into(),
        params: params(&[("strategy", json!("hello"))]),
    });
    ctx.update_extend(params(&[("tenant", json!("blue"))]))
        .await
        .unwrap();
    ctx.save_context().await.unwrap();

    let reloaded = GuardianContext::load(Arc::clone(&store) as Arc<dyn StateStore>, paths())
        .await
        .unwrap();
    assert_eq!(reloaded.backlog, ctx.backlog);
    assert_eq!(reloaded.extend, ctx.extend);
    assert!(reloaded.lock());
}

#[tokio::test]
async fn save_without_lock_is_rejected() {
    let store = seeded_store().await;
    let mut ctx = leader_context(&store).await;
    ctx.set_lock(false);

    assert!(matches!(
        ctx.save_context().await,
        Err(ContextError::NotLeader { .. })
    ));
    assert!(matches!(
        ctx.save_operation(&Operation::new("op1", ParamMap::default()))
            .await,
        Err(ContextError::NotLeader { .. })
    ));
}

#[tokio::test]
async fn unknown_record_fields_survive_a_rewrite() {
    let store = seeded_store().await;

    // A newer schema wrote a field this version does not know about.
    let newer = json!({
        "version": 2,
        "backlog": [],
        "extend": {},
        "lock": true,
        "shard_epoch": 41
    });
    store
        .put("/testg/context", newer.to_string().as_bytes())
        .await
        .unwrap();

    let mut ctx = GuardianContext::load(Arc::clone(&store) as Arc<dyn StateStore>, paths())
        .await
        .unwrap();
    ctx.set_lock(true);
    ctx.save_context().await.unwrap();

    let raw = store.get("/testg/context").await.unwrap();
    let record: ContextRecord = serde_json::from_slice(&raw).unwrap();
    assert_eq!(record.unknown.get("shard_epoch"), Some(&json!(41)));
}

#[tokio::test]
async fn send_hook_creates_operations_and_appends_periods() {
    let store = seeded_store().await;
    let mut ctx = leader_context(&store).await;

    let sensed = Message::Sensed {
        operation_id: "op1".into(),
        params: params(&[("strategy", json!("hello"))]),
    };
    ctx.on_send(&sensed).await.unwrap();
    assert!(store.exists("/testg/operations/op1").await.unwrap());

    let decided = Message::Decided {
        operation_id: "op1".into(),
        params: params(&[("strategy", json!("hello"))]),
    };
    ctx.on_send(&decided).await.unwrap();

    let operation = ctx.get_operation("op1").unwrap();
    let tags: Vec<MessageTag> = operation.periods.iter().map(|p| p.tag).collect();
    assert_eq!(tags, vec![MessageTag::Sensed, MessageTag::Decided]);
    assert_eq!(operation.status, OperationStatus::Create);
}

#[tokio::test]
async fn state_complete_hook_folds_checkpoints_into_the_operation() {
    let store = seeded_store().await;
    let mut ctx = leader_context(&store).await;
    ctx.on_send(&Message::Sensed {
        operation_id: "op2".into(),
        params: ParamMap::default(),
    })
    .await
    .unwrap();

    let mut session = Session::new("op2", ParamMap::default());
    session.status = GraphStatus::Running;
    session.current_node = Some("add".into());
    ctx.on_send(&Message::StateComplete {
        operation_id: "op2".into(),
        session: session.clone(),
        finished: None,
        current: Some("add".into()),
        timestamp: chrono::Utc::now(),
    })
    .await
    .unwrap();

    session.current_node = Some("check".into());
    session.nodes_process.insert("add".into(), true);
    ctx.on_send(&Message::StateComplete {
        operation_id: "op2".into(),
        session: session.clone(),
        finished: Some("add".into()),
        current: Some("check".into()),
        timestamp: chrono::Utc::now(),
    })
    .await
    .unwrap();

    let operation = ctx.get_operation("op2").unwrap();
    let names: Vec<&str> = operation.actions.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["add", "check"]);
    assert_eq!(
        operation.session.as_ref().unwrap().current_node.as_deref(),
        Some("check")
    );

    // The record in the store reflects the latest checkpoint.
    let raw = store.get("/testg/operations/op2").await.unwrap();
    let persisted: Operation = serde_json::from_slice(&raw).unwrap();
    assert_eq!(persisted.actions.len(), 2);
}

#[tokio::test]
async fn complete_retires_the_operation() {
    let store = seeded_store().await;
    let mut ctx = leader_context(&store).await;
    ctx.on_send(&Message::Sensed {
        operation_id: "op1".into(),
        params: ParamMap::default(),
    })
    .await
    .unwrap();

    ctx.complete_operation("op1").await.unwrap();
    assert!(ctx.get_operation("op1").is_none());
    assert!(!store.exists("/testg/operations/op1").await.unwrap());
}

#[tokio::test]
async fn recovery_injects_decided_for_unfinished_operations() {
    let store = seeded_store().await;
    let mut ctx = leader_context(&store).await;

    let event = params(&[("strategy", json!("hello"))]);
    ctx.create_operation(Operation::new("op-a", event.clone()))
        .await
        .unwrap();
    ctx.create_operation(Operation::new("op-b", ParamMap::default()))
        .await
        .unwrap();

    // op-b already has a backlog message, so only op-a is replayed.
    ctx.backlog.push(Message::Decided {
        operation_id: "op-b".into(),
        params: ParamMap::default(),
    });

    let injected = ctx.recover_backlog();
    assert_eq!(injected, 1);
    let replayed = ctx
        .backlog
        .iter()
        .find(|m| m.operation_id() == Some("op-a"))
        .unwrap();
    assert_eq!(replayed.tag(), MessageTag::Decided);
    assert_eq!(replayed.params(), Some(&event));
}
