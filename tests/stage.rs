mod common;

use std::sync::Arc;

use common::nodes::{CollectingHooks, ScriptedAdapter};
use serde_json::json;
use wardmill::graph::{GraphStatus, Session};
use wardmill::machine::PersistedStateMachine;
use wardmill::message::ParamMap;
use wardmill::stage::{StageBuilder, StagePlan};

fn rollout_plan() -> Vec<StagePlan> {
    serde_json::from_value(json!([
        {"stage_name": "small", "job_list": [{"id": 1}, {"id": 2}]},
        {"stage_name": "all", "job_list": [{"id": 3}]}
    ]))
    .unwrap()
}

async fn run_staged(adapter: &ScriptedAdapter, hooks: &CollectingHooks) -> PersistedStateMachine {
    let nodes = StageBuilder::new()
        .build(&rollout_plan(), Arc::new(adapter.clone()))
        .unwrap();
    let mut machine = PersistedStateMachine::new(Session::new("op5", ParamMap::default()));
    for node in nodes {
        machine.add_node(node).unwrap();
    }
    machine.run(hooks).await.unwrap();
    machine
}

#[tokio::test]
async fn staged_rollout_visits_nodes_in_order() {
    let adapter = ScriptedAdapter::new();
    // First verify poll reports still-running once, then settles; the
    // second settles immediately.
    adapter.script_results(&[1, 0, 0]);
    let hooks = CollectingHooks::new();

    let machine = run_staged(&adapter, &hooks).await;

    assert_eq!(machine.status(), GraphStatus::Finished);
    assert_eq!(
        *adapter.created.lock().unwrap(),
        vec!["small-job-1-sub-1", "small-job-1-sub-2", "all-job-2-sub-1"]
    );
    assert_eq!(
        *adapter.polls.lock().unwrap(),
        vec!["small-verify-1:1", "small-verify-1:0", "all-verify-2:0"]
    );

    // Handles are cleared stage by stage.
    assert!(machine.session().handle_list.is_empty());
}

#[tokio::test]
async fn verify_reentry_does_not_checkpoint() {
    let adapter = ScriptedAdapter::new();
    adapter.script_results(&[2, 1, 0, 0]);
    let hooks = CollectingHooks::new();

    run_staged(&adapter, &hooks).await;

    // Re-entering the same verify node is not a transition; only real
    // node changes produce checkpoints.
    let transitions: Vec<(Option<String>, Option<String>)> = hooks
        .calls()
        .iter()
        .map(|c| (c.finished.clone(), c.current.clone()))
        .collect();
    for (finished, current) in &transitions {
        assert_ne!(finished, current, "self-transition checkpointed");
    }
    assert_eq!(
        adapter
            .polls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.starts_with("small-verify-1"))
            .count(),
        3
    );
}

#[tokio::test]
async fn negative_verify_result_aborts_the_rollout() {
    let adapter = ScriptedAdapter::new();
    adapter.script_results(&[-1]);
    let hooks = CollectingHooks::new();

    let machine = run_staged(&adapter, &hooks).await;

    assert_eq!(machine.status(), GraphStatus::Finished);
    // The second stage never started.
    assert_eq!(
        *adapter.created.lock().unwrap(),
        vec!["small-job-1-sub-1", "small-job-1-sub-2"]
    );
    assert!(machine.session().handle_list.is_empty());
}

#[tokio::test]
async fn pending_control_reaches_the_adapter_once() {
    let adapter = ScriptedAdapter::new();
    adapter.script_results(&[1, 0, 0]);
    let hooks = CollectingHooks::new();

    let mut control = ParamMap::default();
    control.insert("action".into(), json!("pause"));
    hooks.park_control("op5", "ctl-9", control.clone());

    let machine = run_staged(&adapter, &hooks).await;

    assert_eq!(machine.status(), GraphStatus::Finished);
    // Delivered exactly once despite the verify node re-entering.
    let delivered = adapter.controls.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0], control);
    assert_eq!(machine.session().control_message, None);
    assert_eq!(machine.session().last_control_id.as_deref(), Some("ctl-9"));
}

#[tokio::test]
async fn rejected_control_is_redelivered_until_accepted() {
    let adapter = ScriptedAdapter::new();
    // The verify node re-enters once, giving the retained control a
    // second delivery attempt.
    adapter.script_results(&[1, 0, 0]);
    adapter.script_control_results(&[1, 0]);
    let hooks = CollectingHooks::new();

    let mut control = ParamMap::default();
    control.insert("action".into(), json!("pause"));
    hooks.park_control("op5", "ctl-9", control.clone());

    let machine = run_staged(&adapter, &hooks).await;

    assert_eq!(machine.status(), GraphStatus::Finished);
    // First delivery was rejected, so the slot survived to the next
    // tick and was redelivered; acceptance then cleared it.
    let delivered = adapter.controls.lock().unwrap();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|c| c == &control));
    assert_eq!(machine.session().control_message, None);
    assert_eq!(machine.session().last_control_id.as_deref(), Some("ctl-9"));
}

#[tokio::test]
async fn jobs_accumulate_handles_until_verify_clears_them() {
    let adapter = ScriptedAdapter::new();
    let hooks = CollectingHooks::new();

    let nodes = StageBuilder::new()
        .build(&rollout_plan()[..1], Arc::new(adapter.clone()))
        .unwrap();
    let mut machine = PersistedStateMachine::new(Session::new("op", ParamMap::default()));
    for node in nodes {
        machine.add_node(node).unwrap();
    }
    machine.run(&hooks).await.unwrap();

    // Both handles were in the session at the verify checkpoint.
    let verify_checkpoint = hooks
        .calls()
        .iter()
        .find(|c| c.current.as_deref() == Some("small-verify-1"))
        .unwrap()
        .session
        .clone();
    assert_eq!(verify_checkpoint.handle_list.len(), 2);
    assert!(machine.session().handle_list.is_empty());
}
