mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::nodes::{CollectingHooks, RecordingNode};
use serde_json::json;
use wardmill::graph::{GraphError, GraphNode, GraphStatus, Next, Session};
use wardmill::machine::{PersistReason, PersistedStateMachine};
use wardmill::message::ParamMap;

fn two_node_machine(
    session: Session,
    log: &Arc<Mutex<Vec<String>>>,
) -> PersistedStateMachine {
    let mut machine = if session.status == GraphStatus::Created {
        PersistedStateMachine::new(session)
    } else {
        PersistedStateMachine::from_session(session)
    };
    machine
        .add_node(RecordingNode::new("add", false, Next::node("check"), log.clone()))
        .unwrap();
    machine
        .add_node(RecordingNode::new("check", true, Next::End, log.clone()))
        .unwrap();
    machine
}

#[tokio::test]
async fn checkpoint_sequence_for_a_two_node_run() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = CollectingHooks::new();
    let mut machine = two_node_machine(Session::new("op2", ParamMap::default()), &log);

    machine.run(&hooks).await.unwrap();

    let calls = hooks.calls();
    assert_eq!(calls.len(), 3);

    assert_eq!(calls[0].reason, PersistReason::Started);
    assert_eq!(calls[0].finished, None);
    assert_eq!(calls[0].current.as_deref(), Some("add"));

    assert_eq!(calls[1].reason, PersistReason::NodeChanged);
    assert_eq!(calls[1].finished.as_deref(), Some("add"));
    assert_eq!(calls[1].current.as_deref(), Some("check"));

    assert_eq!(calls[2].reason, PersistReason::NodeChanged);
    assert_eq!(calls[2].finished.as_deref(), Some("check"));
    assert_eq!(calls[2].current, None);
    assert_eq!(calls[2].session.status, GraphStatus::Finished);
    assert_eq!(calls[2].session.current_node, None);
}

#[tokio::test]
async fn resuming_from_any_checkpoint_reaches_the_same_terminal_session() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = CollectingHooks::new();
    let mut machine = two_node_machine(Session::new("op2", ParamMap::default()), &log);
    machine.run(&hooks).await.unwrap();
    let terminal = machine.session().clone();

    for (k, call) in hooks.calls().into_iter().enumerate() {
        let resumed_log = Arc::new(Mutex::new(Vec::new()));
        let resumed_hooks = CollectingHooks::new();
        let mut resumed = two_node_machine(call.session.clone(), &resumed_log);
        resumed
            .run(&resumed_hooks)
            .await
            .unwrap_or_else(|e| panic!("resume from checkpoint {k} failed: {e}"));
        assert_eq!(
            resumed.session(),
            &terminal,
            "checkpoint {k} produced a different terminal session"
        );
    }
}

#[tokio::test]
async fn resume_never_reruns_a_finished_non_reentrant_node() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = CollectingHooks::new();
    let mut machine = two_node_machine(Session::new("op2", ParamMap::default()), &log);
    machine.run(&hooks).await.unwrap();

    // Resume from the checkpoint written after "add" completed.
    let after_add = hooks.calls()[1].session.clone();
    log.lock().unwrap().clear();

    let mut resumed = two_node_machine(after_add, &log);
    resumed.run(&CollectingHooks::new()).await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["check"]);
}

#[tokio::test]
async fn resume_with_a_removed_node_fails_unknown_node() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let hooks = CollectingHooks::new();
    let mut machine = two_node_machine(Session::new("op2", ParamMap::default()), &log);
    machine.run(&hooks).await.unwrap();

    // The node set shrank between deploys: "check" no longer exists.
    let after_add = hooks.calls()[1].session.clone();
    let mut resumed = PersistedStateMachine::from_session(after_add);
    resumed
        .add_node(RecordingNode::new("add", false, Next::node("check"), log))
        .unwrap();

    let error = resumed.run(&CollectingHooks::new()).await.unwrap_err();
    assert!(error.to_string().contains("unknown node"));
    assert_eq!(resumed.status(), GraphStatus::Failed);
}

/// Node that parks a control for its own session while processing, then
/// hands over to `next` — the control arrives "between" two nodes.
struct ControlInjector {
    name: String,
    next: String,
    hooks: CollectingHooks,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl GraphNode for ControlInjector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, session: &mut Session) -> Result<Next, GraphError> {
        self.log.lock().unwrap().push(self.name.clone());
        let mut payload = ParamMap::default();
        payload.insert("action".into(), json!("pause"));
        self.hooks.park_control(&session.id, "ctl-1", payload);
        Ok(Next::node(&self.next))
    }
}

/// Node that records whether it observed a control payload.
struct ControlObserver {
    name: String,
    observed: Arc<Mutex<Vec<Option<ParamMap>>>>,
}

#[async_trait]
impl GraphNode for ControlObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn reentrant(&self) -> bool {
        true
    }

    async fn process(&self, session: &mut Session) -> Result<Next, GraphError> {
        self.observed
            .lock()
            .unwrap()
            .push(session.control_message.clone());
        session.control_message = None;
        Ok(Next::End)
    }
}

#[tokio::test]
async fn control_is_checkpointed_before_the_node_sees_it() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::new(Mutex::new(Vec::new()));
    let hooks = CollectingHooks::new();

    let mut machine = PersistedStateMachine::new(Session::new("op4", ParamMap::default()));
    machine
        .add_node(Arc::new(ControlInjector {
            name: "add".into(),
            next: "check".into(),
            hooks: hooks.clone(),
            log: log.clone(),
        }))
        .unwrap();
    machine
        .add_node(Arc::new(ControlObserver {
            name: "check".into(),
            observed: observed.clone(),
        }))
        .unwrap();

    machine.run(&hooks).await.unwrap();

    let calls = hooks.calls();
    let reasons: Vec<PersistReason> = calls.iter().map(|c| c.reason).collect();
    // Started, add→check, control receipt, check→end.
    assert_eq!(
        reasons,
        vec![
            PersistReason::Started,
            PersistReason::NodeChanged,
            PersistReason::Control,
            PersistReason::NodeChanged,
        ]
    );

    // The control checkpoint carries the payload, so a crash after
    // receipt cannot lose it.
    let control_call = &calls[2];
    assert!(control_call.session.control_message.is_some());
    assert_eq!(
        control_call.session.last_control_id.as_deref(),
        Some("ctl-1")
    );

    // Exactly the next node invocation observed the control.
    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].as_ref().unwrap().get("action"), Some(&json!("pause")));

    // The id is never re-delivered: the terminal session keeps the id
    // but the slot stays empty.
    assert_eq!(machine.session().last_control_id.as_deref(), Some("ctl-1"));
    assert_eq!(machine.session().control_message, None);
}
