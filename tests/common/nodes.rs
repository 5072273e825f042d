use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use wardmill::graph::{GraphError, GraphNode, Next, Session};
use wardmill::machine::{MachineError, MachineHooks, PersistReason};
use wardmill::message::ParamMap;
use wardmill::stage::JobAdapter;

/// How a [`RecordingNode`] answers `check`.
#[derive(Clone, Copy, Debug)]
pub enum Ready {
    /// Default state-machine behaviour: ready iff it is the current node.
    Current,
    Always,
    Never,
}

/// Scripted node that logs each execution.
pub struct RecordingNode {
    name: String,
    reentrant: bool,
    next: Next,
    ready: Ready,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingNode {
    pub fn new(
        name: &str,
        reentrant: bool,
        next: Next,
        log: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reentrant,
            next,
            ready: Ready::Current,
            log,
        })
    }

    pub fn with_ready(
        name: &str,
        reentrant: bool,
        next: Next,
        ready: Ready,
        log: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reentrant,
            next,
            ready,
            log,
        })
    }
}

#[async_trait]
impl GraphNode for RecordingNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn reentrant(&self) -> bool {
        self.reentrant
    }

    async fn check(&self, session: &Session) -> Result<bool, GraphError> {
        Ok(match self.ready {
            Ready::Current => session.current_node.as_deref() == Some(self.name()),
            Ready::Always => true,
            Ready::Never => false,
        })
    }

    async fn process(&self, _session: &mut Session) -> Result<Next, GraphError> {
        self.log.lock().unwrap().push(self.name.clone());
        Ok(self.next.clone())
    }
}

/// One recorded checkpoint call.
#[derive(Clone, Debug)]
pub struct PersistCall {
    pub reason: PersistReason,
    pub finished: Option<String>,
    pub current: Option<String>,
    pub session: Session,
}

/// [`MachineHooks`] double that records checkpoints and serves controls
/// from a plain map.
#[derive(Clone, Default)]
pub struct CollectingHooks {
    pub persists: Arc<Mutex<Vec<PersistCall>>>,
    pub controls: Arc<Mutex<FxHashMap<String, (String, ParamMap)>>>,
}

impl CollectingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park_control(&self, session_id: &str, control_id: &str, payload: ParamMap) {
        self.controls
            .lock()
            .unwrap()
            .insert(session_id.to_string(), (control_id.to_string(), payload));
    }

    pub fn calls(&self) -> Vec<PersistCall> {
        self.persists.lock().unwrap().clone()
    }
}

impl MachineHooks for CollectingHooks {
    fn poll_control(&self, session_id: &str) -> Option<(String, ParamMap)> {
        self.controls.lock().unwrap().get(session_id).cloned()
    }

    fn persist(
        &self,
        session: &Session,
        reason: PersistReason,
        finished: Option<&str>,
        next: Option<&str>,
    ) -> Result<(), MachineError> {
        self.persists.lock().unwrap().push(PersistCall {
            reason,
            finished: finished.map(str::to_string),
            current: next.map(str::to_string),
            session: session.clone(),
        });
        Ok(())
    }
}

/// Job adapter with scripted verify and control results.
#[derive(Clone, Default)]
pub struct ScriptedAdapter {
    /// Node names `create` ran for, in order.
    pub created: Arc<Mutex<Vec<String>>>,
    /// Scripted `get_result` return codes; empty means 0 (settled).
    pub results: Arc<Mutex<VecDeque<i32>>>,
    /// Scripted `control` return codes; empty means 0 (accepted).
    pub control_results: Arc<Mutex<VecDeque<i32>>>,
    /// Control payloads delivered to `control`.
    pub controls: Arc<Mutex<Vec<ParamMap>>>,
    /// Verify polls, as `"<node>:<rc>"`.
    pub polls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_results(&self, codes: &[i32]) {
        self.results.lock().unwrap().extend(codes.iter().copied());
    }

    pub fn script_control_results(&self, codes: &[i32]) {
        self.control_results
            .lock()
            .unwrap()
            .extend(codes.iter().copied());
    }
}

#[async_trait]
impl JobAdapter for ScriptedAdapter {
    async fn create(
        &self,
        job_desc: &Value,
        node: &str,
        _session: &mut Session,
    ) -> Result<Option<Value>, GraphError> {
        self.created.lock().unwrap().push(node.to_string());
        Ok(Some(json!({ "node": node, "job": job_desc })))
    }

    async fn get_result(
        &self,
        _handles: &[Value],
        node: &str,
        _session: &mut Session,
    ) -> Result<i32, GraphError> {
        let rc = self.results.lock().unwrap().pop_front().unwrap_or(0);
        self.polls.lock().unwrap().push(format!("{node}:{rc}"));
        Ok(rc)
    }

    async fn control(
        &self,
        _handles: &[Value],
        control: &ParamMap,
        _session: &mut Session,
    ) -> Result<i32, GraphError> {
        self.controls.lock().unwrap().push(control.clone());
        Ok(self.control_results.lock().unwrap().pop_front().unwrap_or(0))
    }
}
