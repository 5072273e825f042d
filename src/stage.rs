//! Staged job orchestration.
//!
//! [`StageBuilder`] turns a declarative staged plan into a state-machine
//! node chain. A plan is a list of stages, each naming a batch of jobs:
//!
//! ```json
//! [
//!   {"stage_name": "small", "job_list": [{"task_id": 1001}, {"task_id": 1002}]},
//!   {"stage_name": "all",   "job_list": [{"task_id": 1003}]}
//! ]
//! ```
//!
//! Stage `k` (1-based index `i`) compiles to one non-reentrant
//! [`JobNode`] per job (`<stage>-job-<i>-sub-<j>`), a reentrant
//! [`JobEndNode`] (`<stage>-job-<i+1>-sub-1`) and a reentrant
//! [`VerifyNode`] (`<stage>-verify-<i>`) that polls the job adapter until
//! the batch settles; the chain ends with the [`EndNode`]
//! `terminal-end`. Names are pure functions of the plan, so a machine
//! resumed after a crash lands on the same node it checkpointed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::graph::{GraphError, GraphNode, Next, Session};
use crate::message::ParamMap;

/// Name of the terminal node appended after the last stage.
pub const TERMINAL_NODE: &str = "terminal-end";

/// Reserved operation-params key holding the staged plan.
pub const STAGE_DESCRIPTION_KEY: &str = "stage_description";

/// One stage of a staged plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    pub stage_name: String,
    pub job_list: Vec<Value>,
}

/// External job system driven by the staged nodes.
///
/// `create` submits one job and returns its handle (`None` ends the
/// machine); `get_result` polls a batch (`0` settled, `< 0` abort,
/// `> 0` still running); `control` applies an operator control payload
/// to a running batch. Implementations may call
/// [`Session::request_flush`] to force a checkpoint after the current
/// step even without a node change.
#[async_trait]
pub trait JobAdapter: Send + Sync {
    async fn create(
        &self,
        job_desc: &Value,
        node: &str,
        session: &mut Session,
    ) -> Result<Option<Value>, GraphError>;

    async fn get_result(
        &self,
        handles: &[Value],
        node: &str,
        session: &mut Session,
    ) -> Result<i32, GraphError>;

    async fn control(
        &self,
        handles: &[Value],
        control: &ParamMap,
        session: &mut Session,
    ) -> Result<i32, GraphError>;
}

/// Submits one job through the adapter and appends its handle.
pub struct JobNode {
    name: String,
    next_name: String,
    job_desc: Value,
    adapter: Arc<dyn JobAdapter>,
}

#[async_trait]
impl GraphNode for JobNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, session: &mut Session) -> Result<Next, GraphError> {
        match self
            .adapter
            .create(&self.job_desc, &self.name, session)
            .await?
        {
            Some(handle) => {
                session.handle_list.push(handle);
                Ok(Next::node(&self.next_name))
            }
            None => Ok(Next::End),
        }
    }
}

/// Marks the end of a stage's job batch and routes to its verify node.
pub struct JobEndNode {
    name: String,
    next_name: String,
}

#[async_trait]
impl GraphNode for JobEndNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn reentrant(&self) -> bool {
        true
    }

    async fn process(&self, _session: &mut Session) -> Result<Next, GraphError> {
        Ok(Next::node(&self.next_name))
    }
}

/// Polls a stage's batch until it settles; delivers pending controls.
pub struct VerifyNode {
    name: String,
    next_name: String,
    adapter: Arc<dyn JobAdapter>,
}

#[async_trait]
impl GraphNode for VerifyNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn reentrant(&self) -> bool {
        true
    }

    async fn process(&self, session: &mut Session) -> Result<Next, GraphError> {
        if let Some(control) = session.control_message.clone() {
            let handles = session.handle_list.clone();
            let rc = self.adapter.control(&handles, &control, session).await?;
            if rc == 0 {
                session.control_message = None;
            } else {
                // Keep the pending control; it is redelivered on the
                // next tick until the adapter accepts it.
                tracing::warn!(node = %self.name, rc, "job control failed");
            }
        }
        let handles = session.handle_list.clone();
        let rc = self.adapter.get_result(&handles, &self.name, session).await?;
        if rc == 0 {
            session.handle_list.clear();
            Ok(Next::node(&self.next_name))
        } else if rc < 0 {
            tracing::warn!(node = %self.name, rc, "stage aborted by adapter");
            session.handle_list.clear();
            Ok(Next::End)
        } else {
            Ok(Next::node(&self.name))
        }
    }
}

/// Terminal node.
pub struct EndNode {
    name: String,
}

#[async_trait]
impl GraphNode for EndNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn reentrant(&self) -> bool {
        true
    }

    async fn process(&self, _session: &mut Session) -> Result<Next, GraphError> {
        Ok(Next::End)
    }
}

/// Compiles staged plans into node chains.
#[derive(Clone, Default)]
pub struct StageBuilder;

impl StageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Parse the plan out of operation params (`stage_description` key).
    pub fn plan_from_params(params: &ParamMap) -> Result<Vec<StagePlan>, GraphError> {
        let raw = params
            .get(STAGE_DESCRIPTION_KEY)
            .ok_or_else(|| GraphError::NodeFailed {
                node: TERMINAL_NODE.into(),
                message: format!("params missing `{STAGE_DESCRIPTION_KEY}`"),
            })?;
        serde_json::from_value(raw.clone()).map_err(|e| GraphError::NodeFailed {
            node: TERMINAL_NODE.into(),
            message: format!("invalid staged plan: {e}"),
        })
    }

    /// Build the node chain for `plan`, every job wired to `adapter`.
    pub fn build(
        &self,
        plan: &[StagePlan],
        adapter: Arc<dyn JobAdapter>,
    ) -> Result<Vec<Arc<dyn GraphNode>>, GraphError> {
        if plan.is_empty() {
            return Err(GraphError::Uninitialized);
        }
        let mut nodes: Vec<Arc<dyn GraphNode>> = Vec::new();
        for (k, stage) in plan.iter().enumerate() {
            let i = k + 1;
            let job_end_name = job_name(&stage.stage_name, i + 1, 1);
            for (j0, job_desc) in stage.job_list.iter().enumerate() {
                let j = j0 + 1;
                let next_name = if j0 + 1 < stage.job_list.len() {
                    job_name(&stage.stage_name, i, j + 1)
                } else {
                    job_end_name.clone()
                };
                nodes.push(Arc::new(JobNode {
                    name: job_name(&stage.stage_name, i, j),
                    next_name,
                    job_desc: job_desc.clone(),
                    adapter: Arc::clone(&adapter),
                }));
            }
            let verify_name = format!("{}-verify-{i}", stage.stage_name);
            nodes.push(Arc::new(JobEndNode {
                name: job_end_name,
                next_name: verify_name.clone(),
            }));
            let verify_next = match plan.get(k + 1) {
                Some(next_stage) => job_name(&next_stage.stage_name, i + 1, 1),
                None => TERMINAL_NODE.to_string(),
            };
            nodes.push(Arc::new(VerifyNode {
                name: verify_name,
                next_name: verify_next,
                adapter: Arc::clone(&adapter),
            }));
        }
        nodes.push(Arc::new(EndNode {
            name: TERMINAL_NODE.to_string(),
        }));
        Ok(nodes)
    }
}

fn job_name(stage: &str, index: usize, sub: usize) -> String {
    format!("{stage}-job-{index}-sub-{sub}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Vec<StagePlan> {
        serde_json::from_str(
            r#"[
                {"stage_name": "small", "job_list": [{"id": 1}, {"id": 2}]},
                {"stage_name": "all", "job_list": [{"id": 3}]}
            ]"#,
        )
        .unwrap()
    }

    struct NullAdapter;

    #[async_trait]
    impl JobAdapter for NullAdapter {
        async fn create(
            &self,
            _job_desc: &Value,
            _node: &str,
            _session: &mut Session,
        ) -> Result<Option<Value>, GraphError> {
            Ok(None)
        }

        async fn get_result(
            &self,
            _handles: &[Value],
            _node: &str,
            _session: &mut Session,
        ) -> Result<i32, GraphError> {
            Ok(0)
        }

        async fn control(
            &self,
            _handles: &[Value],
            _control: &ParamMap,
            _session: &mut Session,
        ) -> Result<i32, GraphError> {
            Ok(0)
        }
    }

    #[test]
    fn node_names_are_stable() {
        let nodes = StageBuilder::new()
            .build(&plan(), Arc::new(NullAdapter))
            .unwrap();
        let names: Vec<&str> = nodes.iter().map(|n| n.name()).collect();
        assert_eq!(
            names,
            vec![
                "small-job-1-sub-1",
                "small-job-1-sub-2",
                "small-job-2-sub-1",
                "small-verify-1",
                "all-job-2-sub-1",
                "all-job-3-sub-1",
                "all-verify-2",
                "terminal-end",
            ]
        );
    }

    #[test]
    fn empty_plan_is_rejected() {
        let err = StageBuilder::new()
            .build(&[], Arc::new(NullAdapter))
            .unwrap_err();
        assert!(matches!(err, GraphError::Uninitialized));
    }
}
