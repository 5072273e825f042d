//! Long-running process control as graphs of named nodes.
//!
//! Two step engines share one lifecycle and one [`Session`] shape:
//!
//! * [`StateMachine`] — every `process` returns the *definite* next node;
//!   suited to driving a single entity through known transitions.
//! * [`DependencyFlow`] — the next node is a *suggestion*; each step
//!   scans the node list from the current index and runs the first node
//!   whose `check` passes.
//!
//! Node reentrance is the crash-safety contract: a node whose work is not
//! idempotent declares `reentrant() == false` and the engines refuse to
//! run its completed step a second time.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::message::ParamMap;

/// Graph lifecycle status.
///
/// `Created → Inited → Running ↔ Paused → Finished | Cancelled | Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraphStatus {
    Created,
    Inited,
    Running,
    Paused,
    Finished,
    Cancelled,
    Failed,
}

impl GraphStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphStatus::Finished | GraphStatus::Cancelled | GraphStatus::Failed
        )
    }
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GraphStatus::Created => "CREATED",
            GraphStatus::Inited => "INITED",
            GraphStatus::Running => "RUNNING",
            GraphStatus::Paused => "PAUSED",
            GraphStatus::Finished => "FINISHED",
            GraphStatus::Cancelled => "CANCELLED",
            GraphStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Errors from graph construction and stepping.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    /// A lifecycle method was called from an illegal status.
    #[error("operation requires status {expected}, current status is {actual}")]
    #[diagnostic(code(wardmill::graph::status_mismatch))]
    StatusMismatch {
        expected: &'static str,
        actual: GraphStatus,
    },

    /// A node refused execution: `check` returned false, or a finished
    /// non-reentrant node was asked to run again.
    #[error("node {node} check failed: {reason}")]
    #[diagnostic(code(wardmill::graph::check_failed))]
    CheckFailed { node: String, reason: &'static str },

    /// A transition named a node outside the machine's node set.
    #[error("unknown node: {node}")]
    #[diagnostic(
        code(wardmill::graph::unknown_node),
        help("Node names persisted in a session must survive redeploys; did the node set change?")
    )]
    UnknownNode { node: String },

    /// `add_node` saw a duplicate name.
    #[error("node {node} already added")]
    #[diagnostic(code(wardmill::graph::node_exists))]
    NodeExists { node: String },

    /// The graph was started with no nodes.
    #[error("graph has no nodes")]
    #[diagnostic(code(wardmill::graph::uninitialized))]
    Uninitialized,

    /// A node implementation failed.
    #[error("node {node} failed: {message}")]
    #[diagnostic(code(wardmill::graph::node_failed))]
    NodeFailed { node: String, message: String },
}

/// What a node's `process` wants to happen next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Next {
    /// Transition to the named node.
    Node(String),
    /// The graph is done.
    End,
}

impl Next {
    /// Convenience for node implementations returning a computed name.
    #[must_use]
    pub fn node(name: impl Into<String>) -> Self {
        Next::Node(name.into())
    }
}

/// Per-graph run state; the durable part of a state machine.
///
/// The session is embedded in the owning operation record on every
/// checkpoint, and a machine rebuilt from it resumes exactly where the
/// checkpoint left off. `current_node` is `None` precisely when the
/// machine finished.
///
/// `control_message` holds an operator control payload delivered at most
/// once per distinct control id (`last_control_id` suppresses
/// duplicates). Node code that consumes a control must clear the slot;
/// the staged [`VerifyNode`](crate::stage::VerifyNode) clears it once
/// the job adapter accepts the delivery, and retries it otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub params: ParamMap,
    pub current_node: Option<String>,
    pub nodes_process: FxHashMap<String, bool>,
    pub status: GraphStatus,
    #[serde(default)]
    pub control_message: Option<ParamMap>,
    #[serde(default)]
    pub last_control_id: Option<String>,
    /// Job-adapter bookkeeping for staged machines.
    #[serde(default)]
    pub handle_list: Vec<Value>,
    /// Transient request for a checkpoint even without a node change.
    #[serde(skip)]
    flush: bool,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<String>, params: ParamMap) -> Self {
        Self {
            id: id.into(),
            params,
            current_node: None,
            nodes_process: FxHashMap::default(),
            status: GraphStatus::Created,
            control_message: None,
            last_control_id: None,
            handle_list: Vec::new(),
            flush: false,
        }
    }

    /// Ask the persisted machine to checkpoint after the current step.
    pub fn request_flush(&mut self) {
        self.flush = true;
    }

    /// Consume the flush request, returning whether one was pending.
    pub fn take_flush(&mut self) -> bool {
        std::mem::take(&mut self.flush)
    }
}

/// A named unit of work inside a graph.
///
/// A `GraphNode` is one state of a long-running procedure: it inspects
/// and mutates the [`Session`], performs its side effect, and names the
/// node to run next. `check` gates execution; the default accepts
/// exactly the node the session points at, which is what state machines
/// want. Dependency flows override it with real readiness probes.
///
/// # Design Principles
///
/// - **Named**: a node's name is its identity in checkpoints; keep it
///   stable across deploys or resumed sessions will fail with
///   [`GraphError::UnknownNode`]
/// - **Reentrance-honest**: declare `reentrant() == false` for anything
///   that fires a one-shot side effect; the engines then refuse to
///   re-run its completed step after a crash
/// - **Cooperative**: cancellation and pausing happen between steps, so
///   keep one `process` call bounded and poll
///   `session.control_message` for operator input in long waits
///
/// # Examples
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use wardmill::graph::{GraphError, GraphNode, Next, Session};
///
/// /// Submits a repair task exactly once per operation.
/// struct SubmitRepair;
///
/// #[async_trait]
/// impl GraphNode for SubmitRepair {
///     fn name(&self) -> &str {
///         "submit_repair"
///     }
///
///     // Submitting twice would double the repair: not reentrant.
///     fn reentrant(&self) -> bool {
///         false
///     }
///
///     async fn process(&self, session: &mut Session) -> Result<Next, GraphError> {
///         let target = session.params.get("host").cloned().ok_or_else(|| {
///             GraphError::NodeFailed {
///                 node: "submit_repair".into(),
///                 message: "params missing `host`".into(),
///             }
///         })?;
///         session.handle_list.push(target);
///         Ok(Next::node("await_repair"))
///     }
/// }
///
/// /// Polls the submitted task; safe to re-run any number of times.
/// struct AwaitRepair;
///
/// #[async_trait]
/// impl GraphNode for AwaitRepair {
///     fn name(&self) -> &str {
///         "await_repair"
///     }
///
///     fn reentrant(&self) -> bool {
///         true
///     }
///
///     async fn process(&self, session: &mut Session) -> Result<Next, GraphError> {
///         // Re-enter until the external system reports completion.
///         let done = session.handle_list.is_empty();
///         if done {
///             Ok(Next::End)
///         } else {
///             Ok(Next::node("await_repair"))
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait GraphNode: Send + Sync {
    fn name(&self) -> &str;

    /// Whether re-running this node's completed step is safe.
    ///
    /// Read-only probes are reentrant; anything that fires a side effect
    /// once (submitting a job, mutating an external system) is not.
    fn reentrant(&self) -> bool {
        false
    }

    async fn check(&self, session: &Session) -> Result<bool, GraphError> {
        Ok(session.current_node.as_deref() == Some(self.name()))
    }

    async fn process(&self, session: &mut Session) -> Result<Next, GraphError>;
}

impl std::fmt::Debug for dyn GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode").field("name", &self.name()).finish()
    }
}

/// Node set + session + lifecycle shared by both step engines.
pub struct GraphCore {
    nodes: Vec<Arc<dyn GraphNode>>,
    pub session: Session,
}

impl GraphCore {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            nodes: Vec::new(),
            session,
        }
    }

    pub fn add_node(&mut self, node: Arc<dyn GraphNode>) -> Result<(), GraphError> {
        if self.nodes.iter().any(|n| n.name() == node.name()) {
            return Err(GraphError::NodeExists {
                node: node.name().into(),
            });
        }
        // Keep any progress a restored session already recorded.
        self.session
            .nodes_process
            .entry(node.name().to_string())
            .or_insert(false);
        self.nodes.push(node);
        Ok(())
    }

    pub fn node(&self, name: &str) -> Result<&Arc<dyn GraphNode>, GraphError> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .ok_or_else(|| GraphError::UnknownNode { node: name.into() })
    }

    #[must_use]
    pub fn nodes(&self) -> &[Arc<dyn GraphNode>] {
        &self.nodes
    }

    #[must_use]
    pub fn status(&self) -> GraphStatus {
        self.session.status
    }

    /// First-time check: requires at least one node, points the session
    /// at the first node and moves to `Inited`.
    pub fn prepare(&mut self) -> Result<(), GraphError> {
        match self.session.status {
            GraphStatus::Created | GraphStatus::Inited => {}
            actual => {
                return Err(GraphError::StatusMismatch {
                    expected: "CREATED or INITED",
                    actual,
                })
            }
        }
        let first = self.nodes.first().ok_or(GraphError::Uninitialized)?;
        self.session.status = GraphStatus::Inited;
        self.session.current_node = Some(first.name().to_string());
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), GraphError> {
        if self.session.status != GraphStatus::Running {
            return Err(GraphError::StatusMismatch {
                expected: "RUNNING",
                actual: self.session.status,
            });
        }
        self.session.status = GraphStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), GraphError> {
        if self.session.status != GraphStatus::Paused {
            return Err(GraphError::StatusMismatch {
                expected: "PAUSED",
                actual: self.session.status,
            });
        }
        self.session.status = GraphStatus::Running;
        Ok(())
    }

    /// Request cancellation; the run loop exits at the next boundary. An
    /// in-progress `process` call is not interrupted.
    pub fn cancel(&mut self) -> Result<(), GraphError> {
        if self.session.status.is_terminal() {
            return Err(GraphError::StatusMismatch {
                expected: "a non-terminal status",
                actual: self.session.status,
            });
        }
        self.session.status = GraphStatus::Cancelled;
        Ok(())
    }

    fn start_running(&mut self) -> Result<(), GraphError> {
        self.prepare()?;
        match self.session.status {
            GraphStatus::Inited | GraphStatus::Paused => {
                self.session.status = GraphStatus::Running;
                Ok(())
            }
            actual => Err(GraphError::StatusMismatch {
                expected: "INITED or PAUSED",
                actual,
            }),
        }
    }

    fn current_node_name(&self) -> Result<String, GraphError> {
        self.session
            .current_node
            .clone()
            .ok_or(GraphError::StatusMismatch {
                expected: "a current node",
                actual: self.session.status,
            })
    }
}

/// Deterministic-transition step engine.
pub struct StateMachine {
    pub core: GraphCore,
}

impl StateMachine {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            core: GraphCore::new(session),
        }
    }

    pub fn add_node(&mut self, node: Arc<dyn GraphNode>) -> Result<(), GraphError> {
        self.core.add_node(node)
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.core.session
    }

    /// Execute one transition.
    ///
    /// The current node must pass `check` (and must not be a finished
    /// non-reentrant node); its `process` result becomes the next current
    /// node, `End` finishes the machine, and an unknown name fails it.
    pub async fn run_next(&mut self) -> Result<(), GraphError> {
        let current = self.core.current_node_name()?;
        let node = Arc::clone(self.core.node(&current)?);
        let executed = self
            .core
            .session
            .nodes_process
            .get(&current)
            .copied()
            .unwrap_or(false);
        if !node.reentrant() && executed {
            return Err(GraphError::CheckFailed {
                node: current,
                reason: "node is finished and not reentrant",
            });
        }
        if !node.check(&self.core.session).await? {
            return Err(GraphError::CheckFailed {
                node: current,
                reason: "check returned false",
            });
        }
        self.core.session.nodes_process.insert(current.clone(), true);
        let next = node.process(&mut self.core.session).await?;
        tracing::debug!(node = %current, next = ?next, "state machine transition");
        match next {
            Next::End => {
                self.core.session.status = GraphStatus::Finished;
                self.core.session.current_node = None;
            }
            Next::Node(name) => {
                if !self.core.session.nodes_process.contains_key(&name) {
                    return Err(GraphError::UnknownNode { node: name });
                }
                self.core.session.current_node = Some(name);
            }
        }
        Ok(())
    }

    /// Run to a terminal status. A step error marks the machine `Failed`
    /// and is returned to the caller.
    pub async fn start(&mut self) -> Result<(), GraphError> {
        self.core.start_running()?;
        while self.core.session.status == GraphStatus::Running {
            if let Err(error) = self.run_next().await {
                self.core.session.status = GraphStatus::Failed;
                return Err(error);
            }
        }
        Ok(())
    }
}

/// Suggestion-based step engine.
///
/// Each step scans the node list starting at the current node's index
/// (wrapping around), skipping finished non-reentrant nodes, and runs the
/// first node whose `check` passes. The processed node's return value
/// only biases where the next scan starts; when it names a node outside
/// the set and the flow is still running, the scan index advances by one
/// instead (logged at debug level).
pub struct DependencyFlow {
    pub core: GraphCore,
}

impl DependencyFlow {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            core: GraphCore::new(session),
        }
    }

    pub fn add_node(&mut self, node: Arc<dyn GraphNode>) -> Result<(), GraphError> {
        self.core.add_node(node)
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.core.session
    }

    /// Execute one scan; returns whether any node was processed.
    pub async fn run_next(&mut self) -> Result<bool, GraphError> {
        let current = self.core.current_node_name()?;
        let len = self.core.nodes().len();
        let start = self
            .core
            .nodes()
            .iter()
            .position(|n| n.name() == current)
            .ok_or_else(|| GraphError::UnknownNode {
                node: current.clone(),
            })?;
        for offset in 0..len {
            let index = (start + offset) % len;
            let node = Arc::clone(&self.core.nodes()[index]);
            let name = node.name().to_string();
            let executed = self
                .core
                .session
                .nodes_process
                .get(&name)
                .copied()
                .unwrap_or(false);
            if !node.reentrant() && executed {
                continue;
            }
            if !node.check(&self.core.session).await? {
                continue;
            }
            self.core.session.nodes_process.insert(name.clone(), true);
            let next = node.process(&mut self.core.session).await?;
            match next {
                Next::End => {
                    self.core.session.status = GraphStatus::Finished;
                    self.core.session.current_node = None;
                }
                Next::Node(suggested)
                    if self.core.session.nodes_process.contains_key(&suggested) =>
                {
                    self.core.session.current_node = Some(suggested);
                }
                Next::Node(unknown) => {
                    if self.core.session.status == GraphStatus::Running {
                        let fallback = self.core.nodes()[(index + 1) % len].name().to_string();
                        tracing::debug!(
                            suggested = %unknown,
                            fallback = %fallback,
                            "unknown next-node suggestion, advancing to next index"
                        );
                        self.core.session.current_node = Some(fallback);
                    }
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Run to a terminal status, yielding briefly when a full scan finds
    /// nothing ready.
    pub async fn start(&mut self) -> Result<(), GraphError> {
        self.core.start_running()?;
        while self.core.session.status == GraphStatus::Running {
            let progressed = match self.run_next().await {
                Ok(progressed) => progressed,
                Err(error) => {
                    self.core.session.status = GraphStatus::Failed;
                    return Err(error);
                }
            };
            if !progressed {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
        Ok(())
    }
}
