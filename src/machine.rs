//! Checkpointed state machines.
//!
//! [`PersistedStateMachine`] wraps [`StateMachine`] with the checkpoint
//! protocol that makes runs crash-safe and operator-controllable:
//!
//! | reason       | when                                   |
//! |--------------|----------------------------------------|
//! | `Control`    | a new control payload was accepted     |
//! | `Started`    | the machine is about to run first node |
//! | `NodeChanged`| a transition completed (or node flush) |
//!
//! The machine itself does not know how checkpoints are stored; a
//! [`MachineHooks`] implementation (in practice the state-machine
//! executor) turns each `persist` call into a pump message and serves
//! control-payload polls.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::graph::{GraphError, GraphNode, GraphStatus, Session, StateMachine};
use crate::message::ParamMap;

/// Why a checkpoint is being written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistReason {
    /// A control payload was just accepted; persist before the node can
    /// observe it so a crash cannot lose the control.
    Control,
    /// First checkpoint, recording the first node to execute.
    Started,
    /// A node transition completed (or a node requested a flush).
    NodeChanged,
}

/// Executor-side services a persisted machine runs against.
pub trait MachineHooks: Send + Sync {
    /// Current control payload for this session, if any, with its id.
    fn poll_control(&self, session_id: &str) -> Option<(String, ParamMap)>;

    /// Checkpoint the session. `finished` / `next` name the nodes the
    /// checkpoint straddles (both `None` for `Control`).
    fn persist(
        &self,
        session: &Session,
        reason: PersistReason,
        finished: Option<&str>,
        next: Option<&str>,
    ) -> Result<(), MachineError>;
}

#[derive(Debug, Error, Diagnostic)]
pub enum MachineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    /// A checkpoint could not be handed to the executor (result channel
    /// gone — the leader stopped underneath this worker).
    #[error("failed to persist session {session_id}: {message}")]
    #[diagnostic(code(wardmill::machine::persist))]
    Persist { session_id: String, message: String },
}

/// A state machine whose session is checkpointed on every transition.
pub struct PersistedStateMachine {
    inner: StateMachine,
}

impl PersistedStateMachine {
    /// Fresh machine for a new operation.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            inner: StateMachine::new(session),
        }
    }

    /// Rebuild a machine from a checkpointed session. Progress recorded
    /// in `nodes_process` is preserved; execution resumes at the
    /// checkpointed `current_node`.
    #[must_use]
    pub fn from_session(session: Session) -> Self {
        Self {
            inner: StateMachine::new(session),
        }
    }

    pub fn add_node(&mut self, node: Arc<dyn GraphNode>) -> Result<(), GraphError> {
        self.inner.add_node(node)
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        self.inner.session()
    }

    #[must_use]
    pub fn status(&self) -> GraphStatus {
        self.inner.core.status()
    }

    /// Run to a terminal status, checkpointing through `hooks`.
    ///
    /// Loop shape: poll for a control (new id → accept + checkpoint with
    /// reason `Control`), emit the `Started` checkpoint once, then step
    /// the underlying machine, checkpointing with `NodeChanged` whenever
    /// the current node moved or a node requested a flush. A step error
    /// marks the machine `Failed` and is surfaced to the executor.
    pub async fn run(&mut self, hooks: &dyn MachineHooks) -> Result<(), MachineError> {
        if self.status() == GraphStatus::Created {
            self.inner.core.prepare()?;
        }
        loop {
            {
                let session = &mut self.inner.core.session;
                if let Some((control_id, payload)) = hooks.poll_control(&session.id) {
                    if session.last_control_id.as_deref() != Some(control_id.as_str()) {
                        tracing::info!(
                            session = %session.id,
                            control_id = %control_id,
                            "control accepted"
                        );
                        session.control_message = Some(payload);
                        session.last_control_id = Some(control_id);
                        hooks.persist(session, PersistReason::Control, None, None)?;
                    }
                }
            }

            if self.status() == GraphStatus::Inited {
                let first = self.inner.session().current_node.clone();
                hooks.persist(
                    self.inner.session(),
                    PersistReason::Started,
                    None,
                    first.as_deref(),
                )?;
                self.inner.core.session.status = GraphStatus::Running;
            }

            if self.status() != GraphStatus::Running {
                break;
            }

            let finished = self.inner.session().current_node.clone();
            if let Err(error) = self.inner.run_next().await {
                self.inner.core.session.status = GraphStatus::Failed;
                tracing::error!(
                    session = %self.inner.session().id,
                    error = %error,
                    "state machine step failed"
                );
                return Err(error.into());
            }
            let flushed = self.inner.core.session.take_flush();
            let current = self.inner.session().current_node.clone();
            if finished != current || flushed {
                hooks.persist(
                    self.inner.session(),
                    PersistReason::NodeChanged,
                    finished.as_deref(),
                    current.as_deref(),
                )?;
            }
        }
        Ok(())
    }
}
