//! Executors: the execute side of the triad.
//!
//! Executors run the actual work in a bounded worker pool and feed
//! completions back to the pump through a result channel. The pump never
//! blocks on a worker: `Decided` dispatch only enqueues work, and the
//! result channel is drained non-blockingly on every idle tick.
//!
//! Two engines are provided. [`CallbackExecutor`] binds an
//! [`ExecFuncSet`] and invokes the function named by the reserved
//! [`EXEC_KEY`] param. [`StateMachineExecutor`] runs a
//! [`PersistedStateMachine`] per operation — either over a fixed node
//! set or over nodes compiled from a staged plan — and routes operator
//! `Control` messages to the running machine through a shared slot map.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::BoxFuture;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::context::{ContextError, GuardianContext};
use crate::graph::{GraphNode, GraphStatus, Session};
use crate::listener::{Listener, ListenerError, ListenerRole};
use crate::machine::{MachineError, MachineHooks, PersistReason, PersistedStateMachine};
use crate::message::{Message, MessageTag, ParamMap};
use crate::stage::{JobAdapter, StageBuilder};

/// Reserved params key naming the function a callback executor runs.
pub const EXEC_KEY: &str = ".inner_executor_key";

const CALLBACK_CONCERNS: &[MessageTag] = &[MessageTag::Idle, MessageTag::Decided];
const MACHINE_CONCERNS: &[MessageTag] = &[
    MessageTag::Idle,
    MessageTag::Decided,
    MessageTag::Control,
];

#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    /// Worker count outside the supported 1–1000 range.
    #[error("worker count must be between 1 and 1000, got {count}")]
    #[diagnostic(code(wardmill::executor::worker_count))]
    WorkerCount { count: usize },

    /// A decided message reached the callback executor without the
    /// reserved executor key.
    #[error("operation {operation_id} params carry no `{EXEC_KEY}`")]
    #[diagnostic(code(wardmill::executor::missing_exec_key))]
    MissingExecKey { operation_id: String },

    /// The executor key names a function the bound set does not have.
    #[error("unknown executor function: {name}")]
    #[diagnostic(code(wardmill::executor::unknown_func))]
    UnknownFunc { name: String },

    /// A user function failed.
    #[error("executor function {name} failed: {message}")]
    #[diagnostic(code(wardmill::executor::func))]
    Func { name: String, message: String },

    /// A tag outside the concern set reached the executor.
    #[error("message tag {tag} is not concerned by the executor")]
    #[diagnostic(code(wardmill::executor::unknown_event))]
    UnknownEvent { tag: MessageTag },

    /// A staged operation carried an unusable plan.
    #[error("invalid staged plan: {message}")]
    #[diagnostic(code(wardmill::executor::invalid_plan))]
    InvalidPlan { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Context(#[from] ContextError),
}

/// A named set of executable operations, all sharing the same shape:
/// params in, params out.
///
/// Functions may run more than once for the same operation: the recovery
/// rule replays the decided step of any operation that was in flight
/// when a leader died, so non-idempotent work belongs in a state machine
/// behind non-reentrant nodes instead.
#[async_trait]
pub trait ExecFuncSet: Send + Sync {
    fn names(&self) -> Vec<String>;

    async fn exec(&self, name: &str, params: &ParamMap) -> Result<ParamMap, ExecutorError>;
}

type ExecFn =
    Arc<dyn Fn(ParamMap) -> BoxFuture<'static, Result<ParamMap, ExecutorError>> + Send + Sync>;

/// Closure-based [`ExecFuncSet`].
#[derive(Clone, Default)]
pub struct FuncRegistry {
    funcs: FxHashMap<String, ExecFn>,
}

impl FuncRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register<F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(ParamMap) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<ParamMap, ExecutorError>> + Send + 'static,
    {
        let boxed = move |params| -> BoxFuture<'static, Result<ParamMap, ExecutorError>> {
            Box::pin(func(params))
        };
        self.funcs.insert(name.into(), Arc::new(boxed));
        self
    }
}

#[async_trait]
impl ExecFuncSet for FuncRegistry {
    fn names(&self) -> Vec<String> {
        self.funcs.keys().cloned().collect()
    }

    async fn exec(&self, name: &str, params: &ParamMap) -> Result<ParamMap, ExecutorError> {
        let func = self
            .funcs
            .get(name)
            .ok_or_else(|| ExecutorError::UnknownFunc { name: name.into() })?;
        func(params.clone()).await
    }
}

/// Bounded pool of worker tasks.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self, ExecutorError> {
        if !(1..=1000).contains(&workers) {
            return Err(ExecutorError::WorkerCount { count: workers });
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(workers)),
        })
    }

    /// Run `work` on a worker slot; queues when the pool is saturated.
    pub fn spawn<F>(&self, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            work.await;
        });
    }
}

/// Pending control payload for one operation.
#[derive(Clone, Debug)]
pub struct ControlSlot {
    pub control_id: String,
    pub payload: ParamMap,
}

type ControlMap = Arc<Mutex<FxHashMap<String, ControlSlot>>>;

fn drain(rx: &flume::Receiver<Message>) -> Vec<Message> {
    let mut pending = Vec::new();
    while let Ok(message) = rx.try_recv() {
        pending.push(message);
    }
    pending
}

/// Callback executor: dispatches decided operations to the functions of
/// a bound [`ExecFuncSet`].
pub struct CallbackExecutor {
    funcs: Arc<dyn ExecFuncSet>,
    pool: WorkerPool,
    results_tx: flume::Sender<Message>,
    results_rx: flume::Receiver<Message>,
}

impl CallbackExecutor {
    pub fn new(funcs: Arc<dyn ExecFuncSet>, workers: usize) -> Result<Self, ExecutorError> {
        let (results_tx, results_rx) = flume::unbounded();
        Ok(Self {
            funcs,
            pool: WorkerPool::new(workers)?,
            results_tx,
            results_rx,
        })
    }

    fn submit(&self, operation_id: String, params: ParamMap) -> Result<(), ExecutorError> {
        let name = params
            .get(EXEC_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::MissingExecKey {
                operation_id: operation_id.clone(),
            })?;
        let funcs = Arc::clone(&self.funcs);
        let results = self.results_tx.clone();
        self.pool.spawn(async move {
            tracing::info!(%operation_id, func = %name, "operation executing");
            let out = match funcs.exec(&name, &params).await {
                Ok(out) => out,
                Err(error) => {
                    tracing::error!(%operation_id, %error, "executor function failed");
                    let mut out = ParamMap::default();
                    out.insert("error".into(), json!(error.to_string()));
                    out
                }
            };
            let _ = results.send(Message::Complete {
                operation_id,
                params: out,
            });
        });
        Ok(())
    }
}

#[async_trait]
impl Listener for CallbackExecutor {
    fn concerns(&self) -> &[MessageTag] {
        CALLBACK_CONCERNS
    }

    fn role(&self) -> ListenerRole {
        ListenerRole::Executor
    }

    async fn dispatch(
        &self,
        message: &Message,
        ctx: &mut GuardianContext,
    ) -> Result<Vec<Message>, ListenerError> {
        match message {
            Message::Decided {
                operation_id,
                params,
            } => {
                let merged = ctx.merge_operation_params(operation_id, params).await?;
                self.submit(operation_id.clone(), merged)?;
                Ok(Vec::new())
            }
            Message::Idle => Ok(drain(&self.results_rx)),
            other => Err(ExecutorError::UnknownEvent { tag: other.tag() }.into()),
        }
    }
}

/// Where a state-machine executor gets its node set.
enum NodeSource {
    Fixed(Vec<Arc<dyn GraphNode>>),
    Staged {
        builder: StageBuilder,
        adapter: Arc<dyn JobAdapter>,
    },
}

/// State-machine executor.
///
/// On `Decided` it creates — or, when the operation record already
/// carries a checkpointed session, re-hydrates — a persisted state
/// machine and runs it to a terminal status in a worker. Checkpoints
/// come back through the result channel as `StateComplete` /
/// `PersistSession` messages; a `Complete` follows once the machine
/// stops. `Control` payloads are parked in a shared slot map the running
/// machine polls between steps.
pub struct StateMachineExecutor {
    source: NodeSource,
    pool: WorkerPool,
    results_tx: flume::Sender<Message>,
    results_rx: flume::Receiver<Message>,
    controls: ControlMap,
}

impl StateMachineExecutor {
    /// Executor over a fixed node set shared by every operation.
    pub fn new(nodes: Vec<Arc<dyn GraphNode>>, workers: usize) -> Result<Self, ExecutorError> {
        Self::with_source(NodeSource::Fixed(nodes), workers)
    }

    /// Staged executor: nodes are compiled per operation from the
    /// `stage_description` in its params, all jobs wired to `adapter`.
    pub fn staged(adapter: Arc<dyn JobAdapter>, workers: usize) -> Result<Self, ExecutorError> {
        Self::with_source(
            NodeSource::Staged {
                builder: StageBuilder::new(),
                adapter,
            },
            workers,
        )
    }

    fn with_source(source: NodeSource, workers: usize) -> Result<Self, ExecutorError> {
        let (results_tx, results_rx) = flume::unbounded();
        Ok(Self {
            source,
            pool: WorkerPool::new(workers)?,
            results_tx,
            results_rx,
            controls: Arc::new(Mutex::new(FxHashMap::default())),
        })
    }

    fn nodes_for(&self, params: &ParamMap) -> Result<Vec<Arc<dyn GraphNode>>, ExecutorError> {
        match &self.source {
            NodeSource::Fixed(nodes) => Ok(nodes.clone()),
            NodeSource::Staged { builder, adapter } => {
                let plan = StageBuilder::plan_from_params(params).map_err(|e| {
                    ExecutorError::InvalidPlan {
                        message: e.to_string(),
                    }
                })?;
                builder
                    .build(&plan, Arc::clone(adapter))
                    .map_err(|e| ExecutorError::InvalidPlan {
                        message: e.to_string(),
                    })
            }
        }
    }

    fn park_control(&self, operation_id: &str, payload: ParamMap) {
        let slot = ControlSlot {
            control_id: uuid::Uuid::new_v4().to_string(),
            payload,
        };
        match self.controls.lock() {
            Ok(mut controls) => {
                tracing::info!(%operation_id, control_id = %slot.control_id, "control parked");
                controls.insert(operation_id.to_string(), slot);
            }
            Err(_) => tracing::error!(%operation_id, "control map poisoned, control dropped"),
        }
    }

    fn submit(
        &self,
        operation_id: String,
        params: ParamMap,
        session: Option<Session>,
    ) -> Result<(), ExecutorError> {
        let nodes = self.nodes_for(&params)?;
        let bridge = ExecutorBridge {
            results: self.results_tx.clone(),
            controls: Arc::clone(&self.controls),
        };
        self.pool.spawn(async move {
            let mut machine = match session {
                Some(session) => PersistedStateMachine::from_session(session),
                None => PersistedStateMachine::new(Session::new(operation_id.clone(), params)),
            };
            for node in nodes {
                if let Err(error) = machine.add_node(node) {
                    tracing::error!(%operation_id, %error, "failed to assemble state machine");
                    bridge.finish(&operation_id, GraphStatus::Failed);
                    return;
                }
            }
            if let Err(error) = machine.run(&bridge).await {
                tracing::error!(%operation_id, %error, "state machine failed");
            } else {
                tracing::info!(%operation_id, status = %machine.status(), "state machine finished");
            }
            bridge.finish(&operation_id, machine.status());
        });
        Ok(())
    }
}

#[async_trait]
impl Listener for StateMachineExecutor {
    fn concerns(&self) -> &[MessageTag] {
        MACHINE_CONCERNS
    }

    fn role(&self) -> ListenerRole {
        ListenerRole::Executor
    }

    async fn dispatch(
        &self,
        message: &Message,
        ctx: &mut GuardianContext,
    ) -> Result<Vec<Message>, ListenerError> {
        match message {
            Message::Decided {
                operation_id,
                params,
            } => {
                let merged = ctx.merge_operation_params(operation_id, params).await?;
                let session = ctx
                    .get_operation(operation_id)
                    .and_then(|op| op.session.clone());
                self.submit(operation_id.clone(), merged, session)?;
                Ok(Vec::new())
            }
            Message::Control {
                operation_id,
                params,
            } => {
                self.park_control(operation_id, params.clone());
                Ok(Vec::new())
            }
            Message::Idle => Ok(drain(&self.results_rx)),
            other => Err(ExecutorError::UnknownEvent { tag: other.tag() }.into()),
        }
    }
}

/// Worker-side bridge between a running machine and the pump.
struct ExecutorBridge {
    results: flume::Sender<Message>,
    controls: ControlMap,
}

impl ExecutorBridge {
    fn finish(&self, operation_id: &str, status: GraphStatus) {
        if let Ok(mut controls) = self.controls.lock() {
            controls.remove(operation_id);
        }
        let mut params = ParamMap::default();
        params.insert("status".into(), json!(status.to_string()));
        let _ = self.results.send(Message::Complete {
            operation_id: operation_id.to_string(),
            params,
        });
    }
}

impl MachineHooks for ExecutorBridge {
    fn poll_control(&self, session_id: &str) -> Option<(String, ParamMap)> {
        let controls = self.controls.lock().ok()?;
        controls
            .get(session_id)
            .map(|slot| (slot.control_id.clone(), slot.payload.clone()))
    }

    fn persist(
        &self,
        session: &Session,
        reason: PersistReason,
        finished: Option<&str>,
        next: Option<&str>,
    ) -> Result<(), MachineError> {
        let message = match reason {
            PersistReason::Control => Message::PersistSession {
                operation_id: session.id.clone(),
                session: session.clone(),
                timestamp: Utc::now(),
            },
            PersistReason::Started | PersistReason::NodeChanged => Message::StateComplete {
                operation_id: session.id.clone(),
                session: session.clone(),
                finished: finished.map(str::to_string),
                current: next.map(str::to_string),
                timestamp: Utc::now(),
            },
        };
        self.results
            .send(message)
            .map_err(|error| MachineError::Persist {
                session_id: session.id.clone(),
                message: error.to_string(),
            })
    }
}
