//! Durable guardian state: the context, operations, and their lifecycle.
//!
//! A [`GuardianContext`] mirrors in memory everything the leader replica
//! has persisted: the message backlog (for crash recovery), one
//! [`Operation`] record per in-flight sensed event, a free-form `extend`
//! map for user data, and the leader-lock flag that gates every write.
//!
//! Persistence layout: the context blob lives at `<root>/context`
//! *without* the operations, which are written one node each under
//! `<root>/operations/<operation_id>` on create, update, and delete.
//! Records are versioned JSON and carry unknown fields through a
//! read-modify-write cycle untouched.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::config::GuardianPaths;
use crate::graph::Session;
use crate::message::{Message, MessageTag, ParamMap};
use crate::store::{StateStore, StoreError};

/// Schema version stamped into persisted context records.
pub const CONTEXT_SCHEMA_VERSION: u32 = 1;

/// Errors from context and operation persistence.
#[derive(Debug, Error, Diagnostic)]
pub enum ContextError {
    /// A write was attempted without the leader lock. This is the
    /// defensive check that stops a demoted replica from clobbering
    /// state the new leader owns.
    #[error("no privilege to save {what}: this replica does not hold the leader lock")]
    #[diagnostic(code(wardmill::context::invalid_operation))]
    NotLeader { what: &'static str },

    #[error("operation {operation_id} not found in context")]
    #[diagnostic(code(wardmill::context::missing_operation))]
    MissingOperation { operation_id: String },

    #[error("action {name} not found on operation")]
    #[diagnostic(code(wardmill::context::missing_action))]
    MissingAction { name: String },

    #[error("message is missing {what}")]
    #[diagnostic(code(wardmill::context::missing_param))]
    MissingParam { what: &'static str },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("record (de)serialization failed: {0}")]
    #[diagnostic(code(wardmill::context::serde))]
    Serde(#[from] serde_json::Error),
}

/// Status of an operation record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Create,
    Finish,
}

/// Status of a fine-grained action entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Create,
    Finished,
}

/// Coarse phase marker: one per SENSED/DECIDED/COMPLETE message sent for
/// the operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Period {
    pub tag: MessageTag,
    pub at: DateTime<Utc>,
}

/// Fine-grained marker for one state-machine node execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub status: ActionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Durable record of one sensed event's lifecycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub status: OperationStatus,
    pub params: ParamMap,
    #[serde(default)]
    pub periods: Vec<Period>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub session: Option<Session>,
    /// Fields written by newer schema versions ride along untouched.
    #[serde(flatten)]
    pub unknown: FxHashMap<String, Value>,
}

impl Operation {
    #[must_use]
    pub fn new(operation_id: impl Into<String>, params: ParamMap) -> Self {
        Self {
            operation_id: operation_id.into(),
            status: OperationStatus::Create,
            params,
            periods: Vec::new(),
            actions: Vec::new(),
            session: None,
            unknown: FxHashMap::default(),
        }
    }

    pub fn append_period(&mut self, tag: MessageTag) {
        self.periods.push(Period {
            tag,
            at: Utc::now(),
        });
    }

    /// Append an action entry unless it repeats the current tail.
    pub fn add_action(&mut self, name: &str) {
        if self.actions.last().is_some_and(|a| a.name == name) {
            return;
        }
        self.actions.push(Action {
            name: name.to_string(),
            status: ActionStatus::Create,
            started_at: Utc::now(),
            ended_at: None,
        });
    }

    /// Mark the named action finished at `ended_at`.
    pub fn update_action(
        &mut self,
        name: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<(), ContextError> {
        let action = self
            .actions
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| ContextError::MissingAction { name: name.into() })?;
        action.status = ActionStatus::Finished;
        action.ended_at = Some(ended_at);
        Ok(())
    }

    pub fn end_operation(&mut self) {
        self.status = OperationStatus::Finish;
    }
}

/// Persisted form of the context (operations excluded by design).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub version: u32,
    pub backlog: Vec<Message>,
    pub extend: ParamMap,
    pub lock: bool,
    #[serde(flatten)]
    pub unknown: FxHashMap<String, Value>,
}

/// In-memory mirror of the durable guardian state.
pub struct GuardianContext {
    store: Arc<dyn StateStore>,
    paths: GuardianPaths,
    pub backlog: Vec<Message>,
    pub operations: FxHashMap<String, Operation>,
    pub extend: ParamMap,
    lock: bool,
    unknown: FxHashMap<String, Value>,
}

impl GuardianContext {
    /// A fresh, empty context (nothing loaded, lock released).
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, paths: GuardianPaths) -> Self {
        Self {
            store,
            paths,
            backlog: Vec::new(),
            operations: FxHashMap::default(),
            extend: ParamMap::default(),
            lock: false,
            unknown: FxHashMap::default(),
        }
    }

    /// Load the context and all operation records from the store.
    ///
    /// An absent or empty context node yields a fresh context. A single
    /// unreadable operation record is logged and skipped rather than
    /// failing the whole load.
    pub async fn load(
        store: Arc<dyn StateStore>,
        paths: GuardianPaths,
    ) -> Result<Self, ContextError> {
        let mut context = Self::new(store, paths);
        match context.store.get(&context.paths.context()).await {
            Ok(data) if !data.is_empty() => {
                let record: ContextRecord = serde_json::from_slice(&data)?;
                context.backlog = record.backlog;
                context.extend = record.extend;
                context.lock = record.lock;
                context.unknown = record.unknown;
            }
            Ok(_) => {}
            Err(StoreError::NoNode { .. }) => {}
            Err(error) => return Err(error.into()),
        }
        let operation_ids = match context
            .store
            .children(&context.paths.operations(), None)
            .await
        {
            Ok(ids) => ids,
            Err(StoreError::NoNode { .. }) => Vec::new(),
            Err(error) => return Err(error.into()),
        };
        for operation_id in operation_ids {
            let path = context.paths.operation(&operation_id);
            match context.store.get(&path).await {
                Ok(data) => match serde_json::from_slice::<Operation>(&data) {
                    Ok(operation) => {
                        context.operations.insert(operation_id, operation);
                    }
                    Err(error) => {
                        tracing::error!(%operation_id, %error, "skipping unreadable operation record");
                    }
                },
                Err(error) => {
                    tracing::error!(%operation_id, %error, "failed to read operation record");
                }
            }
        }
        tracing::info!(
            operations = context.operations.len(),
            backlog = context.backlog.len(),
            "context loaded"
        );
        Ok(context)
    }

    #[must_use]
    pub fn lock(&self) -> bool {
        self.lock
    }

    /// Flip the leader-lock flag. Only the replica holding `lock = true`
    /// may persist the context or any operation.
    pub fn set_lock(&mut self, lock: bool) {
        self.lock = lock;
        tracing::debug!(lock, "context lock updated");
    }

    fn record(&self) -> ContextRecord {
        ContextRecord {
            version: CONTEXT_SCHEMA_VERSION,
            backlog: self.backlog.clone(),
            extend: self.extend.clone(),
            lock: self.lock,
            unknown: self.unknown.clone(),
        }
    }

    /// Checkpoint the context blob (backlog + extend + lock).
    pub async fn save_context(&self) -> Result<(), ContextError> {
        if !self.lock {
            return Err(ContextError::NotLeader { what: "context" });
        }
        let data = serde_json::to_vec(&self.record())?;
        let path = self.paths.context();
        match self.store.put(&path, &data).await {
            Ok(()) => Ok(()),
            Err(StoreError::NoNode { .. }) => {
                self.store.create(&path, &data, false, false, true).await?;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Persist one operation record.
    pub async fn save_operation(&self, operation: &Operation) -> Result<(), ContextError> {
        if !self.lock {
            return Err(ContextError::NotLeader { what: "operation" });
        }
        let data = serde_json::to_vec(operation)?;
        let path = self.paths.operation(&operation.operation_id);
        match self.store.put(&path, &data).await {
            Ok(()) => Ok(()),
            Err(StoreError::NoNode { .. }) => {
                self.store.create(&path, &data, false, false, true).await?;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn get_operation(&self, operation_id: &str) -> Option<&Operation> {
        self.operations.get(operation_id)
    }

    /// Insert and persist a new operation.
    pub async fn create_operation(&mut self, operation: Operation) -> Result<(), ContextError> {
        self.save_operation(&operation).await?;
        tracing::debug!(operation_id = %operation.operation_id, "operation created");
        self.operations
            .insert(operation.operation_id.clone(), operation);
        Ok(())
    }

    /// Remove an operation from memory and the store.
    pub async fn delete_operation(&mut self, operation_id: &str) -> Result<(), ContextError> {
        self.operations.remove(operation_id);
        match self
            .store
            .delete(&self.paths.operation(operation_id), true)
            .await
        {
            Ok(()) | Err(StoreError::NoNode { .. }) => {
                tracing::debug!(%operation_id, "operation deleted");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Merge newer message params into the operation, persisting when the
    /// merge changed anything; returns the effective params.
    pub async fn merge_operation_params(
        &mut self,
        operation_id: &str,
        params: &ParamMap,
    ) -> Result<ParamMap, ContextError> {
        let operation = self.operations.get_mut(operation_id).ok_or_else(|| {
            ContextError::MissingOperation {
                operation_id: operation_id.into(),
            }
        })?;
        let mut changed = false;
        for (key, value) in params {
            if operation.params.get(key) != Some(value) {
                operation.params.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        let snapshot = operation.params.clone();
        if changed {
            let operation = operation.clone();
            self.save_operation(&operation).await?;
        }
        Ok(snapshot)
    }

    /// Incrementally update the user extend map and checkpoint.
    pub async fn update_extend(&mut self, params: ParamMap) -> Result<(), ContextError> {
        self.extend.extend(params);
        self.save_context().await
    }

    /// Drop a key from the user extend map and checkpoint.
    pub async fn del_extend(&mut self, key: &str) -> Result<(), ContextError> {
        self.extend.remove(key);
        self.save_context().await
    }

    #[must_use]
    pub fn backlog_contains_operation(&self, operation_id: &str) -> bool {
        self.backlog
            .iter()
            .any(|m| m.operation_id() == Some(operation_id))
    }

    /// The recovery rule: for every non-finished operation with no
    /// backlog message, inject a `Decided` message carrying the
    /// operation's original params. In-flight work resumes by replaying
    /// the decided step; state-machine reentrance skips completed nodes.
    /// Returns how many messages were injected.
    pub fn recover_backlog(&mut self) -> usize {
        let mut ids: Vec<String> = self
            .operations
            .values()
            .filter(|op| op.status != OperationStatus::Finish)
            .map(|op| op.operation_id.clone())
            .collect();
        ids.sort();
        let mut injected = 0;
        for operation_id in ids {
            if self.backlog_contains_operation(&operation_id) {
                continue;
            }
            let params = self.operations[&operation_id].params.clone();
            tracing::info!(%operation_id, "recovering in-flight operation");
            self.backlog.push(Message::Decided {
                operation_id,
                params,
            });
            injected += 1;
        }
        injected
    }

    /// Send-side lifecycle hook, applied by the pump to every message a
    /// listener emits before it enters the backlog.
    ///
    /// * `Sensed`/`Decided`/`Complete` — get-or-create the operation and
    ///   append a period entry.
    /// * `StateComplete`/`PersistSession` — fold the checkpoint into the
    ///   operation's action list and embedded session.
    pub async fn on_send(&mut self, message: &Message) -> Result<(), ContextError> {
        match message {
            Message::Sensed { operation_id, params }
            | Message::Decided { operation_id, params }
            | Message::Complete { operation_id, params } => {
                if operation_id.is_empty() {
                    return Err(ContextError::MissingParam {
                        what: "operation_id",
                    });
                }
                if !self.operations.contains_key(operation_id) {
                    self.create_operation(Operation::new(operation_id.clone(), params.clone()))
                        .await?;
                }
                let operation = self
                    .operations
                    .get_mut(operation_id)
                    .expect("operation just ensured");
                operation.append_period(message.tag());
                let operation = operation.clone();
                self.save_operation(&operation).await?;
            }
            Message::StateComplete {
                operation_id,
                session,
                finished,
                current,
                timestamp,
            } => {
                let operation = self.operations.get_mut(operation_id).ok_or_else(|| {
                    ContextError::MissingOperation {
                        operation_id: operation_id.clone(),
                    }
                })?;
                if let Some(current) = current {
                    operation.add_action(current);
                }
                if let Some(finished) = finished {
                    operation.update_action(finished, *timestamp)?;
                }
                operation.session = Some(session.clone());
                let operation = operation.clone();
                self.save_operation(&operation).await?;
            }
            Message::PersistSession {
                operation_id,
                session,
                ..
            } => {
                let operation = self.operations.get_mut(operation_id).ok_or_else(|| {
                    ContextError::MissingOperation {
                        operation_id: operation_id.clone(),
                    }
                })?;
                operation.session = Some(session.clone());
                let operation = operation.clone();
                self.save_operation(&operation).await?;
            }
            Message::Idle | Message::Control { .. } => {}
        }
        Ok(())
    }

    /// Completion hook, applied by the pump after the listener fan-out of
    /// a `Complete` message: mark the operation finished and drop it.
    pub async fn complete_operation(&mut self, operation_id: &str) -> Result<(), ContextError> {
        let operation = self.operations.get_mut(operation_id).ok_or_else(|| {
            ContextError::MissingOperation {
                operation_id: operation_id.into(),
            }
        })?;
        operation.end_operation();
        self.delete_operation(operation_id).await
    }
}
