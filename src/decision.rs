//! Decision makers: the decide side of the triad.
//!
//! A decision maker concerns `Sensed` and `Complete` messages. `Sensed`
//! is turned into `Decided` by the variant's decision logic; `Complete`
//! is acknowledged and ignored (the pump's lifecycle hooks already
//! retire the operation).

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::context::GuardianContext;
use crate::executor::EXEC_KEY;
use crate::listener::{Listener, ListenerError, ListenerRole};
use crate::message::{Message, MessageTag, ParamMap};

const DECISION_CONCERNS: &[MessageTag] = &[MessageTag::Sensed, MessageTag::Complete];

#[derive(Debug, Error, Diagnostic)]
pub enum DecisionError {
    /// The sensed event does not fit the decision table: the from-key is
    /// absent or its value has no mapping.
    #[error("key {key} absent from event params or unmapped")]
    #[diagnostic(
        code(wardmill::decision::type_mismatch),
        help("Every sensed event must carry `{key}` with a value present in the mapping table.")
    )]
    KeyMismatch { key: String },

    /// A tag outside the concern set reached the decision maker.
    #[error("message tag {tag} is not concerned by the decision maker")]
    #[diagnostic(code(wardmill::decision::unknown_event))]
    UnknownEvent { tag: MessageTag },
}

/// Table-driven decision maker.
///
/// Looks up `params[from_key]` in the mapping and attaches the mapped
/// action name under the reserved executor key, leaving everything else
/// untouched.
pub struct KeyMappingDecisionMaker {
    mapping: FxHashMap<String, String>,
    from_key: String,
}

impl KeyMappingDecisionMaker {
    #[must_use]
    pub fn new(mapping: FxHashMap<String, String>, from_key: impl Into<String>) -> Self {
        Self {
            mapping,
            from_key: from_key.into(),
        }
    }

    fn decide(&self, operation_id: &str, params: &ParamMap) -> Result<Message, DecisionError> {
        let value = match params.get(&self.from_key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                return Err(DecisionError::KeyMismatch {
                    key: self.from_key.clone(),
                })
            }
        };
        let action = self
            .mapping
            .get(&value)
            .ok_or_else(|| DecisionError::KeyMismatch {
                key: self.from_key.clone(),
            })?;
        let mut decided = params.clone();
        decided.insert(EXEC_KEY.to_string(), Value::String(action.clone()));
        tracing::info!(%operation_id, %action, "decision made");
        Ok(Message::Decided {
            operation_id: operation_id.to_string(),
            params: decided,
        })
    }
}

#[async_trait]
impl Listener for KeyMappingDecisionMaker {
    fn concerns(&self) -> &[MessageTag] {
        DECISION_CONCERNS
    }

    fn role(&self) -> ListenerRole {
        ListenerRole::Decision
    }

    async fn dispatch(
        &self,
        message: &Message,
        _ctx: &mut GuardianContext,
    ) -> Result<Vec<Message>, ListenerError> {
        match message {
            Message::Sensed {
                operation_id,
                params,
            } => Ok(vec![self.decide(operation_id, params)?]),
            Message::Complete { .. } => Ok(Vec::new()),
            other => Err(DecisionError::UnknownEvent { tag: other.tag() }.into()),
        }
    }
}

/// Pass-through decision maker for state-machine guardians: all logic
/// lives in the executor's machine, so the sensed params flow to
/// `Decided` unchanged.
#[derive(Default)]
pub struct StateMachineDecisionMaker;

impl StateMachineDecisionMaker {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Listener for StateMachineDecisionMaker {
    fn concerns(&self) -> &[MessageTag] {
        DECISION_CONCERNS
    }

    fn role(&self) -> ListenerRole {
        ListenerRole::Decision
    }

    async fn dispatch(
        &self,
        message: &Message,
        _ctx: &mut GuardianContext,
    ) -> Result<Vec<Message>, ListenerError> {
        match message {
            Message::Sensed {
                operation_id,
                params,
            } => Ok(vec![Message::Decided {
                operation_id: operation_id.clone(),
                params: params.clone(),
            }]),
            Message::Complete { .. } => Ok(Vec::new()),
            other => Err(DecisionError::UnknownEvent { tag: other.tag() }.into()),
        }
    }
}
