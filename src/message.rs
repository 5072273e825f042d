//! Message types flowing through the guardian pump.
//!
//! A [`Message`] is the unit of work the pump dispatches to listeners.
//! External events enter as [`Message::Sensed`], the decision maker turns
//! them into [`Message::Decided`], workers report back with
//! [`Message::Complete`] and, for state machines, the intermediate
//! [`Message::StateComplete`] / [`Message::PersistSession`] checkpoints.
//! [`Message::Idle`] is synthesized by the pump when the backlog is empty
//! so that listeners with periodic duties (sensors draining their queues,
//! executors collecting worker results) keep running.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::Session;

/// Free-form, JSON-serializable parameter map carried by non-idle messages.
pub type ParamMap = FxHashMap<String, Value>;

/// The tag of a [`Message`], used for listener concern sets.
///
/// Tags are the wire-level discriminants of the pump protocol; a listener
/// registers the set of tags it wants dispatched to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageTag {
    Idle,
    Sensed,
    Decided,
    Complete,
    StateComplete,
    PersistSession,
    Control,
}

impl MessageTag {
    /// Stable string form used in logs and persisted period records.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageTag::Idle => "IDLE",
            MessageTag::Sensed => "SENSED",
            MessageTag::Decided => "DECIDED",
            MessageTag::Complete => "COMPLETE",
            MessageTag::StateComplete => "STATE_COMPLETE",
            MessageTag::PersistSession => "PERSIST_SESSION",
            MessageTag::Control => "CONTROL",
        }
    }
}

impl std::fmt::Display for MessageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pump message.
///
/// Every non-idle message carries the `operation_id` of the operation it
/// belongs to. `StateComplete` and `PersistSession` additionally carry the
/// checkpointed state-machine [`Session`] together with the node names the
/// checkpoint straddles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Idle,
    Sensed {
        operation_id: String,
        params: ParamMap,
    },
    Decided {
        operation_id: String,
        params: ParamMap,
    },
    Complete {
        operation_id: String,
        params: ParamMap,
    },
    /// A state-machine checkpoint after a node transition (or at start).
    StateComplete {
        operation_id: String,
        session: Session,
        /// Node that just finished, `None` for the STARTED checkpoint.
        finished: Option<String>,
        /// Node that will run next, `None` when the machine finished.
        current: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A forced session checkpoint with no node transition (control receipt).
    PersistSession {
        operation_id: String,
        session: Session,
        timestamp: DateTime<Utc>,
    },
    /// An operator control payload addressed to a running state machine.
    Control {
        operation_id: String,
        params: ParamMap,
    },
}

impl Message {
    #[must_use]
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Idle => MessageTag::Idle,
            Message::Sensed { .. } => MessageTag::Sensed,
            Message::Decided { .. } => MessageTag::Decided,
            Message::Complete { .. } => MessageTag::Complete,
            Message::StateComplete { .. } => MessageTag::StateComplete,
            Message::PersistSession { .. } => MessageTag::PersistSession,
            Message::Control { .. } => MessageTag::Control,
        }
    }

    /// The operation this message belongs to; `None` only for `Idle`.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Message::Idle => None,
            Message::Sensed { operation_id, .. }
            | Message::Decided { operation_id, .. }
            | Message::Complete { operation_id, .. }
            | Message::StateComplete { operation_id, .. }
            | Message::PersistSession { operation_id, .. }
            | Message::Control { operation_id, .. } => Some(operation_id),
        }
    }

    /// The parameter map, for the tags that carry one.
    #[must_use]
    pub fn params(&self) -> Option<&ParamMap> {
        match self {
            Message::Sensed { params, .. }
            | Message::Decided { params, .. }
            | Message::Complete { params, .. }
            | Message::Control { params, .. } => Some(params),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self, Message::Idle)
    }
}
