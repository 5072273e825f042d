//! Listener abstractions.
//!
//! A [`Listener`] is a message handler bound to the pump. It declares
//! the [`MessageTag`]s it concerns, a [`ListenerRole`] used by the
//! startup validation (at least one sensor, exactly one decision maker,
//! exactly one executor), and a `dispatch` entry point that returns the
//! follow-up messages to enqueue. Returning messages — instead of
//! pushing into shared state — keeps every context mutation on the pump
//! task and lets the pump run the operation-lifecycle hooks around each
//! send.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::context::{ContextError, GuardianContext};
use crate::decision::DecisionError;
use crate::executor::ExecutorError;
use crate::message::{Message, MessageTag};
use crate::sensor::SensorError;

/// Which slot of the sense / decide / execute triad a listener fills.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerRole {
    Sensor,
    Decision,
    Executor,
}

/// Errors surfaced by listener dispatch. The pump logs these and moves
/// on; a listener failure never stops the loop.
#[derive(Debug, Error, Diagnostic)]
pub enum ListenerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Decision(#[from] DecisionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Context(#[from] ContextError),
}

/// A message handler registered with the pump.
#[async_trait]
pub trait Listener: Send + Sync {
    /// The tags this listener wants dispatched to it.
    fn concerns(&self) -> &[MessageTag];

    fn role(&self) -> ListenerRole;

    /// Called when this replica gains leadership. Sensors start their
    /// worker tasks here.
    async fn activate(&self) {}

    /// Called when this replica loses leadership. Sensors drain their
    /// queues here so events from the old tenure are discarded.
    async fn deactivate(&self) {}

    /// Handle one message; the returned messages are run through the
    /// context's send hooks and appended to the backlog.
    async fn dispatch(
        &self,
        message: &Message,
        ctx: &mut GuardianContext,
    ) -> Result<Vec<Message>, ListenerError>;
}
