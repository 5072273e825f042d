//! The message pump: the guardian's single-threaded heart.
//!
//! The pump drives the sense / decide / execute cycle over the context's
//! backlog. One iteration: synthesize an idle message when the backlog
//! is empty, dispatch the head to every listener whose concern set
//! contains its tag (in registration order, errors logged and swallowed
//! per listener), run the operation-lifecycle hooks on everything the
//! listeners emitted, pop the head, and checkpoint the context when the
//! message was non-idle.
//!
//! In *short-circuit mode* a `Sensed` head is rewritten in place to
//! `Decided`, skipping the decision maker and the automatic checkpoint —
//! for purely reactive guardians that keep no decision state.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::watch;
use tracing::Instrument;

use crate::context::GuardianContext;
use crate::listener::{Listener, ListenerRole};
use crate::message::{Message, MessageTag};

/// Sleep applied when an idle tick leaves the backlog empty.
pub const IDLE_SLEEP: Duration = Duration::from_micros(100);

#[derive(Debug, Error, Diagnostic)]
pub enum PumpError {
    /// The registered listener set does not form a valid triad.
    #[error(
        "listener set invalid: {sensors} sensor(s), {decisions} decision maker(s), \
         {executors} executor(s); need at least one sensor and exactly one of each other role"
    )]
    #[diagnostic(code(wardmill::pump::listener_set))]
    ListenerSet {
        sensors: usize,
        decisions: usize,
        executors: usize,
    },
}

/// Dispatches backlog messages to registered listeners.
pub struct MessagePump {
    listeners: Vec<Arc<dyn Listener>>,
    short_circuit: bool,
    idle_sleep: Duration,
}

impl MessagePump {
    #[must_use]
    pub fn new(listeners: Vec<Arc<dyn Listener>>) -> Self {
        Self {
            listeners,
            short_circuit: false,
            idle_sleep: IDLE_SLEEP,
        }
    }

    /// Toggle short-circuit mode.
    #[must_use]
    pub fn with_short_circuit(mut self, short_circuit: bool) -> Self {
        self.short_circuit = short_circuit;
        self
    }

    #[must_use]
    pub fn listeners(&self) -> &[Arc<dyn Listener>] {
        &self.listeners
    }

    /// Validate the triad: at least one sensor, exactly one decision
    /// maker, exactly one executor. Violations are fatal at startup.
    pub fn validate_listeners(&self) -> Result<(), PumpError> {
        let mut sensors = 0;
        let mut decisions = 0;
        let mut executors = 0;
        for listener in &self.listeners {
            match listener.role() {
                ListenerRole::Sensor => sensors += 1,
                ListenerRole::Decision => decisions += 1,
                ListenerRole::Executor => executors += 1,
            }
        }
        if sensors < 1 || decisions != 1 || executors != 1 {
            return Err(PumpError::ListenerSet {
                sensors,
                decisions,
                executors,
            });
        }
        Ok(())
    }

    /// Run the dispatch loop until `stop` flips to true.
    pub async fn run(&self, ctx: &mut GuardianContext, stop: watch::Receiver<bool>) {
        tracing::info!(
            listeners = self.listeners.len(),
            short_circuit = self.short_circuit,
            "message pump started"
        );
        while !*stop.borrow() {
            self.run_once(ctx).await;
        }
        tracing::info!("message pump stopped");
    }

    /// One pump iteration. Exposed for tests and embedders that drive
    /// the loop themselves.
    pub async fn run_once(&self, ctx: &mut GuardianContext) {
        let is_idle = ctx.backlog.is_empty();
        if is_idle {
            ctx.backlog.push(Message::Idle);
        }

        let mut head = ctx.backlog[0].clone();
        if !is_idle && self.short_circuit {
            if let Message::Sensed {
                operation_id,
                params,
            } = &head
            {
                head = Message::Decided {
                    operation_id: operation_id.clone(),
                    params: params.clone(),
                };
                ctx.backlog[0] = head.clone();
            }
        }

        let tag = head.tag();
        let span = match head.operation_id() {
            Some(operation_id) => {
                tracing::info_span!("dispatch", %tag, %operation_id)
            }
            None => tracing::trace_span!("dispatch", %tag),
        };
        self.dispatch_to_listeners(&head, tag, ctx).instrument(span).await;

        if tag == MessageTag::Complete {
            if let Some(operation_id) = head.operation_id() {
                if let Err(error) = ctx.complete_operation(operation_id).await {
                    tracing::error!(%operation_id, %error, "failed to retire operation");
                }
            }
        }

        ctx.backlog.remove(0);
        if !is_idle {
            if !self.short_circuit {
                if let Err(error) = ctx.save_context().await {
                    tracing::error!(%error, "context checkpoint failed");
                }
            }
        } else if ctx.backlog.is_empty() {
            tokio::time::sleep(self.idle_sleep).await;
        }
    }

    async fn dispatch_to_listeners(
        &self,
        head: &Message,
        tag: MessageTag,
        ctx: &mut GuardianContext,
    ) {
        for (index, listener) in self.listeners.iter().enumerate() {
            if !listener.concerns().contains(&tag) {
                continue;
            }
            match listener.dispatch(head, ctx).await {
                Ok(outgoing) => {
                    for message in outgoing {
                        if let Err(error) = ctx.on_send(&message).await {
                            tracing::error!(
                                out_tag = %message.tag(),
                                %error,
                                "send hook failed, message dropped"
                            );
                            continue;
                        }
                        ctx.backlog.push(message);
                    }
                }
                Err(error) => {
                    // Listener isolation: log and move on.
                    tracing::error!(listener = index, %error, "listener dispatch failed");
                }
            }
        }
    }
}
