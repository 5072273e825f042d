//! # Wardmill: Highly-Available Guardian Framework
//!
//! Wardmill is a framework for building *guardian* services: automation
//! processes that watch external signals, decide what to do about them,
//! and drive long-running, resumable workflows to completion. Progress
//! survives process crashes and leader migrations because every step is
//! checkpointed to a coordination store.
//!
//! ## Core Concepts
//!
//! - **Messages**: the tagged units flowing through the pump —
//!   `SENSED → DECIDED → (STATE_COMPLETE…) → COMPLETE`
//! - **Listeners**: sensors, one decision maker, and one executor bound
//!   to the pump; each concerns a set of message tags
//! - **Operations**: durable per-event lifecycle records in the store
//! - **State machines**: graphs of named nodes with reentrance flags,
//!   checkpointed on every transition
//! - **Leadership**: ephemeral-sequenced election; exactly one replica
//!   pumps messages at a time
//!
//! ## Anatomy of a Guardian
//!
//! ```text
//!  events ──▶ Sensor ──▶ SENSED ──▶ DecisionMaker ──▶ DECIDED ──▶ Executor
//!                │                                                  │
//!                └───────────── MessagePump ◀── COMPLETE ◀── worker pool
//!                                   │
//!                          GuardianContext ──▶ coordination store
//! ```
//!
//! The pump serializes all dispatch and all context mutation on one
//! task; workers run user logic concurrently and report back over a
//! result channel. After every non-idle message the context (backlog,
//! extend map, lock flag) is checkpointed; operations are persisted
//! individually as they change.
//!
//! ## Quick Start
//!
//! Wire a guardian with [`Guardian::builder`](guardian::Guardian::builder):
//! a store, at least one sensor, exactly one decision maker, and exactly
//! one executor. See the [`guardian`] module for a complete example.
//!
//! ## Crash Recovery
//!
//! A replica that gains leadership loads the context and every operation
//! record, then injects a `DECIDED` message for each unfinished
//! operation that has no backlog entry. State machines re-hydrate from
//! their checkpointed session and continue from the last `current_node`;
//! nodes marked non-reentrant refuse to re-run their completed step, so
//! one-shot side effects stay one-shot.
//!
//! ## Module Guide
//!
//! - [`message`] — message tags, params, the pump wire protocol
//! - [`listener`] — the listener trait and roles
//! - [`pump`] — the dispatch loop
//! - [`sensor`] / [`decision`] / [`executor`] — the triad implementations
//! - [`graph`] / [`machine`] / [`stage`] — state machines and staged jobs
//! - [`context`] — durable guardian state and operation records
//! - [`store`] — the coordination-store contract and reference drivers
//! - [`ha`] — leader election
//! - [`guardian`] — wiring and the leadership run loop
//! - [`config`] / [`telemetry`] / [`client`] — process plumbing

pub mod client;
pub mod config;
pub mod context;
pub mod decision;
pub mod executor;
pub mod graph;
pub mod guardian;
pub mod ha;
pub mod listener;
pub mod machine;
pub mod message;
pub mod pump;
pub mod sensor;
pub mod stage;
pub mod store;
pub mod telemetry;
