//! Sensors: the sense side of the triad.
//!
//! All variants share one contract: produce external events and convert
//! each into a `Sensed` message whose `operation_id` comes from the
//! event's `operation_id` field when present, else a fresh uuid. Dedup
//! is the operator's job — idempotent keys collapse repeated sensings of
//! the same incident onto one operation.
//!
//! The pump thread must stay responsive, so sensors never do I/O in
//! `dispatch`: events land in a bounded queue (producers block when it
//! is full) and the queue is drained one event per idle tick.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::context::GuardianContext;
use crate::listener::{Listener, ListenerError, ListenerRole};
use crate::message::{Message, MessageTag, ParamMap};

const SENSOR_CONCERNS: &[MessageTag] = &[MessageTag::Idle];

/// Default capacity of the sensor event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error, Diagnostic)]
pub enum SensorError {
    /// The event source failed; the pull task logs this and retries
    /// after its interval.
    #[error("event fetch failed: {message}")]
    #[diagnostic(code(wardmill::sensor::fetch))]
    Fetch { message: String },

    /// The sensor queue is gone (sensor dropped while a producer held a
    /// handle).
    #[error("sensor queue closed")]
    #[diagnostic(code(wardmill::sensor::closed))]
    QueueClosed,
}

/// Producer handle for feeding events into a [`CallbackSensor`] from
/// outside the pump task.
#[derive(Clone)]
pub struct SensorHandle {
    tx: flume::Sender<ParamMap>,
}

impl SensorHandle {
    /// Enqueue an event, blocking the calling thread when the queue is
    /// full (the overflow policy is to slow the producer down).
    pub fn push(&self, event: ParamMap) -> Result<(), SensorError> {
        self.tx.send(event).map_err(|_| SensorError::QueueClosed)
    }

    /// Async variant of [`push`](Self::push).
    pub async fn push_async(&self, event: ParamMap) -> Result<(), SensorError> {
        self.tx
            .send_async(event)
            .await
            .map_err(|_| SensorError::QueueClosed)
    }
}

fn operation_id_of(event: &ParamMap) -> String {
    match event.get("operation_id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

/// Callback sensor: external code pushes events through a
/// [`SensorHandle`]; one event is forwarded per idle tick.
pub struct CallbackSensor {
    tx: flume::Sender<ParamMap>,
    rx: flume::Receiver<ParamMap>,
}

impl CallbackSensor {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    #[must_use]
    pub fn handle(&self) -> SensorHandle {
        SensorHandle {
            tx: self.tx.clone(),
        }
    }

    fn drain(&self) {
        let mut drained = 0_usize;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            tracing::info!(drained, "discarded residual sensor events");
        }
    }

    fn next_sensed(&self) -> Option<Message> {
        let event = self.rx.try_recv().ok()?;
        let operation_id = operation_id_of(&event);
        tracing::info!(%operation_id, "sensed new event");
        Some(Message::Sensed {
            operation_id,
            params: event,
        })
    }
}

impl Default for CallbackSensor {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[async_trait]
impl Listener for CallbackSensor {
    fn concerns(&self) -> &[MessageTag] {
        SENSOR_CONCERNS
    }

    fn role(&self) -> ListenerRole {
        ListenerRole::Sensor
    }

    async fn deactivate(&self) {
        self.drain();
    }

    async fn dispatch(
        &self,
        _message: &Message,
        _ctx: &mut GuardianContext,
    ) -> Result<Vec<Message>, ListenerError> {
        Ok(self.next_sensed().into_iter().collect())
    }
}

/// Source polled by a [`PullSensor`].
#[async_trait]
pub trait EventFetch: Send + Sync {
    /// Fetch at most one event; `None` means nothing new right now.
    async fn fetch_one(&self) -> Result<Option<ParamMap>, SensorError>;
}

/// Pull sensor: a worker task periodically invokes an [`EventFetch`] and
/// feeds results into the callback queue.
pub struct PullSensor {
    inner: CallbackSensor,
    fetch: Arc<dyn EventFetch>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PullSensor {
    #[must_use]
    pub fn new(fetch: Arc<dyn EventFetch>, interval: Duration) -> Self {
        Self {
            inner: CallbackSensor::default(),
            fetch,
            interval,
            task: Mutex::new(None),
        }
    }

    fn stop_task(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Listener for PullSensor {
    fn concerns(&self) -> &[MessageTag] {
        SENSOR_CONCERNS
    }

    fn role(&self) -> ListenerRole {
        ListenerRole::Sensor
    }

    async fn activate(&self) {
        let fetch = Arc::clone(&self.fetch);
        let handle = self.inner.handle();
        let interval = self.interval;
        let worker = tokio::spawn(async move {
            loop {
                match fetch.fetch_one().await {
                    Ok(Some(event)) => {
                        if handle.push_async(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => tokio::time::sleep(interval).await,
                    Err(error) => {
                        tracing::warn!(%error, "event fetch failed");
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        });
        if let Ok(mut task) = self.task.lock() {
            if let Some(previous) = task.replace(worker) {
                previous.abort();
            }
        }
    }

    async fn deactivate(&self) {
        self.stop_task();
        self.inner.drain();
    }

    async fn dispatch(
        &self,
        message: &Message,
        ctx: &mut GuardianContext,
    ) -> Result<Vec<Message>, ListenerError> {
        self.inner.dispatch(message, ctx).await
    }
}

impl Drop for PullSensor {
    fn drop(&mut self) {
        self.stop_task();
    }
}

/// Push sensor: marker variant for sources that deliver events
/// asynchronously on their own (message-queue consumers and the like).
/// No worker task; producers use the [`SensorHandle`].
pub struct PushSensor {
    inner: CallbackSensor,
}

impl PushSensor {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: CallbackSensor::new(capacity),
        }
    }

    #[must_use]
    pub fn handle(&self) -> SensorHandle {
        self.inner.handle()
    }
}

impl Default for PushSensor {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[async_trait]
impl Listener for PushSensor {
    fn concerns(&self) -> &[MessageTag] {
        SENSOR_CONCERNS
    }

    fn role(&self) -> ListenerRole {
        ListenerRole::Sensor
    }

    async fn deactivate(&self) {
        self.inner.drain();
    }

    async fn dispatch(
        &self,
        message: &Message,
        ctx: &mut GuardianContext,
    ) -> Result<Vec<Message>, ListenerError> {
        self.inner.dispatch(message, ctx).await
    }
}
