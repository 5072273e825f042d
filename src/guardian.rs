//! Guardian wiring and the leadership run loop.
//!
//! A [`Guardian`] owns its configuration, store client, listeners, and
//! pump — all constructor-wired through [`GuardianBuilder`], nothing
//! process-global. `start` runs the replica: register for election, and
//! whenever leadership is gained, load the durable context, replay
//! in-flight operations, take the write lock, activate the listeners and
//! pump messages until leadership is lost or the guardian is shut down.
//!
//! ```no_run
//! use std::sync::Arc;
//! use wardmill::config::{GuardianConfig, GUARDIAN_ID, INSTANCE_ID};
//! use wardmill::decision::KeyMappingDecisionMaker;
//! use wardmill::executor::{CallbackExecutor, FuncRegistry};
//! use wardmill::guardian::Guardian;
//! use wardmill::sensor::CallbackSensor;
//! use wardmill::store::MemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = GuardianConfig::from_env();
//! config.set(GUARDIAN_ID, "demo");
//! config.set(INSTANCE_ID, "replica-1");
//!
//! let sensor = Arc::new(CallbackSensor::default());
//! let handle = sensor.handle();
//! let funcs = FuncRegistry::new().register("say_hello", |params| async move {
//!     println!("hello {params:?}");
//!     Ok(params)
//! });
//! let mapping = [("hello".to_string(), "say_hello".to_string())]
//!     .into_iter()
//!     .collect();
//!
//! let mut guardian = Guardian::builder(config)
//!     .store(Arc::new(MemoryStore::new()))
//!     .sensor(sensor)
//!     .decision(Arc::new(KeyMappingDecisionMaker::new(mapping, "strategy")))
//!     .executor(Arc::new(CallbackExecutor::new(Arc::new(funcs), 4)?))
//!     .build()?;
//! guardian.start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::{ConfigError, GuardianConfig, GuardianPaths, INSTANCE_ID};
use crate::context::{ContextError, GuardianContext};
use crate::ha::{HaCoordinator, HaError, LeaderEvent};
use crate::listener::Listener;
use crate::pump::{MessagePump, PumpError};
use crate::store::StateStore;

#[derive(Debug, Error, Diagnostic)]
pub enum GuardianError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pump(#[from] PumpError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Ha(#[from] HaError),

    /// The builder was not given a coordination store.
    #[error("guardian requires a coordination store")]
    #[diagnostic(
        code(wardmill::guardian::no_store),
        help("Call GuardianBuilder::store with a StateStore implementation.")
    )]
    NoStore,
}

/// Builder for a [`Guardian`]; listeners dispatch in registration order
/// (sensors, then the decision maker, then the executor).
pub struct GuardianBuilder {
    config: GuardianConfig,
    store: Option<Arc<dyn StateStore>>,
    sensors: Vec<Arc<dyn Listener>>,
    decision: Option<Arc<dyn Listener>>,
    executor: Option<Arc<dyn Listener>>,
    short_circuit: bool,
}

impl GuardianBuilder {
    #[must_use]
    pub fn new(config: GuardianConfig) -> Self {
        Self {
            config,
            store: None,
            sensors: Vec::new(),
            decision: None,
            executor: None,
            short_circuit: false,
        }
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn sensor(mut self, sensor: Arc<dyn Listener>) -> Self {
        self.sensors.push(sensor);
        self
    }

    #[must_use]
    pub fn decision(mut self, decision: Arc<dyn Listener>) -> Self {
        self.decision = Some(decision);
        self
    }

    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn Listener>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Rewrite sensed messages straight to decided, bypassing the
    /// decision maker (purely reactive guardians).
    #[must_use]
    pub fn short_circuit(mut self, short_circuit: bool) -> Self {
        self.short_circuit = short_circuit;
        self
    }

    pub fn build(self) -> Result<Guardian, GuardianError> {
        let store = self.store.ok_or(GuardianError::NoStore)?;
        let paths = self.config.paths()?;
        let mut listeners = self.sensors;
        listeners.extend(self.decision);
        listeners.extend(self.executor);
        let pump = MessagePump::new(listeners).with_short_circuit(self.short_circuit);
        pump.validate_listeners()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Guardian {
            config: self.config,
            paths,
            store,
            pump,
            shutdown: Arc::new(shutdown_tx),
        })
    }
}

/// Handle for stopping a running guardian from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// One logical automation service replica.
pub struct Guardian {
    config: GuardianConfig,
    paths: GuardianPaths,
    store: Arc<dyn StateStore>,
    pump: MessagePump,
    shutdown: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Guardian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guardian").finish_non_exhaustive()
    }
}

impl Guardian {
    #[must_use]
    pub fn builder(config: GuardianConfig) -> GuardianBuilder {
        GuardianBuilder::new(config)
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }

    /// Run this replica until [`ShutdownHandle::shutdown`] is called.
    ///
    /// Non-leader tenure is passive: no pump, no workers, no writes.
    pub async fn start(&mut self) -> Result<(), GuardianError> {
        HaCoordinator::init_environment(self.store.as_ref(), &self.paths).await?;
        let instance_id = self.config.get(INSTANCE_ID)?.to_string();
        let (leader_tx, leader_rx) = flume::unbounded();
        HaCoordinator::new(
            Arc::clone(&self.store),
            self.paths.clone(),
            instance_id.clone(),
            leader_tx,
        )
        .start()
        .await?;
        tracing::info!(instance = %instance_id, "guardian started, awaiting election");

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                event = leader_rx.recv_async() => match event {
                    Ok(LeaderEvent::Gained) => {}
                    Ok(LeaderEvent::Lost) => continue,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => continue,
            }

            // Leadership gained: restore durable state and run the pump.
            let mut ctx =
                GuardianContext::load(Arc::clone(&self.store), self.paths.clone()).await?;
            let recovered = ctx.recover_backlog();
            if recovered > 0 {
                tracing::info!(recovered, "replaying in-flight operations");
            }
            ctx.set_lock(true);
            for listener in self.pump.listeners() {
                listener.activate().await;
            }

            let (stop_tx, stop_rx) = watch::channel(false);
            {
                let pump_run = self.pump.run(&mut ctx, stop_rx);
                tokio::pin!(pump_run);
                loop {
                    tokio::select! {
                        _ = &mut pump_run => break,
                        event = leader_rx.recv_async() => match event {
                            Ok(LeaderEvent::Lost) | Err(_) => {
                                stop_tx.send_replace(true);
                            }
                            Ok(LeaderEvent::Gained) => {}
                        },
                        _ = shutdown_rx.changed() => {
                            stop_tx.send_replace(true);
                        }
                    }
                }
            }

            for listener in self.pump.listeners() {
                listener.deactivate().await;
            }
            ctx.set_lock(false);
            tracing::info!("leadership released");
        }
        tracing::info!("guardian shut down");
        Ok(())
    }
}
