//! Leader election and high availability.
//!
//! Every replica registers an ephemeral-sequenced marker under
//! `<root>/alive_clients/<INSTANCE_ID>#NNNNNNNNN`. On any change to the
//! marker set, each replica lists the children and parses the instance
//! id out of the lexicographically smallest entry; the matching replica
//! is the leader. Transitions are delivered as [`LeaderEvent`]s — at
//! most one per actual change — over the channel handed to
//! [`HaCoordinator::start`].
//!
//! Session handling: on `Lost` the replica treats itself as non-leader,
//! then re-creates its marker and re-subscribes, retrying at fixed
//! intervals until the store answers; `Suspended` keeps the current role
//! but the caller must not write (the context lock check backs this up);
//! `Connected` re-evaluates the election.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::config::GuardianPaths;
use crate::store::{SessionStatus, StateStore, StoreError, WatchEvent, WatchKind};

/// Interval between re-registration attempts after a lost session.
const RECREATE_RETRY: Duration = Duration::from_secs(1);

/// Leadership transition of this replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderEvent {
    Gained,
    Lost,
}

#[derive(Debug, Error, Diagnostic)]
pub enum HaError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    /// The election directory listed no markers — not even our own.
    #[error("no election markers under {path}")]
    #[diagnostic(code(wardmill::ha::no_markers))]
    NoMarkers { path: String },
}

enum Signal {
    Watch(WatchEvent),
    Session(SessionStatus),
}

/// Election client for one replica.
pub struct HaCoordinator {
    store: Arc<dyn StateStore>,
    paths: GuardianPaths,
    instance_id: String,
    events: flume::Sender<LeaderEvent>,
}

impl HaCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        paths: GuardianPaths,
        instance_id: impl Into<String>,
        events: flume::Sender<LeaderEvent>,
    ) -> Self {
        Self {
            store,
            paths,
            instance_id: instance_id.into(),
            events,
        }
    }

    /// Create the guardian's persistent store skeleton when absent.
    pub async fn init_environment(
        store: &dyn StateStore,
        paths: &GuardianPaths,
    ) -> Result<(), HaError> {
        for path in [
            paths.root().to_string(),
            paths.context(),
            paths.alive_clients(),
            paths.operations(),
        ] {
            if !store.exists(&path).await? {
                match store.create(&path, b"", false, false, true).await {
                    Ok(_) => tracing::debug!(%path, "persistent node created"),
                    // A peer replica may have created it in between.
                    Err(StoreError::NodeExists { .. }) => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }
        Ok(())
    }

    /// Register this replica's ephemeral-sequenced election marker.
    pub async fn create_instance(&self) -> Result<String, HaError> {
        let path = format!("{}/{}#", self.paths.alive_clients(), self.instance_id);
        let actual = self.store.create(&path, b"", true, true, true).await?;
        tracing::info!(marker = %actual, "election marker registered");
        Ok(actual)
    }

    /// Register the marker, subscribe to session state, run the first
    /// election, and spawn the background task that keeps electing.
    pub async fn start(self) -> Result<(), HaError> {
        self.create_instance().await?;
        let (signal_tx, signal_rx) = flume::unbounded();
        let session_tx = signal_tx.clone();
        self.store.add_session_listener(Box::new(move |status| {
            let _ = session_tx.send(Signal::Session(status));
        }));

        let mut is_leader = false;
        self.evaluate(&signal_tx, &mut is_leader).await?;

        tokio::spawn(async move {
            let mut is_leader = is_leader;
            while let Ok(signal) = signal_rx.recv_async().await {
                match signal {
                    Signal::Watch(event) => {
                        if Self::relevant(&event) {
                            if let Err(error) = self.evaluate(&signal_tx, &mut is_leader).await {
                                tracing::error!(%error, "election evaluation failed");
                            }
                        } else {
                            tracing::debug!(?event, "ignored watch event");
                        }
                    }
                    Signal::Session(SessionStatus::Lost) => {
                        tracing::warn!("store session lost");
                        if is_leader {
                            is_leader = false;
                            let _ = self.events.send(LeaderEvent::Lost);
                        }
                        loop {
                            let recreated = match self.create_instance().await {
                                Ok(_) => self.evaluate(&signal_tx, &mut is_leader).await,
                                Err(error) => Err(error),
                            };
                            match recreated {
                                Ok(()) => {
                                    tracing::info!("election marker re-registered after session loss");
                                    break;
                                }
                                Err(error) => {
                                    tracing::warn!(%error, "marker re-registration failed, retrying");
                                    tokio::time::sleep(RECREATE_RETRY).await;
                                }
                            }
                        }
                    }
                    Signal::Session(SessionStatus::Suspended) => {
                        // Keep the current role; the context lock check
                        // blocks writes from a stale leader.
                        tracing::warn!("store session suspended");
                    }
                    Signal::Session(SessionStatus::Connected) => {
                        tracing::info!("store session connected");
                        if let Err(error) = self.evaluate(&signal_tx, &mut is_leader).await {
                            tracing::error!(%error, "election evaluation failed");
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn relevant(event: &WatchEvent) -> bool {
        event.status == SessionStatus::Connected
            || matches!(
                event.kind,
                WatchKind::Created | WatchKind::Deleted | WatchKind::Changed | WatchKind::Child
            )
    }

    async fn watch_children(
        &self,
        signal_tx: &flume::Sender<Signal>,
    ) -> Result<Vec<String>, HaError> {
        let tx = signal_tx.clone();
        let markers = self
            .store
            .children(
                &self.paths.alive_clients(),
                Some(Box::new(move |event| {
                    let _ = tx.send(Signal::Watch(event));
                })),
            )
            .await?;
        Ok(markers)
    }

    /// List the markers (re-arming the watch) and fire a transition
    /// event when this replica's role changed.
    async fn evaluate(
        &self,
        signal_tx: &flume::Sender<Signal>,
        is_leader: &mut bool,
    ) -> Result<(), HaError> {
        let mut markers = self.watch_children(signal_tx).await?;
        markers.sort();
        let smallest = markers.first().ok_or_else(|| HaError::NoMarkers {
            path: self.paths.alive_clients(),
        })?;
        let elected = smallest.split('#').next().unwrap_or_default();
        let am_leader = elected == self.instance_id;
        match (am_leader, *is_leader) {
            (true, false) => {
                *is_leader = true;
                tracing::info!("gained leadership");
                let _ = self.events.send(LeaderEvent::Gained);
            }
            (false, true) => {
                *is_leader = false;
                tracing::info!(leader = %elected, "lost leadership");
                let _ = self.events.send(LeaderEvent::Lost);
            }
            _ => tracing::debug!(leader = %elected, "leadership unchanged"),
        }
        Ok(())
    }
}
