//! Node assembly: wires the components into one running node.
//!
//! The server owns every queue between the components; none of them is
//! global. A supervisor task waits for the first of a shutdown request, the
//! controller's "terminated" signal and the tracker's "shrunk" signal, then
//! stops the components in a fixed order:
//!
//! 1. Replicated Store
//! 2. Controller
//! 3. Configurator
//! 4. Membership Tracker
//! 5. Packet Transport
//!
//! The store goes first because the controller may be blocked handing it
//! an entry; once the store is gone that hand-over fails and the controller
//! can stop.

use crate::bootstrap::{BootstrapDecision, BootstrapSequencer};
use crate::config::ServerConfig;
use crate::configurator::{Configurator, ConfiguratorChannels};
use crate::controller::{Controller, ControllerChannels};
use crate::membership::{ClusterSet, MembershipEvents, MembershipTracker};
use crate::store::{ReplicatedStore, StoreChannels};
use crate::translator::TopologyTranslator;
use crate::transport::PacketTransport;
use crate::types::ControllerStatus;
use async_trait::async_trait;
use meshkv_common::{Error, Result};
use meshkv_kv::BincodeCodec;
use meshkv_overlay::{PacketConn, PeerIdentity, Topology};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// A component with a scoped, idempotent stop.
#[async_trait]
pub trait Stoppable: Send + Sync {
    fn name(&self) -> &'static str;

    async fn stop(&self);
}

#[async_trait]
impl Stoppable for ReplicatedStore {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn stop(&self) {
        ReplicatedStore::stop(self).await
    }
}

#[async_trait]
impl Stoppable for Controller {
    fn name(&self) -> &'static str {
        "controller"
    }

    async fn stop(&self) {
        Controller::stop(self).await
    }
}

#[async_trait]
impl Stoppable for Configurator {
    fn name(&self) -> &'static str {
        "configurator"
    }

    async fn stop(&self) {
        Configurator::stop(self).await
    }
}

#[async_trait]
impl Stoppable for MembershipTracker {
    fn name(&self) -> &'static str {
        "membership"
    }

    async fn stop(&self) {
        MembershipTracker::stop(self).await
    }
}

#[async_trait]
impl Stoppable for PacketTransport {
    fn name(&self) -> &'static str {
        "transport"
    }

    async fn stop(&self) {
        PacketTransport::stop(self).await
    }
}

/// Components stopped one after the other, in insertion order.
#[derive(Default)]
pub struct ShutdownSequence {
    stages: Vec<Arc<dyn Stoppable>>,
}

impl ShutdownSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, stage: Arc<dyn Stoppable>) -> Self {
        self.stages.push(stage);
        self
    }

    pub async fn run(&self) {
        for stage in &self.stages {
            tracing::debug!(component = stage.name(), "stopping");
            stage.stop().await;
        }
    }
}

/// The conditions that end a node.
pub struct TerminalSignals {
    /// Carries why the controller ended on its own: removal from the
    /// cluster, or the error that broke the engine.
    pub terminated_rx: oneshot::Receiver<Error>,
    /// Carries the visible peer count.
    pub shrunk_rx: oneshot::Receiver<usize>,
    pub min_peer_count: usize,
}

/// Waits for the first terminating event, runs the shutdown sequence and
/// returns the outcome. Later signals are ignored, and a signal source that
/// went away without firing leaves only the shutdown request.
pub async fn supervise(
    shutdown: CancellationToken,
    signals: TerminalSignals,
    sequence: ShutdownSequence,
) -> Result<()> {
    let TerminalSignals {
        terminated_rx,
        shrunk_rx,
        min_peer_count,
    } = signals;

    let outcome = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(()),
        Ok(e) = terminated_rx => Err(e),
        Ok(size) = shrunk_rx => Err(Error::ClusterShrunk { size, min: min_peer_count }),
    };

    match &outcome {
        Ok(()) => tracing::info!("shutting down"),
        Err(e) => tracing::error!(error = %e, "node terminating"),
    }
    sequence.run().await;
    outcome
}

/// A running node.
pub struct Server {
    identity: PeerIdentity,
    decision: BootstrapDecision,
    store: Arc<ReplicatedStore>,
    controller: Arc<Controller>,
    shutdown: CancellationToken,
    outcome_rx: watch::Receiver<Option<Result<()>>>,
}

impl Server {
    /// Bootstraps and starts a node.
    ///
    /// Blocks until the bootstrap sequencer has decided, which takes at
    /// least until the configured minimum number of peers is visible.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for an invalid configuration, or the
    /// error of the consensus engine if it cannot be created.
    pub async fn start(
        config: ServerConfig,
        identity: PeerIdentity,
        topology: Arc<dyn Topology>,
        conn: Arc<dyn PacketConn>,
    ) -> Result<Self> {
        config.validate().map_err(Error::ConfigError)?;
        let raft = &config.raft;
        let node = identity.uid;

        let decision = BootstrapSequencer::new(config.min_peer_count, raft.bootstrap_poll_interval())
            .run(topology.as_ref())
            .await;
        let initial = match &decision {
            BootstrapDecision::Create(peers) => peers.iter().copied().collect(),
            BootstrapDecision::Join => ClusterSet::observe(topology.as_ref()),
        };

        let (incoming_tx, incoming_rx) = mpsc::channel(raft.queue_capacity);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(raft.queue_capacity);
        let (unreachable_tx, unreachable_rx) = mpsc::channel(raft.unreachable_capacity);
        let (conf_change_tx, conf_change_rx) = mpsc::channel(1);
        let (conf_entry_tx, conf_entry_rx) = mpsc::channel(raft.queue_capacity);
        let (proposal_tx, proposal_rx) = mpsc::channel(raft.queue_capacity);
        let (entry_tx, entry_rx) = mpsc::channel(raft.queue_capacity);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let (snapshot_request_tx, snapshot_request_rx) = mpsc::channel(1);
        let (add_tx, add_rx) = mpsc::channel(raft.queue_capacity);
        let (remove_tx, remove_rx) = mpsc::channel(raft.queue_capacity);
        let (terminated_tx, terminated_rx) = oneshot::channel();
        let (shrunk_tx, shrunk_rx) = oneshot::channel();

        let transport = Arc::new(PacketTransport::start(
            node,
            conn,
            Arc::new(TopologyTranslator::new(topology.clone())),
            incoming_tx,
            outgoing_rx,
            unreachable_tx,
        ));

        let controller = Controller::start(
            node,
            &decision.initial_peers(),
            raft,
            ControllerChannels {
                incoming_rx,
                outgoing_tx,
                unreachable_rx,
                conf_change_rx,
                conf_entry_tx,
                proposal_rx,
                entry_tx,
                snapshot_rx,
                snapshot_request_tx: snapshot_request_tx.clone(),
            },
            terminated_tx,
        );
        let controller = match controller {
            Ok(controller) => Arc::new(controller),
            Err(e) => {
                transport.stop().await;
                return Err(e);
            }
        };

        let configurator = Arc::new(Configurator::start(
            node,
            ConfiguratorChannels {
                add_rx,
                remove_rx,
                conf_change_tx,
                conf_entry_rx,
            },
        ));
        let membership = Arc::new(MembershipTracker::start(
            node,
            topology,
            initial,
            config.min_peer_count,
            raft.membership_poll_interval(),
            MembershipEvents {
                add_tx,
                remove_tx,
                shrunk_tx,
            },
        ));
        let store = Arc::new(ReplicatedStore::start(
            node,
            Arc::new(BincodeCodec),
            raft.snapshot_interval_entries,
            StoreChannels {
                proposal_tx,
                entry_rx,
                snapshot_tx,
                snapshot_request_tx,
                snapshot_request_rx,
            },
        ));

        let sequence = ShutdownSequence::new()
            .then(store.clone())
            .then(controller.clone())
            .then(configurator)
            .then(membership)
            .then(transport);
        let signals = TerminalSignals {
            terminated_rx,
            shrunk_rx,
            min_peer_count: config.min_peer_count,
        };

        let shutdown = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let supervisor_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let outcome = supervise(supervisor_shutdown, signals, sequence).await;
            outcome_tx.send_replace(Some(outcome));
        });

        tracing::info!(node = %format!("{node:x}"), decision = ?decision, "node started");
        Ok(Self {
            identity,
            decision,
            store,
            controller,
            shutdown,
            outcome_rx,
        })
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }

    pub fn decision(&self) -> &BootstrapDecision {
        &self.decision
    }

    /// The key-value API of this node.
    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    pub fn status(&self) -> ControllerStatus {
        self.controller.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.controller.subscribe()
    }

    /// Requests a clean stop. Returns immediately; use [`wait`](Self::wait)
    /// to wait for it.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits until the node has fully stopped.
    ///
    /// # Errors
    ///
    /// Returns the terminal condition that ended the node, if any.
    pub async fn wait(&self) -> Result<()> {
        let mut outcome_rx = self.outcome_rx.clone();
        let outcome = outcome_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Stopped)?;
        outcome.clone().unwrap_or(Err(Error::Stopped))
    }
}
