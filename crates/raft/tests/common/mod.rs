//! Common test utilities for meshkv integration tests.
//!
//! This module provides helpers for starting whole nodes on an in-memory
//! overlay, waiting for cluster conditions and writing through a cluster
//! that may still be electing a leader.

#![allow(dead_code)]

use meshkv_common::PeerUid;
use meshkv_kv::{PutRequest, PutResponse, RangeRequest};
use meshkv_overlay::{MemoryMesh, MemoryPeer, PeerDescription, Topology};
use meshkv_raft::{RaftConfig, Server, ServerConfig};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber once per test binary.
///
/// Set `RUST_LOG=meshkv_raft=debug` to see the nodes talk.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A configuration with short ticks and polls so clusters form in well under
/// a second.
pub fn fast_config(min_peer_count: usize) -> ServerConfig {
    ServerConfig {
        min_peer_count,
        raft: RaftConfig {
            tick_interval_ms: 10,
            election_tick: 10,
            heartbeat_tick: 2,
            bootstrap_poll_ms: 20,
            membership_poll_ms: 20,
            conf_change_retry_ticks: 20,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A node's view of the overlay, with peers that can be hidden from it.
pub struct ViewTopology {
    peer: Arc<MemoryPeer>,
    hidden: Mutex<HashSet<PeerUid>>,
}

impl ViewTopology {
    pub fn new(peer: Arc<MemoryPeer>) -> Self {
        Self {
            peer,
            hidden: Mutex::new(HashSet::new()),
        }
    }

    /// Stops reporting `uid` to this node only.
    pub fn hide(&self, uid: PeerUid) {
        self.hidden.lock().unwrap().insert(uid);
    }
}

impl Topology for ViewTopology {
    fn descriptions(&self) -> Vec<PeerDescription> {
        let hidden = self.hidden.lock().unwrap();
        self.peer
            .descriptions()
            .into_iter()
            .filter(|desc| !hidden.contains(&desc.uid))
            .collect()
    }
}

/// A started node together with its overlay handle.
pub struct TestNode {
    pub name: u64,
    pub peer: Arc<MemoryPeer>,
    pub view: Arc<ViewTopology>,
    pub server: Server,
}

impl TestNode {
    pub fn uid(&self) -> PeerUid {
        self.peer.identity().uid
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.server
            .store()
            .range(&RangeRequest::key(key))
            .kvs
            .into_iter()
            .next()
            .map(|kv| kv.value)
    }
}

/// Joins `names` to the mesh and starts one server per peer.
///
/// Every peer is on the mesh before any server starts, so with
/// `min_peer_count == names.len()` all of them decide to create the cluster.
/// The servers start concurrently since each blocks until bootstrap has
/// decided.
///
/// # Panics
///
/// Panics if a peer cannot join or a server fails to start.
pub async fn start_nodes(mesh: &MemoryMesh, config: &ServerConfig, names: &[u64]) -> Vec<TestNode> {
    let peers: Vec<(u64, Arc<MemoryPeer>)> = names
        .iter()
        .map(|&name| {
            let peer = mesh
                .join(&config.overlay, name, format!("node-{name}"))
                .expect("join mesh");
            (name, Arc::new(peer))
        })
        .collect();

    let handles: Vec<_> = peers
        .into_iter()
        .map(|(name, peer)| {
            let config = config.clone();
            tokio::spawn(async move {
                let view = Arc::new(ViewTopology::new(peer.clone()));
                let server = Server::start(config, peer.identity(), view.clone(), peer.clone())
                    .await
                    .expect("server start");
                TestNode {
                    name,
                    peer,
                    view,
                    server,
                }
            })
        })
        .collect();

    let mut nodes = Vec::with_capacity(handles.len());
    for handle in handles {
        nodes.push(handle.await.expect("start task"));
    }
    nodes
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
///
/// # Returns
///
/// * `true` - Condition was met within timeout
/// * `false` - Timeout occurred before condition was met
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Waits until exactly one node is leader and every node agrees on it.
pub async fn wait_for_leader(nodes: &[TestNode], timeout: Duration) -> Option<u64> {
    let agreed = wait_until(timeout, || agreed_leader(nodes).is_some()).await;
    if agreed {
        agreed_leader(nodes)
    } else {
        None
    }
}

fn agreed_leader(nodes: &[TestNode]) -> Option<u64> {
    let leaders = nodes.iter().filter(|n| n.server.status().is_leader()).count();
    if leaders != 1 {
        return None;
    }
    let first = nodes.first()?.server.status().leader_id?;
    nodes
        .iter()
        .all(|n| n.server.status().leader_id == Some(first))
        .then_some(first)
}

/// Writes through `node`, retrying while the proposal is lost.
///
/// A proposal made while no leader is known is dropped by the consensus
/// engine and its future never resolves, so each attempt is bounded. A retry
/// of an attempt that did commit applies the write a second time.
pub async fn put_with_retry(node: &TestNode, key: &str, value: &str) -> PutResponse {
    for attempt in 1..=20 {
        let put = node.server.store().put(PutRequest::new(key, value));
        match tokio::time::timeout(Duration::from_millis(500), put).await {
            Ok(Ok(resp)) => return resp,
            Ok(Err(e)) => panic!("put {key} failed: {e}"),
            Err(_) => tracing::debug!(attempt, key, "put timed out, retrying"),
        }
    }
    panic!("put {key} never committed");
}

/// Shuts every node down and waits for each to stop.
pub async fn shutdown_all(nodes: &[TestNode]) {
    for node in nodes {
        node.server.shutdown();
    }
    for node in nodes {
        let outcome = tokio::time::timeout(Duration::from_secs(5), node.server.wait())
            .await
            .expect("node stops in time");
        assert!(outcome.is_ok(), "clean shutdown, got {outcome:?}");
    }
}
