//! Fans the single upstream video feed out to every connected peer. The
//! registry is copy-on-write: readers (the ingress hot path) never block on
//! writers (peers joining or leaving).

use crate::peer::{PeerConnection, PeerId, PeerState};
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn is_terminal(state: PeerState) -> bool {
    matches!(state, PeerState::Closed | PeerState::Disconnected | PeerState::Failed)
}

/// Registry of every currently-connected peer, plus the fan-out path from
/// the ingest feed to each one's outbound queue.
pub struct StreamMultiplexer {
    peers: ArcSwap<Vec<Arc<PeerConnection>>>,
    /// Peers eligible for fan-out, a strict subset of `peers`. A peer joins
    /// the registry before its DTLS/SRTP context exists, so registration and
    /// transmit-eligibility are tracked separately.
    transmitting: ArcSwap<HashSet<PeerId>>,
    packets_forwarded: AtomicU64,
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMultiplexer {
    pub fn new() -> Self {
        StreamMultiplexer {
            peers: ArcSwap::from_pointee(Vec::new()),
            transmitting: ArcSwap::from_pointee(HashSet::new()),
            packets_forwarded: AtomicU64::new(0),
        }
    }

    /// Add a peer to the registry. Not yet eligible for fan-out until
    /// `start_transmit` marks it so.
    pub fn register(&self, peer: Arc<PeerConnection>) {
        self.peers.rcu(|current| {
            let mut next = current.clone();
            next.push(peer.clone());
            next
        });
    }

    /// Remove a peer unconditionally, e.g. once a host observes
    /// `PeerState::Closed`. A no-op if the peer was already removed.
    pub fn unregister(&self, peer_id: PeerId) {
        self.peers.rcu(|current| {
            let mut next = current.clone();
            next.retain(|p| p.id != peer_id);
            next
        });
        self.stop_transmit(peer_id);
    }

    /// Mark a peer as eligible for fan-out. Idempotent.
    pub fn start_transmit(&self, peer_id: PeerId) {
        self.transmitting.rcu(|current| {
            let mut next = current.clone();
            next.insert(peer_id);
            next
        });
    }

    /// Stop fan-out to this peer without removing it from the registry.
    /// Idempotent.
    pub fn stop_transmit(&self, peer_id: PeerId) {
        self.transmitting.rcu(|current| {
            let mut next = current.clone();
            next.remove(&peer_id);
            next
        });
    }

    /// Drop every peer whose connection state has reached `closed`,
    /// `disconnected` or `failed` from the registry.
    pub fn cleanup(&self) {
        self.peers.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|p| !is_terminal(p.state()))
                .cloned()
                .collect();
            next
        });
        let live: HashSet<PeerId> = self.peers.load().iter().map(|p| p.id).collect();
        self.transmitting.rcu(|current| {
            let mut next = current.clone();
            next.retain(|id| live.contains(id));
            next
        });
    }

    /// Forward one upstream RTP packet to every transmit-eligible peer.
    /// Each peer's own bounded queue absorbs a slow receiver; this loop
    /// never waits on any one peer.
    pub fn send_video(&self, rtp: Arc<[u8]>) {
        let snapshot = self.peers.load();
        let transmitting = self.transmitting.load();
        for peer in snapshot.iter() {
            if transmitting.contains(&peer.id) {
                peer.send_video(rtp.clone());
            }
        }
        self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of registered peers whose connection state is not terminal;
    /// observability only.
    pub fn active_streams_count(&self) -> usize {
        self.peers.load().iter().filter(|p| !is_terminal(p.state())).count()
    }

    pub fn packets_forwarded(&self) -> u64 {
        self.packets_forwarded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod multiplexer_test {
    use super::*;
    use crate::config::RelayConfig;

    async fn spawn_peer() -> Arc<PeerConnection> {
        let config = RelayConfig::with_generated_certificate("127.0.0.1:0".parse().unwrap()).unwrap();
        PeerConnection::bind(config, None).await.unwrap()
    }

    #[tokio::test]
    async fn register_and_unregister_update_the_active_count() {
        let mux = StreamMultiplexer::new();
        assert_eq!(mux.active_streams_count(), 0);

        let peer = spawn_peer().await;
        let id = peer.id;
        mux.register(peer);
        assert_eq!(mux.active_streams_count(), 1);

        mux.unregister(id);
        assert_eq!(mux.active_streams_count(), 0);
    }

    #[tokio::test]
    async fn send_video_counts_forwarded_packets_without_touching_unregistered_peers() {
        let mux = StreamMultiplexer::new();
        mux.send_video(Arc::from(&b"unrouted"[..]));
        assert_eq!(mux.packets_forwarded(), 1);
        assert_eq!(mux.active_streams_count(), 0);
    }

    #[tokio::test]
    async fn only_transmit_eligible_peers_are_tracked_for_fan_out() {
        let mux = StreamMultiplexer::new();
        let peer = spawn_peer().await;
        let id = peer.id;
        mux.register(peer);

        assert!(!mux.transmitting.load().contains(&id));
        mux.start_transmit(id);
        assert!(mux.transmitting.load().contains(&id));
        mux.stop_transmit(id);
        assert!(!mux.transmitting.load().contains(&id));
    }

    #[tokio::test]
    async fn cleanup_drops_terminal_peers_from_the_registry() {
        let mux = StreamMultiplexer::new();
        let peer = spawn_peer().await;
        let id = peer.id;
        mux.register(peer.clone());
        mux.start_transmit(id);
        assert_eq!(mux.peers.load().len(), 1);

        peer.close().await;
        // A closed peer is already excluded from the active count...
        assert_eq!(mux.active_streams_count(), 0);
        // ...but only `cleanup` actually drops it from the registry.
        assert_eq!(mux.peers.load().len(), 1);

        mux.cleanup();
        assert_eq!(mux.peers.load().len(), 0);
        assert!(!mux.transmitting.load().contains(&id));
    }
}
