//! The relay's control surface: start/stop the ingest loop and accept new
//! WHEP clients, independent of whatever HTTP framework the hosting
//! application puts in front of it.

use crate::config::RelayConfig;
use crate::ingress::UdpIngress;
use crate::multiplexer::StreamMultiplexer;
use crate::peer::{PeerConnection, PeerEventHandler, PeerId, PeerState};
use log::{info, warn};
use sdp::SessionDescription;
use shared::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Owns the ingest loop and the peer registry; this is the single entry
/// point a hosting application (an HTTP server implementing the WHEP
/// resource) drives.
pub struct RelayControl {
    config: RelayConfig,
    multiplexer: Arc<StreamMultiplexer>,
    ingress: Arc<UdpIngress>,
    ingress_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayControl {
    pub async fn new(config: RelayConfig) -> Result<Self> {
        let ingress = UdpIngress::bind(config.ingest_bind).await?;
        Ok(RelayControl {
            config,
            multiplexer: Arc::new(StreamMultiplexer::new()),
            ingress: Arc::new(ingress),
            ingress_task: Mutex::new(None),
        })
    }

    /// Start the ingest receive loop in the background. Idempotent:
    /// calling it twice is a no-op.
    pub async fn start(&self) {
        let mut task = self.ingress_task.lock().await;
        if task.is_some() {
            return;
        }
        let ingress = self.ingress.clone();
        let multiplexer = self.multiplexer.clone();
        *task = Some(tokio::spawn(async move { ingress.run(multiplexer).await }));
        info!("relay control started");
    }

    /// Stop the ingest loop. Already-connected peers keep relaying
    /// whatever is left in their own queues but receive no further
    /// upstream packets.
    pub async fn stop(&self) {
        self.ingress.stop();
        if let Some(task) = self.ingress_task.lock().await.take() {
            let _ = task.await;
        }
        info!("relay control stopped");
    }

    /// Accept a new WHEP client: parse its SDP offer, negotiate a
    /// `PeerConnection`, and register it for fan-out. Returns the SDP
    /// answer text the caller hands back in the HTTP response body.
    /// Negotiation failures (malformed SDP, unsupported transport, missing
    /// fingerprint) are returned as typed errors, never a panic.
    ///
    /// The peer only becomes transmit-eligible once its own state handler
    /// sees `Connected`, and is swept out of the registry the moment it
    /// reaches a terminal state, regardless of whatever `on_event` the
    /// caller supplied.
    pub async fn append_client(&self, sdp_offer: &str, on_event: Option<PeerEventHandler>) -> Result<(PeerId, String)> {
        let offer = SessionDescription::parse(sdp_offer).map_err(|e| Error::ErrSdp(e.to_string()))?;
        let multiplexer = self.multiplexer.clone();
        let combined_handler: PeerEventHandler = Box::new(move |id, event| {
            if let crate::peer::PeerEvent::StateChanged(state) = &event {
                match state {
                    PeerState::Connected => multiplexer.start_transmit(id),
                    PeerState::Disconnected | PeerState::Failed | PeerState::Closed => {
                        multiplexer.stop_transmit(id);
                        multiplexer.cleanup();
                    }
                    PeerState::New | PeerState::Connecting => {}
                }
            }
            if let Some(handler) = &on_event {
                handler(id, event);
            }
        });
        let peer = PeerConnection::bind(self.config.clone(), Some(combined_handler)).await?;
        let answer = match peer.set_remote_description(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("peer {}: negotiation failed, discarding: {e}", peer.id);
                peer.close().await;
                return Err(e);
            }
        };
        let id = peer.id;
        self.multiplexer.register(peer);
        Ok((id, answer))
    }

    /// Remove a peer from the fan-out set, e.g. in response to an `on_event`
    /// callback the host wants to act on directly. `append_client` already
    /// wires this up internally for terminal states, so hosts that have no
    /// other use for `on_event` never need to call this themselves.
    pub fn remove_client(&self, peer_id: PeerId) {
        self.multiplexer.unregister(peer_id);
    }

    /// Sweep peers in `{closed, disconnected, failed}` out of the registry.
    /// `append_client` already triggers this on every terminal transition;
    /// exposed for a hosting application that wants its own cadence too.
    pub fn cleanup(&self) {
        self.multiplexer.cleanup();
    }

    pub fn active_streams_count(&self) -> usize {
        self.multiplexer.active_streams_count()
    }
}

/// Convenience predicate for a hosting application mapping WHEP resource
/// URLs to peer ids: a peer in this state will never transmit or receive
/// anything again.
pub fn is_terminal(state: PeerState) -> bool {
    matches!(state, PeerState::Closed | PeerState::Failed)
}

#[cfg(test)]
mod control_test {
    use super::*;

    async fn test_config() -> RelayConfig {
        RelayConfig::with_generated_certificate("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    const OFFER: &str = "v=0\r\n\
o=- 123 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtcp-mux\r\n\
a=mid:0\r\n\
a=setup:actpass\r\n\
a=ice-ufrag:someufrag\r\n\
a=ice-pwd:somepasswordlongenoughtobevalid\r\n\
a=fingerprint:sha-256 AA:BB:CC:DD\r\n\
a=rtpmap:96 H264/90000\r\n\
a=end-of-candidates\r\n";

    #[tokio::test]
    async fn append_client_registers_a_peer_and_returns_an_answer() {
        let control = RelayControl::new(test_config().await).await.unwrap();
        let (id, answer) = control.append_client(OFFER, None).await.unwrap();
        assert!(answer.contains("a=setup:active"));
        assert_eq!(control.active_streams_count(), 1);

        control.remove_client(id);
        assert_eq!(control.active_streams_count(), 0);
    }

    #[tokio::test]
    async fn malformed_offer_is_rejected_without_registering_a_peer() {
        let control = RelayControl::new(test_config().await).await.unwrap();
        let err = control.append_client("not an sdp offer", None).await.unwrap_err();
        assert!(matches!(err, Error::ErrSdp(_)));
        assert_eq!(control.active_streams_count(), 0);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_joins_the_ingress_task() {
        let control = RelayControl::new(test_config().await).await.unwrap();
        control.start().await;
        control.start().await;
        control.stop().await;
    }
}
