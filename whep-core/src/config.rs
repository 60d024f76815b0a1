use dtls::SelfSignedCert;
use shared::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Runtime configuration for the relay, loaded and owned by the hosting
/// application: a plain struct the caller constructs however it likes, with
/// no config-file parsing of its own.
#[derive(Clone)]
pub struct RelayConfig {
    /// Where `UdpIngress` binds to receive the upstream RTP feed.
    pub ingest_bind: SocketAddr,
    /// Ephemeral port range each peer's demuxed transport socket binds
    /// within.
    pub peer_port_range: (u16, u16),
    /// This relay's DTLS identity, shared by every peer connection. Only
    /// one process-wide cert is generated; WebRTC trusts it by SDP
    /// fingerprint, not by CA chain, so there is no reason to mint one per
    /// peer.
    pub certificate: Arc<SelfSignedCert>,
    /// ICE connectivity-check back-off cap.
    pub ice_check_backoff_cap: Duration,
    /// Overall ICE connect budget before a peer is declared failed.
    pub ice_connect_timeout: Duration,
    /// Bound on each peer's outbound send queue: a slow peer drops its
    /// oldest queued packet rather than stalling ingress.
    pub peer_send_queue_capacity: usize,
    /// Bound on the shared buffer pool's free-list.
    pub buffer_pool_capacity: usize,
}

impl RelayConfig {
    /// Build a config with a freshly generated self-signed certificate and
    /// otherwise sensible defaults. The hosting application can still
    /// override any field afterwards or construct `RelayConfig` directly
    /// with its own `certificate`.
    pub fn with_generated_certificate(ingest_bind: SocketAddr) -> Result<Self> {
        Ok(RelayConfig {
            ingest_bind,
            peer_port_range: (40000, 40999),
            certificate: Arc::new(SelfSignedCert::generate()?),
            ice_check_backoff_cap: Duration::from_millis(500),
            ice_connect_timeout: Duration::from_secs(30),
            peer_send_queue_capacity: 256,
            buffer_pool_capacity: 4096,
        })
    }
}

#[cfg(test)]
mod config_test {
    use super::*;

    #[test]
    fn default_config_is_self_consistent() {
        let cfg = RelayConfig::with_generated_certificate("0.0.0.0:5000".parse().unwrap()).unwrap();
        assert!(cfg.peer_port_range.0 < cfg.peer_port_range.1);
        assert!(cfg.ice_check_backoff_cap < cfg.ice_connect_timeout);
    }
}
