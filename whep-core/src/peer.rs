//! A single browser/WHEP client's WebRTC session: the ICE agent, DTLS-SRTP
//! transport and SRTP session for one peer, composed behind the
//! connection-state machine the control surface and multiplexer observe.

use crate::config::RelayConfig;
use crate::demux::{classify, DatagramKind};
use crate::queue::DropOldestQueue;
use crate::track::LocalTrack;
use dtls::{DtlsEvent, DtlsRole, DtlsSrtpTransport};
use ice::{ConnectionState as IceConnState, IceAgent, IceCandidate, IceEvent};
use log::{debug, info, warn};
use rtcp::{CompoundPacket, Packet as RtcpPacket, ReceptionReport};
use rtp::Header as RtpHeader;
use sdp::{Candidate as SdpCandidate, CandidateType as SdpCandidateType, SessionDescription, SetupRole};
use shared::crypto::{FingerprintAlgorithm, KeyingMaterialExporter};
use shared::error::{Error, Result};
use srtp::{KeyingMaterial, SrtpSession};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex as AsyncMutex, Notify};

pub type PeerId = u64;

fn next_peer_id() -> PeerId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// `PeerConnection`'s lifecycle: `new` precedes ICE gathering, `connecting`
/// spans the ICE/DTLS handshakes, `connected` is steady-state media relay,
/// `disconnected`/`failed` end it abnormally, `closed` is terminal and
/// always reachable directly from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events surfaced to whoever owns this peer (the multiplexer/control
/// surface), as an explicit handler rather than a dynamic subscriber list.
pub enum PeerEvent {
    StateChanged(PeerState),
    /// The client sent RTCP BYE; the peer is closing itself as a result.
    ByeReceived,
}

pub type PeerEventHandler = Box<dyn Fn(PeerId, PeerEvent) + Send + Sync>;

struct PeerInner {
    ice: IceAgent,
    dtls: Option<DtlsSrtpTransport>,
    dtls_role: Option<DtlsRole>,
    srtp: Option<SrtpSession>,
    track: LocalTrack,
}

/// One peer's session state plus its dedicated UDP 5-tuple. Shared between
/// the receiver task, the ICE-tick task and the outbound fan-out task via a
/// short-critical-section lock on `inner` rather than a copy-on-write
/// structure, appropriate here since one peer's state is never read by any
/// other peer.
pub struct PeerConnection {
    pub id: PeerId,
    socket: Arc<UdpSocket>,
    state: StdMutex<PeerState>,
    inner: AsyncMutex<PeerInner>,
    remote_addr: StdMutex<Option<SocketAddr>>,
    outbound: DropOldestQueue<Arc<[u8]>>,
    closed: Notify,
    on_event: Option<PeerEventHandler>,
    config: RelayConfig,
    /// The most recent reception report block this peer's client has sent
    /// back, whether carried in an RR or an SR, wired up for observability
    /// rather than just parsed.
    last_reception_report: StdMutex<Option<ReceptionReport>>,
}

impl PeerConnection {
    /// Bind this peer's transport socket and start ICE gathering. The
    /// returned connection is still in `PeerState::New` until
    /// `set_remote_description` supplies the offer.
    pub async fn bind(config: RelayConfig, on_event: Option<PeerEventHandler>) -> Result<Arc<Self>> {
        let socket = bind_in_range(&config.peer_port_range).await?;
        let local_port = socket.local_addr()?.port();

        let mut ice = IceAgent::new(false); // this relay is always the controlled side: the browser always nominates
        ice.gather_host_candidates(SocketAddr::new(config.ingest_bind.ip(), local_port))?;

        let id = next_peer_id();
        let peer = PeerConnection {
            id,
            socket: Arc::new(socket),
            state: StdMutex::new(PeerState::New),
            inner: AsyncMutex::new(PeerInner {
                ice,
                dtls: None,
                dtls_role: None,
                srtp: None,
                track: LocalTrack::new(96, format!("relay-{id}")),
            }),
            remote_addr: StdMutex::new(None),
            outbound: DropOldestQueue::new(config.peer_send_queue_capacity),
            closed: Notify::new(),
            on_event,
            config,
            last_reception_report: StdMutex::new(None),
        };
        Ok(Arc::new(peer))
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    /// The client's most recently reported reception quality, if it has
    /// sent any RTCP RR/SR yet.
    pub fn last_reception_report(&self) -> Option<ReceptionReport> {
        *self.last_reception_report.lock().unwrap()
    }

    /// Transition state, firing exactly one `StateChanged` event per actual
    /// transition; a no-op transition to the current state is silently
    /// ignored.
    fn set_state(self: &Arc<Self>, new: PeerState) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if *state == new {
                false
            } else {
                *state = new;
                true
            }
        };
        if changed {
            if let Some(handler) = &self.on_event {
                handler(self.id, PeerEvent::StateChanged(new));
            }
        }
    }

    /// Accept the client's SDP offer, negotiate ICE/DTLS roles from it, and
    /// build the SDP answer text. Combines the conceptual `createOffer`/
    /// `setRemoteDescription` split into the single request/response round
    /// trip an HTTP WHEP POST actually performs.
    pub async fn set_remote_description(self: &Arc<Self>, offer: &SessionDescription) -> Result<String> {
        offer
            .validate_for_video_relay()
            .map_err(|e| Error::ErrSdp(e.to_string()))?;
        let video = offer
            .video_media()
            .expect("validate_for_video_relay guarantees a video section");

        let remote_ufrag = video
            .ice_ufrag
            .clone()
            .or_else(|| offer.ice_ufrag.clone())
            .ok_or_else(|| Error::ErrSdp("missing ice-ufrag".into()))?;
        let remote_pwd = video
            .ice_pwd
            .clone()
            .or_else(|| offer.ice_pwd.clone())
            .ok_or_else(|| Error::ErrSdp("missing ice-pwd".into()))?;
        let fp = video
            .fingerprint
            .clone()
            .or_else(|| offer.fingerprint.clone())
            .expect("validate_for_video_relay guarantees a fingerprint");
        let algo = FingerprintAlgorithm::parse(&fp.algorithm).map_err(|e| Error::ErrSdp(e.to_string()))?;
        let remote_digest =
            shared::crypto::fingerprint_from_hex(&fp.hex_digest).map_err(|e| Error::ErrSdp(e.to_string()))?;

        // The offerer's `active` means we are the DTLS server; `passive`
        // means we dial out as the client; `actpass` (the common case)
        // leaves the choice to us, and the answerer always becomes active
        // (the DTLS client) in that case.
        let (role, answer_setup) = match video.setup {
            Some(SetupRole::Active) => (DtlsRole::Server, SetupRole::Passive),
            Some(SetupRole::Passive) => (DtlsRole::Client, SetupRole::Active),
            _ => (DtlsRole::Client, SetupRole::Active),
        };

        let answer = {
            let mut inner = self.inner.lock().await;
            inner.ice.set_remote_credentials(remote_ufrag, remote_pwd);
            for c in &video.candidates {
                if let Some(candidate) = to_ice_candidate(c) {
                    inner.ice.add_remote_candidate(candidate)?;
                }
            }
            let dtls = DtlsSrtpTransport::new(role, (*self.config.certificate).clone(), (algo, remote_digest));
            inner.dtls = Some(dtls);
            inner.dtls_role = Some(role);

            let local_candidates = sdp_candidates(&inner.ice.local_candidates);
            let local_fingerprint_hex = self.config.certificate.fingerprint(FingerprintAlgorithm::Sha256);
            let ssrc_cname = (inner.track.ssrc, inner.track.cname.clone());
            SessionDescription::build_answer(
                &inner.ice.local_ufrag,
                &inner.ice.local_pwd,
                FingerprintAlgorithm::Sha256.sdp_name(),
                &local_fingerprint_hex,
                answer_setup,
                &video.mid,
                &video.protocol,
                &[inner.track.payload_type],
                &local_candidates,
                true,
                Some((ssrc_cname.0, &ssrc_cname.1)),
            )
        };

        self.set_state(PeerState::Connecting);
        self.spawn_tasks();
        Ok(answer)
    }

    /// Trickled ICE candidate arriving after the initial offer.
    pub async fn add_ice_candidate(&self, line: &str) -> Result<()> {
        let candidate = sdp::parse_candidate_line(line)
            .ok_or_else(|| Error::ErrSdp("malformed candidate line".into()))?;
        let ice_candidate =
            to_ice_candidate(&candidate).ok_or_else(|| Error::ErrSdp("unresolvable candidate address".into()))?;
        self.inner.lock().await.ice.add_remote_candidate(ice_candidate)
    }

    fn spawn_tasks(self: &Arc<Self>) {
        let receiver = self.clone();
        tokio::spawn(async move { receiver.run_receiver().await });
        let ticker = self.clone();
        tokio::spawn(async move { ticker.run_ice_ticker().await });
        let sender = self.clone();
        tokio::spawn(async move { sender.run_sender().await });
    }

    async fn run_receiver(self: Arc<Self>) {
        let mut buf = vec![0u8; shared::buffer_pool::MAX_DATAGRAM_SIZE];
        loop {
            let recv = tokio::select! {
                _ = self.closed.notified() => return,
                r = self.socket.recv_from(&mut buf) => r,
            };
            let (len, from) = match recv {
                Ok(v) => v,
                Err(e) => {
                    warn!("peer {}: socket recv error: {e}", self.id);
                    self.set_state(PeerState::Failed);
                    return;
                }
            };
            self.handle_datagram(&buf[..len], from).await;
        }
    }

    async fn handle_datagram(self: &Arc<Self>, buf: &[u8], from: SocketAddr) {
        match classify(buf) {
            Some(DatagramKind::Stun) => self.handle_stun(buf, from).await,
            Some(DatagramKind::Dtls) => self.handle_dtls(buf, from).await,
            Some(DatagramKind::Rtcp) => self.handle_rtcp(buf).await,
            Some(DatagramKind::Rtp) => {
                debug!("peer {}: dropping unexpected inbound RTP (receive-only relay)", self.id);
            }
            None => {
                debug!("peer {}: dropping unclassifiable datagram from {from}", self.id);
            }
        }
    }

    async fn handle_stun(self: &Arc<Self>, buf: &[u8], from: SocketAddr) {
        let events = {
            let mut inner = self.inner.lock().await;
            inner.ice.handle_stun(buf, from)
        };
        self.apply_ice_events(events).await;
    }

    async fn apply_ice_events(self: &Arc<Self>, events: Vec<IceEvent>) {
        for event in events {
            match event {
                IceEvent::Send { dest, bytes } => {
                    if let Err(e) = self.socket.send_to(&bytes, dest).await {
                        warn!("peer {}: failed to send STUN packet: {e}", self.id);
                    }
                }
                IceEvent::Nominated(remote) => {
                    *self.remote_addr.lock().unwrap() = Some(remote);
                    let start_events = {
                        let mut inner = self.inner.lock().await;
                        inner.dtls.as_mut().map(|d| d.start()).unwrap_or_default()
                    };
                    self.apply_dtls_events(start_events, remote).await;
                }
                IceEvent::ConnectionStateChanged(IceConnState::Failed) => {
                    self.set_state(PeerState::Failed);
                }
                IceEvent::ConnectionStateChanged(_) => {}
                IceEvent::GatheringStateChanged(_) => {}
            }
        }
    }

    async fn handle_dtls(self: &Arc<Self>, buf: &[u8], from: SocketAddr) {
        let events = {
            let mut inner = self.inner.lock().await;
            match inner.dtls.as_mut() {
                Some(dtls) => dtls.handle_datagram(buf),
                None => {
                    debug!("peer {}: DTLS datagram before remote description", self.id);
                    return;
                }
            }
        };
        self.apply_dtls_events(events, from).await;
    }

    async fn apply_dtls_events(self: &Arc<Self>, events: Vec<DtlsEvent>, dest: SocketAddr) {
        for event in events {
            match event {
                DtlsEvent::Send(bytes) => {
                    if let Err(e) = self.socket.send_to(&bytes, dest).await {
                        warn!("peer {}: failed to send DTLS record: {e}", self.id);
                    }
                }
                DtlsEvent::Connected => {
                    if let Err(e) = self.activate_srtp().await {
                        warn!("peer {}: failed to derive SRTP session: {e}", self.id);
                        self.set_state(PeerState::Failed);
                        continue;
                    }
                    self.set_state(PeerState::Connected);
                }
                DtlsEvent::Failed(reason) => {
                    warn!("peer {}: DTLS handshake failed: {reason}", self.id);
                    self.set_state(PeerState::Failed);
                }
            }
        }
    }

    async fn activate_srtp(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let dtls = inner
            .dtls
            .as_ref()
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("no transport".into()))?;
        let exported = dtls.export_keying_material("EXTRACTOR-dtls_srtp", &[], 60)?;
        let keying = KeyingMaterial::from_exported(&exported)?;
        let local_is_client = matches!(inner.dtls_role, Some(DtlsRole::Client));
        inner.srtp = Some(SrtpSession::new(&keying, local_is_client));
        Ok(())
    }

    async fn handle_rtcp(self: &Arc<Self>, buf: &[u8]) {
        let plaintext = {
            let mut inner = self.inner.lock().await;
            let Some(srtp) = inner.srtp.as_mut() else {
                return;
            };
            match srtp.unprotect_rtcp(buf) {
                Ok(p) => p,
                Err(e) => {
                    debug!("peer {}: dropping SRTCP packet: {e}", self.id);
                    return;
                }
            }
        };
        let compound = match CompoundPacket::unmarshal(&plaintext) {
            Ok(c) => c,
            Err(e) => {
                debug!("peer {}: malformed RTCP compound packet: {e}", self.id);
                return;
            }
        };
        for packet in compound.packets {
            match packet {
                RtcpPacket::Bye(bye) => {
                    info!("peer {}: received RTCP BYE ({:?})", self.id, bye.reason);
                    if let Some(handler) = &self.on_event {
                        handler(self.id, PeerEvent::ByeReceived);
                    }
                    self.close().await;
                }
                RtcpPacket::ReceiverReport(rr) => {
                    debug!("peer {}: receiver report, {} blocks", self.id, rr.reports.len());
                    if let Some(report) = rr.reports.into_iter().next() {
                        *self.last_reception_report.lock().unwrap() = Some(report);
                    }
                }
                RtcpPacket::SenderReport(sr) => {
                    debug!("peer {}: sender report from ssrc {}", self.id, sr.ssrc);
                    if let Some(report) = sr.reports.into_iter().next() {
                        *self.last_reception_report.lock().unwrap() = Some(report);
                    }
                }
                RtcpPacket::Rtpfb(fb) => {
                    debug!("peer {}: RTPFB fmt={} (parsed, not acted on)", self.id, fb.fmt);
                }
                RtcpPacket::Psfb(fb) => {
                    debug!("peer {}: PSFB fmt={} (parsed, not acted on)", self.id, fb.fmt);
                }
                RtcpPacket::SourceDescription(_) | RtcpPacket::Unknown { .. } => {}
            }
        }
    }

    async fn run_ice_ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                _ = self.closed.notified() => return,
                _ = interval.tick() => {}
            }
            if self.state() == PeerState::Connected || self.state() == PeerState::Closed {
                continue;
            }
            let events = {
                let mut inner = self.inner.lock().await;
                inner.ice.poll_checks(Instant::now())
            };
            self.apply_ice_events(events).await;
        }
    }

    /// Fan-out task: drains this peer's outbound queue, rewrites each
    /// upstream RTP packet onto this peer's own SSRC/sequence space
    /// (timestamp passes through unchanged), protects it and sends it.
    async fn run_sender(self: Arc<Self>) {
        loop {
            let item = tokio::select! {
                _ = self.closed.notified() => return,
                item = self.outbound.pop() => item,
            };
            if self.state() != PeerState::Connected {
                continue;
            }
            let Some(dest) = *self.remote_addr.lock().unwrap() else {
                continue;
            };
            let protected = {
                let mut inner = self.inner.lock().await;
                let Some(srtp) = inner.srtp.as_mut() else {
                    continue;
                };
                match rewrite_for_track(&item, &mut inner.track) {
                    Ok(rewritten) => match srtp.protect_rtp(&rewritten) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("peer {}: failed to protect outbound RTP: {e}", self.id);
                            continue;
                        }
                    },
                    Err(e) => {
                        debug!("peer {}: dropping malformed upstream packet: {e}", self.id);
                        continue;
                    }
                }
            };
            if let Err(e) = self.socket.send_to(&protected, dest).await {
                warn!("peer {}: failed to send protected RTP: {e}", self.id);
            }
        }
    }

    /// Enqueue one upstream RTP packet for this peer. Never blocks: the
    /// bounded queue drops its oldest entry on overflow instead.
    pub fn send_video(&self, rtp: Arc<[u8]>) {
        if self.state() == PeerState::Closed {
            return;
        }
        self.outbound.push(rtp);
    }

    /// Tear this peer down: idempotent, and a no-op if already closed.
    pub async fn close(self: &Arc<Self>) {
        if self.state() == PeerState::Closed {
            return;
        }
        self.set_state(PeerState::Closed);
        self.closed.notify_waiters();
    }
}

fn sdp_candidates(candidates: &[IceCandidate]) -> Vec<SdpCandidate> {
    candidates
        .iter()
        .map(|c| SdpCandidate {
            foundation: c.foundation.clone(),
            component: c.component,
            priority: c.priority,
            address: c.address.ip().to_string(),
            port: c.address.port(),
            typ: match c.typ {
                ice::CandidateType::Host => SdpCandidateType::Host,
                ice::CandidateType::ServerReflexive => SdpCandidateType::ServerReflexive,
                ice::CandidateType::PeerReflexive => SdpCandidateType::PeerReflexive,
                ice::CandidateType::Relay => SdpCandidateType::Relay,
            },
        })
        .collect()
}

fn to_ice_candidate(c: &SdpCandidate) -> Option<IceCandidate> {
    let address = sdp::candidate_socket_addr(c)?;
    Some(IceCandidate {
        foundation: c.foundation.clone(),
        component: c.component,
        priority: c.priority,
        address,
        typ: match c.typ {
            SdpCandidateType::Host => ice::CandidateType::Host,
            SdpCandidateType::ServerReflexive => ice::CandidateType::ServerReflexive,
            SdpCandidateType::PeerReflexive => ice::CandidateType::PeerReflexive,
            SdpCandidateType::Relay => ice::CandidateType::Relay,
        },
    })
}

fn rewrite_for_track(upstream: &[u8], track: &mut LocalTrack) -> Result<Vec<u8>> {
    let mut header = RtpHeader::unmarshal(upstream)?;
    let header_len = header.marshal_size();
    header.ssrc = track.ssrc;
    header.sequence_number = track.next_sequence_number();
    header.payload_type = track.payload_type;
    let mut out = header.marshal()?;
    out.extend_from_slice(&upstream[header_len..]);
    Ok(out)
}

async fn bind_in_range(range: &(u16, u16)) -> Result<UdpSocket> {
    for port in range.0..=range.1 {
        if let Ok(socket) = UdpSocket::bind(("0.0.0.0", port)).await {
            return Ok(socket);
        }
    }
    Err(Error::ErrIo(format!(
        "no free UDP port in range {}..={}",
        range.0, range.1
    )))
}
