use crate::error::{Result, SdpError};
use rand::Rng;
use std::fmt::Write as _;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Application,
}

impl MediaType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(MediaType::Audio),
            "video" => Some(MediaType::Video),
            "application" => Some(MediaType::Application),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Application => "application",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupRole {
    ActPass,
    Active,
    Passive,
}

impl SetupRole {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "actpass" => Some(SetupRole::ActPass),
            "active" => Some(SetupRole::Active),
            "passive" => Some(SetupRole::Passive),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            SetupRole::ActPass => "actpass",
            SetupRole::Active => "active",
            SetupRole::Passive => "passive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(CandidateType::Host),
            "srflx" => Some(CandidateType::ServerReflexive),
            "prflx" => Some(CandidateType::PeerReflexive),
            "relay" => Some(CandidateType::Relay),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }
}

/// `a=candidate:<foundation> <component> <proto> <priority> <addr> <port> typ <type>`
/// (RFC8445 §15.1). Component is always 1: RTCP-mux is mandatory, so there
/// is no separate RTCP component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u16,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub typ: CandidateType,
}

impl Candidate {
    pub fn to_sdp_line(&self) -> String {
        format!(
            "a=candidate:{} {} udp {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.address,
            self.port,
            self.typ.as_str()
        )
    }

    fn parse_line(line: &str) -> Option<Candidate> {
        // "candidate:<foundation> <component> <proto> <priority> <addr> <port> typ <type> ..."
        let rest = line.strip_prefix("candidate:")?;
        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() < 8 {
            return None;
        }
        let foundation = parts[0].to_owned();
        let component: u16 = parts[1].parse().ok()?;
        // parts[2] is transport protocol, always udp in this relay.
        let priority: u32 = parts[3].parse().ok()?;
        let address = parts[4].to_owned();
        let port: u16 = parts[5].parse().ok()?;
        if parts[6] != "typ" {
            return None;
        }
        let typ = CandidateType::parse(parts[7])?;
        Some(Candidate {
            foundation,
            component,
            priority,
            address,
            port,
            typ,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub algorithm: String,
    pub hex_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcAttribute {
    pub ssrc: u32,
    pub cname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media_type: MediaType,
    pub protocol: String,
    pub port: u16,
    pub formats: Vec<u8>,
    pub mid: String,
    pub rtcp_mux: bool,
    pub setup: Option<SetupRole>,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub rtpmap: Vec<(u8, String)>,
    pub ssrc: Option<SsrcAttribute>,
    pub candidates: Vec<Candidate>,
    pub end_of_candidates: bool,
}

impl Default for MediaDescription {
    fn default() -> Self {
        MediaDescription {
            media_type: MediaType::Video,
            protocol: "UDP/TLS/RTP/SAVPF".to_owned(),
            port: 9,
            formats: Vec::new(),
            mid: String::new(),
            rtcp_mux: false,
            setup: None,
            ice_ufrag: None,
            ice_pwd: None,
            fingerprint: None,
            rtpmap: Vec::new(),
            ssrc: None,
            candidates: Vec::new(),
            end_of_candidates: false,
        }
    }
}

const ALLOWED_PROFILES: &[&str] = &[
    "UDP/TLS/RTP/SAVP",
    "UDP/TLS/RTP/SAVPF",
    "UDP/DTLS/SCTP",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub session_id: u64,
    pub session_version: u64,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub bundle_group: Vec<String>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(text: &str) -> Result<Self> {
        let mut session_id = 0u64;
        let mut session_version = 0u64;
        let mut ice_ufrag = None;
        let mut ice_pwd = None;
        let mut fingerprint = None;
        let mut bundle_group = Vec::new();
        let mut media = Vec::new();
        let mut current: Option<MediaDescription> = None;

        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\r');
            if line.len() < 2 || line.as_bytes()[1] != b'=' {
                continue;
            }
            let (key, value) = (line.as_bytes()[0], &line[2..]);
            match key {
                b'o' => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        session_id = parts[1].parse().unwrap_or(0);
                        session_version = parts[2].parse().unwrap_or(0);
                    }
                }
                b'm' => {
                    if let Some(m) = current.take() {
                        media.push(m);
                    }
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(SdpError::Error("malformed m= line".to_owned()));
                    }
                    let media_type = MediaType::parse(parts[0])
                        .ok_or_else(|| SdpError::Error(format!("unknown media type {}", parts[0])))?;
                    let port: u16 = parts[1]
                        .parse()
                        .map_err(|_| SdpError::Error("bad m= port".to_owned()))?;
                    let protocol = parts[2].to_owned();
                    if !ALLOWED_PROFILES.contains(&protocol.as_str()) {
                        return Err(SdpError::Error(format!(
                            "unsupported transport profile {protocol}"
                        )));
                    }
                    if protocol == "UDP/DTLS/SCTP" {
                        return Err(SdpError::DataChannelTransportNotSupported);
                    }
                    let formats = parts[3..]
                        .iter()
                        .filter_map(|p| p.parse::<u8>().ok())
                        .collect();
                    current = Some(MediaDescription {
                        media_type,
                        protocol,
                        port,
                        formats,
                        ..Default::default()
                    });
                }
                b'a' => {
                    parse_attribute(
                        value,
                        current.as_mut(),
                        &mut ice_ufrag,
                        &mut ice_pwd,
                        &mut fingerprint,
                        &mut bundle_group,
                    )?;
                }
                _ => {}
            }
        }
        if let Some(m) = current.take() {
            media.push(m);
        }

        if media.is_empty() {
            return Err(SdpError::NoRemoteMedia);
        }

        Ok(SessionDescription {
            session_id,
            session_version,
            ice_ufrag,
            ice_pwd,
            fingerprint,
            bundle_group,
            media,
        })
    }

    /// The first video media section, if any -- this relay only ever
    /// serves a single bundled video track: one ingest feeds many WebRTC
    /// peers.
    pub fn video_media(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.media_type == MediaType::Video)
    }

    /// Validate the negotiation-relevant fields this relay requires of a
    /// remote offer/answer: at least one video section, rtcp-mux, and a
    /// DTLS fingerprint with a supported digest.
    pub fn validate_for_video_relay(&self) -> Result<()> {
        let video = self.video_media().ok_or(SdpError::NoMatchingMediaType)?;
        if !video.rtcp_mux {
            return Err(SdpError::Error("remote media section lacks rtcp-mux".into()));
        }
        let fp = video
            .fingerprint
            .as_ref()
            .or(self.fingerprint.as_ref())
            .ok_or(SdpError::DtlsFingerprintMissing)?;
        shared::crypto::FingerprintAlgorithm::parse(&fp.algorithm)
            .map_err(|_| SdpError::DtlsFingerprintDigestNotSupported(fp.algorithm.clone()))?;
        Ok(())
    }

    /// Build an SDP answer for a single video track.
    #[allow(clippy::too_many_arguments)]
    pub fn build_answer(
        local_ufrag: &str,
        local_pwd: &str,
        local_fingerprint_alg: &str,
        local_fingerprint_hex: &str,
        setup: SetupRole,
        mid: &str,
        remote_protocol: &str,
        payload_types: &[u8],
        candidates: &[Candidate],
        gathering_complete: bool,
        local_ssrc: Option<(u32, &str)>,
    ) -> String {
        let mut rng = rand::rng();
        let session_id: u64 = rng.random();
        let mut out = String::new();
        let _ = writeln!(out, "v=0");
        let _ = writeln!(
            out,
            "o=- {session_id} 2 IN IP4 127.0.0.1"
        );
        let _ = writeln!(out, "s=-");
        let _ = writeln!(out, "t=0 0");
        let _ = writeln!(out, "a=group:BUNDLE {mid}");
        let _ = writeln!(out, "m=video 9 {remote_protocol} {}", fmt_list(payload_types));
        let _ = writeln!(out, "c=IN IP4 0.0.0.0");
        let _ = writeln!(out, "a=rtcp-mux");
        let _ = writeln!(out, "a=mid:{mid}");
        let _ = writeln!(out, "a=setup:{}", setup.as_str());
        let _ = writeln!(out, "a=ice-ufrag:{local_ufrag}");
        let _ = writeln!(out, "a=ice-pwd:{local_pwd}");
        let _ = writeln!(
            out,
            "a=fingerprint:{local_fingerprint_alg} {local_fingerprint_hex}"
        );
        for pt in payload_types {
            let _ = writeln!(out, "a=rtpmap:{pt} H264/90000");
        }
        if let Some((ssrc, cname)) = local_ssrc {
            let _ = writeln!(out, "a=ssrc:{ssrc} cname:{cname}");
        }
        for c in candidates {
            let _ = writeln!(out, "{}", c.to_sdp_line());
        }
        if gathering_complete {
            let _ = writeln!(out, "a=end-of-candidates");
        }
        out
    }
}

fn fmt_list(v: &[u8]) -> String {
    v.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[allow(clippy::too_many_arguments)]
fn parse_attribute(
    value: &str,
    mut current: Option<&mut MediaDescription>,
    session_ufrag: &mut Option<String>,
    session_pwd: &mut Option<String>,
    session_fingerprint: &mut Option<Fingerprint>,
    bundle_group: &mut Vec<String>,
) -> Result<()> {
    if let Some(rest) = value.strip_prefix("ice-ufrag:") {
        match current.as_deref_mut() {
            Some(m) => m.ice_ufrag = Some(rest.to_owned()),
            None => *session_ufrag = Some(rest.to_owned()),
        }
    } else if let Some(rest) = value.strip_prefix("ice-pwd:") {
        match current.as_deref_mut() {
            Some(m) => m.ice_pwd = Some(rest.to_owned()),
            None => *session_pwd = Some(rest.to_owned()),
        }
    } else if let Some(rest) = value.strip_prefix("fingerprint:") {
        let mut parts = rest.splitn(2, ' ');
        let algorithm = parts.next().unwrap_or_default().to_owned();
        let hex_digest = parts.next().unwrap_or_default().to_owned();
        let fp = Fingerprint {
            algorithm,
            hex_digest,
        };
        match current.as_deref_mut() {
            Some(m) => m.fingerprint = Some(fp),
            None => *session_fingerprint = Some(fp),
        }
    } else if let Some(rest) = value.strip_prefix("group:BUNDLE") {
        bundle_group.extend(rest.split_whitespace().map(|s| s.to_owned()));
    } else if let Some(m) = current.as_deref_mut() {
        if value == "rtcp-mux" {
            m.rtcp_mux = true;
        } else if let Some(rest) = value.strip_prefix("mid:") {
            m.mid = rest.to_owned();
        } else if let Some(rest) = value.strip_prefix("setup:") {
            m.setup = SetupRole::parse(rest);
        } else if let Some(rest) = value.strip_prefix("rtpmap:") {
            let mut parts = rest.splitn(2, ' ');
            if let Some(pt) = parts.next().and_then(|p| p.parse::<u8>().ok()) {
                m.rtpmap.push((pt, parts.next().unwrap_or_default().to_owned()));
            }
        } else if let Some(rest) = value.strip_prefix("ssrc:") {
            let mut parts = rest.splitn(2, ' ');
            if let Some(ssrc) = parts.next().and_then(|p| p.parse::<u32>().ok()) {
                if let Some(cname_part) = parts.next() {
                    if let Some(cname) = cname_part.strip_prefix("cname:") {
                        m.ssrc = Some(SsrcAttribute {
                            ssrc,
                            cname: cname.to_owned(),
                        });
                    }
                }
            }
        } else if value == "end-of-candidates" {
            m.end_of_candidates = true;
        } else if value.starts_with("candidate:") {
            if let Some(c) = Candidate::parse_line(value) {
                m.candidates.push(c);
            }
        }
    }
    Ok(())
}

/// Whether an address may be the source of a trickled/inline candidate we
/// accept from the remote side: any type is accepted; only the component
/// number is validated since RTCP-mux makes component 1 mandatory.
pub fn validate_remote_candidate_component(component: u16) -> Result<()> {
    if component == 1 {
        Ok(())
    } else {
        Err(SdpError::Error("candidate component must be 1".to_owned()))
    }
}

pub fn parse_candidate_line(line: &str) -> Option<Candidate> {
    Candidate::parse_line(line.trim_start_matches("a=candidate:").trim_start_matches("candidate:"))
        .or_else(|| Candidate::parse_line(line))
}

/// Best-effort resolution of a candidate's transport address, used by the
/// multiplexer/ICE layer once a candidate has been accepted.
pub fn candidate_socket_addr(c: &Candidate) -> Option<SocketAddr> {
    format!("{}:{}", c.address, c.port).parse().ok()
}

#[cfg(test)]
mod session_test {
    use super::*;

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
a=candidate:1 1 udp 2130706431 192.0.2.5 40000 typ host\r\n\
a=end-of-candidates\r\n";

    #[test]
    fn parses_basic_offer() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(sdp.bundle_group, vec!["0".to_owned()]);
        let video = sdp.video_media().unwrap();
        assert!(video.rtcp_mux);
        assert_eq!(video.mid, "0");
        assert_eq!(video.setup, Some(SetupRole::ActPass));
        assert_eq!(video.candidates.len(), 1);
        assert!(video.end_of_candidates);
        sdp.validate_for_video_relay().unwrap();
    }

    #[test]
    fn rejects_empty_media() {
        let err = SessionDescription::parse("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n")
            .unwrap_err();
        assert_eq!(err, SdpError::NoRemoteMedia);
    }

    #[test]
    fn rejects_data_channel_transport() {
        let text = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";
        assert_eq!(
            SessionDescription::parse(text).unwrap_err(),
            SdpError::DataChannelTransportNotSupported
        );
    }

    #[test]
    fn missing_fingerprint_is_rejected() {
        let text = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtcp-mux\r\na=mid:0\r\n";
        let sdp = SessionDescription::parse(text).unwrap();
        assert_eq!(
            sdp.validate_for_video_relay().unwrap_err(),
            SdpError::DtlsFingerprintMissing
        );
    }

    #[test]
    fn build_answer_contains_required_lines() {
        let candidates = vec![Candidate {
            foundation: "1".into(),
            component: 1,
            priority: 2130706431,
            address: "198.51.100.2".into(),
            port: 50000,
            typ: CandidateType::Host,
        }];
        let answer = SessionDescription::build_answer(
            "ansufrag",
            "answerpasswordlongenoughtobevalid22",
            "sha-256",
            "11:22:33",
            SetupRole::Active,
            "0",
            "UDP/TLS/RTP/SAVPF",
            &[96],
            &candidates,
            true,
            Some((0xA1B2C3D4, "relay")),
        );
        assert!(answer.contains("a=setup:active"));
        assert!(answer.contains("a=rtcp-mux"));
        assert!(answer.contains("a=end-of-candidates"));
        assert!(answer.contains("a=ssrc:2712847316 cname:relay"));
        let reparsed = SessionDescription::parse(&answer).unwrap();
        assert_eq!(reparsed.video_media().unwrap().candidates.len(), 1);
    }
}
