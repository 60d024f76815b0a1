//! Per-datagram classifier for a peer's single UDP 5-tuple, following
//! RFC7983's byte-range scheme. Every inbound datagram on a peer's socket is
//! one of STUN, DTLS, or SRTP/SRTCP; anything else is dropped.

use shared::util::{is_rtcp, match_dtls, match_stun};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    Stun,
    Dtls,
    Rtcp,
    Rtp,
}

/// Classify one datagram. Returns `None` for anything this relay never
/// expects on a peer socket (TURN channel data, ZRTP, truncated packets).
pub fn classify(buf: &[u8]) -> Option<DatagramKind> {
    if buf.len() < 12 {
        return None;
    }
    if match_stun(buf) {
        return Some(DatagramKind::Stun);
    }
    if match_dtls(buf) {
        return Some(DatagramKind::Dtls);
    }
    if (128..=191).contains(&buf[0]) {
        return Some(if is_rtcp(buf) {
            DatagramKind::Rtcp
        } else {
            DatagramKind::Rtp
        });
    }
    None
}

#[cfg(test)]
mod demux_test {
    use super::*;

    #[test]
    fn classifies_stun() {
        let buf = [0x00, 0x01, 0, 0, 0x21, 0x12, 0xA4, 0x42, 0, 0, 0, 0];
        assert_eq!(classify(&buf), Some(DatagramKind::Stun));
    }

    #[test]
    fn classifies_dtls() {
        let buf = [22u8, 254, 253, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(classify(&buf), Some(DatagramKind::Dtls));
    }

    #[test]
    fn classifies_rtcp_by_packet_type() {
        let mut buf = vec![0x80, 201, 0, 1];
        buf.extend_from_slice(&[0u8; 8]);
        assert_eq!(classify(&buf), Some(DatagramKind::Rtcp));
    }

    #[test]
    fn classifies_rtp_by_exclusion() {
        let mut buf = vec![0x80, 96, 0, 1];
        buf.extend_from_slice(&[0u8; 8]);
        assert_eq!(classify(&buf), Some(DatagramKind::Rtp));
    }

    #[test]
    fn rejects_too_short() {
        assert_eq!(classify(&[0u8; 4]), None);
    }
}
