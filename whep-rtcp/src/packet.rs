use crate::header::{Header, PacketType};
use crate::reception_report::{ReceptionReport, REPORT_BLOCK_LENGTH};
use shared::error::{Error, Result};

/// Sender Report (RFC3550 §6.4.1). We only relay-side *receive* RTCP, so
/// this type exists to parse an incoming SR, not to generate one (spec's
/// Non-goals exclude bandwidth adaptation/NACK-driven reporting; nothing
/// here requires the relay to originate SRs of its own).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_time: u64,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReceptionReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReceptionReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdes {
    pub chunks: Vec<SdesChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub source: u32,
    pub cname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bye {
    pub sources: Vec<u32>,
    pub reason: Option<String>,
}

/// Generic RTP feedback message (RFC4585): parsed and surfaced, not acted
/// on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rtpfb {
    pub fmt: u8,
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub fci: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Psfb {
    pub fmt: u8,
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub fci: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(Sdes),
    Bye(Bye),
    Rtpfb(Rtpfb),
    Psfb(Psfb),
    Unknown { packet_type: u8 },
}

impl SenderReport {
    fn unmarshal(header: &Header, body: &[u8]) -> Result<Self> {
        if body.len() < 20 {
            return Err(Error::ErrRtcpBadLength);
        }
        let ssrc = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let ntp_time = u64::from_be_bytes([
            body[4], body[5], body[6], body[7], body[8], body[9], body[10], body[11],
        ]);
        let rtp_time = u32::from_be_bytes([body[12], body[13], body[14], body[15]]);
        let packet_count = u32::from_be_bytes([body[16], body[17], body[18], body[19]]);
        let octet_count = u32::from_be_bytes([body[20], body[21], body[22], body[23]]);

        let mut reports = Vec::with_capacity(header.count as usize);
        let mut offset = 24;
        for _ in 0..header.count {
            if body.len() < offset + REPORT_BLOCK_LENGTH {
                return Err(Error::ErrRtcpBadLength);
            }
            reports.push(ReceptionReport::unmarshal(
                &body[offset..offset + REPORT_BLOCK_LENGTH],
            )?);
            offset += REPORT_BLOCK_LENGTH;
        }

        Ok(SenderReport {
            ssrc,
            ntp_time,
            rtp_time,
            packet_count,
            octet_count,
            reports,
        })
    }
}

impl ReceiverReport {
    fn unmarshal(header: &Header, body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::ErrRtcpBadLength);
        }
        let ssrc = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let mut reports = Vec::with_capacity(header.count as usize);
        let mut offset = 4;
        for _ in 0..header.count {
            if body.len() < offset + REPORT_BLOCK_LENGTH {
                return Err(Error::ErrRtcpBadLength);
            }
            reports.push(ReceptionReport::unmarshal(
                &body[offset..offset + REPORT_BLOCK_LENGTH],
            )?);
            offset += REPORT_BLOCK_LENGTH;
        }
        Ok(ReceiverReport { ssrc, reports })
    }
}

impl Sdes {
    fn unmarshal(header: &Header, body: &[u8]) -> Result<Self> {
        let mut chunks = Vec::with_capacity(header.count as usize);
        let mut offset = 0;
        for _ in 0..header.count {
            if body.len() < offset + 4 {
                break;
            }
            let source = u32::from_be_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]);
            offset += 4;
            let mut cname = None;
            loop {
                if offset >= body.len() {
                    break;
                }
                let item_type = body[offset];
                if item_type == 0 {
                    offset += 1;
                    break;
                }
                if body.len() < offset + 2 {
                    break;
                }
                let len = body[offset + 1] as usize;
                let start = offset + 2;
                if body.len() < start + len {
                    break;
                }
                if item_type == 1 {
                    cname = Some(String::from_utf8_lossy(&body[start..start + len]).into_owned());
                }
                offset = start + len;
            }
            // Chunks are padded to a 32-bit boundary.
            offset = offset.div_ceil(4) * 4;
            chunks.push(SdesChunk { source, cname });
        }
        Ok(Sdes { chunks })
    }
}

impl Bye {
    fn unmarshal(header: &Header, body: &[u8]) -> Result<Self> {
        let src_count = header.count as usize;
        if body.len() < src_count * 4 {
            return Err(Error::ErrRtcpBadLength);
        }
        let mut sources = Vec::with_capacity(src_count);
        for i in 0..src_count {
            let o = i * 4;
            sources.push(u32::from_be_bytes([
                body[o],
                body[o + 1],
                body[o + 2],
                body[o + 3],
            ]));
        }
        let mut offset = src_count * 4;
        let reason = if body.len() > offset {
            let len = body[offset] as usize;
            offset += 1;
            if body.len() >= offset + len {
                Some(String::from_utf8_lossy(&body[offset..offset + len]).into_owned())
            } else {
                None
            }
        } else {
            None
        };
        Ok(Bye { sources, reason })
    }
}

fn unmarshal_fb(header: &Header, body: &[u8]) -> Result<(u8, u32, u32, Vec<u8>)> {
    if body.len() < 8 {
        return Err(Error::ErrRtcpBadLength);
    }
    let sender_ssrc = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let media_ssrc = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    Ok((header.count, sender_ssrc, media_ssrc, body[8..].to_vec()))
}

impl Packet {
    pub fn unmarshal(header: &Header, body: &[u8]) -> Result<Self> {
        Ok(match header.packet_type {
            PacketType::SenderReport => Packet::SenderReport(SenderReport::unmarshal(header, body)?),
            PacketType::ReceiverReport => {
                Packet::ReceiverReport(ReceiverReport::unmarshal(header, body)?)
            }
            PacketType::SourceDescription => Packet::SourceDescription(Sdes::unmarshal(header, body)?),
            PacketType::Bye => Packet::Bye(Bye::unmarshal(header, body)?),
            PacketType::TransportSpecificFeedback => {
                let (fmt, sender_ssrc, media_ssrc, fci) = unmarshal_fb(header, body)?;
                Packet::Rtpfb(Rtpfb {
                    fmt,
                    sender_ssrc,
                    media_ssrc,
                    fci,
                })
            }
            PacketType::PayloadSpecificFeedback => {
                let (fmt, sender_ssrc, media_ssrc, fci) = unmarshal_fb(header, body)?;
                Packet::Psfb(Psfb {
                    fmt,
                    sender_ssrc,
                    media_ssrc,
                    fci,
                })
            }
            PacketType::ApplicationDefined => Packet::Unknown { packet_type: 204 },
            PacketType::Unknown(t) => Packet::Unknown { packet_type: t },
        })
    }
}

/// A compound RTCP packet: one or more individual packets back-to-back in
/// a single (S)RTCP datagram, as RFC3550 §6.1 mandates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompoundPacket {
    pub packets: Vec<Packet>,
}

impl CompoundPacket {
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset + 4 <= buf.len() {
            let header = Header::unmarshal(&buf[offset..])?;
            let total_len = header.packet_len();
            if total_len < 4 || offset + total_len > buf.len() {
                return Err(Error::ErrRtcpBadLength);
            }
            let mut body_end = offset + total_len;
            if header.padding && body_end > offset + 4 {
                let pad = buf[body_end - 1] as usize;
                if pad > 0 && pad <= total_len - 4 {
                    body_end -= pad;
                }
            }
            let body = &buf[offset + 4..body_end];
            packets.push(Packet::unmarshal(&header, body)?);
            offset += total_len;
        }
        Ok(CompoundPacket { packets })
    }

    /// Read the cleartext SSRC/CSRC identifying a (pre-unprotect) SRTCP
    /// packet. SRTCP's header (including the sender SSRC at byte offset
    /// 4..8) is never encrypted -- only the packet body past the fixed
    /// header may be. Read it directly; do not run it through `unprotect`
    /// first.
    pub fn cleartext_ssrc(buf: &[u8]) -> Option<u32> {
        if buf.len() < 8 {
            return None;
        }
        Some(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]))
    }
}

#[cfg(test)]
mod packet_test {
    use super::*;

    fn rr_header(count: u8) -> Header {
        Header {
            padding: false,
            count,
            packet_type: PacketType::ReceiverReport,
            length: 0,
        }
    }

    #[test]
    fn receiver_report_with_no_blocks() {
        let header = rr_header(0);
        let body = 0xAABB_CCDDu32.to_be_bytes();
        let rr = ReceiverReport::unmarshal(&header, &body).unwrap();
        assert_eq!(rr.ssrc, 0xAABB_CCDD);
        assert!(rr.reports.is_empty());
    }

    #[test]
    fn bye_parses_reason() {
        let header = Header {
            padding: false,
            count: 1,
            packet_type: PacketType::Bye,
            length: 0,
        };
        let mut body = 42u32.to_be_bytes().to_vec();
        body.push(3);
        body.extend_from_slice(b"bye");
        let bye = Bye::unmarshal(&header, &body).unwrap();
        assert_eq!(bye.sources, vec![42]);
        assert_eq!(bye.reason.as_deref(), Some("bye"));
    }

    #[test]
    fn cleartext_ssrc_reads_without_unprotecting() {
        let mut buf = vec![0x80, 203, 0, 1];
        buf.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        assert_eq!(CompoundPacket::cleartext_ssrc(&buf), Some(0x1234_5678));
    }

    #[test]
    fn compound_packet_splits_back_to_back_packets() {
        // RR (ssrc=1, 0 reports): header len = 1 (8 bytes = 2 words -> length=1)
        let mut buf = Vec::new();
        let rr_header = Header {
            padding: false,
            count: 0,
            packet_type: PacketType::ReceiverReport,
            length: 1,
        };
        buf.extend_from_slice(&rr_header.marshal());
        buf.extend_from_slice(&1u32.to_be_bytes());

        let bye_header = Header {
            padding: false,
            count: 1,
            packet_type: PacketType::Bye,
            length: 1,
        };
        buf.extend_from_slice(&bye_header.marshal());
        buf.extend_from_slice(&2u32.to_be_bytes());

        let compound = CompoundPacket::unmarshal(&buf).unwrap();
        assert_eq!(compound.packets.len(), 2);
        assert!(matches!(compound.packets[0], Packet::ReceiverReport(_)));
        assert!(matches!(compound.packets[1], Packet::Bye(_)));
    }
}
