use shared::error::{Error, Result};

pub const HEADER_LENGTH: usize = 4;
pub const VERSION_RTCP: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    SenderReport,   // 200
    ReceiverReport, // 201
    SourceDescription, // 202
    Bye,            // 203
    ApplicationDefined, // 204
    TransportSpecificFeedback, // 205 (RTPFB)
    PayloadSpecificFeedback,   // 206 (PSFB)
    Unknown(u8),
}

impl PacketType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            200 => PacketType::SenderReport,
            201 => PacketType::ReceiverReport,
            202 => PacketType::SourceDescription,
            203 => PacketType::Bye,
            204 => PacketType::ApplicationDefined,
            205 => PacketType::TransportSpecificFeedback,
            206 => PacketType::PayloadSpecificFeedback,
            other => PacketType::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            PacketType::SenderReport => 200,
            PacketType::ReceiverReport => 201,
            PacketType::SourceDescription => 202,
            PacketType::Bye => 203,
            PacketType::ApplicationDefined => 204,
            PacketType::TransportSpecificFeedback => 205,
            PacketType::PayloadSpecificFeedback => 206,
            PacketType::Unknown(v) => v,
        }
    }
}

/// The common 4-byte RTCP header prefix (RFC3550 §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub padding: bool,
    /// Reception-report count, subtype (FB message type), or SDES chunk
    /// count depending on `packet_type` -- RFC3550 overloads this field.
    pub count: u8,
    pub packet_type: PacketType,
    /// Length of the packet in 32-bit words, minus one, per RFC3550 §6.1.
    pub length: u16,
}

impl Header {
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::ErrRtcpHeaderTooShort);
        }
        let version = (buf[0] >> 6) & 0x3;
        if version != VERSION_RTCP {
            return Err(Error::ErrRtcpHeaderTooShort);
        }
        let padding = (buf[0] >> 5) & 0x1 != 0;
        let count = buf[0] & 0x1F;
        let packet_type = PacketType::from_u8(buf[1]);
        let length = u16::from_be_bytes([buf[2], buf[3]]);
        Ok(Header {
            padding,
            count,
            packet_type,
            length,
        })
    }

    pub fn marshal(&self) -> [u8; HEADER_LENGTH] {
        let mut first = VERSION_RTCP << 6;
        if self.padding {
            first |= 1 << 5;
        }
        first |= self.count & 0x1F;
        let len = self.length.to_be_bytes();
        [first, self.packet_type.to_u8(), len[0], len[1]]
    }

    /// Total packet length in bytes, including this 4-byte header.
    pub fn packet_len(&self) -> usize {
        (self.length as usize + 1) * 4
    }
}
