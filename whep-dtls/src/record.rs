use shared::error::{Error, Result};

pub const RECORD_HEADER_LEN: usize = 13;

/// DTLS 1.2 is wire-tagged as `{254, 253}` (RFC6347 §4.2.1) -- one's
/// complement of TLS 1.2's `{3, 3}`.
pub const DTLS_1_2: (u8, u8) = (254, 253);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
}

impl ContentType {
    fn to_u8(self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            other => return Err(Error::ErrDtlsHandshakeFailed(format!("unknown content type {other}"))),
        })
    }
}

/// DTLS record header (RFC6347 §4.1): content type, version, a 16-bit epoch
/// folded with the 48-bit sequence number into one 64-bit field on the wire,
/// and a payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub epoch: u16,
    pub sequence_number: u64, // low 48 bits significant
    pub length: u16,
}

impl RecordHeader {
    pub fn unmarshal(buf: &[u8]) -> Result<(Self, &[u8])> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(Error::ErrBufferShort {
                need: RECORD_HEADER_LEN,
                have: buf.len(),
            });
        }
        let content_type = ContentType::from_u8(buf[0])?;
        let epoch = u16::from_be_bytes([buf[3], buf[4]]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes[2..8].copy_from_slice(&buf[5..11]);
        let sequence_number = u64::from_be_bytes(seq_bytes);
        let length = u16::from_be_bytes([buf[11], buf[12]]);
        let end = RECORD_HEADER_LEN + length as usize;
        if buf.len() < end {
            return Err(Error::ErrBufferShort {
                need: end,
                have: buf.len(),
            });
        }
        Ok((
            RecordHeader {
                content_type,
                epoch,
                sequence_number,
                length,
            },
            &buf[RECORD_HEADER_LEN..end],
        ))
    }

    pub fn marshal(&self, payload: &[u8], out: &mut Vec<u8>) {
        out.push(self.content_type.to_u8());
        out.push(DTLS_1_2.0);
        out.push(DTLS_1_2.1);
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&self.sequence_number.to_be_bytes()[2..8]);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
    }
}

#[cfg(test)]
mod record_test {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = RecordHeader {
            content_type: ContentType::Handshake,
            epoch: 0,
            sequence_number: 7,
            length: 4,
        };
        let mut buf = Vec::new();
        header.marshal(&[1, 2, 3, 4], &mut buf);
        let (parsed, payload) = RecordHeader::unmarshal(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, &[1, 2, 3, 4]);
    }
}
