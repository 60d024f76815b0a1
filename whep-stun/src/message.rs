use shared::crypto::{hmac_sha1, verify_hmac_sha1};
use shared::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LENGTH: usize = 20;
pub const TRANSACTION_ID_LENGTH: usize = 12;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const FINGERPRINT_XOR: u32 = 0x5354_554E;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Binding,
    Unknown(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Username(String),
    MessageIntegrity(Vec<u8>),
    Fingerprint(u32),
    XorMappedAddress(SocketAddr),
    Priority(u32),
    UseCandidate,
    IceControlling(u64),
    IceControlled(u64),
    ErrorCode { code: u16, reason: String },
    Unknown { typ: u16, value: Vec<u8> },
}

/// A parsed STUN message (RFC5389 §6). Only the attributes the ICE
/// connectivity-check state machine actually uses are modelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub class: Class,
    pub method: Method,
    pub transaction_id: [u8; TRANSACTION_ID_LENGTH],
    pub attributes: Vec<Attribute>,
}

fn class_method_from_type(msg_type: u16) -> (Class, Method) {
    // The 14-bit method is split around two class bits (RFC5389 §6).
    let c0 = (msg_type >> 4) & 0x1;
    let c1 = (msg_type >> 8) & 0x1;
    let class_bits = (c1 << 1) | c0;
    let class = match class_bits {
        0b00 => Class::Request,
        0b01 => Class::Indication,
        0b10 => Class::SuccessResponse,
        _ => Class::ErrorResponse,
    };
    let method_bits = (msg_type & 0x000F)
        | ((msg_type & 0x00E0) >> 1)
        | ((msg_type & 0x3E00) >> 2);
    let method = match method_bits {
        0x001 => Method::Binding,
        other => Method::Unknown(other),
    };
    (class, method)
}

fn type_from_class_method(class: Class, method: Method) -> u16 {
    let method_bits: u16 = match method {
        Method::Binding => 0x001,
        Method::Unknown(v) => v,
    };
    let class_bits: u16 = match class {
        Class::Request => 0b00,
        Class::Indication => 0b01,
        Class::SuccessResponse => 0b10,
        Class::ErrorResponse => 0b11,
    };
    let c0 = class_bits & 0x1;
    let c1 = (class_bits >> 1) & 0x1;
    (method_bits & 0x000F)
        | (c0 << 4)
        | ((method_bits & 0x0070) << 1)
        | (c1 << 8)
        | ((method_bits & 0x0F80) << 2)
}

impl Message {
    pub fn new_binding_request(transaction_id: [u8; TRANSACTION_ID_LENGTH]) -> Self {
        Message {
            class: Class::Request,
            method: Method::Binding,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn new_binding_success(transaction_id: [u8; TRANSACTION_ID_LENGTH]) -> Self {
        Message {
            class: Class::SuccessResponse,
            method: Method::Binding,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn is_stun(buf: &[u8]) -> bool {
        buf.len() >= HEADER_LENGTH
            && (buf[0] >> 6) == 0
            && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == MAGIC_COOKIE
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::ErrStunTooShort);
        }
        let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
        let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(Error::ErrStunBadMagicCookie);
        }
        if buf.len() < HEADER_LENGTH + msg_len {
            return Err(Error::ErrStunTooShort);
        }
        let mut transaction_id = [0u8; TRANSACTION_ID_LENGTH];
        transaction_id.copy_from_slice(&buf[8..20]);

        let (class, method) = class_method_from_type(msg_type);
        let mut attributes = Vec::new();
        let mut offset = HEADER_LENGTH;
        let end = HEADER_LENGTH + msg_len;
        while offset + 4 <= end {
            let typ = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let val_start = offset + 4;
            if val_start + len > end {
                break;
            }
            let value = &buf[val_start..val_start + len];
            attributes.push(parse_attribute(typ, value, &transaction_id)?);
            let padded = len.div_ceil(4) * 4;
            offset = val_start + padded;
        }

        Ok(Message {
            class,
            method,
            transaction_id,
            attributes,
        })
    }

    /// Serialize the message, appending MESSAGE-INTEGRITY (HMAC-SHA1 keyed
    /// by `integrity_key`) and FINGERPRINT if requested, exactly in that
    /// order as RFC5389 §15.4 requires (FINGERPRINT is always last).
    pub fn marshal(&self, integrity_key: Option<&[u8]>, add_fingerprint: bool) -> Vec<u8> {
        let mut body = Vec::new();
        for attr in &self.attributes {
            encode_attribute(attr, &mut body);
        }

        let msg_type = type_from_class_method(self.class, self.method);
        let build = |body: &[u8]| -> Vec<u8> {
            let mut out = Vec::with_capacity(HEADER_LENGTH + body.len());
            out.extend_from_slice(&msg_type.to_be_bytes());
            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
            out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
            out.extend_from_slice(&self.transaction_id);
            out.extend_from_slice(body);
            out
        };

        if let Some(key) = integrity_key {
            // Length field must already account for the MI attribute
            // (20 bytes value + 4 byte TLV header) before computing the
            // HMAC over the header+body prefix.
            let mi_len = body.len() + 24;
            let mut prefix = Vec::with_capacity(HEADER_LENGTH + mi_len);
            prefix.extend_from_slice(&msg_type.to_be_bytes());
            prefix.extend_from_slice(&(mi_len as u16).to_be_bytes());
            prefix.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
            prefix.extend_from_slice(&self.transaction_id);
            prefix.extend_from_slice(&body);
            let tag = hmac_sha1(key, &prefix, 20);
            body.extend_from_slice(&ATTR_MESSAGE_INTEGRITY.to_be_bytes());
            body.extend_from_slice(&20u16.to_be_bytes());
            body.extend_from_slice(&tag);
        }

        if add_fingerprint {
            let fp_len = body.len() + 8;
            let mut prefix = Vec::with_capacity(HEADER_LENGTH + fp_len);
            prefix.extend_from_slice(&msg_type.to_be_bytes());
            prefix.extend_from_slice(&(fp_len as u16).to_be_bytes());
            prefix.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
            prefix.extend_from_slice(&self.transaction_id);
            prefix.extend_from_slice(&body);
            let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(&prefix);
            let fingerprint = crc ^ FINGERPRINT_XOR;
            body.extend_from_slice(&ATTR_FINGERPRINT.to_be_bytes());
            body.extend_from_slice(&4u16.to_be_bytes());
            body.extend_from_slice(&fingerprint.to_be_bytes());
        }

        build(&body)
    }

    /// Verify MESSAGE-INTEGRITY against `buf` (the original wire bytes)
    /// using `key`. The HMAC covers everything up to (not including) the
    /// MESSAGE-INTEGRITY attribute, with the length field set as it was
    /// when the sender computed it -- i.e. exactly `buf` truncated right
    /// before the MI attribute's TLV header.
    pub fn verify_message_integrity(buf: &[u8], key: &[u8]) -> Result<()> {
        let mi_offset = find_attribute_offset(buf, ATTR_MESSAGE_INTEGRITY)
            .ok_or(Error::ErrStunIntegrityMismatch)?;
        let tag_start = mi_offset + 4;
        if buf.len() < tag_start + 20 {
            return Err(Error::ErrStunIntegrityMismatch);
        }
        let tag = &buf[tag_start..tag_start + 20];
        let prefix = &buf[..mi_offset];
        if verify_hmac_sha1(key, prefix, tag) {
            Ok(())
        } else {
            Err(Error::ErrStunIntegrityMismatch)
        }
    }
}

fn find_attribute_offset(buf: &[u8], target: u16) -> Option<usize> {
    if buf.len() < HEADER_LENGTH {
        return None;
    }
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let end = (HEADER_LENGTH + msg_len).min(buf.len());
    let mut offset = HEADER_LENGTH;
    while offset + 4 <= end {
        let typ = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        if typ == target {
            return Some(offset);
        }
        let padded = len.div_ceil(4) * 4;
        offset += 4 + padded;
    }
    None
}

fn parse_attribute(typ: u16, value: &[u8], transaction_id: &[u8; 12]) -> Result<Attribute> {
    Ok(match typ {
        ATTR_USERNAME => Attribute::Username(String::from_utf8_lossy(value).into_owned()),
        ATTR_MESSAGE_INTEGRITY => Attribute::MessageIntegrity(value.to_vec()),
        ATTR_FINGERPRINT if value.len() == 4 => {
            Attribute::Fingerprint(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
        }
        ATTR_PRIORITY if value.len() == 4 => {
            Attribute::Priority(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
        }
        ATTR_USE_CANDIDATE => Attribute::UseCandidate,
        ATTR_ICE_CONTROLLING if value.len() == 8 => {
            Attribute::IceControlling(u64::from_be_bytes(value.try_into().unwrap()))
        }
        ATTR_ICE_CONTROLLED if value.len() == 8 => {
            Attribute::IceControlled(u64::from_be_bytes(value.try_into().unwrap()))
        }
        ATTR_XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(decode_xor_mapped_address(
            value,
            transaction_id,
        )?),
        ATTR_ERROR_CODE if value.len() >= 4 => {
            let code = value[2] as u16 * 100 + value[3] as u16;
            let reason = String::from_utf8_lossy(&value[4..]).into_owned();
            Attribute::ErrorCode { code, reason }
        }
        other => Attribute::Unknown {
            typ: other,
            value: value.to_vec(),
        },
    })
}

fn encode_attribute(attr: &Attribute, out: &mut Vec<u8>) {
    let mut push_tlv = |typ: u16, value: &[u8], out: &mut Vec<u8>| {
        out.extend_from_slice(&typ.to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
        let pad = value.len().div_ceil(4) * 4 - value.len();
        out.extend(std::iter::repeat_n(0u8, pad));
    };
    match attr {
        Attribute::Username(s) => push_tlv(ATTR_USERNAME, s.as_bytes(), out),
        Attribute::Priority(p) => push_tlv(ATTR_PRIORITY, &p.to_be_bytes(), out),
        Attribute::UseCandidate => push_tlv(ATTR_USE_CANDIDATE, &[], out),
        Attribute::IceControlling(tb) => push_tlv(ATTR_ICE_CONTROLLING, &tb.to_be_bytes(), out),
        Attribute::IceControlled(tb) => push_tlv(ATTR_ICE_CONTROLLED, &tb.to_be_bytes(), out),
        Attribute::XorMappedAddress(addr) => {
            push_tlv(ATTR_XOR_MAPPED_ADDRESS, &encode_xor_mapped_address(*addr), out)
        }
        // MESSAGE-INTEGRITY / FINGERPRINT are appended by `marshal` itself
        // (they need the rest of the body to hash/checksum over).
        Attribute::MessageIntegrity(_) | Attribute::Fingerprint(_) => {}
        Attribute::ErrorCode { code, reason } => {
            let mut value = vec![0, 0, (*code / 100) as u8, (*code % 100) as u8];
            value.extend_from_slice(reason.as_bytes());
            push_tlv(ATTR_ERROR_CODE, &value, out)
        }
        Attribute::Unknown { typ, value } => push_tlv(*typ, value, out),
    }
}

fn decode_xor_mapped_address(value: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr> {
    if value.len() < 4 {
        return Err(Error::ErrStunTooShort);
    }
    let family = value[1];
    let xport = u16::from_be_bytes([value[2], value[3]]);
    let port = xport ^ ((MAGIC_COOKIE >> 16) as u16);
    match family {
        0x01 if value.len() >= 8 => {
            let xaddr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            let addr = xaddr ^ MAGIC_COOKIE;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(addr)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut key = Vec::with_capacity(16);
            key.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
            key.extend_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ key[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(Error::ErrStunTooShort),
    }
}

fn encode_xor_mapped_address(addr: SocketAddr) -> Vec<u8> {
    let xport = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = vec![0, 0x01];
            out.extend_from_slice(&xport.to_be_bytes());
            let xaddr = u32::from(*v4.ip()) ^ MAGIC_COOKIE;
            out.extend_from_slice(&xaddr.to_be_bytes());
            out
        }
        SocketAddr::V6(_) => {
            // Only IPv4 relay is in scope; callers never construct a V6
            // XorMappedAddress.
            vec![0, 0x02]
        }
    }
}

#[cfg(test)]
mod message_test {
    use super::*;

    #[test]
    fn binding_request_roundtrip() {
        let msg = Message::new_binding_request([7u8; 12]);
        let bytes = msg.marshal(None, false);
        assert!(Message::is_stun(&bytes));
        let parsed = Message::unmarshal(&bytes).unwrap();
        assert_eq!(parsed.class, Class::Request);
        assert_eq!(parsed.method, Method::Binding);
        assert_eq!(parsed.transaction_id, [7u8; 12]);
    }

    #[test]
    fn message_integrity_roundtrip() {
        let mut msg = Message::new_binding_request([1u8; 12]);
        msg.attributes.push(Attribute::Priority(100));
        msg.attributes.push(Attribute::UseCandidate);
        let key = b"remote-pwd-at-least-22-chars-long!!";
        let bytes = msg.marshal(Some(key), true);
        Message::verify_message_integrity(&bytes, key).unwrap();
        assert!(Message::verify_message_integrity(&bytes, b"wrong-key-wrong-key-wrong").is_err());
    }

    #[test]
    fn xor_mapped_address_roundtrip() {
        let addr: SocketAddr = "192.0.2.5:40000".parse().unwrap();
        let mut msg = Message::new_binding_success([3u8; 12]);
        msg.attributes.push(Attribute::XorMappedAddress(addr));
        let bytes = msg.marshal(None, false);
        let parsed = Message::unmarshal(&bytes).unwrap();
        assert_eq!(
            parsed.attributes,
            vec![Attribute::XorMappedAddress(addr)]
        );
    }
}
