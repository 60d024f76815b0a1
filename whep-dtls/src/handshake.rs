use hmac::{Hmac, Mac};
use sha2::Sha256;
use shared::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const HANDSHAKE_HEADER_LEN: usize = 12;

/// The single cipher suite this relay offers and accepts --
/// TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 (RFC5289), the suite every
/// browser's DTLS-SRTP stack supports.
pub const CIPHER_SUITE: u16 = 0xC02B;
const NAMED_CURVE_SECP256R1: u16 = 23;
const SIGNATURE_ECDSA_SHA256: (u8, u8) = (4, 3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    ClientHello,
    ServerHello,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
}

impl HandshakeType {
    fn to_u8(self) -> u8 {
        match self {
            HandshakeType::ClientHello => 1,
            HandshakeType::ServerHello => 2,
            HandshakeType::Certificate => 11,
            HandshakeType::ServerKeyExchange => 12,
            HandshakeType::CertificateRequest => 13,
            HandshakeType::ServerHelloDone => 14,
            HandshakeType::CertificateVerify => 15,
            HandshakeType::ClientKeyExchange => 16,
            HandshakeType::Finished => 20,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => HandshakeType::ClientHello,
            2 => HandshakeType::ServerHello,
            11 => HandshakeType::Certificate,
            12 => HandshakeType::ServerKeyExchange,
            13 => HandshakeType::CertificateRequest,
            14 => HandshakeType::ServerHelloDone,
            15 => HandshakeType::CertificateVerify,
            16 => HandshakeType::ClientKeyExchange,
            20 => HandshakeType::Finished,
            other => {
                return Err(Error::ErrDtlsHandshakeFailed(format!(
                    "unknown handshake message type {other}"
                )))
            }
        })
    }
}

fn put_u24(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes()[1..4]);
}

fn get_u24(buf: &[u8]) -> u32 {
    u32::from_be_bytes([0, buf[0], buf[1], buf[2]])
}

/// A single (unfragmented) DTLS handshake message: type, the DTLS-specific
/// message_seq/fragment fields (RFC6347 §4.2.2), and body. This relay never
/// fragments outbound messages and rejects fragmented inbound ones -- every
/// message here fits comfortably in one UDP datagram.
#[derive(Debug, Clone)]
pub struct HandshakeMessage {
    pub msg_type: HandshakeType,
    pub message_seq: u16,
    pub body: Vec<u8>,
}

impl HandshakeMessage {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HANDSHAKE_HEADER_LEN + self.body.len());
        out.push(self.msg_type.to_u8());
        put_u24(&mut out, self.body.len() as u32);
        out.extend_from_slice(&self.message_seq.to_be_bytes());
        put_u24(&mut out, 0); // fragment_offset
        put_u24(&mut out, self.body.len() as u32); // fragment_length == length, unfragmented
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse one or more concatenated handshake messages out of a flight
    /// record's payload.
    pub fn unmarshal_all(mut buf: &[u8]) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        while !buf.is_empty() {
            if buf.len() < HANDSHAKE_HEADER_LEN {
                return Err(Error::ErrBufferShort {
                    need: HANDSHAKE_HEADER_LEN,
                    have: buf.len(),
                });
            }
            let msg_type = HandshakeType::from_u8(buf[0])?;
            let length = get_u24(&buf[1..4]) as usize;
            let message_seq = u16::from_be_bytes([buf[4], buf[5]]);
            let fragment_offset = get_u24(&buf[6..9]);
            let fragment_length = get_u24(&buf[9..12]) as usize;
            if fragment_offset != 0 || fragment_length != length {
                return Err(Error::ErrDtlsHandshakeFailed(
                    "fragmented handshake messages are not supported".into(),
                ));
            }
            let end = HANDSHAKE_HEADER_LEN + length;
            if buf.len() < end {
                return Err(Error::ErrBufferShort {
                    need: end,
                    have: buf.len(),
                });
            }
            out.push(HandshakeMessage {
                msg_type,
                message_seq,
                body: buf[HANDSHAKE_HEADER_LEN..end].to_vec(),
            });
            buf = &buf[end..];
        }
        Ok(out)
    }
}

pub struct ClientHello {
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
}

impl ClientHello {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[254, 253]); // client_version: DTLS 1.2
        out.extend_from_slice(&self.random);
        out.push(self.session_id.len() as u8);
        out.extend_from_slice(&self.session_id);
        out.push(0); // empty cookie: this relay skips the HelloVerifyRequest round trip
        out.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for suite in &self.cipher_suites {
            out.extend_from_slice(&suite.to_be_bytes());
        }
        out.push(1); // compression_methods length
        out.push(0); // null compression
        out
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < 34 {
            return Err(Error::ErrBufferShort { need: 34, have: buf.len() });
        }
        let mut random = [0u8; 32];
        random.copy_from_slice(&buf[2..34]);
        let mut offset = 34;
        let session_id_len = buf[offset] as usize;
        offset += 1 + session_id_len;
        let session_id = buf[offset - session_id_len..offset].to_vec();
        let cookie_len = buf[offset] as usize;
        offset += 1 + cookie_len;
        let suites_len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
        offset += 2;
        let mut cipher_suites = Vec::new();
        for chunk in buf[offset..offset + suites_len].chunks_exact(2) {
            cipher_suites.push(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        Ok(ClientHello {
            random,
            session_id,
            cipher_suites,
        })
    }
}

pub struct ServerHello {
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
}

impl ServerHello {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[254, 253]);
        out.extend_from_slice(&self.random);
        out.push(self.session_id.len() as u8);
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(&self.cipher_suite.to_be_bytes());
        out.push(0); // null compression
        out
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        if buf.len() < 34 {
            return Err(Error::ErrBufferShort { need: 34, have: buf.len() });
        }
        let mut random = [0u8; 32];
        random.copy_from_slice(&buf[2..34]);
        let mut offset = 34;
        let session_id_len = buf[offset] as usize;
        offset += 1;
        let session_id = buf[offset..offset + session_id_len].to_vec();
        offset += session_id_len;
        let cipher_suite = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        Ok(ServerHello {
            random,
            session_id,
            cipher_suite,
        })
    }
}

/// `Certificate` carries one DER certificate -- the relay, like a browser
/// peer, presents exactly one self-signed leaf and nothing else.
pub fn marshal_certificate(der: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut list = Vec::new();
    put_u24(&mut list, der.len() as u32);
    list.extend_from_slice(der);
    put_u24(&mut out, list.len() as u32);
    out.extend_from_slice(&list);
    out
}

pub fn unmarshal_certificate(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.len() < 3 {
        return Err(Error::ErrBufferShort { need: 3, have: buf.len() });
    }
    let list_len = get_u24(&buf[0..3]) as usize;
    if buf.len() < 3 + list_len || list_len < 3 {
        return Err(Error::ErrDtlsHandshakeFailed("truncated certificate list".into()));
    }
    let cert_len = get_u24(&buf[3..6]) as usize;
    let start = 6;
    let end = start + cert_len;
    if buf.len() < end {
        return Err(Error::ErrBufferShort { need: end, have: buf.len() });
    }
    Ok(buf[start..end].to_vec())
}

pub struct ServerKeyExchange {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl ServerKeyExchange {
    /// `signed_params` is `client_random || server_random || curve params ||
    /// public_key`, signed by the server's certificate key (RFC4492 §5.4).
    pub fn marshal(public_key: &[u8], signature: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(3); // named_curve
        out.extend_from_slice(&NAMED_CURVE_SECP256R1.to_be_bytes());
        out.push(public_key.len() as u8);
        out.extend_from_slice(public_key);
        out.push(SIGNATURE_ECDSA_SHA256.0);
        out.push(SIGNATURE_ECDSA_SHA256.1);
        out.extend_from_slice(&(signature.len() as u16).to_be_bytes());
        out.extend_from_slice(signature);
        out
    }

    pub fn unmarshal(buf: &[u8]) -> Result<(Self, Vec<u8>)> {
        if buf.len() < 4 {
            return Err(Error::ErrBufferShort { need: 4, have: buf.len() });
        }
        let key_len = buf[3] as usize;
        let key_start = 4;
        let key_end = key_start + key_len;
        let public_key = buf[key_start..key_end].to_vec();
        let sig_len = u16::from_be_bytes([buf[key_end + 2], buf[key_end + 3]]) as usize;
        let sig_start = key_end + 4;
        let signature = buf[sig_start..sig_start + sig_len].to_vec();
        let params_with_key = buf[0..key_end].to_vec();
        Ok((
            ServerKeyExchange {
                public_key,
                signature,
            },
            params_with_key,
        ))
    }
}

pub fn marshal_client_key_exchange(public_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(public_key.len() as u8);
    out.extend_from_slice(public_key);
    out
}

pub fn unmarshal_client_key_exchange(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.is_empty() {
        return Err(Error::ErrBufferShort { need: 1, have: 0 });
    }
    let len = buf[0] as usize;
    Ok(buf[1..1 + len].to_vec())
}

pub fn marshal_finished(verify_data: &[u8]) -> Vec<u8> {
    verify_data.to_vec()
}

/// `CertificateVerify` carries a fixed `(hash_alg, sig_alg)` pair (this
/// relay only ever negotiates ECDSA-SHA256) followed by the signature
/// itself; only the signature is of interest to the caller.
pub fn unmarshal_certificate_verify(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.len() < 4 {
        return Err(Error::ErrBufferShort { need: 4, have: buf.len() });
    }
    let sig_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let start = 4;
    let end = start + sig_len;
    if buf.len() < end {
        return Err(Error::ErrBufferShort { need: end, have: buf.len() });
    }
    Ok(buf[start..end].to_vec())
}

/// TLS 1.2 PRF (RFC5246 §5) instantiated with HMAC-SHA256, the PRF hash tied
/// to this relay's single `_SHA256` cipher suite.
pub fn prf(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    let mut result = Vec::with_capacity(out_len);
    let mut a = label_seed.clone();
    while result.len() < out_len {
        let mut mac_a = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac_a.update(&a);
        a = mac_a.finalize().into_bytes().to_vec();

        let mut mac_out = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac_out.update(&a);
        mac_out.update(&label_seed);
        result.extend_from_slice(&mac_out.finalize().into_bytes());
    }
    result.truncate(out_len);
    result
}

pub fn master_secret(pre_master_secret: &[u8], client_random: &[u8; 32], server_random: &[u8; 32]) -> Vec<u8> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    prf(pre_master_secret, b"master secret", &seed, 48)
}

/// 12-byte `verify_data` for Finished (RFC5246 §7.4.9), over a SHA-256 hash
/// of the handshake transcript so far.
pub fn verify_data(master_secret: &[u8], label: &[u8], transcript_hash: &[u8]) -> Vec<u8> {
    prf(master_secret, label, transcript_hash, 12)
}

#[cfg(test)]
mod handshake_test {
    use super::*;

    #[test]
    fn client_hello_roundtrip() {
        let hello = ClientHello {
            random: [5u8; 32],
            session_id: vec![],
            cipher_suites: vec![CIPHER_SUITE],
        };
        let body = hello.marshal();
        let parsed = ClientHello::unmarshal(&body).unwrap();
        assert_eq!(parsed.random, hello.random);
        assert_eq!(parsed.cipher_suites, vec![CIPHER_SUITE]);
    }

    #[test]
    fn handshake_message_roundtrip() {
        let msg = HandshakeMessage {
            msg_type: HandshakeType::ClientHello,
            message_seq: 0,
            body: vec![1, 2, 3],
        };
        let bytes = msg.marshal();
        let parsed = HandshakeMessage::unmarshal_all(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].body, vec![1, 2, 3]);
    }

    #[test]
    fn prf_is_deterministic() {
        let a = prf(b"secret", b"label", b"seed", 32);
        let b = prf(b"secret", b"label", b"seed", 32);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
