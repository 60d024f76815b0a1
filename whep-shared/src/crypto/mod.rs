use crate::error::{Error, Result};
use aes::Aes128;
use aes::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// KeyingMaterialExporter to extract keying material.
///
/// This trait sits here to avoid a direct dependency between the dtls and
/// srtp crates: `DtlsSrtpTransport` implements it once the handshake
/// completes, `SrtpSession` only depends on the trait object.
pub trait KeyingMaterialExporter {
    fn export_keying_material(&self, label: &str, context: &[u8], length: usize)
    -> Result<Vec<u8>>;
}

/// HMAC-SHA1, truncated to `tag_len` bytes (SRTP/SRTCP use 80-bit tags; STUN
/// MESSAGE-INTEGRITY uses the full 160 bits).
pub fn hmac_sha1(key: &[u8], data: &[u8], tag_len: usize) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    full[..tag_len.min(full.len())].to_vec()
}

pub fn verify_hmac_sha1(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let computed = hmac_sha1(key, data, tag.len());
    subtle::ConstantTimeEq::ct_eq(computed.as_slice(), tag).into()
}

/// AES-CM (counter mode) keystream XOR, in place. `iv` must be 16 bytes, as
/// derived by the SRTP IV formula in RFC3711 §4.1.1.
pub fn aes_cm_xor(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(data);
}

/// Certificate fingerprint algorithms a remote SDP `a=fingerprint` line may
/// name (RFC8122). `sha-256` is the common case; the others are accepted
/// because interoperating with older browsers means not all SDP fingerprint
/// lines use SHA-256.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl FingerprintAlgorithm {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha-256" => Ok(FingerprintAlgorithm::Sha256),
            "sha-384" => Ok(FingerprintAlgorithm::Sha384),
            "sha-512" => Ok(FingerprintAlgorithm::Sha512),
            other => Err(Error::ErrDtlsDigestUnsupported(other.to_owned())),
        }
    }

    pub fn sdp_name(&self) -> &'static str {
        match self {
            FingerprintAlgorithm::Sha256 => "sha-256",
            FingerprintAlgorithm::Sha384 => "sha-384",
            FingerprintAlgorithm::Sha512 => "sha-512",
        }
    }

    pub fn digest(&self, der_cert: &[u8]) -> Vec<u8> {
        match self {
            FingerprintAlgorithm::Sha256 => Sha256::digest(der_cert).to_vec(),
            FingerprintAlgorithm::Sha384 => Sha384::digest(der_cert).to_vec(),
            FingerprintAlgorithm::Sha512 => Sha512::digest(der_cert).to_vec(),
        }
    }
}

/// Format a raw digest as the colon-separated upper-hex SDP represents it in,
/// e.g. `AA:BB:CC`.
pub fn fingerprint_to_hex(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a colon- or bare-hex fingerprint string back into bytes, comparing
/// case-insensitively as RFC8122 requires.
pub fn fingerprint_from_hex(s: &str) -> Result<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| *c != ':').collect();
    if cleaned.len() % 2 != 0 {
        return Err(Error::ErrSdp("odd-length fingerprint hex".to_owned()));
    }
    let mut out = Vec::with_capacity(cleaned.len() / 2);
    let bytes = cleaned.as_bytes();
    for chunk in bytes.chunks(2) {
        let byte_str = std::str::from_utf8(chunk).map_err(|_| Error::ErrSdp("bad hex".into()))?;
        let byte =
            u8::from_str_radix(byte_str, 16).map_err(|_| Error::ErrSdp("bad hex digit".into()))?;
        out.push(byte);
    }
    Ok(out)
}

pub fn fingerprints_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(subtle::ConstantTimeEq::ct_eq(a, b))
}

#[cfg(test)]
mod crypto_test {
    use super::*;

    #[test]
    fn hmac_sha1_roundtrip_verifies() {
        let key = b"a reasonably long shared secret";
        let data = b"protect this";
        let tag = hmac_sha1(key, data, 10);
        assert_eq!(tag.len(), 10);
        assert!(verify_hmac_sha1(key, data, &tag));
        assert!(!verify_hmac_sha1(key, b"tampered", &tag));
    }

    #[test]
    fn fingerprint_hex_roundtrip() {
        let digest = vec![0xAAu8, 0xBB, 0x01];
        let hex = fingerprint_to_hex(&digest);
        assert_eq!(hex, "AA:BB:01");
        let back = fingerprint_from_hex(&hex).unwrap();
        assert_eq!(back, digest);
        assert!(fingerprints_match(&digest, &back));
    }

    #[test]
    fn aes_cm_xor_is_involutive() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let mut data = b"hello world stay secret".to_vec();
        let original = data.clone();
        aes_cm_xor(&key, &iv, &mut data);
        assert_ne!(data, original);
        aes_cm_xor(&key, &iv, &mut data);
        assert_eq!(data, original);
    }
}
