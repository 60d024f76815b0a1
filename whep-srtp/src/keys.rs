use shared::crypto::aes_cm_xor;
use shared::error::{Error, Result};

const LABEL_RTP_ENCRYPTION: u8 = 0x00;
const LABEL_RTP_AUTH: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;
const LABEL_RTCP_ENCRYPTION: u8 = 0x03;
const LABEL_RTCP_AUTH: u8 = 0x04;
const LABEL_RTCP_SALT: u8 = 0x05;

pub const MASTER_KEY_LEN: usize = 16;
pub const MASTER_SALT_LEN: usize = 14;
pub const AUTH_KEY_LEN: usize = 20;
pub const AUTH_TAG_LEN: usize = 10;

/// The 60 bytes exported from the DTLS handshake via
/// `KeyingMaterialExporter` (RFC5764 §4.2), split into the client's and
/// server's master key/salt pairs. Which pair is "local" (used to protect
/// outbound packets) depends on the transport's DTLS role.
pub struct KeyingMaterial {
    pub client_key: [u8; MASTER_KEY_LEN],
    pub server_key: [u8; MASTER_KEY_LEN],
    pub client_salt: [u8; MASTER_SALT_LEN],
    pub server_salt: [u8; MASTER_SALT_LEN],
}

impl KeyingMaterial {
    pub fn from_exported(bytes: &[u8]) -> Result<Self> {
        let expected = 2 * MASTER_KEY_LEN + 2 * MASTER_SALT_LEN;
        if bytes.len() != expected {
            return Err(Error::ErrDtlsHandshakeFailed(format!(
                "expected {expected} bytes of exported SRTP keying material, got {}",
                bytes.len()
            )));
        }
        let mut offset = 0;
        let mut take = |len: usize| {
            let slice = &bytes[offset..offset + len];
            offset += len;
            slice
        };
        let client_key = take(MASTER_KEY_LEN).try_into().unwrap();
        let server_key = take(MASTER_KEY_LEN).try_into().unwrap();
        let client_salt = take(MASTER_SALT_LEN).try_into().unwrap();
        let server_salt = take(MASTER_SALT_LEN).try_into().unwrap();
        Ok(KeyingMaterial {
            client_key,
            server_key,
            client_salt,
            server_salt,
        })
    }
}

/// The per-direction session keys derived from a single master key/salt
/// pair (RFC3711 §4.3), one set of RTP keys and one set of RTCP keys.
pub struct DerivedKeys {
    pub rtp_key: [u8; MASTER_KEY_LEN],
    pub rtp_auth: [u8; AUTH_KEY_LEN],
    pub rtp_salt: [u8; MASTER_SALT_LEN],
    pub rtcp_key: [u8; MASTER_KEY_LEN],
    pub rtcp_auth: [u8; AUTH_KEY_LEN],
    pub rtcp_salt: [u8; MASTER_SALT_LEN],
}

impl DerivedKeys {
    pub fn derive(master_key: &[u8; MASTER_KEY_LEN], master_salt: &[u8; MASTER_SALT_LEN]) -> Self {
        DerivedKeys {
            rtp_key: derive_fixed(master_key, master_salt, LABEL_RTP_ENCRYPTION),
            rtp_auth: derive_auth(master_key, master_salt, LABEL_RTP_AUTH),
            rtp_salt: derive_salt(master_key, master_salt, LABEL_RTP_SALT),
            rtcp_key: derive_fixed(master_key, master_salt, LABEL_RTCP_ENCRYPTION),
            rtcp_auth: derive_auth(master_key, master_salt, LABEL_RTCP_AUTH),
            rtcp_salt: derive_salt(master_key, master_salt, LABEL_RTCP_SALT),
        }
    }
}

/// RFC3711 §4.3.1 AES-CM key derivation: encrypt an all-zero block with
/// the master key, using an IV built by XORing `label` into bit 48 of the
/// (zero-padded to 128 bits) master salt. `key_derivation_rate` is always
/// 0 for this relay, so the low 48 bits of the IV stay untouched.
fn derive_bytes(master_key: &[u8; MASTER_KEY_LEN], master_salt: &[u8; MASTER_SALT_LEN], label: u8, out_len: usize) -> Vec<u8> {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(master_salt);
    iv[9] ^= label;
    let mut out = vec![0u8; out_len];
    aes_cm_xor(master_key, &iv, &mut out);
    out
}

fn derive_fixed(master_key: &[u8; MASTER_KEY_LEN], master_salt: &[u8; MASTER_SALT_LEN], label: u8) -> [u8; MASTER_KEY_LEN] {
    derive_bytes(master_key, master_salt, label, MASTER_KEY_LEN)
        .try_into()
        .unwrap()
}

fn derive_salt(master_key: &[u8; MASTER_KEY_LEN], master_salt: &[u8; MASTER_SALT_LEN], label: u8) -> [u8; MASTER_SALT_LEN] {
    derive_bytes(master_key, master_salt, label, MASTER_SALT_LEN)
        .try_into()
        .unwrap()
}

fn derive_auth(master_key: &[u8; MASTER_KEY_LEN], master_salt: &[u8; MASTER_SALT_LEN], label: u8) -> [u8; AUTH_KEY_LEN] {
    derive_bytes(master_key, master_salt, label, AUTH_KEY_LEN)
        .try_into()
        .unwrap()
}

#[cfg(test)]
mod keys_test {
    use super::*;

    #[test]
    fn derivation_is_deterministic_and_label_dependent() {
        let key = [1u8; MASTER_KEY_LEN];
        let salt = [2u8; MASTER_SALT_LEN];
        let derived = DerivedKeys::derive(&key, &salt);
        let derived2 = DerivedKeys::derive(&key, &salt);
        assert_eq!(derived.rtp_key, derived2.rtp_key);
        assert_ne!(derived.rtp_key, derived.rtcp_key);
        assert_ne!(derived.rtp_auth, derived.rtcp_auth);
    }

    #[test]
    fn keying_material_splits_in_rfc5764_order() {
        let mut bytes = Vec::new();
        bytes.extend(std::iter::repeat_n(1u8, MASTER_KEY_LEN));
        bytes.extend(std::iter::repeat_n(2u8, MASTER_KEY_LEN));
        bytes.extend(std::iter::repeat_n(3u8, MASTER_SALT_LEN));
        bytes.extend(std::iter::repeat_n(4u8, MASTER_SALT_LEN));
        let km = KeyingMaterial::from_exported(&bytes).unwrap();
        assert_eq!(km.client_key, [1u8; MASTER_KEY_LEN]);
        assert_eq!(km.server_key, [2u8; MASTER_KEY_LEN]);
        assert_eq!(km.client_salt, [3u8; MASTER_SALT_LEN]);
        assert_eq!(km.server_salt, [4u8; MASTER_SALT_LEN]);
    }
}
