use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use shared::crypto::{fingerprint_to_hex, FingerprintAlgorithm};
use shared::error::{Error, Result};

/// A self-signed certificate generated fresh per relay process (WebRTC
/// identifies peers by the SDP `a=fingerprint` line, not by a CA chain, so
/// there is no reason to persist a cert across restarts).
#[derive(Clone)]
pub struct SelfSignedCert {
    pub certificate_der: Vec<u8>,
    key_pair_der: Vec<u8>,
}

impl SelfSignedCert {
    pub fn generate() -> Result<Self> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["whep-relay.local".to_owned()])
                .map_err(|e| Error::ErrDtlsHandshakeFailed(e.to_string()))?;
        Ok(SelfSignedCert {
            certificate_der: cert.der().to_vec(),
            key_pair_der: key_pair.serialize_der(),
        })
    }

    /// The fingerprint this relay advertises in its SDP answer.
    pub fn fingerprint(&self, algo: FingerprintAlgorithm) -> String {
        fingerprint_to_hex(&algo.digest(&self.certificate_der))
    }

    pub fn signing_key(&self) -> Result<EcdsaKeyPair> {
        EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_ASN1_SIGNING,
            &self.key_pair_der,
            &SystemRandom::new(),
        )
        .map_err(|_| Error::ErrDtlsHandshakeFailed("generated signing key rejected by ring".into()))
    }
}

#[cfg(test)]
mod cert_test {
    use super::*;

    #[test]
    fn generates_a_stable_fingerprint() {
        let cert = SelfSignedCert::generate().unwrap();
        let a = cert.fingerprint(FingerprintAlgorithm::Sha256);
        let b = cert.fingerprint(FingerprintAlgorithm::Sha256);
        assert_eq!(a, b);
        assert!(a.contains(':'));
    }
}
