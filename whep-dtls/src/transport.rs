use crate::cert::SelfSignedCert;
use crate::handshake::{
    self, marshal_certificate, marshal_client_key_exchange, marshal_finished,
    unmarshal_certificate, unmarshal_certificate_verify, unmarshal_client_key_exchange, verify_data,
    ClientHello, HandshakeMessage, HandshakeType, ServerHello, ServerKeyExchange, CIPHER_SUITE,
};
use crate::record::{ContentType, RecordHeader};
use log::{debug, warn};
use ring::agreement::{self, EphemeralPrivateKey};
use ring::rand::SystemRandom;
use ring::signature::{self, UnparsedPublicKey};
use sha2::{Digest, Sha256};
use shared::crypto::{fingerprints_match, FingerprintAlgorithm, KeyingMaterialExporter};
use shared::error::{Error, Result};

/// Which side of the DTLS handshake this transport plays, derived from the
/// SDP `a=setup` attribute (RFC8122 / RFC4145): the offerer's `active`
/// means the relay is the DTLS server, `passive` means the relay dials out
/// as the DTLS client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub enum DtlsEvent {
    Send(Vec<u8>),
    Connected,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    WaitServerFlight,
    /// Server only: first flight sent, waiting for the client's second
    /// flight (Certificate, ClientKeyExchange, CertificateVerify, Finished).
    WaitClientFinished,
    WaitServerFinished,
    Connected,
    Failed,
}

struct Transcript {
    hasher: Sha256,
}

impl Transcript {
    fn new() -> Self {
        Transcript {
            hasher: Sha256::new(),
        }
    }

    fn push(&mut self, msg: &HandshakeMessage) {
        self.hasher.update(msg.marshal());
    }

    fn hash(&self) -> Vec<u8> {
        self.hasher.clone().finalize().to_vec()
    }
}

/// Drives a DTLS 1.2 handshake to completion and, once connected, exports
/// SRTP keying material (RFC5764) for `SrtpSession`. This relay never
/// sends application data over the DTLS channel itself -- media travels as
/// SRTP, not as DTLS records -- so no record-layer AEAD is implemented here.
///
/// Simplification: the HelloVerifyRequest cookie exchange (RFC6347 §4.2.1)
/// is skipped. A relay behind a stable, already-ICE-validated 5-tuple does
/// not need the anti-amplification cookie a public-facing DTLS listener
/// would.
pub struct DtlsSrtpTransport {
    role: DtlsRole,
    cert: SelfSignedCert,
    remote_fingerprint: (FingerprintAlgorithm, Vec<u8>),
    phase: Phase,
    next_seq: u16,
    epoch: u16,
    send_seq: u64,
    transcript: Transcript,
    client_random: [u8; 32],
    server_random: [u8; 32],
    ephemeral_key: Option<EphemeralPrivateKey>,
    master_secret: Option<Vec<u8>>,
    remote_certificate_der: Option<Vec<u8>>,
}

impl DtlsSrtpTransport {
    pub fn new(
        role: DtlsRole,
        cert: SelfSignedCert,
        remote_fingerprint: (FingerprintAlgorithm, Vec<u8>),
    ) -> Self {
        DtlsSrtpTransport {
            role,
            cert,
            remote_fingerprint,
            phase: Phase::Init,
            next_seq: 0,
            epoch: 0,
            send_seq: 0,
            transcript: Transcript::new(),
            client_random: [0u8; 32],
            server_random: [0u8; 32],
            ephemeral_key: None,
            master_secret: None,
            remote_certificate_der: None,
        }
    }

    fn next_handshake_record(&mut self, msg_type: HandshakeType, body: Vec<u8>) -> (HandshakeMessage, Vec<u8>) {
        let msg = HandshakeMessage {
            msg_type,
            message_seq: self.next_seq,
            body,
        };
        self.next_seq += 1;
        let mut record = Vec::new();
        let header = RecordHeader {
            content_type: ContentType::Handshake,
            epoch: self.epoch,
            sequence_number: self.send_seq,
            length: 0,
        };
        self.send_seq += 1;
        header.marshal(&msg.marshal(), &mut record);
        (msg, record)
    }

    fn change_cipher_spec_record(&mut self) -> Vec<u8> {
        let header = RecordHeader {
            content_type: ContentType::ChangeCipherSpec,
            epoch: self.epoch,
            sequence_number: self.send_seq,
            length: 0,
        };
        self.send_seq += 1;
        let mut out = Vec::new();
        header.marshal(&[1], &mut out);
        out
    }

    /// Starts the handshake as the DTLS client by sending `ClientHello`.
    /// No-op (returns no events) when this transport is the server, which
    /// instead waits for the client's first flight via `handle_datagram`.
    pub fn start(&mut self) -> Vec<DtlsEvent> {
        if self.role != DtlsRole::Client || self.phase != Phase::Init {
            return Vec::new();
        }
        let mut rng_bytes = [0u8; 32];
        fill_random(&mut rng_bytes);
        self.client_random = rng_bytes;

        let hello = ClientHello {
            random: self.client_random,
            session_id: vec![],
            cipher_suites: vec![CIPHER_SUITE],
        };
        let (msg, record) = self.next_handshake_record(HandshakeType::ClientHello, hello.marshal());
        self.transcript.push(&msg);
        self.phase = Phase::WaitServerFlight;
        vec![DtlsEvent::Send(record)]
    }

    /// Feeds one inbound UDP datagram (already classified as DTLS by the
    /// demux layer) into the handshake state machine.
    pub fn handle_datagram(&mut self, datagram: &[u8]) -> Vec<DtlsEvent> {
        match self.step(datagram) {
            Ok(events) => events,
            Err(e) => {
                warn!("dtls: handshake failed: {e}");
                self.phase = Phase::Failed;
                vec![DtlsEvent::Failed(e.to_string())]
            }
        }
    }

    fn step(&mut self, datagram: &[u8]) -> Result<Vec<DtlsEvent>> {
        let mut messages = Vec::new();
        let mut rest = datagram;
        while !rest.is_empty() {
            let (header, payload) = RecordHeader::unmarshal(rest)?;
            match header.content_type {
                ContentType::Handshake => {
                    messages.extend(HandshakeMessage::unmarshal_all(payload)?);
                }
                ContentType::ChangeCipherSpec => {}
                ContentType::Alert => return Err(Error::ErrDtlsClosed),
                ContentType::ApplicationData => {}
            }
            rest = &rest[crate::record::RECORD_HEADER_LEN + payload.len()..];
        }

        match self.phase {
            Phase::Init if self.role == DtlsRole::Server => self.handle_client_first_flight(&messages),
            Phase::WaitServerFlight => self.handle_server_flight(&messages),
            Phase::WaitClientFinished if self.role == DtlsRole::Server => {
                self.handle_client_second_flight(&messages)
            }
            Phase::WaitServerFinished => self.handle_server_finished(&messages),
            _ => {
                debug!("dtls: ignoring datagram in phase {:?}", self.phase);
                Ok(Vec::new())
            }
        }
    }

    fn handle_client_first_flight(&mut self, messages: &[HandshakeMessage]) -> Result<Vec<DtlsEvent>> {
        let Some(hello_msg) = messages
            .iter()
            .find(|m| m.msg_type == HandshakeType::ClientHello)
        else {
            return Ok(Vec::new());
        };
        let hello = ClientHello::unmarshal(&hello_msg.body)?;
        self.client_random = hello.random;
        self.transcript.push(hello_msg);

        let mut server_random = [0u8; 32];
        fill_random(&mut server_random);
        self.server_random = server_random;

        let mut events = Vec::new();
        let mut flight = Vec::new();

        let server_hello = ServerHello {
            random: self.server_random,
            session_id: vec![],
            cipher_suite: CIPHER_SUITE,
        };
        let (msg, record) = self.next_handshake_record(HandshakeType::ServerHello, server_hello.marshal());
        self.transcript.push(&msg);
        flight.extend_from_slice(&record);

        let (msg, record) = self.next_handshake_record(
            HandshakeType::Certificate,
            marshal_certificate(&self.cert.certificate_der),
        );
        self.transcript.push(&msg);
        flight.extend_from_slice(&record);

        let rng = SystemRandom::new();
        let eph = EphemeralPrivateKey::generate(&agreement::ECDH_P256, &rng)
            .map_err(|_| Error::ErrDtlsHandshakeFailed("ecdhe keygen failed".into()))?;
        let pub_key = eph
            .compute_public_key()
            .map_err(|_| Error::ErrDtlsHandshakeFailed("ecdhe pubkey failed".into()))?;
        let mut signed_params = Vec::new();
        signed_params.extend_from_slice(&self.client_random);
        signed_params.extend_from_slice(&self.server_random);
        signed_params.push(3);
        signed_params.extend_from_slice(&23u16.to_be_bytes());
        signed_params.push(pub_key.as_ref().len() as u8);
        signed_params.extend_from_slice(pub_key.as_ref());
        let signing_key = self.cert.signing_key()?;
        let signature = signing_key
            .sign(&rng, &signed_params)
            .map_err(|_| Error::ErrDtlsHandshakeFailed("signing failed".into()))?;
        let (msg, record) = self.next_handshake_record(
            HandshakeType::ServerKeyExchange,
            ServerKeyExchange::marshal(pub_key.as_ref(), signature.as_ref()),
        );
        self.transcript.push(&msg);
        flight.extend_from_slice(&record);
        self.ephemeral_key = Some(eph);

        let (msg, record) = self.next_handshake_record(HandshakeType::CertificateRequest, vec![1, 64]);
        self.transcript.push(&msg);
        flight.extend_from_slice(&record);

        let (msg, record) = self.next_handshake_record(HandshakeType::ServerHelloDone, Vec::new());
        self.transcript.push(&msg);
        flight.extend_from_slice(&record);

        events.push(DtlsEvent::Send(flight));
        self.phase = Phase::WaitClientFinished;
        Ok(events)
    }

    /// Server only: processes the client's second flight (Certificate,
    /// ClientKeyExchange, CertificateVerify, Finished -- the
    /// ChangeCipherSpec between CertificateVerify and Finished carries no
    /// handshake content and is dropped by `step` already), derives
    /// `master_secret`, verifies the client `Finished`, and replies with
    /// this side's own ChangeCipherSpec + `Finished`.
    fn handle_client_second_flight(&mut self, messages: &[HandshakeMessage]) -> Result<Vec<DtlsEvent>> {
        let cert_msg = messages
            .iter()
            .find(|m| m.msg_type == HandshakeType::Certificate)
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("missing client Certificate".into()))?;
        let cert_der = unmarshal_certificate(&cert_msg.body)?;
        self.verify_remote_fingerprint(&cert_der)?;

        let cke_msg = messages
            .iter()
            .find(|m| m.msg_type == HandshakeType::ClientKeyExchange)
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("missing ClientKeyExchange".into()))?;
        let client_pub_key = unmarshal_client_key_exchange(&cke_msg.body)?;

        let eph = self
            .ephemeral_key
            .take()
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("no ephemeral key".into()))?;
        let master_secret = agreement::agree_ephemeral(
            eph,
            &agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, &client_pub_key),
            |shared_secret| handshake::master_secret(shared_secret, &self.client_random, &self.server_random),
        )
        .map_err(|_| Error::ErrDtlsHandshakeFailed("ecdh agreement failed".into()))?;
        self.master_secret = Some(master_secret.clone());
        self.remote_certificate_der = Some(cert_der.clone());

        self.transcript.push(cert_msg);
        self.transcript.push(cke_msg);

        let cert_verify_msg = messages
            .iter()
            .find(|m| m.msg_type == HandshakeType::CertificateVerify)
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("missing CertificateVerify".into()))?;
        let verify_hash = self.transcript.hash();
        let signature = unmarshal_certificate_verify(&cert_verify_msg.body)?;
        self.verify_signature(&cert_der, &verify_hash, &signature)?;
        self.transcript.push(cert_verify_msg);

        let finished_hash = self.transcript.hash();
        let finished_msg = messages
            .iter()
            .find(|m| m.msg_type == HandshakeType::Finished)
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("missing client Finished".into()))?;
        let expected = verify_data(&master_secret, b"client finished", &finished_hash);
        if !fingerprints_match(&expected, &finished_msg.body) {
            return Err(Error::ErrDtlsHandshakeFailed("client Finished mismatch".into()));
        }
        self.transcript.push(finished_msg);

        let mut flight = Vec::new();
        flight.extend_from_slice(&self.change_cipher_spec_record());
        self.epoch += 1;

        let server_finished_hash = self.transcript.hash();
        let server_verify_data = verify_data(&master_secret, b"server finished", &server_finished_hash);
        let (msg, record) =
            self.next_handshake_record(HandshakeType::Finished, marshal_finished(&server_verify_data));
        self.transcript.push(&msg);
        flight.extend_from_slice(&record);

        self.phase = Phase::Connected;
        Ok(vec![DtlsEvent::Send(flight), DtlsEvent::Connected])
    }

    fn handle_server_flight(&mut self, messages: &[HandshakeMessage]) -> Result<Vec<DtlsEvent>> {
        let server_hello_msg = messages
            .iter()
            .find(|m| m.msg_type == HandshakeType::ServerHello)
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("missing ServerHello".into()))?;
        let server_hello = ServerHello::unmarshal(&server_hello_msg.body)?;
        self.server_random = server_hello.random;

        let cert_msg = messages
            .iter()
            .find(|m| m.msg_type == HandshakeType::Certificate)
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("missing Certificate".into()))?;
        let cert_der = unmarshal_certificate(&cert_msg.body)?;
        self.verify_remote_fingerprint(&cert_der)?;

        let ske_msg = messages
            .iter()
            .find(|m| m.msg_type == HandshakeType::ServerKeyExchange)
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("missing ServerKeyExchange".into()))?;
        let (ske, signed_params_tail) = ServerKeyExchange::unmarshal(&ske_msg.body)?;
        let mut signed_params = Vec::new();
        signed_params.extend_from_slice(&self.client_random);
        signed_params.extend_from_slice(&self.server_random);
        signed_params.extend_from_slice(&signed_params_tail);
        self.verify_signature(&cert_der, &signed_params, &ske.signature)?;

        for msg in messages {
            self.transcript.push(msg);
        }

        let rng = SystemRandom::new();
        let eph = EphemeralPrivateKey::generate(&agreement::ECDH_P256, &rng)
            .map_err(|_| Error::ErrDtlsHandshakeFailed("ecdhe keygen failed".into()))?;
        let my_pub_key = eph
            .compute_public_key()
            .map_err(|_| Error::ErrDtlsHandshakeFailed("ecdhe pubkey failed".into()))?;
        let my_pub_key_bytes = my_pub_key.as_ref().to_vec();

        let master_secret = agreement::agree_ephemeral(
            eph,
            &agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, &ske.public_key),
            |shared_secret| handshake::master_secret(shared_secret, &self.client_random, &self.server_random),
        )
        .map_err(|_| Error::ErrDtlsHandshakeFailed("ecdh agreement failed".into()))?;
        self.master_secret = Some(master_secret);
        self.remote_certificate_der = Some(cert_der);

        let mut flight = Vec::new();

        let (msg, record) = self.next_handshake_record(
            HandshakeType::Certificate,
            marshal_certificate(&self.cert.certificate_der),
        );
        self.transcript.push(&msg);
        flight.extend_from_slice(&record);

        let (msg, record) = self.next_handshake_record(
            HandshakeType::ClientKeyExchange,
            marshal_client_key_exchange(&my_pub_key_bytes),
        );
        self.transcript.push(&msg);
        flight.extend_from_slice(&record);

        let verify_hash = self.transcript.hash();
        let signing_key = self.cert.signing_key()?;
        let signature = signing_key
            .sign(&rng, &verify_hash)
            .map_err(|_| Error::ErrDtlsHandshakeFailed("signing failed".into()))?;
        let mut cert_verify_body = Vec::new();
        cert_verify_body.push(4);
        cert_verify_body.push(3);
        cert_verify_body.extend_from_slice(&(signature.as_ref().len() as u16).to_be_bytes());
        cert_verify_body.extend_from_slice(signature.as_ref());
        let (msg, record) = self.next_handshake_record(HandshakeType::CertificateVerify, cert_verify_body);
        self.transcript.push(&msg);
        flight.extend_from_slice(&record);

        flight.extend_from_slice(&self.change_cipher_spec_record());
        self.epoch += 1;

        let finished_hash = self.transcript.hash();
        let master_secret = self.master_secret.clone().expect("set above");
        let client_verify_data = verify_data(&master_secret, b"client finished", &finished_hash);
        let (msg, record) =
            self.next_handshake_record(HandshakeType::Finished, marshal_finished(&client_verify_data));
        self.transcript.push(&msg);
        flight.extend_from_slice(&record);

        self.phase = Phase::WaitServerFinished;
        Ok(vec![DtlsEvent::Send(flight)])
    }

    fn handle_server_finished(&mut self, messages: &[HandshakeMessage]) -> Result<Vec<DtlsEvent>> {
        let expected_hash = self.transcript.hash();
        let finished_msg = messages
            .iter()
            .find(|m| m.msg_type == HandshakeType::Finished)
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("missing server Finished".into()))?;
        let master_secret = self
            .master_secret
            .clone()
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("no master secret yet".into()))?;
        let expected = verify_data(&master_secret, b"server finished", &expected_hash);
        if !fingerprints_match(&expected, &finished_msg.body) {
            return Err(Error::ErrDtlsHandshakeFailed("server Finished mismatch".into()));
        }
        self.phase = Phase::Connected;
        Ok(vec![DtlsEvent::Connected])
    }

    fn verify_remote_fingerprint(&self, cert_der: &[u8]) -> Result<()> {
        let (algo, expected) = &self.remote_fingerprint;
        let digest = algo.digest(cert_der);
        if fingerprints_match(&digest, expected) {
            Ok(())
        } else {
            Err(Error::ErrDtlsFingerprintMismatch)
        }
    }

    fn verify_signature(&self, cert_der: &[u8], signed_params: &[u8], signature: &[u8]) -> Result<()> {
        let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
            .map_err(|_| Error::ErrDtlsHandshakeFailed("malformed peer certificate".into()))?;
        let spki = cert.public_key().subject_public_key.data.to_vec();
        let public_key = UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, spki);
        public_key
            .verify(signed_params, signature)
            .map_err(|_| Error::ErrDtlsHandshakeFailed("ServerKeyExchange signature invalid".into()))
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }
}

impl KeyingMaterialExporter for DtlsSrtpTransport {
    /// RFC5764 §4.2: the exporter seed is `client_random || server_random`
    /// with no additional context, regardless of what `context` holds --
    /// it exists in the trait only because RFC5705's general exporter
    /// interface takes one.
    fn export_keying_material(&self, label: &str, _context: &[u8], length: usize) -> Result<Vec<u8>> {
        let master_secret = self
            .master_secret
            .as_ref()
            .ok_or_else(|| Error::ErrDtlsHandshakeFailed("not connected yet".into()))?;
        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(&self.client_random);
        seed.extend_from_slice(&self.server_random);
        Ok(handshake::prf(master_secret, label.as_bytes(), &seed, length))
    }
}

fn fill_random(buf: &mut [u8]) {
    use rand::RngCore;
    rand::rng().fill_bytes(buf);
}

#[cfg(test)]
mod transport_test {
    use super::*;

    #[test]
    fn client_and_server_complete_a_handshake() {
        let client_cert = SelfSignedCert::generate().unwrap();
        let server_cert = SelfSignedCert::generate().unwrap();
        let client_fp = (
            FingerprintAlgorithm::Sha256,
            FingerprintAlgorithm::Sha256.digest(&server_cert.certificate_der),
        );
        let server_fp = (
            FingerprintAlgorithm::Sha256,
            FingerprintAlgorithm::Sha256.digest(&client_cert.certificate_der),
        );

        let mut client = DtlsSrtpTransport::new(DtlsRole::Client, client_cert, client_fp);
        let mut server = DtlsSrtpTransport::new(DtlsRole::Server, server_cert, server_fp);

        let client_hello = client.start();
        let client_hello_bytes = send_bytes(&client_hello);

        let server_flight2 = server.handle_datagram(&client_hello_bytes);
        let server_flight2_bytes = send_bytes(&server_flight2);

        let client_flight3 = client.handle_datagram(&server_flight2_bytes);
        let client_flight3_bytes = send_bytes(&client_flight3);

        let server_events = server.handle_datagram(&client_flight3_bytes);
        assert!(server_events
            .iter()
            .any(|e| matches!(e, DtlsEvent::Connected)));
        let server_finished_bytes = send_bytes(
            &server_events
                .into_iter()
                .filter(|e| matches!(e, DtlsEvent::Send(_)))
                .collect::<Vec<_>>(),
        );

        let client_events = client.handle_datagram(&server_finished_bytes);
        assert!(client_events
            .iter()
            .any(|e| matches!(e, DtlsEvent::Connected)));
        assert!(client.is_connected());
        assert!(server.is_connected());

        let client_keys = client
            .export_keying_material("EXTRACTOR-dtls_srtp", &[], 60)
            .unwrap();
        let server_keys = server
            .export_keying_material("EXTRACTOR-dtls_srtp", &[], 60)
            .unwrap();
        assert_eq!(client_keys, server_keys);
    }

    fn send_bytes(events: &[DtlsEvent]) -> Vec<u8> {
        let mut out = Vec::new();
        for event in events {
            if let DtlsEvent::Send(bytes) = event {
                out.extend_from_slice(bytes);
            }
        }
        out
    }
}
