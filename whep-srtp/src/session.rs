use crate::keys::{DerivedKeys, KeyingMaterial, AUTH_TAG_LEN, MASTER_SALT_LEN};
use crate::replay::ReplayWindow;
use log::warn;
use rtp::Header as RtpHeader;
use shared::crypto::{aes_cm_xor, hmac_sha1, verify_hmac_sha1};
use shared::error::{Error, Result};
use std::collections::HashMap;

struct RtpSendState {
    roc: u32,
    last_seq: Option<u16>,
}

struct RtcpRecvState {
    replay: ReplayWindow,
}

/// Per-SSRC SRTP/SRTCP protect and unprotect (RFC3711), keyed off the two
/// master key/salt pairs a completed DTLS-SRTP handshake exports: `local`
/// protects what this relay sends, `remote` authenticates (and, if
/// encrypted, decrypts) what the peer sends back.
///
/// This relay only ever originates RTP -- the upstream source feeds it
/// plaintext RTP that gets protected once per client -- so `unprotect_rtp`
/// exists for completeness and tests, not because any caller in this
/// relay's data path uses it.
pub struct SrtpSession {
    local: DerivedKeys,
    remote: DerivedKeys,
    rtp_send: HashMap<u32, RtpSendState>,
    rtp_recv: HashMap<u32, RtpSendState>,
    rtcp_send_index: u32,
    rtcp_recv: HashMap<u32, RtcpRecvState>,
}

impl SrtpSession {
    /// `local_is_client` selects which half of the exported keying material
    /// protects outbound packets: the DTLS client's write keys are the
    /// server's read keys and vice versa (RFC5764 §4.2).
    pub fn new(exported: &KeyingMaterial, local_is_client: bool) -> Self {
        let (local_key, local_salt, remote_key, remote_salt) = if local_is_client {
            (
                &exported.client_key,
                &exported.client_salt,
                &exported.server_key,
                &exported.server_salt,
            )
        } else {
            (
                &exported.server_key,
                &exported.server_salt,
                &exported.client_key,
                &exported.client_salt,
            )
        };
        SrtpSession {
            local: DerivedKeys::derive(local_key, local_salt),
            remote: DerivedKeys::derive(remote_key, remote_salt),
            rtp_send: HashMap::new(),
            rtp_recv: HashMap::new(),
            rtcp_send_index: 0,
            rtcp_recv: HashMap::new(),
        }
    }

    fn iv(salt: &[u8; MASTER_SALT_LEN], ssrc: u32, index48: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..4].copy_from_slice(&salt[..4]);
        let ssrc_be = ssrc.to_be_bytes();
        for i in 0..4 {
            iv[4 + i] = salt[4 + i] ^ ssrc_be[i];
        }
        let index_be = index48.to_be_bytes(); // u64, we use the low 6 bytes
        for i in 0..6 {
            iv[8 + i] = salt[8 + i] ^ index_be[2 + i];
        }
        iv
    }

    /// Estimate (and advance) the rollover counter for an outbound SSRC
    /// this relay itself sequences, so wraps are always exactly one per
    /// 65536 packets rather than inferred from reordering.
    fn next_send_index(&mut self, ssrc: u32, seq: u16) -> u64 {
        let state = self.rtp_send.entry(ssrc).or_insert(RtpSendState {
            roc: 0,
            last_seq: None,
        });
        if let Some(prev) = state.last_seq {
            if prev > 0xFF00 && seq < 0x00FF {
                state.roc = state.roc.wrapping_add(1);
            }
        }
        state.last_seq = Some(seq);
        ((state.roc as u64) << 16) | seq as u64
    }

    fn recv_index(&mut self, ssrc: u32, seq: u16) -> u64 {
        let state = self.rtp_recv.entry(ssrc).or_insert(RtpSendState {
            roc: 0,
            last_seq: None,
        });
        if let Some(prev) = state.last_seq {
            if prev > 0xFF00 && seq < 0x00FF {
                state.roc = state.roc.wrapping_add(1);
            } else if seq > 0xFF00 && prev < 0x00FF && state.roc > 0 {
                state.roc -= 1;
            }
        }
        state.last_seq = Some(seq);
        ((state.roc as u64) << 16) | seq as u64
    }

    /// Encrypt and authenticate `packet` (a full, unencrypted RTP datagram)
    /// with this session's local (outbound) keys.
    pub fn protect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let header = RtpHeader::unmarshal(packet)?;
        let header_len = header.marshal_size();
        let index = self.next_send_index(header.ssrc, header.sequence_number);
        let iv = Self::iv(&self.local.rtp_salt, header.ssrc, index);

        let mut ciphertext = packet[header_len..].to_vec();
        aes_cm_xor(&self.local.rtp_key, &iv, &mut ciphertext);

        let mut out = Vec::with_capacity(header_len + ciphertext.len() + AUTH_TAG_LEN);
        out.extend_from_slice(&packet[..header_len]);
        out.extend_from_slice(&ciphertext);

        let roc = (index >> 16) as u32;
        let mut auth_input = out.clone();
        auth_input.extend_from_slice(&roc.to_be_bytes());
        let tag = hmac_sha1(&self.local.rtp_auth, &auth_input, AUTH_TAG_LEN);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verify and decrypt an inbound SRTP packet with this session's
    /// remote keys.
    pub fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < AUTH_TAG_LEN {
            return Err(Error::ErrBufferShort {
                need: AUTH_TAG_LEN,
                have: packet.len(),
            });
        }
        let (body, tag) = packet.split_at(packet.len() - AUTH_TAG_LEN);
        let header = RtpHeader::unmarshal(body)?;
        let header_len = header.marshal_size();
        let index = self.recv_index(header.ssrc, header.sequence_number);
        let roc = (index >> 16) as u32;

        let mut auth_input = body.to_vec();
        auth_input.extend_from_slice(&roc.to_be_bytes());
        if !verify_hmac_sha1(&self.remote.rtp_auth, &auth_input, tag) {
            return Err(Error::ErrSrtpAuthFailed);
        }

        let iv = Self::iv(&self.remote.rtp_salt, header.ssrc, index);
        let mut plaintext = body[header_len..].to_vec();
        aes_cm_xor(&self.remote.rtp_key, &iv, &mut plaintext);

        let mut out = Vec::with_capacity(header_len + plaintext.len());
        out.extend_from_slice(&body[..header_len]);
        out.extend_from_slice(&plaintext);
        Ok(out)
    }

    /// Encrypt and authenticate an outbound compound RTCP packet (RFC3711
    /// §3.4): the first packet's 8-byte header (including its SSRC) stays
    /// in the clear, everything after it is encrypted.
    pub fn protect_rtcp(&mut self, compound: &[u8]) -> Result<Vec<u8>> {
        if compound.len() < 8 {
            return Err(Error::ErrRtcpHeaderTooShort);
        }
        let ssrc = u32::from_be_bytes([compound[4], compound[5], compound[6], compound[7]]);
        let index = (self.rtcp_send_index & 0x7FFF_FFFF) as u64;
        self.rtcp_send_index = self.rtcp_send_index.wrapping_add(1) & 0x7FFF_FFFF;

        let iv = Self::iv(&self.local.rtcp_salt, ssrc, index);
        let mut ciphertext = compound[8..].to_vec();
        aes_cm_xor(&self.local.rtcp_key, &iv, &mut ciphertext);

        let trailer = (1u32 << 31) | index as u32; // E-bit always set: this relay always encrypts

        let mut out = Vec::with_capacity(compound.len() + 4 + AUTH_TAG_LEN);
        out.extend_from_slice(&compound[..8]);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&trailer.to_be_bytes());

        let tag = hmac_sha1(&self.local.rtcp_auth, &out, AUTH_TAG_LEN);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Verify and, if the E-bit is set, decrypt an inbound SRTCP packet
    /// (feedback from a client) with this session's remote keys.
    pub fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < 8 + 4 + AUTH_TAG_LEN {
            return Err(Error::ErrBufferShort {
                need: 8 + 4 + AUTH_TAG_LEN,
                have: packet.len(),
            });
        }
        let (signed, tag) = packet.split_at(packet.len() - AUTH_TAG_LEN);
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);

        let state = self
            .rtcp_recv
            .entry(ssrc)
            .or_insert_with(|| RtcpRecvState {
                replay: ReplayWindow::new(),
            });
        let trailer_offset = signed.len() - 4;
        let trailer = u32::from_be_bytes([
            signed[trailer_offset],
            signed[trailer_offset + 1],
            signed[trailer_offset + 2],
            signed[trailer_offset + 3],
        ]);
        let encrypted = trailer & 0x8000_0000 != 0;
        let index = (trailer & 0x7FFF_FFFF) as u64;

        if !state.replay.check_and_update(index) {
            warn!("srtcp: dropping replayed packet from ssrc {ssrc}");
            return Err(Error::ErrSrtpReplay);
        }
        if !verify_hmac_sha1(&self.remote.rtcp_auth, signed, tag) {
            return Err(Error::ErrSrtpAuthFailed);
        }

        let header = &signed[..8];
        let mut payload = signed[8..trailer_offset].to_vec();
        if encrypted {
            let iv = Self::iv(&self.remote.rtcp_salt, ssrc, index);
            aes_cm_xor(&self.remote.rtcp_key, &iv, &mut payload);
        }

        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(header);
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

#[cfg(test)]
mod session_test {
    use super::*;

    fn sample_keying_material() -> KeyingMaterial {
        let mut bytes = vec![0u8; 60];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        KeyingMaterial::from_exported(&bytes).unwrap()
    }

    fn sample_rtp_packet(ssrc: u32, seq: u16) -> Vec<u8> {
        let header = RtpHeader {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: 1000,
            ssrc,
            ..Default::default()
        };
        let mut out = header.marshal().unwrap();
        out.extend_from_slice(b"audio payload bytes");
        out
    }

    #[test]
    fn rtp_protect_unprotect_roundtrip() {
        let km = sample_keying_material();
        let mut sender = SrtpSession::new(&km, false);
        let mut receiver = SrtpSession::new(&km, true);

        let plaintext = sample_rtp_packet(0xCAFEBABE, 1);
        let protected = sender.protect_rtp(&plaintext).unwrap();
        assert_ne!(&protected[12..protected.len() - 10], &plaintext[12..]);

        let recovered = receiver.unprotect_rtp(&protected).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn rtp_tampered_tag_is_rejected() {
        let km = sample_keying_material();
        let mut sender = SrtpSession::new(&km, false);
        let mut receiver = SrtpSession::new(&km, true);

        let plaintext = sample_rtp_packet(1, 1);
        let mut protected = sender.protect_rtp(&plaintext).unwrap();
        let last = protected.len() - 1;
        protected[last] ^= 0xFF;

        assert_eq!(receiver.unprotect_rtp(&protected), Err(Error::ErrSrtpAuthFailed));
    }

    #[test]
    fn rtcp_protect_unprotect_roundtrip() {
        let km = sample_keying_material();
        let mut sender = SrtpSession::new(&km, false);
        let mut receiver = SrtpSession::new(&km, true);

        let mut rr = vec![0x80 | 1, 201, 0, 7];
        rr.extend_from_slice(&0xAAAA_BBBBu32.to_be_bytes());
        rr.extend_from_slice(&[0u8; 24]);

        let protected = sender.protect_rtcp(&rr).unwrap();
        let recovered = receiver.unprotect_rtcp(&protected).unwrap();
        assert_eq!(recovered, rr);
    }

    #[test]
    fn rtcp_replay_is_rejected() {
        let km = sample_keying_material();
        let mut sender = SrtpSession::new(&km, false);
        let mut receiver = SrtpSession::new(&km, true);

        let mut rr = vec![0x80 | 1, 201, 0, 7];
        rr.extend_from_slice(&1u32.to_be_bytes());
        rr.extend_from_slice(&[0u8; 24]);

        let protected = sender.protect_rtcp(&rr).unwrap();
        receiver.unprotect_rtcp(&protected).unwrap();
        assert_eq!(
            receiver.unprotect_rtcp(&protected),
            Err(Error::ErrSrtpReplay)
        );
    }
}
