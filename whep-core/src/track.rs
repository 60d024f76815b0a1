use rand::Rng;

/// The single outbound video track this relay forwards to every peer: one
/// ingest feed, many WHEP clients. Each peer gets its own `LocalTrack` so
/// SSRC and sequence numbering are per-peer, even though every peer relays
/// the same upstream payload.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub ssrc: u32,
    pub payload_type: u8,
    pub cname: String,
    next_sequence_number: u16,
}

impl LocalTrack {
    pub fn new(payload_type: u8, cname: impl Into<String>) -> Self {
        let mut rng = rand::rng();
        LocalTrack {
            ssrc: rng.random(),
            payload_type,
            cname: cname.into(),
            next_sequence_number: rng.random(),
        }
    }

    /// Claim the next sequence number for a packet forwarded on this track.
    /// Monotonic modulo 2^16: every call advances by exactly one, wrapping
    /// is not an error.
    pub fn next_sequence_number(&mut self) -> u16 {
        let seq = self.next_sequence_number;
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
        seq
    }
}

#[cfg(test)]
mod track_test {
    use super::*;

    #[test]
    fn sequence_numbers_advance_monotonically_and_wrap() {
        let mut track = LocalTrack::new(96, "relay");
        track.next_sequence_number = 0xFFFF;
        assert_eq!(track.next_sequence_number(), 0xFFFF);
        assert_eq!(track.next_sequence_number(), 0);
        assert_eq!(track.next_sequence_number(), 1);
    }
}
