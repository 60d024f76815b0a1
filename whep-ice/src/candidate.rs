use std::net::SocketAddr;

/// An ICE candidate tuple (RFC8445 §5.1.1). Component is always 1: RTCP-mux
/// is mandatory, so there is never a separate RTCP component to gather or
/// pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub priority: u32,
    pub address: SocketAddr,
    pub typ: CandidateType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

/// RFC8445 §5.1.2.1 priority formula, local-preference fixed at 65535
/// since this relay gathers at most one candidate per (interface, family).
pub fn candidate_priority(typ: CandidateType, component: u16) -> u32 {
    let local_pref: u32 = 65535;
    (typ.type_preference() << 24) | (local_pref << 8) | (256 - component as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: IceCandidate,
    pub remote: IceCandidate,
    pub state: PairState,
    pub nominated: bool,
    /// STUN transaction id of the most recently sent check on this pair,
    /// used to match the response.
    pub(crate) outstanding_tx: Option<[u8; 12]>,
    pub(crate) attempts: u32,
    pub(crate) last_sent: Option<std::time::Instant>,
}

impl CandidatePair {
    pub fn new(local: IceCandidate, remote: IceCandidate) -> Self {
        CandidatePair {
            local,
            remote,
            state: PairState::Waiting,
            nominated: false,
            outstanding_tx: None,
            attempts: 0,
            last_sent: None,
        }
    }

    /// RFC8445 §6.1.2.3 pair priority (32-bit components, assumes the
    /// controlled side's component-level priority is the same relay-local
    /// convention used for `local`).
    pub fn priority(&self, controlling: bool) -> u64 {
        let (g, d) = if controlling {
            (self.local.priority as u64, self.remote.priority as u64)
        } else {
            (self.remote.priority as u64, self.local.priority as u64)
        };
        (g.min(d) << 32) + (g.max(d) << 1) + if g > d { 1 } else { 0 }
    }
}
