use crate::candidate::{candidate_priority, CandidatePair, CandidateType, IceCandidate, PairState};
use log::{debug, warn};
use rand::Rng;
use shared::error::{Error, Result};
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use stun::message::{Attribute, Class, Message, Method};

const MIN_UFRAG_LEN: usize = 4;
const MIN_PWD_LEN: usize = 22;
const MAX_CHECK_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_OVERALL_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
}

/// Events the agent surfaces to `PeerConnection` as an explicit,
/// capability-typed handler rather than a dynamic subscriber list.
#[derive(Debug, Clone)]
pub enum IceEvent {
    GatheringStateChanged(GatheringState),
    ConnectionStateChanged(ConnectionState),
    /// A pair was nominated; this is the remote endpoint to send media to
    /// from now on.
    Nominated(SocketAddr),
    /// A STUN packet must be sent to `dest`.
    Send { dest: SocketAddr, bytes: Vec<u8> },
}

fn random_string(n: usize, alphabet: &[u8]) -> String {
    let mut rng = rand::rng();
    (0..n)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}

const ALPHANUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Host-candidate gathering, STUN connectivity checks, and candidate-pair
/// nomination for a single peer. Drives as a sans-io state machine:
/// `handle_stun`/`poll_checks` are called by the demux classifier and a
/// periodic tick from `PeerConnection`, which owns the actual socket.
pub struct IceAgent {
    pub local_ufrag: String,
    pub local_pwd: String,
    pub remote_ufrag: Option<String>,
    pub remote_pwd: Option<String>,
    pub controlling: bool,
    pub local_candidates: Vec<IceCandidate>,
    pub remote_candidates: Vec<IceCandidate>,
    pub gathering_state: GatheringState,
    pub connection_state: ConnectionState,
    pairs: Vec<CandidatePair>,
    nominated_remote: Option<SocketAddr>,
    started_at: Option<Instant>,
    overall_budget: Duration,
    tie_breaker: u64,
}

impl IceAgent {
    pub fn new(controlling: bool) -> Self {
        let mut rng = rand::rng();
        IceAgent {
            local_ufrag: random_string(MIN_UFRAG_LEN + 4, ALPHANUM),
            local_pwd: random_string(MIN_PWD_LEN + 2, ALPHANUM),
            remote_ufrag: None,
            remote_pwd: None,
            controlling,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
            gathering_state: GatheringState::New,
            connection_state: ConnectionState::New,
            pairs: Vec::new(),
            nominated_remote: None,
            started_at: None,
            overall_budget: DEFAULT_OVERALL_BUDGET,
            tie_breaker: rng.random(),
        }
    }

    /// Gather local host candidates by discovering the address the kernel
    /// would use to route to the public internet and binding `bind_port`
    /// there. This mirrors the lightweight "connect a UDP socket, read
    /// local_addr()" trick rather than full multi-interface enumeration;
    /// see DESIGN.md.
    pub fn gather_host_candidates(&mut self, bound: SocketAddr) -> Result<()> {
        self.gathering_state = GatheringState::Gathering;
        let probe = UdpSocket::bind("0.0.0.0:0")?;
        let _ = probe.connect("8.8.8.8:80");
        let local_ip = probe
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or(bound.ip());

        let addr = SocketAddr::new(local_ip, bound.port());
        if !addr.ip().is_loopback() {
            self.local_candidates.push(IceCandidate {
                foundation: "1".to_owned(),
                component: 1,
                priority: candidate_priority(CandidateType::Host, 1),
                address: addr,
                typ: CandidateType::Host,
            });
        }
        self.gathering_state = GatheringState::Complete;
        Ok(())
    }

    pub fn set_remote_credentials(&mut self, ufrag: String, pwd: String) {
        self.remote_ufrag = Some(ufrag);
        self.remote_pwd = Some(pwd);
        if self.connection_state == ConnectionState::New {
            self.connection_state = ConnectionState::Checking;
            self.started_at = Some(Instant::now());
        }
    }

    /// Accepts a remote candidate of any type; only the component is
    /// validated since RTCP-mux makes component 1 mandatory.
    pub fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if candidate.component != 1 {
            return Err(Error::ErrIceBadComponent);
        }
        for local in self.local_candidates.clone() {
            self.pairs.push(CandidatePair::new(local, candidate.clone()));
        }
        self.remote_candidates.push(candidate);
        Ok(())
    }

    fn integrity_key_outbound(&self) -> Option<&str> {
        self.remote_pwd.as_deref()
    }

    fn integrity_key_inbound(&self) -> &str {
        &self.local_pwd
    }

    /// Build and send connectivity checks for every pair not yet succeeded,
    /// respecting each pair's exponential back-off. Returns `Send` events
    /// for `PeerConnection` to actually write to the socket (the agent
    /// never owns the socket itself).
    pub fn poll_checks(&mut self, now: Instant) -> Vec<IceEvent> {
        let mut events = Vec::new();
        if self.connection_state == ConnectionState::Failed
            || self.connection_state == ConnectionState::Completed
        {
            return events;
        }
        if let Some(started) = self.started_at {
            if now.duration_since(started) > self.overall_budget
                && !self.pairs.iter().any(|p| p.state == PairState::Succeeded)
            {
                self.connection_state = ConnectionState::Failed;
                events.push(IceEvent::ConnectionStateChanged(ConnectionState::Failed));
                return events;
            }
        }

        let Some(remote_pwd) = self.integrity_key_outbound().map(str::to_owned) else {
            return events;
        };
        let remote_ufrag = self.remote_ufrag.clone().unwrap_or_default();
        let local_ufrag = self.local_ufrag.clone();

        for pair in self.pairs.iter_mut() {
            if pair.state == PairState::Succeeded || pair.state == PairState::Failed {
                continue;
            }
            let backoff = Duration::from_millis(50u64.saturating_mul(1 << pair.attempts.min(4)))
                .min(MAX_CHECK_BACKOFF);
            if let Some(last) = pair.last_sent {
                if now.duration_since(last) < backoff {
                    continue;
                }
            }

            let mut rng = rand::rng();
            let tx: [u8; 12] = rng.random();
            let mut msg = Message::new_binding_request(tx);
            msg.attributes
                .push(Attribute::Username(format!("{remote_ufrag}:{local_ufrag}")));
            msg.attributes.push(Attribute::Priority(pair.local.priority));
            if self.controlling {
                msg.attributes.push(Attribute::IceControlling(self.tie_breaker));
                msg.attributes.push(Attribute::UseCandidate);
            } else {
                msg.attributes.push(Attribute::IceControlled(self.tie_breaker));
            }
            let bytes = msg.marshal(Some(remote_pwd.as_bytes()), true);

            pair.outstanding_tx = Some(tx);
            pair.attempts += 1;
            pair.last_sent = Some(now);
            pair.state = PairState::InProgress;

            events.push(IceEvent::Send {
                dest: pair.remote.address,
                bytes,
            });
        }
        events
    }

    /// Handle an inbound STUN datagram (request or response) from `from`.
    pub fn handle_stun(&mut self, buf: &[u8], from: SocketAddr) -> Vec<IceEvent> {
        let mut events = Vec::new();
        let Ok(msg) = Message::unmarshal(buf) else {
            warn!("ice: dropping malformed STUN datagram from {from}");
            return events;
        };

        match msg.class {
            Class::Request if msg.method == Method::Binding => {
                // Each agent verifies MESSAGE-INTEGRITY with its own local
                // pwd, so two peers that happen to share a (spoofed) remote
                // ufrag never cross-match: the key is always this agent's
                // own password, not anything derived from the other peer.
                if Message::verify_message_integrity(buf, self.integrity_key_inbound().as_bytes())
                    .is_err()
                {
                    debug!("ice: integrity check failed for request from {from}");
                    return events;
                }
                let use_candidate = msg
                    .attributes
                    .iter()
                    .any(|a| matches!(a, Attribute::UseCandidate));

                let mut response = Message::new_binding_success(msg.transaction_id);
                response
                    .attributes
                    .push(Attribute::XorMappedAddress(from));
                let bytes = response.marshal(Some(self.local_pwd.as_bytes()), true);
                events.push(IceEvent::Send { dest: from, bytes });

                if use_candidate {
                    self.nominate(from, &mut events);
                }
            }
            Class::SuccessResponse if msg.method == Method::Binding => {
                if let Some(pair) = self
                    .pairs
                    .iter_mut()
                    .find(|p| p.outstanding_tx == Some(msg.transaction_id))
                {
                    pair.state = PairState::Succeeded;
                    pair.outstanding_tx = None;
                    let remote = pair.remote.address;
                    let controlling = self.controlling;
                    drop(pair);
                    if controlling {
                        self.nominate(remote, &mut events);
                    } else if self.nominated_remote.is_none() {
                        // Controlled side nominates on the peer's
                        // USE-CANDIDATE request, not on its own success
                        // response; nothing further to do here.
                    }
                }
            }
            _ => {}
        }
        events
    }

    fn nominate(&mut self, remote: SocketAddr, events: &mut Vec<IceEvent>) {
        if let Some(pair) = self.pairs.iter_mut().find(|p| p.remote.address == remote) {
            pair.nominated = true;
        }
        let first_nomination = self.nominated_remote.is_none();
        self.nominated_remote = Some(remote);
        if first_nomination {
            events.push(IceEvent::Nominated(remote));
            if self.connection_state != ConnectionState::Completed {
                self.connection_state = ConnectionState::Connected;
                events.push(IceEvent::ConnectionStateChanged(ConnectionState::Connected));
            }
        }
    }

    pub fn nominated_remote(&self) -> Option<SocketAddr> {
        self.nominated_remote
    }
}

#[cfg(test)]
mod agent_test {
    use super::*;

    fn pair_of_agents() -> (IceAgent, IceAgent) {
        let mut controlling = IceAgent::new(true);
        let mut controlled = IceAgent::new(false);
        controlling
            .gather_host_candidates("127.0.0.1:6000".parse().unwrap())
            .unwrap();
        controlled
            .gather_host_candidates("127.0.0.1:6001".parse().unwrap())
            .unwrap();
        // Loopback won't pass the is_loopback filter, so inject a
        // deterministic fake candidate for the test instead.
        controlling.local_candidates = vec![IceCandidate {
            foundation: "1".into(),
            component: 1,
            priority: candidate_priority(CandidateType::Host, 1),
            address: "203.0.113.10:6000".parse().unwrap(),
            typ: CandidateType::Host,
        }];
        controlled.local_candidates = vec![IceCandidate {
            foundation: "1".into(),
            component: 1,
            priority: candidate_priority(CandidateType::Host, 1),
            address: "203.0.113.20:6001".parse().unwrap(),
            typ: CandidateType::Host,
        }];

        controlling.set_remote_credentials(controlled.local_ufrag.clone(), controlled.local_pwd.clone());
        controlled.set_remote_credentials(controlling.local_ufrag.clone(), controlling.local_pwd.clone());

        controlling
            .add_remote_candidate(controlled.local_candidates[0].clone())
            .unwrap();
        controlled
            .add_remote_candidate(controlling.local_candidates[0].clone())
            .unwrap();
        (controlling, controlled)
    }

    #[test]
    fn full_check_exchange_nominates_both_sides() {
        let (mut a, mut b) = pair_of_agents();
        let now = Instant::now();

        let a_events = a.poll_checks(now);
        let request = a_events
            .iter()
            .find_map(|e| match e {
                IceEvent::Send { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .expect("controlling agent sends a check");

        let b_events = b.handle_stun(&request, "203.0.113.10:6000".parse().unwrap());
        let response = b_events
            .iter()
            .find_map(|e| match e {
                IceEvent::Send { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .expect("controlled agent responds");
        assert!(b_events
            .iter()
            .any(|e| matches!(e, IceEvent::Nominated(_))));

        let a_events2 = a.handle_stun(&response, "203.0.113.20:6001".parse().unwrap());
        assert!(a_events2
            .iter()
            .any(|e| matches!(e, IceEvent::Nominated(_))));
        assert_eq!(a.connection_state, ConnectionState::Connected);
        assert_eq!(b.connection_state, ConnectionState::Connected);
    }

    #[test]
    fn mismatched_password_never_cross_matches() {
        let (mut a, _b) = pair_of_agents();
        let now = Instant::now();
        let a_events = a.poll_checks(now);
        let request = a_events
            .iter()
            .find_map(|e| match e {
                IceEvent::Send { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .unwrap();

        let mut adversary = IceAgent::new(false);
        adversary.local_pwd = "completely-different-password-value".to_owned();
        let events = adversary.handle_stun(&request, "203.0.113.10:6000".parse().unwrap());
        // No Send event: integrity check against the wrong local_pwd fails.
        assert!(events.is_empty());
    }
}
