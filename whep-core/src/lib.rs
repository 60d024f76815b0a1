#![warn(rust_2018_idioms)]

//! Ties the sans-io codec and transport crates together into one running
//! relay: a `UdpIngress` feeding a `StreamMultiplexer` of `PeerConnection`s,
//! driven through the `RelayControl` surface.

pub mod config;
pub mod control;
pub mod demux;
pub mod ingress;
pub mod multiplexer;
pub mod peer;
pub mod queue;
pub mod track;

pub use config::RelayConfig;
pub use control::{is_terminal, RelayControl};
pub use ingress::UdpIngress;
pub use multiplexer::StreamMultiplexer;
pub use peer::{PeerConnection, PeerEvent, PeerEventHandler, PeerId, PeerState};
pub use track::LocalTrack;
