#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod error;
pub mod session;

pub use error::SdpError;
pub use session::{
    Candidate, CandidateType, Fingerprint, MediaDescription, MediaType, SessionDescription,
    SetupRole, SsrcAttribute,
};
