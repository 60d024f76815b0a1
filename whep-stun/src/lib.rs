#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod message;

pub use message::{Attribute, Class, Message, Method};

// IANA assigned port for the "stun" protocol.
pub const DEFAULT_PORT: u16 = 3478;
