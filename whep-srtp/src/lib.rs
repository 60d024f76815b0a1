#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod keys;
pub mod replay;
pub mod session;

pub use keys::KeyingMaterial;
pub use session::SrtpSession;
