#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod cert;
pub mod handshake;
pub mod record;
pub mod transport;

pub use cert::SelfSignedCert;
pub use transport::{DtlsEvent, DtlsRole, DtlsSrtpTransport};
