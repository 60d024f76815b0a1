#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod header;
pub mod packet;
pub mod reception_report;

pub use header::{Header, PacketType};
pub use packet::{Bye, CompoundPacket, Packet, Psfb, ReceiverReport, Rtpfb, SenderReport, Sdes};
pub use reception_report::ReceptionReport;
