//! ETMv4 instruction trace (ETMv4-I) protocol support: packet
//! reconstruction and full decode to generic trace elements.

mod config;
mod decode;
mod packet;
mod proc;
mod stack;

pub use config::{CondTraceMode, Etmv4Config};
pub use decode::Etmv4Decoder;
pub use packet::{AddrIs, Atom, Etmv4Context, Etmv4Packet, TraceInfo};
pub use proc::Etmv4PktProc;
