//! # `coresight-decode`
//!
//! A decoding library for ARM CoreSight off-chip trace streams. The
//! library ingests raw bytes captured from a trace sink, separates the
//! interleaved per-source streams carried in 16-byte CoreSight frames,
//! reconstructs protocol packets (ETMv4 instruction trace, PTM, ITM
//! and STM) and reduces them to an ordered stream of generic trace
//! elements — instruction ranges, exceptions, context updates,
//! timestamps, events and software-trace payloads — usable by analysis
//! tools.
//!
//! The usual entry point is a [`DecodeTree`]: one decode channel per
//! trace ID behind the frame demultiplexer, sharing a target
//! [memory mapper](mem::MemAccMapper) for the instruction walks.
//! The per-protocol [packet processors](datapath::PacketProcessor) and
//! [packet decoders](datapath::PacketDecoder) can also be driven
//! individually for packet-level tooling.
//!
//! ```
//! use coresight_decode::element::ElemBuffer;
//! use coresight_decode::frame::{DemuxFlags, FrameMux};
//! use coresight_decode::itm::ItmConfig;
//! use coresight_decode::tree::{DecodeTree, TreeSrc};
//! use coresight_decode::types::{DataPathOp, TraceId};
//!
//! let mut tree = DecodeTree::new(TreeSrc::Formatted(DemuxFlags::FRAME_MEM_ALIGNED));
//! tree.add_itm_decoder(ItmConfig::new(0x0001_0000)).unwrap();
//!
//! // an ITM sync sequence followed by a one-byte stimulus write,
//! // wrapped into a CoreSight frame on trace ID 0x01
//! let mut mux = FrameMux::new();
//! mux.mux_data(
//!     &[0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x19, 0xBB],
//!     TraceId::new(0x01).unwrap(),
//!     true,
//! );
//! let frames = mux.take_frames();
//!
//! let mut out = ElemBuffer::new();
//! let (used, resp) = tree.trace_data_in(DataPathOp::Data, 0, &frames, &mut out);
//! assert_eq!(used, frames.len());
//! assert!(resp.is_cont());
//! assert!(!out.elements.is_empty());
//! ```
//!
//! Control flow is single-threaded and cooperative: every stage
//! returns a [datapath response](types::DataPathResp) that may ask the
//! caller to pause (`Wait`) and flush before supplying more data. The
//! library takes no locks; a tree must not be shared across threads.
#![deny(rustdoc::broken_intra_doc_links)]

pub mod datapath;
pub mod element;
pub mod error;
pub mod etmv4;
pub mod frame;
pub mod instr;
pub mod itm;
pub mod mem;
pub mod ptm;
pub mod stm;
pub mod tree;
pub mod types;

pub use datapath::{DecodeCtx, PacketDecoder, PacketProcessor, PacketSink};
pub use element::{TraceElemSink, TraceElement};
pub use error::{Error, ErrorKind, ErrorSink, Severity};
pub use tree::{DecodeTree, TreeSrc};
pub use types::{DataPathOp, DataPathResp, OpFlags, TraceId, TraceIndex};
