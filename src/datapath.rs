//! Interfaces between the stages of the decode data path:
//! byte stream → packet processor → packet decoder → element sink.

use crate::element::TraceElemSink;
use crate::error::{Error, ErrorSink};
use crate::mem::MemAccMapper;
use crate::types::{DataPathResp, TraceIndex};

/// Receives typed packets from a packet processor.
///
/// The raw/unsynced/error hooks exist for monitoring and error
/// routing; they default to no-ops.
pub trait PacketSink<P> {
    fn on_packet(&mut self, index: TraceIndex, pkt: &P) -> DataPathResp;

    /// Raw bytes of a packet just delivered via `on_packet`.
    fn on_raw_packet(&mut self, _index: TraceIndex, _bytes: &[u8], _pkt: &P) {}

    /// Bytes discarded while hunting for synchronisation.
    fn on_unsynced_bytes(&mut self, _index: TraceIndex, _bytes: &[u8]) {}

    /// Structured error raised while reconstructing packets.
    fn on_error(&mut self, _err: &Error) {}
}

/// Packet sink that collects everything; for tests and packet-level
/// tooling.
#[derive(Debug)]
pub struct PacketBuffer<P> {
    pub packets: Vec<(TraceIndex, P)>,
}

impl<P> Default for PacketBuffer<P> {
    fn default() -> Self {
        PacketBuffer {
            packets: Vec::new(),
        }
    }
}

impl<P> PacketBuffer<P> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P: Clone> PacketSink<P> for PacketBuffer<P> {
    fn on_packet(&mut self, index: TraceIndex, pkt: &P) -> DataPathResp {
        self.packets.push((index, pkt.clone()));
        DataPathResp::Cont
    }
}

/// A byte-stream packet processor: reconstructs typed packets from one
/// trace source's stream. One implementation per protocol.
pub trait PacketProcessor {
    type Packet;

    /// Consume bytes starting at stream position `index`, delivering
    /// completed packets to `sink`. Returns bytes consumed and the
    /// datapath response; on `Wait` the caller flushes before
    /// re-presenting the unconsumed remainder at its original index.
    fn process(
        &mut self,
        index: TraceIndex,
        data: &[u8],
        sink: &mut dyn PacketSink<Self::Packet>,
    ) -> (usize, DataPathResp);

    /// End of trace: flush a partial packet as incomplete.
    fn eot(&mut self, sink: &mut dyn PacketSink<Self::Packet>) -> DataPathResp;

    /// Drain pending output after a `Wait`.
    fn flush(&mut self, sink: &mut dyn PacketSink<Self::Packet>) -> DataPathResp;

    /// Discard all state and return to unsynced.
    fn reset(&mut self);
}

/// Shared services a packet decoder draws on while producing elements.
pub struct DecodeCtx<'a> {
    /// Target memory for instruction walks.
    pub mem: &'a mut MemAccMapper,
    /// Where generic elements go.
    pub elem_out: &'a mut dyn TraceElemSink,
    /// Where structured errors go.
    pub errs: &'a mut dyn ErrorSink,
}

/// A protocol packet decoder: reduces typed packets to generic trace
/// elements.
pub trait PacketDecoder {
    type Packet;

    fn on_packet(
        &mut self,
        index: TraceIndex,
        pkt: &Self::Packet,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp;

    /// End of trace: emit the end-of-trace element.
    fn eot(&mut self, ctx: &mut DecodeCtx<'_>) -> DataPathResp;

    /// Continue an output operation paused by `Wait`.
    fn flush(&mut self, ctx: &mut DecodeCtx<'_>) -> DataPathResp;

    /// Discard all state and return to unsynced.
    fn reset(&mut self);
}
