//! Generic trace elements — the output side of the decode data path.
//!
//! Packet decoders reduce protocol packets to this common element set so
//! analysis tools only deal with one vocabulary regardless of which
//! trace source produced the data.

use crate::instr::{InstrType, Isa};
use crate::types::{DataPathResp, TraceIndex};

/// Security state of the PE at the point of trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SecLevel {
    Secure,
    NonSecure,
    Realm,
    Root,
}

/// Exception level of the PE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExLevel {
    El0,
    El1,
    El2,
    El3,
}

/// PE execution context. Fields are independently valid: a context
/// packet may update any subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeContext {
    pub security: Option<SecLevel>,
    pub exception_level: Option<ExLevel>,
    /// Executing in AArch64 state.
    pub bits64: bool,
    pub context_id: Option<u32>,
    pub vmid: Option<u32>,
}

/// Why a decoder is reporting loss of synchronisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnsyncReason {
    /// Initial state after decoder creation.
    InitDecoder,
    /// Decoder was reset.
    ResetDecoder,
    /// A bad packet forced a re-sync.
    BadPacket,
    /// End of trace reached.
    Eot,
}

/// Why trace output is (re)starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TraceOnReason {
    /// Normal start of trace, or restart after a gap in filtering.
    Normal,
    /// Restart after a trace-unit buffer overflow.
    Overflow,
}

/// Kind of software-trace payload carried by a [`SwTraceInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SwTraceOp {
    /// Software stimulus write (ITM SWIT / STM data).
    Swit,
    /// Hardware source payload (DWT).
    Dwt,
    /// Local timestamp, synchronous with its data packet.
    LocalTsSync,
    /// Local timestamp delayed relative to its data packet.
    LocalTsDelay,
    /// Data packet delayed relative to the event it reports.
    LocalTsPacketDelay,
    /// Both the timestamp and the data packet were delayed.
    LocalTsBothDelay,
    /// Global timestamp value.
    GlobalTs,
    /// Trace stream marker (STM FLAG).
    Marker,
    /// Trigger event (STM TRIG).
    Trigger,
    /// Timestamp clock frequency report (STM FREQ), value in Hz.
    Freq,
    /// Master / global error report (STM MERR / GERR).
    Error,
}

/// Decoded software-trace payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SwTraceInfo {
    pub op: SwTraceOp,
    /// Source of the payload: extended stimulus channel for ITM
    /// (`page << 5 | channel`), `master << 16 | channel` origin for
    /// STM, discriminator ID for DWT payloads.
    pub src_id: u32,
    /// Payload value; meaning depends on `op`.
    pub value: u64,
    /// Size of `value` in bytes as carried on the wire.
    pub value_size: u8,
    /// Accumulated timestamp for timestamp-bearing payloads.
    pub timestamp: Option<u64>,
    /// Payload carried a marker (STM marked data).
    pub marked: bool,
    /// Timestamp clock frequency changed since the last report.
    pub freq_change: bool,
    /// An overflow preceded this payload; data was lost before it.
    pub overflow: bool,
}

impl SwTraceInfo {
    pub fn new(op: SwTraceOp) -> SwTraceInfo {
        SwTraceInfo {
            op,
            src_id: 0,
            value: 0,
            value_size: 0,
            timestamp: None,
            marked: false,
            freq_change: false,
            overflow: false,
        }
    }
}

/// ETE transaction operations. Not produced by the current decoders;
/// retained so the element set covers the full taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemTransOp {
    Start,
    Commit,
    Fail,
}

/// A generic trace element, tagged on output with the trace ID and the
/// stream index of the packet that caused it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TraceElement {
    /// Decoder is not synchronised to the stream.
    NoSync { reason: UnsyncReason },
    /// Trace output has (re)started.
    TraceOn { reason: TraceOnReason },
    /// End of all trace data for this source.
    EoTrace,
    /// PE context update.
    PeContext(PeContext),
    /// An executed range of instructions `[start, end)`.
    InstrRange {
        start: u64,
        end: u64,
        isa: Isa,
        /// Classification of the final instruction in the range.
        last_i_type: InstrType,
        /// Whether the final instruction executed (its atom was E).
        last_exec: bool,
        /// The final instruction was a branch-with-link.
        last_is_link: bool,
    },
    /// Target memory was not accessible at `addr`; decode resumes on
    /// the next address packet.
    AddrNacc { addr: u64 },
    /// Trace continues at an address the decoder cannot determine.
    AddrUnknown,
    /// Exception taken.
    Exception {
        number: u16,
        /// Address the exception will return to.
        preferred_ret: u64,
    },
    /// Return from exception.
    ExceptionRet,
    /// Hardware timestamp.
    Timestamp {
        value: u64,
        cycle_count: Option<u32>,
    },
    /// Accumulated cycle count.
    CycleCount { count: u32 },
    /// Trace-unit event (resource fire / external input).
    Event { value: u16 },
    /// Software-instrumentation trace payload.
    SwTrace(SwTraceInfo),
    /// Synchronisation marker in an unformatted stream.
    SyncMarker,
    /// Memory transaction tracking (ETE).
    MemTrans { op: MemTransOp },
    /// PE instrumentation payload (ETE).
    Instrumentation { el: u8, payload: u64 },
}

/// Receiver for generic trace elements.
///
/// `index_sop` is the root index of the element: the stream position of
/// the packet that caused it. Within one trace ID elements arrive in
/// root-index order; across IDs there is no ordering guarantee.
pub trait TraceElemSink {
    fn on_element(
        &mut self,
        index_sop: TraceIndex,
        trace_id: u8,
        elem: &TraceElement,
    ) -> DataPathResp;
}

/// Element sink that collects everything it is given. Convenient for
/// tests and batch decoding.
#[derive(Debug, Default)]
pub struct ElemBuffer {
    pub elements: Vec<(TraceIndex, u8, TraceElement)>,
}

impl ElemBuffer {
    pub fn new() -> ElemBuffer {
        ElemBuffer::default()
    }
}

impl TraceElemSink for ElemBuffer {
    fn on_element(
        &mut self,
        index_sop: TraceIndex,
        trace_id: u8,
        elem: &TraceElement,
    ) -> DataPathResp {
        self.elements.push((index_sop, trace_id, elem.clone()));
        DataPathResp::Cont
    }
}
