//! ETMv4-I protocol packets.

/// Instruction-set-state bit carried by address packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddrIs {
    /// A32 (AArch32 Arm) or A64 addresses, 4-byte aligned.
    Is0,
    /// T32 addresses, 2-byte aligned.
    Is1,
}

/// A compressed branch-outcome vector: up to 32 atoms, bit 0 oldest,
/// set bit = E (executed / taken).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Atom {
    pub count: u8,
    pub en_bits: u32,
}

impl Atom {
    pub fn one(executed: bool) -> Atom {
        Atom {
            count: 1,
            en_bits: executed as u32,
        }
    }
}

/// Fields of a trace-info packet; these seed the decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceInfo {
    pub cc_enabled: bool,
    pub cond_enabled: bool,
    pub p0_load: bool,
    pub p0_store: bool,
    /// Current P0 right-hand key.
    pub p0_key: u32,
    /// Speculation depth at the point trace was enabled.
    pub curr_spec_depth: u32,
    /// Cycle count threshold.
    pub cc_threshold: u32,
}

/// PE context carried by context / address-with-context packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Etmv4Context {
    /// The packet carried a payload; a bare "same context" packet
    /// leaves this clear and the decoder ignores it.
    pub updated: bool,
    /// Exception level 0–3.
    pub el: u8,
    /// AArch64 execution state.
    pub sf: bool,
    /// Non-secure state.
    pub ns: bool,
    pub updated_c: bool,
    pub ctxt_id: u32,
    pub updated_v: bool,
    pub vmid: u32,
}

/// A reconstructed ETMv4-I packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Etmv4Packet {
    /// Processor is not synchronised; emitted once per unsynced
    /// episode.
    NotSync,
    /// Partial packet flushed at end of trace.
    IncompleteEot,
    /// Alignment synchronisation: eleven `0x00` then `0x80`.
    Async,
    /// Trace parameters at (re)start of trace.
    TraceInfo(TraceInfo),
    /// Trace activated / restart after discontinuity.
    TraceOn,
    /// Trace unit buffer overflowed; data lost.
    Overflow,
    /// Trace discarded while disabled; speculation state dropped.
    Discard,
    /// Hardware timestamp, optionally with a cycle count when cycle
    /// counting is programmed.
    Timestamp { ts: u64, cc: Option<u32> },
    /// Exception taken. `prev_same` indicates the preferred return
    /// address equals the last traced address.
    Exception { number: u16, prev_same: bool },
    /// Return from exception. Countable P0 on v7-M cores only.
    ExceptionReturn,
    /// Accumulated cycle count.
    CycleCount { count: u32 },
    /// Commit the oldest `count` speculative P0 elements.
    Commit { count: u32 },
    /// Cancel the newest `count` speculative P0 elements;
    /// `mispredict` flips the most recent remaining atom afterwards.
    Cancel { count: u32, mispredict: bool },
    /// The newest uncommitted atom was mispredicted; its outcome
    /// inverts.
    Mispredict,
    /// Trace unit event resource fired; 4-bit position mask.
    Event { mask: u8 },
    /// PE context update.
    Context(Etmv4Context),
    /// Long-form target address with context.
    AddrCtxt {
        addr: u64,
        is: AddrIs,
        bits64: bool,
        ctxt: Etmv4Context,
    },
    /// Target address equals address-register-stack entry `idx`.
    AddrMatch { idx: u8 },
    /// Short-form address: low `bits` bits of the target; the rest
    /// come from the newest stack entry.
    AddrShort { addr: u32, bits: u8, is: AddrIs },
    /// Long-form target address.
    AddrLong { addr: u64, is: AddrIs, bits64: bool },
    /// Branch-outcome atoms (any wire format F1–F6).
    Atom(Atom),
    /// Q packet: instructions executed without branch history.
    /// Recognised but not supported by the decoder.
    Q,
    /// Conditional instruction / flush / result packets. Recognised
    /// but not supported by the decoder.
    Cond,
    /// Packet abandoned over a protocol violation.
    BadSequence,
    /// Header byte is reserved.
    Reserved { header: u8 },
}

impl Etmv4Packet {
    pub fn is_bad(&self) -> bool {
        matches!(self, Etmv4Packet::BadSequence | Etmv4Packet::Reserved { .. })
    }

    /// Whether this packet is an address element for the decoder's
    /// exception sequence tracking.
    pub fn is_address(&self) -> bool {
        matches!(
            self,
            Etmv4Packet::AddrCtxt { .. }
                | Etmv4Packet::AddrMatch { .. }
                | Etmv4Packet::AddrShort { .. }
                | Etmv4Packet::AddrLong { .. }
        )
    }
}
