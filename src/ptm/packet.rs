//! PTM protocol packets.

/// Why an I-sync packet was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IsyncReason {
    /// Periodic synchronisation.
    Periodic,
    /// Trace enable / restart.
    TraceOn,
    /// Restart after a trace unit overflow.
    Overflow,
    /// Exit from debug state.
    DebugExit,
}

/// A reconstructed PTM packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PtmPacket {
    /// Processor is not synchronised; emitted once per unsynced
    /// episode.
    NotSync,
    /// Partial packet flushed at end of trace.
    IncompleteEot,
    /// Alignment synchronisation: five `0x00` then `0x80`.
    Async,
    /// Instruction synchronisation: full address, state and context.
    Isync {
        addr: u32,
        /// T32 state at the address.
        thumb: bool,
        /// Non-secure state.
        ns: bool,
        reason: IsyncReason,
        ctxt_id: Option<u32>,
        cycle_count: Option<u32>,
    },
    /// Branch outcome atoms: `count` atoms, bit 0 of `en_bits` oldest,
    /// set = E.
    Atom {
        count: u8,
        en_bits: u32,
        cycle_count: Option<u32>,
    },
    /// Taken indirect branch or exception entry; `addr` is the full
    /// reconstructed target.
    BranchAddr {
        addr: u32,
        thumb: bool,
        /// Exception number when the branch is an exception entry.
        exception: Option<u16>,
        ns: bool,
    },
    /// Waypoint address update without an executed branch (e.g. after
    /// branch broadcasting gaps).
    WaypointUpdate { addr: u32, thumb: bool },
    /// Trigger event.
    Trigger,
    /// Context ID changed.
    ContextId { id: u32 },
    /// VMID changed.
    Vmid { vmid: u8 },
    /// Hardware timestamp.
    Timestamp { ts: u64, cycle_count: Option<u32> },
    /// Return from exception.
    ExceptionRet,
    /// Ignore / padding packet.
    Ignore,
    /// Packet abandoned over a protocol violation.
    BadSequence,
    /// Header byte is reserved.
    Reserved { header: u8 },
}

impl PtmPacket {
    pub fn is_bad(&self) -> bool {
        matches!(self, PtmPacket::BadSequence | PtmPacket::Reserved { .. })
    }
}
