//! STM protocol packets.

/// Timestamp encoding selected by the version packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StmTsType {
    /// Natural binary timestamps (version 3).
    NatBinary,
    /// Grey-coded timestamps (version 4).
    Grey,
}

/// A reconstructed STM packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StmPacket {
    /// Processor is not synchronised; emitted once per unsynced
    /// episode.
    NotSync,
    /// Partial packet flushed at end of trace.
    IncompleteEot,
    /// Alignment synchronisation: twenty-one `0xF` nibbles then `0x0`.
    Async,
    /// Protocol version; selects the timestamp encoding.
    Version { version: u8, ts_type: StmTsType },
    /// Null padding packet.
    Null,
    /// Select the current master; the channel resets to 0.
    Master { master: u8 },
    /// Master error report.
    MErr { err: u8 },
    /// Global error report.
    GErr { err: u8 },
    /// Select the current channel within the master.
    Channel { channel: u16 },
    /// Data payload on the current master:channel.
    Data {
        data: u64,
        /// Payload size in bytes: 1, 2, 4 or 8.
        size: u8,
        /// Data carried a marker.
        marked: bool,
        /// Raw timestamp attached to the payload (encoding resolved by
        /// the packet processor via the version packet).
        ts: Option<u64>,
    },
    /// Flag marker, optionally timestamped.
    Flag { ts: Option<u64> },
    /// Trigger event, optionally timestamped.
    Trig { value: u8, ts: Option<u64> },
    /// Timestamp clock frequency in Hz.
    Freq { hz: u32 },
    /// Packet abandoned over a protocol violation.
    BadSequence,
    /// Opcode is reserved; value records the offending nibble path.
    Reserved { opcode: u16 },
}

impl StmPacket {
    pub fn is_bad(&self) -> bool {
        matches!(self, StmPacket::BadSequence | StmPacket::Reserved { .. })
    }
}
