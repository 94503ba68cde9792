//! ITM protocol packets.

/// A reconstructed ITM packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ItmPacket {
    /// Processor is not synchronised; emitted once per unsynced
    /// episode.
    NotSync,

    /// Partial packet flushed at end of trace.
    IncompleteEot,

    /// Synchronisation packet: five or more `0x00` bytes then `0x80`.
    Async,

    /// Data was lost in the trace unit (stimulus buffer full or local
    /// timestamp counter overflow).
    Overflow,

    /// Software stimulus write.
    Swit {
        /// Stimulus channel, 0–31. Extended to 9 bits by the decoder
        /// using the current stimulus page.
        channel: u8,
        value: u32,
        /// Payload size in bytes: 1, 2 or 4.
        size: u8,
    },

    /// Hardware source (DWT) payload.
    Dwt {
        /// Discriminator ID, 0–31.
        disc: u8,
        value: u32,
        size: u8,
    },

    /// Local timestamp delta.
    LocalTs {
        /// Relationship with the associated data packet (TC field):
        /// 0 sync, 1 timestamp delayed, 2 packet delayed, 3 both.
        tc: u8,
        ts: u32,
        /// Encoded payload size in bytes (1 for the header-only form).
        size: u8,
    },

    /// Global timestamp, lower bits.
    GlobalTs1 {
        ts: u32,
        /// Number of payload bytes (1–4); determines how many low bits
        /// of the running timestamp this packet replaces.
        size: u8,
        /// Higher-order bits changed; a GTS2 follows.
        wrap: bool,
        /// Timestamp clock frequency change asserted.
        clkch: bool,
    },

    /// Global timestamp, bits \[63:26\] or \[47:26\].
    GlobalTs2 { ts: u64 },

    /// Extension packet.
    Extension {
        /// Extension information, header bits \[6:4\] in the low
        /// position with continuation payload above.
        value: u32,
        /// Highest meaningful payload bit index + 1 (2, 9, 16, 23, 31
        /// for 0–4 payload bytes).
        nbits: u8,
        /// Packet originates from the hardware source (SH bit).
        hw_source: bool,
    },

    /// Packet abandoned over a protocol violation; forwarded so the
    /// decoder can resynchronise.
    BadSequence,

    /// Header byte is reserved by the protocol.
    Reserved { header: u8 },
}

impl ItmPacket {
    /// Whether the packet reports a protocol error.
    pub fn is_bad(&self) -> bool {
        matches!(self, ItmPacket::BadSequence | ItmPacket::Reserved { .. })
    }
}
