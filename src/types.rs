//! Common types shared across the decode data path: trace source IDs,
//! stream indices, datapath operations/responses and component
//! operating-mode flags.

use bitflags::bitflags;

/// Byte position within the captured trace stream. Monotonically
/// increasing across `Data` operations; packet and element outputs are
/// tagged with the index of the byte that started them.
pub type TraceIndex = u64;

/// A 7-bit CoreSight trace source ID.
///
/// IDs `0x01..=0x6F` name trace sources inside a multiplexed stream;
/// `0x00` and `0x70..=0x7F` are reserved by the frame protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceId(u8);

impl TraceId {
    /// Smallest valid source ID.
    pub const MIN: u8 = 0x01;
    /// Largest valid source ID.
    pub const MAX: u8 = 0x6F;

    /// Construct from a raw ID value. Returns `None` for reserved IDs.
    pub fn new(id: u8) -> Option<TraceId> {
        if Self::is_reserved(id) {
            None
        } else {
            Some(TraceId(id))
        }
    }

    /// Whether `id` falls in one of the reserved ranges (`0x00`,
    /// `0x70..=0x7F`, or out of 7-bit range entirely).
    pub fn is_reserved(id: u8) -> bool {
        !(Self::MIN..=Self::MAX).contains(&id)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

impl From<TraceId> for u8 {
    fn from(id: TraceId) -> u8 {
        id.0
    }
}

/// Operations on the trace data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPathOp {
    /// Process a block of trace data.
    Data,
    /// End of trace data; flush partial packets as incomplete.
    Eot,
    /// Drain pending output after a `Wait` response.
    Flush,
    /// Discard all buffered state and return to unsynced.
    Reset,
}

/// Response returned by every stage on the trace data path.
///
/// `Wait` is the back-pressure mechanism: the item that produced it
/// *was* accepted, but the caller must issue `Flush` until `Cont` is
/// returned before supplying new data. Fatal responses terminate the
/// source that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPathResp {
    /// All good; send more data when ready.
    Cont,
    /// Accepted, but pause: flush before sending more data.
    Wait,
    /// Component used before initialisation.
    FatalNotInit,
    /// Invalid operation for the current state.
    FatalInvalidOp,
    /// Invalid parameter on the datapath call.
    FatalInvalidParam,
    /// Data invalid and the component cannot recover.
    FatalInvalidData,
    /// Internal failure.
    FatalSysErr,
}

impl DataPathResp {
    pub fn is_cont(&self) -> bool {
        matches!(self, DataPathResp::Cont)
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, DataPathResp::Wait)
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, DataPathResp::Cont | DataPathResp::Wait)
    }
}

bitflags! {
    /// Operating-mode flags, OR-able per component.
    ///
    /// The packet-processor flags control the handling of badly formed
    /// input; the remaining flags enable protocol-specific consistency
    /// checks in the packet decoders.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        /// Treat bad packets as fatal instead of forwarding them.
        const ERR_BAD_PKTS = 1 << 0;
        /// Revert to `WaitSync` after forwarding a bad packet.
        const UNSYNC_ON_BAD_PKTS = 1 << 1;
        /// Do not forward bad packets downstream.
        const NOFWD_BAD_PKTS = 1 << 2;
        /// Do not send bad packets to the raw monitor.
        const NOMON_BAD_PKTS = 1 << 3;
        /// Packet decoders: halt on bad packets rather than re-syncing.
        const HALT_BAD_PKTS = 1 << 4;
        /// ETMv4 decode: verify that a new target address continues the
        /// instruction range the decoder expected.
        const CHK_RANGE_CONTINUE = 1 << 5;
        /// ETMv4 decode: reject an N atom attached to an unconditional
        /// direct branch.
        const CHK_COND_ATOMS = 1 << 6;
        /// Instruction decode: flag AArch64 opcodes with an all-zero
        /// upper half as invalid rather than walking through data.
        const CHK_AA64_OPCODES = 1 << 7;
    }
}
