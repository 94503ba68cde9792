//! Target memory access for the instruction-trace decoders.
//!
//! Decoders resolve `(address, memory space, trace ID)` to opcode bytes
//! through a [`MemAccMapper`] owning an ordered set of
//! [`MemAccessor`]s, optionally fronted by an MRU page cache.

mod accessor;
mod cache;
mod mapper;

pub use accessor::{MemAccCallback, MemAccessor};
pub use cache::CacheConfig;
pub use mapper::MemAccMapper;

use bitflags::bitflags;

bitflags! {
    /// Memory space qualifier for a target address.
    ///
    /// An accessor declares the set of spaces it can serve; a request
    /// names the space the PE was executing in. A request matches an
    /// accessor when the two sets intersect, so a general accessor
    /// (e.g. [`MemSpace::ANY`]) serves specific requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemSpace: u8 {
        /// EL1/0 secure.
        const EL1S = 0x01;
        /// EL1/0 non-secure.
        const EL1N = 0x02;
        /// EL2 non-secure.
        const EL2N = 0x04;
        /// EL3.
        const EL3 = 0x08;
        /// EL2 secure.
        const EL2S = 0x10;
        /// EL1/0 realm.
        const EL1R = 0x20;
        /// EL2 realm.
        const EL2R = 0x40;
        /// Root (EL3 with FEAT_RME).
        const ROOT = 0x80;

        /// Any secure space.
        const S = Self::EL1S.bits() | Self::EL2S.bits() | Self::EL3.bits();
        /// Any non-secure space.
        const N = Self::EL1N.bits() | Self::EL2N.bits();
        /// Any realm / root space.
        const R = Self::EL1R.bits() | Self::EL2R.bits() | Self::ROOT.bits();
        /// All spaces.
        const ANY = 0xFF;
    }
}

impl MemSpace {
    /// Number of individual spaces in the set; used to pick the most
    /// specific accessor when several match.
    pub(crate) fn specificity(&self) -> u32 {
        self.bits().count_ones()
    }
}
