//! ETMv4 hardware configuration: the register values programmed during
//! capture, with accessors for the fields the decoder reads.

use crate::instr::{ArchVersion, Profile};

/// Conditional tracing modes (TRCCONFIGR.COND).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondTraceMode {
    Disabled,
    Load,
    Store,
    LoadStore,
    All,
}

/// ETMv4 trace unit configuration. Register values are
/// implementation-defined snapshots taken by the capture tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Etmv4Config {
    /// TRCCONFIGR: programmed feature enables.
    pub reg_configr: u32,
    /// TRCTRACEIDR: CoreSight trace ID.
    pub reg_traceidr: u32,
    /// TRCIDR0: tracing capabilities.
    pub reg_idr0: u32,
    /// TRCIDR1: architecture version.
    pub reg_idr1: u32,
    /// TRCIDR2: address / context ID sizes.
    pub reg_idr2: u32,
    /// TRCIDR8: maximum speculation depth.
    pub reg_idr8: u32,
    /// TRCIDR9: number of P0 right-hand keys.
    pub reg_idr9: u32,
    /// TRCIDR10: number of conditional instruction right-hand keys.
    pub reg_idr10: u32,
    /// TRCIDR11: maximum conditional key increment.
    pub reg_idr11: u32,
    /// TRCIDR12: number of conditional result right-hand keys.
    pub reg_idr12: u32,
    /// TRCIDR13: maximum conditional result key increment.
    pub reg_idr13: u32,
    /// Core profile; not architecturally discoverable from the trace
    /// unit registers, so supplied by the capture environment.
    pub profile: Profile,
}

impl Default for Etmv4Config {
    /// A plausible v8-A 64-bit configuration with no optional features
    /// programmed. TRCIDR1 carries architecture major version 4;
    /// TRCIDR2 a 64-bit instruction address, 32-bit context ID and
    /// 8-bit VMID.
    fn default() -> Etmv4Config {
        Etmv4Config {
            reg_configr: 0,
            reg_traceidr: 0x10,
            reg_idr0: 0x0600_0006,
            reg_idr1: 0x4100_F403,
            reg_idr2: 0x0000_9108,
            reg_idr8: 0,
            reg_idr9: 0,
            reg_idr10: 0,
            reg_idr11: 0,
            reg_idr12: 0,
            reg_idr13: 0,
            profile: Profile::CortexA,
        }
    }
}

impl Etmv4Config {
    /// CoreSight trace ID.
    pub fn trace_id(&self) -> u8 {
        (self.reg_traceidr & 0x7F) as u8
    }

    /// Maximum number of uncommitted P0 elements (TRCIDR8).
    pub fn max_spec_depth(&self) -> u32 {
        self.reg_idr8
    }

    /// Maximum P0 right-hand key (TRCIDR9).
    pub fn p0_key_max(&self) -> u32 {
        self.reg_idr9
    }

    /// Maximum conditional key increment (TRCIDR11).
    pub fn cond_key_max_incr(&self) -> u32 {
        self.reg_idr11
    }

    /// Maximum instruction address size in bits (TRCIDR2.IASIZE:
    /// 0b00100 → 32, 0b01000 → 64).
    pub fn ia_size_max(&self) -> u32 {
        match (self.reg_idr2 >> 5) & 0x1F {
            0x8 => 64,
            _ => 32,
        }
    }

    /// Context ID size in bytes (TRCIDR2.CIDSIZE).
    pub fn cid_bytes(&self) -> usize {
        match (self.reg_idr2 >> 10) & 0x1F {
            0x4 => 4,
            0 => 0,
            n => n as usize,
        }
    }

    /// VMID size in bytes (TRCIDR2.VMIDSIZE: 0b00001 → 1 byte).
    pub fn vmid_bytes(&self) -> usize {
        (((self.reg_idr2 >> 15) & 0x1F) as usize).min(4)
    }

    /// Cycle counting enabled in the programmed config
    /// (TRCCONFIGR.CCI).
    pub fn enabled_cci(&self) -> bool {
        self.reg_configr & (1 << 4) != 0
    }

    /// Branch broadcast enabled (TRCCONFIGR.BB).
    pub fn enabled_bb(&self) -> bool {
        self.reg_configr & (1 << 3) != 0
    }

    /// Context ID tracing enabled (TRCCONFIGR.CID).
    pub fn enabled_cid(&self) -> bool {
        self.reg_configr & (1 << 6) != 0
    }

    /// VMID tracing enabled (TRCCONFIGR.VMID).
    pub fn enabled_vmid(&self) -> bool {
        self.reg_configr & (1 << 7) != 0
    }

    /// Conditional instruction tracing mode (TRCCONFIGR.COND).
    pub fn cond_trace_mode(&self) -> CondTraceMode {
        match (self.reg_configr >> 10) & 0x3 {
            0 => CondTraceMode::Disabled,
            1 => CondTraceMode::Load,
            2 => CondTraceMode::Store,
            _ => CondTraceMode::LoadStore,
        }
    }

    /// Return stack in use (TRCCONFIGR.RS).
    pub fn enabled_ret_stack(&self) -> bool {
        self.reg_configr & (1 << 12) != 0
    }

    /// Q elements enabled (TRCCONFIGR.QE).
    pub fn enabled_qe(&self) -> bool {
        (self.reg_configr >> 13) & 0x3 != 0
    }

    /// Data tracing capability programmed (TRCIDR0.TRCDATA with the
    /// config enable).
    pub fn enabled_data_trace(&self) -> bool {
        (self.reg_idr0 >> 3) & 0x3 != 0 && self.reg_configr & (1 << 17) != 0
    }

    /// Load/store P0 tracing (TRCIDR0.INSTP0 with branch-broadcast
    /// style enables).
    pub fn enabled_lsp0_trace(&self) -> bool {
        (self.reg_idr0 >> 1) & 0x3 != 0 && self.reg_configr & (1 << 2) != 0
    }

    /// Architecture version (TRCIDR1.TRCARCHMAJ).
    pub fn arch_version(&self) -> ArchVersion {
        match (self.reg_idr1 >> 8) & 0xF {
            0x4 => ArchVersion::V8,
            0x3 => ArchVersion::V7,
            _ => ArchVersion::Unknown,
        }
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_reads() {
        let cfg = Etmv4Config::default();
        assert_eq!(cfg.trace_id(), 0x10);
        assert_eq!(cfg.ia_size_max(), 64);
        assert_eq!(cfg.cid_bytes(), 4);
        assert_eq!(cfg.vmid_bytes(), 1);
        assert_eq!(cfg.max_spec_depth(), 0);
        assert!(!cfg.enabled_cci());
        assert_eq!(cfg.arch_version(), ArchVersion::V8);
    }

    #[test]
    fn feature_bits() {
        let mut cfg = Etmv4Config::default();
        cfg.reg_configr = (1 << 4) | (1 << 12);
        assert!(cfg.enabled_cci());
        assert!(cfg.enabled_ret_stack());
        assert!(!cfg.enabled_qe());
    }
}
