//! ITM packet decoder: [`ItmPacket`] sequence → software-trace
//! elements.

use crate::datapath::{DecodeCtx, PacketDecoder};
use crate::element::{SwTraceInfo, SwTraceOp, TraceElement, UnsyncReason};
use crate::error::{Error, ErrorKind, Severity};
use crate::itm::{ItmConfig, ItmPacket};
use crate::types::{DataPathResp, TraceIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    NoSync,
    WaitSync,
    DecodePkts,
}

// Masks for the low bits of the running global timestamp replaced by a
// GTS1 packet, by payload byte count.
const GLOBAL_TS_LOW_MASK: [u64; 4] = [
    0x0000_007F, // [6:0]
    0x0000_3FFF, // [13:0]
    0x001F_FFFF, // [20:0]
    0x03FF_FFFF, // [25:0]
];
const GLOBAL_TS_HI_SHIFT: u32 = 26;

/// The ITM packet decoder. Tracks stimulus page, accumulated local
/// timestamp and the composed global timestamp across packets.
pub struct ItmDecoder {
    config: ItmConfig,
    state: DecodeState,
    unsync_reason: UnsyncReason,
    /// Aggregate count for local timestamps, prescaler applied.
    local_ts: u64,
    /// Running global timestamp.
    global_ts: u64,
    /// Current page for stimulus write channel extension.
    stim_page: u8,
    /// A wrapped GTS1 means no global timestamp output until the next
    /// GTS2 supplies fresh high bits.
    need_gts2: bool,
    prev_overflow: bool,
    gts_freq_change: bool,
}

impl ItmDecoder {
    pub fn new(config: ItmConfig) -> ItmDecoder {
        ItmDecoder {
            config,
            state: DecodeState::NoSync,
            unsync_reason: UnsyncReason::InitDecoder,
            local_ts: 0,
            global_ts: 0,
            stim_page: 0,
            need_gts2: true,
            prev_overflow: false,
            gts_freq_change: false,
        }
    }

    pub fn trace_id(&self) -> u8 {
        self.config.trace_id()
    }

    fn reset_state(&mut self) {
        self.state = DecodeState::NoSync;
        self.local_ts = 0;
        self.global_ts = 0;
        self.stim_page = 0;
        self.need_gts2 = true;
        self.prev_overflow = false;
        self.gts_freq_change = false;
    }

    fn emit(
        &mut self,
        index: TraceIndex,
        mut info: SwTraceInfo,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        if self.prev_overflow {
            info.overflow = true;
            self.prev_overflow = false;
        }
        ctx.elem_out
            .on_element(index, self.trace_id(), &TraceElement::SwTrace(info))
    }

    fn decode_packet(
        &mut self,
        index: TraceIndex,
        pkt: &ItmPacket,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        match *pkt {
            ItmPacket::BadSequence | ItmPacket::Reserved { .. } => {
                ctx.errs.report(
                    &Error::new(
                        Severity::Fatal,
                        ErrorKind::BadDecodePacket("bad packet in ITM stream"),
                    )
                    .at_index(index)
                    .on_id(self.trace_id()),
                );
                self.unsync_reason = UnsyncReason::BadPacket;
                self.reset_state();
                DataPathResp::FatalInvalidData
            }

            ItmPacket::NotSync => {
                self.unsync_reason = UnsyncReason::BadPacket;
                self.reset_state();
                DataPathResp::Cont
            }

            ItmPacket::Async | ItmPacket::IncompleteEot => DataPathResp::Cont,

            ItmPacket::Dwt { disc, value, size } => {
                let mut info = SwTraceInfo::new(SwTraceOp::Dwt);
                info.src_id = disc as u32;
                info.value = value as u64;
                info.value_size = size;
                self.emit(index, info, ctx)
            }

            ItmPacket::Swit {
                channel,
                value,
                size,
            } => {
                let mut info = SwTraceInfo::new(SwTraceOp::Swit);
                info.src_id = ((channel & 0x1F) as u32) | ((self.stim_page as u32) << 5);
                info.value = value as u64;
                info.value_size = size;
                self.emit(index, info, ctx)
            }

            ItmPacket::Extension {
                value,
                nbits,
                hw_source,
            } => {
                // only the stimulus page extension is understood:
                // software source, 2 meaningful payload bits
                if !hw_source && nbits == 2 {
                    self.stim_page = value as u8;
                }
                DataPathResp::Cont
            }

            ItmPacket::Overflow => {
                // reset the accumulated local TS; mark the next payload
                self.local_ts = 0;
                self.prev_overflow = true;
                DataPathResp::Cont
            }

            ItmPacket::GlobalTs1 {
                ts,
                size,
                wrap,
                clkch,
            } => {
                if !self.need_gts2 {
                    self.need_gts2 = wrap;
                }
                if !self.gts_freq_change {
                    self.gts_freq_change = clkch;
                }

                // update lower bits; only output if not waiting on GTS2
                self.global_ts &= !GLOBAL_TS_LOW_MASK[(size as usize - 1).min(3)];
                self.global_ts |= ts as u64;

                if !self.need_gts2 {
                    let mut info = SwTraceInfo::new(SwTraceOp::GlobalTs);
                    info.timestamp = Some(self.global_ts);
                    info.freq_change = self.gts_freq_change;
                    self.gts_freq_change = false;
                    self.emit(index, info, ctx)
                } else {
                    DataPathResp::Cont
                }
            }

            ItmPacket::GlobalTs2 { ts } => {
                self.global_ts &= GLOBAL_TS_LOW_MASK[3];
                self.global_ts |= ts << GLOBAL_TS_HI_SHIFT;
                self.need_gts2 = false;

                let mut info = SwTraceInfo::new(SwTraceOp::GlobalTs);
                info.timestamp = Some(self.global_ts);
                info.freq_change = self.gts_freq_change;
                self.gts_freq_change = false;
                self.emit(index, info, ctx)
            }

            ItmPacket::LocalTs { tc, ts, size } => {
                let op = match tc & 0x3 {
                    0 => SwTraceOp::LocalTsSync,
                    1 => SwTraceOp::LocalTsDelay,
                    2 => SwTraceOp::LocalTsPacketDelay,
                    _ => SwTraceOp::LocalTsBothDelay,
                };
                self.local_ts += (ts as u64) * self.config.ts_prescale_value() as u64;

                let mut info = SwTraceInfo::new(op);
                info.value = ts as u64;
                info.value_size = size;
                info.timestamp = Some(self.local_ts);
                self.emit(index, info, ctx)
            }
        }
    }
}

impl PacketDecoder for ItmDecoder {
    type Packet = ItmPacket;

    fn on_packet(
        &mut self,
        index: TraceIndex,
        pkt: &ItmPacket,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        let mut resp = DataPathResp::Cont;
        loop {
            match self.state {
                DecodeState::NoSync => {
                    let elem = TraceElement::NoSync {
                        reason: self.unsync_reason,
                    };
                    resp = ctx.elem_out.on_element(index, self.trace_id(), &elem);
                    self.state = DecodeState::WaitSync;
                }
                DecodeState::WaitSync => {
                    if matches!(pkt, ItmPacket::Async) {
                        self.state = DecodeState::DecodePkts;
                    }
                    return resp;
                }
                DecodeState::DecodePkts => {
                    return self.decode_packet(index, pkt, ctx);
                }
            }
        }
    }

    fn eot(&mut self, ctx: &mut DecodeCtx<'_>) -> DataPathResp {
        ctx.elem_out
            .on_element(0, self.trace_id(), &TraceElement::EoTrace)
    }

    fn flush(&mut self, _ctx: &mut DecodeCtx<'_>) -> DataPathResp {
        // no unsent elements are held
        DataPathResp::Cont
    }

    fn reset(&mut self) {
        self.unsync_reason = UnsyncReason::ResetDecoder;
        self.reset_state();
    }
}
