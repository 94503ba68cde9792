//! PTM packet decoder: [`PtmPacket`] sequence → generic trace
//! elements. PTM has no speculation machinery; every packet commits
//! immediately, so decode is a straight waypoint walk between branch
//! packets.

use crate::datapath::{DecodeCtx, PacketDecoder};
use crate::element::{
    PeContext, SecLevel, TraceElement, TraceOnReason, UnsyncReason,
};
use crate::error::{Error, ErrorKind, Severity};
use crate::instr::{self, InstrDecodeOpts, InstrError, InstrType, Isa};
use crate::mem::MemSpace;
use crate::ptm::packet::IsyncReason;
use crate::ptm::{PtmConfig, PtmPacket};
use crate::types::{DataPathResp, OpFlags, TraceIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    NoSync,
    WaitSync,
    WaitISync,
    DecodePkts,
}

/// The PTM packet decoder.
pub struct PtmDecoder {
    config: PtmConfig,
    op_flags: OpFlags,
    state: DecodeState,
    unsync_reason: UnsyncReason,

    pe_context: PeContext,
    ns: bool,
    instr_addr: u64,
    isa: Isa,
    addr_valid: bool,
    mem_nacc_pending: bool,
    nacc_addr: u64,
}

impl PtmDecoder {
    pub fn new(config: PtmConfig) -> PtmDecoder {
        PtmDecoder {
            config,
            op_flags: OpFlags::empty(),
            state: DecodeState::NoSync,
            unsync_reason: UnsyncReason::InitDecoder,
            pe_context: PeContext::default(),
            ns: false,
            instr_addr: 0,
            isa: Isa::Unknown,
            addr_valid: false,
            mem_nacc_pending: false,
            nacc_addr: 0,
        }
    }

    pub fn set_op_flags(&mut self, flags: OpFlags) {
        self.op_flags = flags;
    }

    pub fn trace_id(&self) -> u8 {
        self.config.trace_id()
    }

    fn reset_state(&mut self) {
        self.state = DecodeState::NoSync;
        self.pe_context = PeContext::default();
        self.ns = false;
        self.instr_addr = 0;
        self.isa = Isa::Unknown;
        self.addr_valid = false;
        self.mem_nacc_pending = false;
        self.nacc_addr = 0;
    }

    fn emit(
        &self,
        index: TraceIndex,
        elem: TraceElement,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        ctx.elem_out.on_element(index, self.trace_id(), &elem)
    }

    fn set_addr(&mut self, addr: u32, thumb: bool) {
        self.instr_addr = addr as u64;
        self.isa = if thumb { Isa::T32 } else { Isa::A32 };
        self.addr_valid = true;
    }

    fn update_security(&mut self, ns: bool) {
        self.ns = ns;
        self.pe_context.security = Some(if ns {
            SecLevel::NonSecure
        } else {
            SecLevel::Secure
        });
    }

    // Walk from the current PC to the next waypoint. `None` when
    // memory ran out first.
    fn trace_to_waypoint(
        &mut self,
        ctx: &mut DecodeCtx<'_>,
    ) -> Result<Option<instr::InstrAttrs>, InstrError> {
        let mem_space = if self.ns { MemSpace::N } else { MemSpace::S };
        let opts = InstrDecodeOpts {
            dsb_dmb_waypoints: self.config.dsb_dmb_waypoints(),
            check_aa64_opcode: false,
        };

        loop {
            let mut bytes = [0u8; 4];
            let got = ctx
                .mem
                .read(self.instr_addr, mem_space, self.trace_id(), &mut bytes);
            if got < 4 {
                self.mem_nacc_pending = true;
                self.nacc_addr = self.instr_addr;
                return Ok(None);
            }

            let opcode = match self.isa {
                Isa::T32 => {
                    let hw1 = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
                    let hw2 = u16::from_le_bytes([bytes[2], bytes[3]]) as u32;
                    (hw1 << 16) | hw2
                }
                _ => u32::from_le_bytes(bytes),
            };

            let attrs = instr::decode(opcode, self.instr_addr, self.isa, &opts)?;
            self.instr_addr += attrs.size as u64;
            if attrs.itype != InstrType::Other {
                return Ok(Some(attrs));
            }
        }
    }

    // Commit one atom outcome: emit the range to the next waypoint.
    fn process_atom(
        &mut self,
        executed: bool,
        index: TraceIndex,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        let range_start = self.instr_addr;
        let walk = match self.trace_to_waypoint(ctx) {
            Ok(walk) => walk,
            Err(_) => {
                self.addr_valid = false;
                ctx.errs.report(
                    &Error::new(Severity::Error, ErrorKind::UnsupportedIsa)
                        .at_index(index)
                        .on_id(self.trace_id()),
                );
                return DataPathResp::Cont;
            }
        };

        let mut resp = DataPathResp::Cont;
        match walk {
            Some(attrs) => {
                let range_end = self.instr_addr;
                let range_isa = self.isa;

                match attrs.itype {
                    InstrType::Branch => {
                        if executed {
                            if let Some(target) = attrs.branch_target {
                                self.instr_addr = target;
                            }
                            if attrs.next_isa != Isa::Unknown {
                                self.isa = attrs.next_isa;
                            }
                        }
                    }
                    InstrType::BranchIndirect => {
                        if executed {
                            // a branch address packet supplies the target
                            self.addr_valid = false;
                        }
                    }
                    _ => {}
                }

                resp = self.emit(
                    index,
                    TraceElement::InstrRange {
                        start: range_start,
                        end: range_end,
                        isa: range_isa,
                        last_i_type: attrs.itype,
                        last_exec: executed,
                        last_is_link: attrs.is_link,
                    },
                    ctx,
                );
            }
            None => {
                self.addr_valid = false;
                if self.instr_addr != range_start {
                    resp = self.emit(
                        index,
                        TraceElement::InstrRange {
                            start: range_start,
                            end: self.instr_addr,
                            isa: self.isa,
                            last_i_type: InstrType::Other,
                            last_exec: false,
                            last_is_link: false,
                        },
                        ctx,
                    );
                }
                if self.mem_nacc_pending && resp.is_cont() {
                    resp = self.emit(
                        index,
                        TraceElement::AddrNacc {
                            addr: self.nacc_addr,
                        },
                        ctx,
                    );
                    self.mem_nacc_pending = false;
                }
            }
        }
        resp
    }

    fn process_isync(
        &mut self,
        index: TraceIndex,
        addr: u32,
        thumb: bool,
        ns: bool,
        reason: IsyncReason,
        ctxt_id: Option<u32>,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        self.set_addr(addr, thumb);
        self.update_security(ns);
        if let Some(id) = ctxt_id {
            self.pe_context.context_id = Some(id);
        }

        let on_reason = match reason {
            IsyncReason::Overflow => TraceOnReason::Overflow,
            _ => TraceOnReason::Normal,
        };
        let resp = self.emit(index, TraceElement::TraceOn { reason: on_reason }, ctx);
        if !resp.is_cont() {
            return resp;
        }
        self.emit(index, TraceElement::PeContext(self.pe_context), ctx)
    }

    fn decode_packet(
        &mut self,
        index: TraceIndex,
        pkt: &PtmPacket,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        match *pkt {
            PtmPacket::NotSync | PtmPacket::IncompleteEot | PtmPacket::Ignore => {
                DataPathResp::Cont
            }

            PtmPacket::BadSequence | PtmPacket::Reserved { .. } => {
                if self.op_flags.contains(OpFlags::HALT_BAD_PKTS) {
                    return DataPathResp::FatalInvalidData;
                }
                self.state = DecodeState::WaitSync;
                self.unsync_reason = UnsyncReason::BadPacket;
                self.emit(
                    index,
                    TraceElement::NoSync {
                        reason: UnsyncReason::BadPacket,
                    },
                    ctx,
                )
            }

            PtmPacket::Async => DataPathResp::Cont,

            PtmPacket::Isync {
                addr,
                thumb,
                ns,
                reason,
                ctxt_id,
                cycle_count,
            } => {
                let resp = self.process_isync(index, addr, thumb, ns, reason, ctxt_id, ctx);
                if !resp.is_cont() {
                    return resp;
                }
                match cycle_count {
                    Some(count) => {
                        self.emit(index, TraceElement::CycleCount { count }, ctx)
                    }
                    None => resp,
                }
            }

            PtmPacket::Atom {
                count,
                en_bits,
                cycle_count,
            } => {
                let mut resp = DataPathResp::Cont;
                if self.addr_valid {
                    for i in 0..count {
                        let executed = en_bits & (1 << i) != 0;
                        resp = self.process_atom(executed, index, ctx);
                        if !resp.is_cont() || !self.addr_valid {
                            break;
                        }
                    }
                }
                if let Some(cc) = cycle_count {
                    if resp.is_cont() {
                        resp = self.emit(index, TraceElement::CycleCount { count: cc }, ctx);
                    }
                }
                resp
            }

            PtmPacket::BranchAddr {
                addr,
                thumb,
                exception,
                ns,
            } => {
                let mut resp = DataPathResp::Cont;

                // close off the range up to the branch that produced
                // the packet
                if self.addr_valid {
                    resp = self.process_atom(true, index, ctx);
                }

                if let (Some(number), true) = (exception, resp.is_cont()) {
                    resp = self.emit(
                        index,
                        TraceElement::Exception {
                            number,
                            preferred_ret: self.instr_addr,
                        },
                        ctx,
                    );
                }

                self.set_addr(addr, thumb);
                if ns != self.ns {
                    self.update_security(ns);
                    if resp.is_cont() {
                        resp = self.emit(index, TraceElement::PeContext(self.pe_context), ctx);
                    }
                }
                resp
            }

            PtmPacket::WaypointUpdate { addr, thumb } => {
                self.set_addr(addr, thumb);
                DataPathResp::Cont
            }

            PtmPacket::Trigger => self.emit(index, TraceElement::Event { value: 0 }, ctx),

            PtmPacket::ContextId { id } => {
                if self.pe_context.context_id != Some(id) {
                    self.pe_context.context_id = Some(id);
                    self.emit(index, TraceElement::PeContext(self.pe_context), ctx)
                } else {
                    DataPathResp::Cont
                }
            }

            PtmPacket::Vmid { vmid } => {
                if self.pe_context.vmid != Some(vmid as u32) {
                    self.pe_context.vmid = Some(vmid as u32);
                    self.emit(index, TraceElement::PeContext(self.pe_context), ctx)
                } else {
                    DataPathResp::Cont
                }
            }

            PtmPacket::Timestamp { ts, cycle_count } => self.emit(
                index,
                TraceElement::Timestamp {
                    value: ts,
                    cycle_count,
                },
                ctx,
            ),

            PtmPacket::ExceptionRet => self.emit(index, TraceElement::ExceptionRet, ctx),
        }
    }
}

impl PacketDecoder for PtmDecoder {
    type Packet = PtmPacket;

    fn on_packet(
        &mut self,
        index: TraceIndex,
        pkt: &PtmPacket,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        let mut resp = DataPathResp::Cont;
        loop {
            match self.state {
                DecodeState::NoSync => {
                    resp = self.emit(
                        index,
                        TraceElement::NoSync {
                            reason: self.unsync_reason,
                        },
                        ctx,
                    );
                    self.state = if matches!(pkt, PtmPacket::Async) {
                        DecodeState::WaitISync
                    } else {
                        DecodeState::WaitSync
                    };
                    return resp;
                }

                DecodeState::WaitSync => {
                    if matches!(pkt, PtmPacket::Async) {
                        self.state = DecodeState::WaitISync;
                    }
                    return resp;
                }

                DecodeState::WaitISync => {
                    if matches!(pkt, PtmPacket::Isync { .. }) {
                        self.state = DecodeState::DecodePkts;
                        // fall through to decode this i-sync
                        continue;
                    }
                    return resp;
                }

                DecodeState::DecodePkts => return self.decode_packet(index, pkt, ctx),
            }
        }
    }

    fn eot(&mut self, ctx: &mut DecodeCtx<'_>) -> DataPathResp {
        ctx.elem_out
            .on_element(0, self.trace_id(), &TraceElement::EoTrace)
    }

    fn flush(&mut self, _ctx: &mut DecodeCtx<'_>) -> DataPathResp {
        DataPathResp::Cont
    }

    fn reset(&mut self) {
        self.unsync_reason = UnsyncReason::ResetDecoder;
        self.reset_state();
    }
}
