//! ETMv4-I packet decoder: [`Etmv4Packet`] sequence → generic trace
//! elements.
//!
//! Packets stack as speculative P0 elements until committed; commits
//! happen automatically whenever the number of uncommitted countable
//! P0s exceeds the configured maximum speculation depth, and explicitly
//! on commit packets. Committing an atom walks target memory from the
//! current PC to the next waypoint instruction.

use crate::datapath::{DecodeCtx, PacketDecoder};
use crate::element::{
    ExLevel, PeContext, SecLevel, TraceElement, TraceOnReason, UnsyncReason,
};
use crate::error::{Error, ErrorKind, Severity};
use crate::etmv4::packet::{AddrIs, Etmv4Context, Etmv4Packet};
use crate::etmv4::stack::{
    commit_oldest_atom, AddrElem, AddrVal, AddrValStack, P0Elem, P0Stack,
};
use crate::etmv4::Etmv4Config;
use crate::instr::{self, InstrDecodeOpts, InstrError, InstrType, Isa};
use crate::mem::MemSpace;
use crate::types::{DataPathResp, OpFlags, TraceIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    NoSync,
    WaitSync,
    WaitTinfo,
    DecodePkts,
    CommitElem,
}

/// The ETMv4-I packet decoder.
pub struct Etmv4Decoder {
    config: Etmv4Config,
    op_flags: OpFlags,
    // static configuration
    csid: u8,
    max_spec_depth: u32,
    ia_size64: bool,

    state: DecodeState,
    unsync_reason: UnsyncReason,

    // PE state
    is_secure: bool,
    is_64bit: bool,
    pe_context: PeContext,

    // decode state
    timestamp: u64,
    curr_spec_depth: u32,
    p0_key: u32,
    cc_threshold: u32,
    need_ctxt: bool,
    need_addr: bool,
    except_pending_addr: bool,
    mem_nacc_pending: bool,
    nacc_addr: u64,
    prev_overflow: bool,

    addr_regs: AddrValStack,
    p0_stack: P0Stack,
    /// Countable P0 units left to commit in the current operation.
    p0_commit: u32,

    // instruction walk state
    instr_addr: u64,
    isa: Isa,
}

impl Etmv4Decoder {
    /// Create a decoder for the given hardware configuration. Fails
    /// with `HwConfigUnsupported` when the trace unit was programmed
    /// with features this decoder cannot reconstruct.
    pub fn new(config: Etmv4Config) -> Result<Etmv4Decoder, Error> {
        let unsupported = if config.enabled_data_trace() {
            Some("data trace elements not supported")
        } else if config.enabled_lsp0_trace() {
            Some("LSP0 elements not supported")
        } else if config.cond_trace_mode() != super::CondTraceMode::Disabled {
            Some("conditional non-branch tracing not supported")
        } else if config.enabled_ret_stack() {
            Some("return stack tracing not supported")
        } else if config.enabled_qe() {
            Some("Q elements not supported")
        } else {
            None
        };
        if let Some(msg) = unsupported {
            return Err(
                Error::new(Severity::Error, ErrorKind::HwConfigUnsupported(msg))
                    .on_id(config.trace_id()),
            );
        }

        let mut dec = Etmv4Decoder {
            csid: config.trace_id(),
            max_spec_depth: config.max_spec_depth(),
            ia_size64: config.ia_size_max() == 64,
            op_flags: OpFlags::empty(),
            state: DecodeState::NoSync,
            unsync_reason: UnsyncReason::InitDecoder,
            is_secure: true,
            is_64bit: false,
            pe_context: PeContext::default(),
            timestamp: 0,
            curr_spec_depth: 0,
            p0_key: 0,
            cc_threshold: 0,
            need_ctxt: true,
            need_addr: true,
            except_pending_addr: false,
            mem_nacc_pending: false,
            nacc_addr: 0,
            prev_overflow: false,
            addr_regs: AddrValStack::default(),
            p0_stack: P0Stack::default(),
            p0_commit: 0,
            instr_addr: 0,
            isa: Isa::Unknown,
            config,
        };
        dec.reset_state();
        Ok(dec)
    }

    pub fn set_op_flags(&mut self, flags: OpFlags) {
        self.op_flags = flags;
    }

    pub fn trace_id(&self) -> u8 {
        self.csid
    }

    /// Last hardware timestamp seen on the stream.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Current P0 right-hand key, as seeded by trace info packets.
    pub fn p0_key(&self) -> u32 {
        self.p0_key
    }

    /// Cycle count threshold in force.
    pub fn cc_threshold(&self) -> u32 {
        self.cc_threshold
    }

    fn reset_state(&mut self) {
        self.state = DecodeState::NoSync;
        self.timestamp = 0;
        self.is_secure = true;
        self.is_64bit = false;
        self.pe_context = PeContext::default();
        self.cc_threshold = 0;
        self.curr_spec_depth = 0;
        self.p0_key = 0;
        self.need_ctxt = true;
        self.need_addr = true;
        self.except_pending_addr = false;
        self.mem_nacc_pending = false;
        self.nacc_addr = 0;
        self.prev_overflow = false;
        self.addr_regs.clear();
        // preload the first entry so match packets before any broadcast
        // resolve to zero
        self.addr_regs.push(AddrVal::default());
        self.p0_stack.clear();
        self.p0_commit = 0;
        self.instr_addr = 0;
        self.isa = Isa::Unknown;
    }

    fn instr_opts(&self) -> InstrDecodeOpts {
        InstrDecodeOpts {
            dsb_dmb_waypoints: false,
            check_aa64_opcode: self.op_flags.contains(OpFlags::CHK_AA64_OPCODES),
        }
    }

    fn emit(
        &self,
        index: TraceIndex,
        elem: TraceElement,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        ctx.elem_out.on_element(index, self.csid, &elem)
    }

    fn seed_from_trace_info(&mut self, info: &crate::etmv4::TraceInfo) {
        self.p0_key = info.p0_key;
        self.curr_spec_depth = info.curr_spec_depth;
        self.cc_threshold = info.cc_threshold;
    }

    // Stack the packet (or act on it immediately) and work out whether
    // a commit pass is now required.
    fn decode_packet(
        &mut self,
        index: TraceIndex,
        pkt: &Etmv4Packet,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        let mut resp = DataPathResp::Cont;
        let mut is_addr = false;
        let mut is_except = false;
        let mut is_ctxt = false;

        match pkt {
            Etmv4Packet::Async | Etmv4Packet::IncompleteEot => {}
            Etmv4Packet::TraceInfo(_) => {} // repeat infos carry nothing new

            Etmv4Packet::TraceOn => self.p0_stack.push(index, P0Elem::TraceOn),
            Etmv4Packet::Overflow => self.p0_stack.push(index, P0Elem::Overflow),

            Etmv4Packet::Discard => {
                // trace disabled mid-speculation: everything
                // uncommitted is dropped
                self.p0_stack.clear();
                self.curr_spec_depth = 0;
                self.need_addr = true;
            }

            Etmv4Packet::Atom(atom) => {
                self.p0_stack.push(index, P0Elem::Atom(*atom));
                self.curr_spec_depth += atom.count as u32;
            }

            Etmv4Packet::Context(ctxt) => {
                self.p0_stack.push(index, P0Elem::Ctxt(*ctxt));
                is_ctxt = true;
            }

            Etmv4Packet::AddrMatch { idx } => {
                self.p0_stack.push(index, P0Elem::Addr(AddrElem::Match(*idx)));
                is_addr = true;
            }

            Etmv4Packet::AddrCtxt {
                addr,
                is,
                bits64,
                ctxt,
            } => {
                self.p0_stack.push(index, P0Elem::Ctxt(*ctxt));
                self.p0_stack.push(
                    index,
                    P0Elem::Addr(AddrElem::Value {
                        addr: *addr,
                        is: *is,
                        bits64: *bits64,
                    }),
                );
                is_addr = true;
            }

            Etmv4Packet::AddrLong { addr, is, bits64 } => {
                self.p0_stack.push(
                    index,
                    P0Elem::Addr(AddrElem::Value {
                        addr: *addr,
                        is: *is,
                        bits64: *bits64,
                    }),
                );
                is_addr = true;
            }

            Etmv4Packet::AddrShort { addr, bits, is } => {
                self.p0_stack.push(
                    index,
                    P0Elem::Addr(AddrElem::Short {
                        addr: *addr,
                        bits: *bits,
                        is: *is,
                    }),
                );
                is_addr = true;
            }

            Etmv4Packet::Exception { number, prev_same } => {
                self.p0_stack.push(
                    index,
                    P0Elem::Except {
                        number: *number,
                        prev_same: *prev_same,
                    },
                );
                // wait for the following address before counting it
                self.except_pending_addr = true;
                is_except = true;
            }

            Etmv4Packet::ExceptionReturn => {
                let countable = self.config.arch_version() == crate::instr::ArchVersion::V7
                    && self.config.profile() == crate::instr::Profile::CortexM;
                self.p0_stack.push(index, P0Elem::ExceptRet { countable });
            }

            Etmv4Packet::Event { mask } => {
                self.p0_stack.push(index, P0Elem::Event { mask: *mask });
            }

            Etmv4Packet::CycleCount { count } => {
                self.p0_stack.push(index, P0Elem::Cc { count: *count });
            }

            Etmv4Packet::Timestamp { ts, cc } => {
                self.p0_stack.push(index, P0Elem::Ts { ts: *ts, cc: *cc });
            }

            Etmv4Packet::Commit { count } => {
                self.p0_commit += count;
                self.state = DecodeState::CommitElem;
            }

            Etmv4Packet::Cancel { count, mispredict } => {
                let cancelled = self.p0_stack.cancel_newest(*count);
                if cancelled < *count {
                    ctx.errs.report(
                        &Error::new(Severity::Error, ErrorKind::CommitPacketOverrun)
                            .at_index(index)
                            .on_id(self.csid),
                    );
                    resp = DataPathResp::FatalInvalidData;
                } else {
                    self.curr_spec_depth = self.curr_spec_depth.saturating_sub(*count);
                    if *mispredict {
                        self.p0_stack.mispredict_newest();
                    }
                }
            }

            Etmv4Packet::Mispredict => {
                if !self.p0_stack.mispredict_newest() {
                    ctx.errs.report(
                        &Error::new(
                            Severity::Warn,
                            ErrorKind::BadDecodePacket("mispredict with no stacked atom"),
                        )
                        .at_index(index)
                        .on_id(self.csid),
                    );
                }
            }

            Etmv4Packet::NotSync => {
                self.unsync_reason = UnsyncReason::BadPacket;
                self.reset_state();
                return DataPathResp::Cont;
            }

            Etmv4Packet::BadSequence => {
                return self.handle_bad_packet(index, "bad byte sequence in packet", ctx);
            }
            Etmv4Packet::Reserved { .. } => {
                return self.handle_bad_packet(index, "reserved packet header", ctx);
            }

            Etmv4Packet::Q | Etmv4Packet::Cond => {
                ctx.errs.report(
                    &Error::new(
                        Severity::Error,
                        ErrorKind::BadDecodePacket("unsupported packet type"),
                    )
                    .at_index(index)
                    .on_id(self.csid),
                );
                return DataPathResp::FatalInvalidData;
            }
        }

        // an exception only becomes countable once its address arrives;
        // a context packet may sit between the two
        if self.except_pending_addr && !is_except && !is_ctxt {
            self.except_pending_addr = false;
            if is_addr {
                self.curr_spec_depth += 1;
            } else {
                ctx.errs.report(
                    &Error::new(
                        Severity::Error,
                        ErrorKind::BadPacketSequence("address missing after exception packet"),
                    )
                    .at_index(index)
                    .on_id(self.csid),
                );
                return self.handle_bad_packet(index, "address missing after exception", ctx);
            }
        }

        if resp.is_cont() && self.curr_spec_depth > self.max_spec_depth {
            // auto commit everything above the speculation bound
            self.p0_commit += self.curr_spec_depth - self.max_spec_depth;
            self.state = DecodeState::CommitElem;
        }
        resp
    }

    // Walk the element stack oldest-first until the required number of
    // countable P0s has been committed.
    fn commit_elements(&mut self, ctx: &mut DecodeCtx<'_>) -> DataPathResp {
        let mut resp = DataPathResp::Cont;
        let num_req = self.p0_commit;

        while self.p0_commit > 0 && resp.is_cont() {
            let Some(entry) = self.p0_stack.oldest() else {
                ctx.errs.report(
                    &Error::new(Severity::Fatal, ErrorKind::CommitPacketOverrun)
                        .on_id(self.csid),
                );
                resp = DataPathResp::FatalInvalidData;
                break;
            };
            let index = entry.index;
            let mut pop = true;

            match entry.elem.clone() {
                P0Elem::TraceOn => {
                    let reason = if self.prev_overflow {
                        TraceOnReason::Overflow
                    } else {
                        TraceOnReason::Normal
                    };
                    self.prev_overflow = false;
                    resp = self.emit(index, TraceElement::TraceOn { reason }, ctx);
                }

                P0Elem::Overflow => self.prev_overflow = true,

                P0Elem::Ctxt(ctxt) => {
                    if ctxt.updated {
                        self.update_context(&ctxt);
                        resp =
                            self.emit(index, TraceElement::PeContext(self.pe_context), ctx);
                    }
                }

                P0Elem::Addr(a) => {
                    let (val, push) = self.resolve_addr(&a);
                    if self.op_flags.contains(OpFlags::CHK_RANGE_CONTINUE)
                        && !self.need_addr
                        && val.addr != self.instr_addr
                    {
                        ctx.errs.report(
                            &Error::new(
                                Severity::Warn,
                                ErrorKind::BadDecodePacket(
                                    "address does not continue the previous range",
                                ),
                            )
                            .at_index(index)
                            .on_id(self.csid),
                        );
                    }
                    self.set_instr_addr(val);
                    if push {
                        self.addr_regs.push(val);
                    }
                    self.need_addr = false;
                }

                P0Elem::Event { mask } => {
                    resp = self.emit(
                        index,
                        TraceElement::Event {
                            value: mask as u16,
                        },
                        ctx,
                    );
                }

                P0Elem::Ts { ts, cc } => {
                    self.timestamp = ts;
                    resp = self.emit(
                        index,
                        TraceElement::Timestamp {
                            value: ts,
                            cycle_count: cc,
                        },
                        ctx,
                    );
                }

                P0Elem::Cc { count } => {
                    resp = self.emit(index, TraceElement::CycleCount { count }, ctx);
                }

                P0Elem::Atom(_) => {
                    // commit atoms one at a time from the oldest stack
                    // element; it stays put while it still holds atoms
                    loop {
                        let Some(entry) = self.p0_stack.oldest_mut() else {
                            break;
                        };
                        let P0Elem::Atom(atom) = &mut entry.elem else {
                            break;
                        };
                        if atom.count == 0 || self.p0_commit == 0 || !resp.is_cont() {
                            break;
                        }
                        let executed = commit_oldest_atom(atom);
                        let atom_index = entry.index;
                        if !self.need_ctxt && !self.need_addr {
                            resp = self.process_atom(executed, atom_index, ctx);
                        }
                        self.p0_commit -= 1;
                    }
                    if let Some(entry) = self.p0_stack.oldest() {
                        if let P0Elem::Atom(atom) = &entry.elem {
                            if atom.count > 0 {
                                pop = false;
                            }
                        }
                    }
                }

                P0Elem::Except { number, prev_same } => {
                    resp = self.process_exception(number, prev_same, ctx);
                    self.p0_commit -= 1;
                    pop = false; // process_exception consumed its elements
                }

                P0Elem::ExceptRet { countable } => {
                    resp = self.emit(index, TraceElement::ExceptionRet, ctx);
                    if countable {
                        self.p0_commit = self.p0_commit.saturating_sub(1);
                    }
                }
            }

            if pop {
                self.p0_stack.pop_oldest();
            }
        }

        if self.p0_commit == 0 {
            self.state = DecodeState::DecodePkts;
        }
        self.curr_spec_depth = self
            .curr_spec_depth
            .saturating_sub(num_req - self.p0_commit);

        resp
    }

    fn set_instr_addr(&mut self, val: AddrVal) {
        self.instr_addr = val.addr;
        self.isa = if self.is_64bit {
            Isa::A64
        } else if val.is == 0 {
            Isa::A32
        } else {
            Isa::T32
        };
    }

    // Resolve a stacked address element against the address register
    // stack. Returns the value and whether it must be pushed.
    fn resolve_addr(&mut self, a: &AddrElem) -> (AddrVal, bool) {
        match *a {
            AddrElem::Match(idx) => (self.addr_regs.get(idx as usize), false),

            AddrElem::Value { addr, is, bits64 } => {
                if !self.ia_size64 || bits64 {
                    (AddrVal::new(addr, is), true)
                } else {
                    // 32-bit value on a 64-bit decoder: upper half from
                    // the newest stack entry
                    let top = self.addr_regs.get(0);
                    let composed = (top.addr & !0xFFFF_FFFF) | (addr & 0xFFFF_FFFF);
                    (AddrVal::new(composed, is), true)
                }
            }

            AddrElem::Short { addr, bits, is } => {
                let top = self.addr_regs.get(0);
                let mask = (1u64 << bits) - 1;
                let composed = (top.addr & !mask) | (addr as u64 & mask);
                (AddrVal::new(composed, is), true)
            }
        }
    }

    fn update_context(&mut self, ctxt: &Etmv4Context) {
        self.is_64bit = ctxt.sf;
        self.is_secure = !ctxt.ns;
        self.pe_context.bits64 = ctxt.sf;
        self.pe_context.security = Some(if ctxt.ns {
            SecLevel::NonSecure
        } else {
            SecLevel::Secure
        });
        self.pe_context.exception_level = Some(match ctxt.el {
            0 => ExLevel::El0,
            1 => ExLevel::El1,
            2 => ExLevel::El2,
            _ => ExLevel::El3,
        });
        if ctxt.updated_c {
            self.pe_context.context_id = Some(ctxt.ctxt_id);
        }
        if ctxt.updated_v {
            self.pe_context.vmid = Some(ctxt.vmid);
        }
        self.need_ctxt = false;
    }

    // Commit one atom: walk instructions from the current PC to the
    // next waypoint and emit the range it covers.
    fn process_atom(
        &mut self,
        executed: bool,
        root_index: TraceIndex,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        let range_start = self.instr_addr;
        let walk = match self.trace_to_waypoint(ctx) {
            Ok(walk) => walk,
            Err(InstrError::UnsupportedIsa) => {
                // wait for the next context / address to recover
                self.need_addr = true;
                self.need_ctxt = true;
                ctx.errs.report(
                    &Error::new(Severity::Error, ErrorKind::UnsupportedIsa)
                        .at_index(root_index)
                        .on_id(self.csid),
                );
                return DataPathResp::Cont;
            }
            Err(InstrError::InvalidOpcode(_)) => {
                return self.handle_bad_packet(
                    root_index,
                    "invalid opcode on instruction path",
                    ctx,
                );
            }
        };

        let mut resp = DataPathResp::Cont;
        match walk {
            Some(attrs) => {
                // the range ends just past the waypoint; a taken branch
                // then moves the PC to its target
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
                        } else if self.op_flags.contains(OpFlags::CHK_COND_ATOMS)
                            && !attrs.is_conditional
                        {
                            ctx.errs.report(
                                &Error::new(
                                    Severity::Warn,
                                    ErrorKind::BadDecodePacket(
                                        "N atom on an unconditional direct branch",
                                    ),
                                )
                                .at_index(root_index)
                                .on_id(self.csid),
                            );
                        }
                    }
                    InstrType::BranchIndirect => {
                        if executed {
                            // target must come from a new address packet
                            self.need_addr = true;
                        }
                    }
                    _ => {}
                }

                resp = self.emit(
                    root_index,
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
                // no waypoint reachable: memory not accessible
                self.need_addr = true;

                if self.instr_addr != range_start {
                    resp = self.emit(
                        root_index,
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
                        root_index,
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

    // Walk from the current PC until a waypoint instruction. On
    // success the PC sits just past the waypoint (branch targets are
    // applied by the caller). `None` means memory ran out first.
    fn trace_to_waypoint(
        &mut self,
        ctx: &mut DecodeCtx<'_>,
    ) -> Result<Option<instr::InstrAttrs>, InstrError> {
        let mem_space = if self.is_secure {
            MemSpace::S
        } else {
            MemSpace::N
        };
        let opts = self.instr_opts();

        loop {
            let mut bytes = [0u8; 4];
            let got = ctx.mem.read(self.instr_addr, mem_space, self.csid, &mut bytes);
            if got < 4 {
                self.mem_nacc_pending = true;
                self.nacc_addr = self.instr_addr;
                return Ok(None);
            }

            let opcode = match self.isa {
                // T32 carries the first halfword in the upper half
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

    // Exception commit: the stack holds exception, optional context,
    // then the address whose value is the preferred return address.
    fn process_exception(
        &mut self,
        number: u16,
        prev_same: bool,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        let except_entry = self
            .p0_stack
            .pop_oldest()
            .expect("caller matched the exception element");
        let except_index = except_entry.index;

        let mut ctxt_elem = None;
        if matches!(
            self.p0_stack.oldest().map(|e| &e.elem),
            Some(P0Elem::Ctxt(_))
        ) {
            if let Some(entry) = self.p0_stack.pop_oldest() {
                if let P0Elem::Ctxt(c) = entry.elem {
                    ctxt_elem = Some((entry.index, c));
                }
            }
        }

        let addr_elem = match self.p0_stack.oldest().map(|e| e.elem.clone()) {
            Some(P0Elem::Addr(a)) => {
                self.p0_stack.pop_oldest();
                a
            }
            _ => {
                ctx.errs.report(
                    &Error::new(
                        Severity::Fatal,
                        ErrorKind::BadPacketSequence("address missing in exception packet"),
                    )
                    .at_index(except_index)
                    .on_id(self.csid),
                );
                return DataPathResp::FatalInvalidData;
            }
        };

        let (addr, push) = self.resolve_addr(&addr_elem);

        let mut resp = DataPathResp::Cont;
        if let Some((ctxt_index, ctxt)) = ctxt_elem {
            if ctxt.updated {
                self.update_context(&ctxt);
                resp = self.emit(ctxt_index, TraceElement::PeContext(self.pe_context), ctx);
            }
        }

        // the exception interrupted execution at this very address
        if prev_same {
            self.set_instr_addr(addr);
        }

        if push {
            self.addr_regs.push(addr);
        }

        if resp.is_cont() {
            resp = self.emit(
                except_index,
                TraceElement::Exception {
                    number,
                    preferred_ret: addr.addr,
                },
                ctx,
            );
        }
        resp
    }

    fn handle_bad_packet(
        &mut self,
        index: TraceIndex,
        reason: &'static str,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        if self.op_flags.contains(OpFlags::HALT_BAD_PKTS) {
            ctx.errs.report(
                &Error::new(Severity::Fatal, ErrorKind::BadDecodePacket(reason))
                    .at_index(index)
                    .on_id(self.csid),
            );
            return DataPathResp::FatalInvalidData;
        }

        ctx.errs.report(
            &Error::new(Severity::Error, ErrorKind::BadDecodePacket(reason))
                .at_index(index)
                .on_id(self.csid),
        );
        // recover locally: report loss of sync and hunt again
        let resp = self.emit(
            index,
            TraceElement::NoSync {
                reason: UnsyncReason::BadPacket,
            },
            ctx,
        );
        self.unsync_reason = UnsyncReason::BadPacket;
        self.reset_state();
        self.state = DecodeState::WaitSync;
        resp
    }
}

impl PacketDecoder for Etmv4Decoder {
    type Packet = Etmv4Packet;

    fn on_packet(
        &mut self,
        index: TraceIndex,
        pkt: &Etmv4Packet,
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
                    self.state = DecodeState::WaitSync;
                }

                DecodeState::WaitSync => {
                    if matches!(pkt, Etmv4Packet::Async) {
                        self.state = DecodeState::WaitTinfo;
                    }
                    return resp;
                }

                DecodeState::WaitTinfo => {
                    self.need_ctxt = true;
                    self.need_addr = true;
                    if let Etmv4Packet::TraceInfo(info) = pkt {
                        self.seed_from_trace_info(info);
                        self.state = DecodeState::DecodePkts;
                    }
                    return resp;
                }

                DecodeState::DecodePkts => {
                    resp = self.decode_packet(index, pkt, ctx);
                    if self.state != DecodeState::CommitElem || !resp.is_cont() {
                        return resp;
                    }
                }

                DecodeState::CommitElem => {
                    return self.commit_elements(ctx);
                }
            }
        }
    }

    fn eot(&mut self, ctx: &mut DecodeCtx<'_>) -> DataPathResp {
        ctx.elem_out
            .on_element(0, self.csid, &TraceElement::EoTrace)
    }

    fn flush(&mut self, ctx: &mut DecodeCtx<'_>) -> DataPathResp {
        if self.state == DecodeState::CommitElem {
            return self.commit_elements(ctx);
        }
        DataPathResp::Cont
    }

    fn reset(&mut self) {
        self.unsync_reason = UnsyncReason::ResetDecoder;
        self.reset_state();
    }
}
