//! ETMv4-I packet processor: byte stream → [`Etmv4Packet`] sequence.
//!
//! Header dispatch table (first byte of each packet):
//!
//! ```text
//! 0x00        extension: async (0x00...), discard (0x03), overflow (0x05)
//! 0x01        trace info
//! 0x02-0x03   timestamp (bit 0: cycle count follows)
//! 0x04        trace on
//! 0x06        exception
//! 0x07        exception return
//! 0x0C-0x0D   cycle count format 1 (continued payload)
//! 0x0E-0x0F   cycle count format 2 (one payload byte)
//! 0x10-0x13   cycle count format 3 (count in header bits [1:0])
//! 0x2D        commit (continued count)
//! 0x2E-0x2F   cancel format 1 (continued count; bit 0: mispredict)
//! 0x30-0x33   mispredict
//! 0x34-0x37   cancel format 2 (count 1)
//! 0x38-0x3F   cancel format 3 (count = bits [2:0] + 2)
//! 0x40-0x6F   conditional instruction / result (unsupported downstream)
//! 0x71-0x7F   event (mask in bits [3:0])
//! 0x80-0x81   context (0x81 carries a payload)
//! 0x82-0x83   32-bit address + context, IS0 / IS1
//! 0x85-0x86   64-bit address + context, IS0 / IS1
//! 0x90-0x92   exact-match address, stack entry 0 / 1 / 2
//! 0x95-0x96   short address, IS0 / IS1
//! 0x9A-0x9B   32-bit address, IS0 / IS1
//! 0x9D-0x9E   64-bit address, IS0 / IS1
//! 0xA0-0xAF   Q (unsupported downstream)
//! 0xC0-0xD3   atom format 6 (N×E then one N)
//! 0xD5-0xD7   atom format 5 (with 0xF5)
//! 0xD8-0xDB   atom format 2 (2 atoms in bits [1:0])
//! 0xDC-0xDF   atom format 4 (pattern in bits [1:0])
//! 0xF5        atom format 5
//! 0xF6-0xF7   atom format 1 (1 atom in bit 0)
//! 0xF8-0xFF   atom format 3 (3 atoms in bits [2:0])
//! remainder   reserved
//! ```

use crate::datapath::{PacketProcessor, PacketSink};
use crate::error::{Error, ErrorKind, Severity};
use crate::etmv4::packet::{AddrIs, Atom, Etmv4Context, Etmv4Packet, TraceInfo};
use crate::etmv4::Etmv4Config;
use crate::types::{DataPathResp, OpFlags, TraceIndex};

// async = eleven 0x00 then 0x80
const ASYNC_ZEROS: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcState {
    WaitSync,
    ProcHdr,
    ProcData(PktFn),
    SendPkt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PktFn {
    Extension,
    Async,
    TraceInfo,
    Timestamp { cc: bool },
    Exception,
    CcF1,
    CcF2,
    Commit,
    Cancel { mispredict: bool },
    Context,
    AddrShort { is: AddrIs },
    AddrLong { bits64: bool, is: AddrIs, with_ctxt: bool },
}

enum BadPacket {
    Sequence(&'static str),
    ReservedHdr(u8),
}

enum AsyncScan {
    Found,
    Error,
    NeedData,
}

// Incremental payload scanning outcome.
enum Parse<T> {
    Done(T),
    NeedMore,
}

/// The ETMv4-I packet processor.
pub struct Etmv4PktProc {
    config: Etmv4Config,
    op_flags: OpFlags,
    state: ProcState,
    synced: bool,
    sync_start: bool,
    sent_notsync: bool,
    dump_unsynced: usize,
    data: Vec<u8>,
    pkt_index: TraceIndex,
    ready: Option<Etmv4Packet>,
}

impl Etmv4PktProc {
    pub fn new(config: Etmv4Config) -> Etmv4PktProc {
        Etmv4PktProc {
            config,
            op_flags: OpFlags::empty(),
            state: ProcState::WaitSync,
            synced: false,
            sync_start: false,
            sent_notsync: false,
            dump_unsynced: 0,
            data: Vec::new(),
            pkt_index: 0,
            ready: None,
        }
    }

    pub fn set_op_flags(&mut self, flags: OpFlags) {
        self.op_flags = flags;
    }

    pub fn config(&self) -> &Etmv4Config {
        &self.config
    }

    fn read_byte(&mut self, block: &[u8], used: &mut usize) -> Option<u8> {
        if *used < block.len() {
            let byte = block[*used];
            *used += 1;
            self.data.push(byte);
            Some(byte)
        } else {
            None
        }
    }

    fn stage(&mut self, pkt: Etmv4Packet) {
        self.ready = Some(pkt);
        self.state = ProcState::SendPkt;
    }

    fn process_hdr(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        let Some(header) = self.read_byte(block, used) else {
            return Ok(());
        };

        let next = match header {
            0x00 => ProcState::ProcData(PktFn::Extension),
            0x01 => ProcState::ProcData(PktFn::TraceInfo),
            0x02 | 0x03 => ProcState::ProcData(PktFn::Timestamp {
                cc: header & 1 != 0 && self.config.enabled_cci(),
            }),
            0x04 => {
                self.stage(Etmv4Packet::TraceOn);
                return Ok(());
            }
            0x06 => ProcState::ProcData(PktFn::Exception),
            0x07 => {
                self.stage(Etmv4Packet::ExceptionReturn);
                return Ok(());
            }
            0x0C | 0x0D => ProcState::ProcData(PktFn::CcF1),
            0x0E | 0x0F => ProcState::ProcData(PktFn::CcF2),
            0x10..=0x13 => {
                self.stage(Etmv4Packet::CycleCount {
                    count: (header & 0x3) as u32,
                });
                return Ok(());
            }
            0x2D => ProcState::ProcData(PktFn::Commit),
            0x2E | 0x2F => ProcState::ProcData(PktFn::Cancel {
                mispredict: header & 1 != 0,
            }),
            0x30..=0x33 => {
                self.stage(Etmv4Packet::Mispredict);
                return Ok(());
            }
            0x34..=0x37 => {
                self.stage(Etmv4Packet::Cancel {
                    count: 1,
                    mispredict: false,
                });
                return Ok(());
            }
            0x38..=0x3F => {
                self.stage(Etmv4Packet::Cancel {
                    count: ((header & 0x7) + 2) as u32,
                    mispredict: false,
                });
                return Ok(());
            }
            0x40..=0x6F => {
                self.stage(Etmv4Packet::Cond);
                return Ok(());
            }
            0x71..=0x7F => {
                self.stage(Etmv4Packet::Event {
                    mask: header & 0xF,
                });
                return Ok(());
            }
            0x80 => {
                self.stage(Etmv4Packet::Context(Etmv4Context::default()));
                return Ok(());
            }
            0x81 => ProcState::ProcData(PktFn::Context),
            0x82 | 0x83 => ProcState::ProcData(PktFn::AddrLong {
                bits64: false,
                is: if header & 1 != 0 { AddrIs::Is1 } else { AddrIs::Is0 },
                with_ctxt: true,
            }),
            0x85 | 0x86 => ProcState::ProcData(PktFn::AddrLong {
                bits64: true,
                is: if header == 0x86 { AddrIs::Is1 } else { AddrIs::Is0 },
                with_ctxt: true,
            }),
            0x90..=0x92 => {
                self.stage(Etmv4Packet::AddrMatch {
                    idx: header & 0x3,
                });
                return Ok(());
            }
            0x95 | 0x96 => ProcState::ProcData(PktFn::AddrShort {
                is: if header & 1 != 0 { AddrIs::Is1 } else { AddrIs::Is0 },
            }),
            0x9A | 0x9B => ProcState::ProcData(PktFn::AddrLong {
                bits64: false,
                is: if header & 1 != 0 { AddrIs::Is1 } else { AddrIs::Is0 },
                with_ctxt: false,
            }),
            0x9D | 0x9E => ProcState::ProcData(PktFn::AddrLong {
                bits64: true,
                is: if header == 0x9E { AddrIs::Is1 } else { AddrIs::Is0 },
                with_ctxt: false,
            }),
            0xA0..=0xAF => {
                self.stage(Etmv4Packet::Q);
                return Ok(());
            }
            0xC0..=0xD3 => {
                // format 6: (header - 0xC0) + 3 E atoms, then one N
                let e_count = (header - 0xC0) + 3;
                self.stage(Etmv4Packet::Atom(Atom {
                    count: e_count + 1,
                    en_bits: (1u32 << e_count) - 1,
                }));
                return Ok(());
            }
            0xF5 | 0xD5..=0xD7 => {
                // format 5 patterns, oldest atom first:
                //   0xF5 NENEN, 0xD5 ENENE, 0xD6 NNNNN, 0xD7 EEEEE
                let en_bits = match header {
                    0xF5 => 0b01010,
                    0xD5 => 0b10101,
                    0xD6 => 0b00000,
                    _ => 0b11111,
                };
                self.stage(Etmv4Packet::Atom(Atom { count: 5, en_bits }));
                return Ok(());
            }
            0xD8..=0xDB => {
                self.stage(Etmv4Packet::Atom(Atom {
                    count: 2,
                    en_bits: (header & 0x3) as u32,
                }));
                return Ok(());
            }
            0xDC..=0xDF => {
                // format 4 patterns, oldest atom first:
                //   0xDC NNNN, 0xDD EEEE, 0xDE NENE, 0xDF ENEN
                let en_bits = match header {
                    0xDC => 0b0000,
                    0xDD => 0b1111,
                    0xDE => 0b1010,
                    _ => 0b0101,
                };
                self.stage(Etmv4Packet::Atom(Atom { count: 4, en_bits }));
                return Ok(());
            }
            0xF6 | 0xF7 => {
                self.stage(Etmv4Packet::Atom(Atom::one(header & 1 != 0)));
                return Ok(());
            }
            0xF8..=0xFF => {
                self.stage(Etmv4Packet::Atom(Atom {
                    count: 3,
                    en_bits: (header & 0x7) as u32,
                }));
                return Ok(());
            }
            _ => return Err(BadPacket::ReservedHdr(header)),
        };
        self.state = next;
        Ok(())
    }

    fn run_pkt_fn(
        &mut self,
        f: PktFn,
        block: &[u8],
        used: &mut usize,
    ) -> Result<(), BadPacket> {
        match f {
            PktFn::Extension => self.pkt_extension(block, used),
            PktFn::Async => self.pkt_async(block, used),
            PktFn::TraceInfo => self.pkt_trace_info(block, used),
            PktFn::Timestamp { cc } => self.pkt_timestamp(cc, block, used),
            PktFn::Exception => self.pkt_exception(block, used),
            PktFn::CcF1 => self.pkt_cc_f1(block, used),
            PktFn::CcF2 => self.pkt_cc_f2(block, used),
            PktFn::Commit => self.pkt_commit(block, used),
            PktFn::Cancel { mispredict } => self.pkt_cancel(mispredict, block, used),
            PktFn::Context => self.pkt_context(block, used),
            PktFn::AddrShort { is } => self.pkt_addr_short(is, block, used),
            PktFn::AddrLong {
                bits64,
                is,
                with_ctxt,
            } => self.pkt_addr_long(bits64, is, with_ctxt, block, used),
        }
    }

    // Scan a continued (base-128) value in self.data starting at
    // `start`: bytes carry 7 value bits, bit 7 continues. At most
    // `max_bytes`.
    fn scan_cont(
        data: &[u8],
        start: usize,
        max_bytes: usize,
    ) -> Result<Parse<(u64, usize)>, ()> {
        let mut value = 0u64;
        for (i, byte) in data[start..].iter().enumerate() {
            if i == max_bytes {
                return Err(());
            }
            value |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(Parse::Done((value, start + i + 1)));
            }
        }
        if data.len() - start >= max_bytes {
            return Err(());
        }
        Ok(Parse::NeedMore)
    }

    fn pkt_extension(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        if self.data.len() == 1 {
            let Some(ext) = self.read_byte(block, used) else {
                return Ok(());
            };
            match ext {
                0x00 => {
                    self.state = ProcState::ProcData(PktFn::Async);
                    return self.pkt_async(block, used);
                }
                0x03 => {
                    self.stage(Etmv4Packet::Discard);
                    return Ok(());
                }
                0x05 => {
                    self.stage(Etmv4Packet::Overflow);
                    return Ok(());
                }
                _ => {
                    return Err(BadPacket::Sequence(
                        "extension packet: unknown second byte",
                    ))
                }
            }
        }
        Ok(())
    }

    fn read_async_seq(&mut self, block: &[u8], used: &mut usize) -> AsyncScan {
        while self.data.len() < ASYNC_ZEROS {
            match self.read_byte(block, used) {
                Some(0x00) => {}
                Some(_) => return AsyncScan::Error,
                None => return AsyncScan::NeedData,
            }
        }
        loop {
            match self.read_byte(block, used) {
                Some(0x80) => return AsyncScan::Found,
                Some(0x00) => {}
                Some(_) => return AsyncScan::Error,
                None => return AsyncScan::NeedData,
            }
        }
    }

    fn pkt_async(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        match self.read_async_seq(block, used) {
            AsyncScan::Found => {
                self.stage(Etmv4Packet::Async);
                Ok(())
            }
            AsyncScan::Error => Err(BadPacket::Sequence(
                "async packet: unexpected non-zero value",
            )),
            AsyncScan::NeedData => Ok(()),
        }
    }

    fn pkt_trace_info(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        loop {
            match Self::try_trace_info(&self.data) {
                Ok(Parse::Done(info)) => {
                    self.stage(Etmv4Packet::TraceInfo(info));
                    return Ok(());
                }
                Ok(Parse::NeedMore) => {
                    if self.read_byte(block, used).is_none() {
                        return Ok(());
                    }
                }
                Err(()) => {
                    return Err(BadPacket::Sequence(
                        "trace info packet: section value too long",
                    ))
                }
            }
        }
    }

    // layout: PLCTL, [INFO], [KEY cont ≤4], [SPEC cont ≤4], [CYCT cont ≤2]
    fn try_trace_info(data: &[u8]) -> Result<Parse<TraceInfo>, ()> {
        let Some(&plctl) = data.get(1) else {
            return Ok(Parse::NeedMore);
        };
        let mut info = TraceInfo::default();
        let mut pos = 2usize;

        if plctl & 0x01 != 0 {
            let Some(&byte) = data.get(pos) else {
                return Ok(Parse::NeedMore);
            };
            info.cc_enabled = byte & 0x01 != 0;
            info.cond_enabled = byte & 0x02 != 0;
            info.p0_load = byte & 0x04 != 0;
            info.p0_store = byte & 0x08 != 0;
            pos += 1;
        }
        if plctl & 0x02 != 0 {
            match Self::scan_cont(data, pos, 4)? {
                Parse::Done((v, next)) => {
                    info.p0_key = v as u32;
                    pos = next;
                }
                Parse::NeedMore => return Ok(Parse::NeedMore),
            }
        }
        if plctl & 0x04 != 0 {
            match Self::scan_cont(data, pos, 4)? {
                Parse::Done((v, next)) => {
                    info.curr_spec_depth = v as u32;
                    pos = next;
                }
                Parse::NeedMore => return Ok(Parse::NeedMore),
            }
        }
        if plctl & 0x08 != 0 {
            match Self::scan_cont(data, pos, 2)? {
                Parse::Done((v, _)) => info.cc_threshold = v as u32,
                Parse::NeedMore => return Ok(Parse::NeedMore),
            }
        }
        Ok(Parse::Done(info))
    }

    fn pkt_timestamp(&mut self, cc: bool, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        loop {
            match Self::try_timestamp(&self.data, cc) {
                Some((ts, cc_val)) => {
                    self.stage(Etmv4Packet::Timestamp { ts, cc: cc_val });
                    return Ok(());
                }
                None => {
                    if self.read_byte(block, used).is_none() {
                        return Ok(());
                    }
                }
            }
        }
    }

    // up to 9 timestamp bytes: the first eight carry 7 bits each with a
    // continuation bit, the ninth carries bits [63:56] outright.
    fn try_timestamp(data: &[u8], cc: bool) -> Option<(u64, Option<u32>)> {
        let payload = &data[1..];
        let mut ts = 0u64;
        let mut ts_end = None;
        for (i, byte) in payload.iter().enumerate().take(9) {
            if i == 8 {
                ts |= (*byte as u64) << 56;
                ts_end = Some(i + 1);
                break;
            }
            ts |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                ts_end = Some(i + 1);
                break;
            }
        }
        let ts_end = ts_end?;

        if !cc {
            return Some((ts, None));
        }
        match Self::scan_cont(data, 1 + ts_end, 3) {
            Ok(Parse::Done((count, _))) => Some((ts, Some(count as u32))),
            _ => None,
        }
    }

    fn pkt_exception(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        // byte 0: [5:1] number low, [6] same-address flag, [7] continue
        // byte 1: [4:0] number high
        while self.data.len() < 2 {
            if self.read_byte(block, used).is_none() {
                return Ok(());
            }
        }
        let b0 = self.data[1];
        if b0 & 0x80 != 0 && self.data.len() < 3 {
            if self.read_byte(block, used).is_none() {
                return Ok(());
            }
        }

        let mut number = ((b0 >> 1) & 0x1F) as u16;
        if b0 & 0x80 != 0 {
            number |= ((self.data[2] & 0x1F) as u16) << 5;
        }
        self.stage(Etmv4Packet::Exception {
            number,
            prev_same: b0 & 0x40 != 0,
        });
        Ok(())
    }

    fn pkt_cc_f1(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        loop {
            match Self::scan_cont(&self.data, 1, 3) {
                Ok(Parse::Done((count, _))) => {
                    self.stage(Etmv4Packet::CycleCount {
                        count: count as u32,
                    });
                    return Ok(());
                }
                Ok(Parse::NeedMore) => {
                    if self.read_byte(block, used).is_none() {
                        return Ok(());
                    }
                }
                Err(()) => {
                    return Err(BadPacket::Sequence("cycle count packet: value too long"))
                }
            }
        }
    }

    fn pkt_cc_f2(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        if self.data.len() < 2 && self.read_byte(block, used).is_none() {
            return Ok(());
        }
        self.stage(Etmv4Packet::CycleCount {
            count: self.data[1] as u32,
        });
        Ok(())
    }

    fn pkt_commit(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        loop {
            match Self::scan_cont(&self.data, 1, 4) {
                Ok(Parse::Done((count, _))) => {
                    self.stage(Etmv4Packet::Commit {
                        count: count as u32,
                    });
                    return Ok(());
                }
                Ok(Parse::NeedMore) => {
                    if self.read_byte(block, used).is_none() {
                        return Ok(());
                    }
                }
                Err(()) => return Err(BadPacket::Sequence("commit packet: count too long")),
            }
        }
    }

    fn pkt_cancel(
        &mut self,
        mispredict: bool,
        block: &[u8],
        used: &mut usize,
    ) -> Result<(), BadPacket> {
        loop {
            match Self::scan_cont(&self.data, 1, 4) {
                Ok(Parse::Done((count, _))) => {
                    self.stage(Etmv4Packet::Cancel {
                        count: count as u32,
                        mispredict,
                    });
                    return Ok(());
                }
                Ok(Parse::NeedMore) => {
                    if self.read_byte(block, used).is_none() {
                        return Ok(());
                    }
                }
                Err(()) => return Err(BadPacket::Sequence("cancel packet: count too long")),
            }
        }
    }

    // context payload from `start`: info byte [1:0] EL, [4] SF, [5] NS,
    // [6] VMID follows, [7] context ID follows; then VMID / context ID
    // bytes, sizes per the hardware config.
    fn try_context(&self, start: usize) -> Option<(Etmv4Context, usize)> {
        let info = *self.data.get(start)?;
        let vmid_len = if info & 0x40 != 0 {
            self.config.vmid_bytes().max(1)
        } else {
            0
        };
        let cid_len = if info & 0x80 != 0 { self.config.cid_bytes() } else { 0 };
        let needed = start + 1 + vmid_len + cid_len;
        if self.data.len() < needed {
            return None;
        }

        let mut ctxt = Etmv4Context {
            updated: true,
            el: info & 0x3,
            sf: info & 0x10 != 0,
            ns: info & 0x20 != 0,
            ..Etmv4Context::default()
        };
        let mut pos = start + 1;
        if vmid_len > 0 {
            let mut vmid = 0u32;
            for (i, byte) in self.data[pos..pos + vmid_len].iter().enumerate() {
                vmid |= (*byte as u32) << (8 * i);
            }
            ctxt.updated_v = true;
            ctxt.vmid = vmid;
            pos += vmid_len;
        }
        if cid_len > 0 {
            let mut cid = 0u32;
            for (i, byte) in self.data[pos..pos + cid_len].iter().enumerate() {
                cid |= (*byte as u32) << (8 * i);
            }
            ctxt.updated_c = true;
            ctxt.ctxt_id = cid;
            pos += cid_len;
        }
        Some((ctxt, pos))
    }

    fn pkt_context(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        loop {
            if let Some((ctxt, _)) = self.try_context(1) {
                self.stage(Etmv4Packet::Context(ctxt));
                return Ok(());
            }
            if self.read_byte(block, used).is_none() {
                return Ok(());
            }
        }
    }

    // short address: byte 0 carries the low bits (IS0: address [8:2],
    // IS1: [7:1]) and a continuation bit selecting a second byte (IS0:
    // [16:9], IS1: [15:8]).
    fn pkt_addr_short(
        &mut self,
        is: AddrIs,
        block: &[u8],
        used: &mut usize,
    ) -> Result<(), BadPacket> {
        if self.data.len() < 2 && self.read_byte(block, used).is_none() {
            return Ok(());
        }
        let b0 = self.data[1];
        let two_bytes = b0 & 0x80 != 0;
        if two_bytes && self.data.len() < 3 && self.read_byte(block, used).is_none() {
            return Ok(());
        }

        let shift0 = match is {
            AddrIs::Is0 => 2,
            AddrIs::Is1 => 1,
        };
        let mut addr = ((b0 & 0x7F) as u32) << shift0;
        let mut bits = 7 + shift0;
        if two_bytes {
            addr |= (self.data[2] as u32) << (7 + shift0);
            bits += 8;
        }
        self.stage(Etmv4Packet::AddrShort { addr, bits, is });
        Ok(())
    }

    // long address: IS0 packs address [8:2] and [15:9] into two 7-bit
    // bytes then full bytes upward; IS1 packs [7:1] then full bytes.
    fn extract_long_addr(&self, bits64: bool, is: AddrIs) -> u64 {
        let p = &self.data[1..];
        let mut addr: u64;
        let mut next: usize;
        let mut shift: u32;
        match is {
            AddrIs::Is0 => {
                addr = ((p[0] & 0x7F) as u64) << 2;
                addr |= ((p[1] & 0x7F) as u64) << 9;
                next = 2;
                shift = 16;
            }
            AddrIs::Is1 => {
                addr = ((p[0] & 0x7F) as u64) << 1;
                next = 1;
                shift = 8;
            }
        }
        let total = if bits64 { 8 } else { 4 };
        while next < total {
            addr |= (p[next] as u64) << shift;
            next += 1;
            shift += 8;
        }
        addr
    }

    fn pkt_addr_long(
        &mut self,
        bits64: bool,
        is: AddrIs,
        with_ctxt: bool,
        block: &[u8],
        used: &mut usize,
    ) -> Result<(), BadPacket> {
        let addr_len = if bits64 { 8 } else { 4 };
        while self.data.len() < 1 + addr_len {
            if self.read_byte(block, used).is_none() {
                return Ok(());
            }
        }

        if with_ctxt {
            loop {
                if let Some((ctxt, _)) = self.try_context(1 + addr_len) {
                    let addr = self.extract_long_addr(bits64, is);
                    self.stage(Etmv4Packet::AddrCtxt {
                        addr,
                        is,
                        bits64,
                        ctxt,
                    });
                    return Ok(());
                }
                if self.read_byte(block, used).is_none() {
                    return Ok(());
                }
            }
        }

        let addr = self.extract_long_addr(bits64, is);
        self.stage(Etmv4Packet::AddrLong { addr, is, bits64 });
        Ok(())
    }

    fn wait_for_sync(
        &mut self,
        block_index: TraceIndex,
        block: &[u8],
        used: &mut usize,
        sink: &mut dyn PacketSink<Etmv4Packet>,
    ) -> DataPathResp {
        let mut resp = DataPathResp::Cont;
        self.dump_unsynced = 0;

        if !self.sync_start {
            self.pkt_index = block_index + *used as u64;
        }

        while !self.synced && *used < block.len() && resp.is_cont() {
            if self.sync_start {
                match self.read_async_seq(block, used) {
                    AsyncScan::Found => {
                        self.synced = true;
                        self.stage(Etmv4Packet::Async);
                    }
                    AsyncScan::Error => {
                        self.dump_unsynced = self.data.len();
                        self.sync_start = false;
                    }
                    AsyncScan::NeedData => break,
                }
            }

            if !self.sync_start && !self.synced {
                let Some(byte) = self.read_byte(block, used) else {
                    break;
                };
                if byte == 0x00 {
                    self.sync_start = true;
                    resp = self.flush_unsynced(sink);
                    self.pkt_index = block_index + *used as u64 - 1;
                } else {
                    self.dump_unsynced += 1;
                    if self.dump_unsynced >= 8 {
                        resp = self.flush_unsynced(sink);
                    }
                }
            }
        }

        if !self.synced && !self.sync_start {
            resp = self.flush_unsynced(sink);
        }
        resp
    }

    fn flush_unsynced(&mut self, sink: &mut dyn PacketSink<Etmv4Packet>) -> DataPathResp {
        let mut resp = DataPathResp::Cont;
        let dump = self.dump_unsynced.min(self.data.len());
        sink.on_unsynced_bytes(self.pkt_index, &self.data[..dump]);

        if !self.sent_notsync {
            resp = sink.on_packet(self.pkt_index, &Etmv4Packet::NotSync);
            self.sent_notsync = true;
        }

        self.data.drain(..dump);
        self.dump_unsynced = 0;
        resp
    }

    fn output_packet(&mut self, sink: &mut dyn PacketSink<Etmv4Packet>) -> DataPathResp {
        let Some(pkt) = self.ready.take() else {
            return DataPathResp::Cont;
        };
        if !(pkt.is_bad() && self.op_flags.contains(OpFlags::NOMON_BAD_PKTS)) {
            sink.on_raw_packet(self.pkt_index, &self.data, &pkt);
        }
        let resp = sink.on_packet(self.pkt_index, &pkt);
        self.data.clear();
        self.state = if self.synced {
            ProcState::ProcHdr
        } else {
            ProcState::WaitSync
        };
        resp
    }

    fn handle_bad_packet(
        &mut self,
        bad: BadPacket,
        sink: &mut dyn PacketSink<Etmv4Packet>,
    ) -> DataPathResp {
        let (kind, pkt) = match bad {
            BadPacket::Sequence(msg) => {
                (ErrorKind::BadPacketSequence(msg), Etmv4Packet::BadSequence)
            }
            BadPacket::ReservedHdr(header) => (
                ErrorKind::InvalidPacketHeader { header },
                Etmv4Packet::Reserved { header },
            ),
        };
        sink.on_error(
            &Error::new(Severity::Error, kind)
                .at_index(self.pkt_index)
                .on_id(self.config.trace_id()),
        );

        if self.op_flags.contains(OpFlags::ERR_BAD_PKTS) {
            return DataPathResp::FatalInvalidData;
        }

        let resp = if self.op_flags.contains(OpFlags::NOFWD_BAD_PKTS) {
            self.data.clear();
            self.ready = None;
            self.state = ProcState::ProcHdr;
            DataPathResp::Cont
        } else {
            self.ready = Some(pkt);
            self.output_packet(sink)
        };

        if self.op_flags.contains(OpFlags::UNSYNC_ON_BAD_PKTS) {
            self.synced = false;
            self.sync_start = false;
            self.sent_notsync = false;
            self.state = ProcState::WaitSync;
        }
        resp
    }
}

impl PacketProcessor for Etmv4PktProc {
    type Packet = Etmv4Packet;

    fn process(
        &mut self,
        index: TraceIndex,
        data: &[u8],
        sink: &mut dyn PacketSink<Etmv4Packet>,
    ) -> (usize, DataPathResp) {
        let mut used = 0usize;
        let mut resp = DataPathResp::Cont;

        while used < data.len() && resp.is_cont() {
            if self.state == ProcState::WaitSync {
                resp = self.wait_for_sync(index, data, &mut used, sink);
                if self.state != ProcState::SendPkt {
                    continue;
                }
            }

            if self.state == ProcState::ProcHdr {
                self.pkt_index = index + used as u64;
                if let Err(bad) = self.process_hdr(data, &mut used) {
                    resp = self.handle_bad_packet(bad, sink);
                    continue;
                }
            }

            if let ProcState::ProcData(f) = self.state {
                if let Err(bad) = self.run_pkt_fn(f, data, &mut used) {
                    resp = self.handle_bad_packet(bad, sink);
                    continue;
                }
            }

            if self.state == ProcState::SendPkt {
                let out = self.output_packet(sink);
                if resp.is_cont() {
                    resp = out;
                }
            }
        }

        (used, resp)
    }

    fn eot(&mut self, sink: &mut dyn PacketSink<Etmv4Packet>) -> DataPathResp {
        if let ProcState::ProcData(_) = self.state {
            self.ready = Some(Etmv4Packet::IncompleteEot);
            return self.output_packet(sink);
        }
        DataPathResp::Cont
    }

    fn flush(&mut self, _sink: &mut dyn PacketSink<Etmv4Packet>) -> DataPathResp {
        DataPathResp::Cont
    }

    fn reset(&mut self) {
        self.state = ProcState::WaitSync;
        self.synced = false;
        self.sync_start = false;
        self.sent_notsync = false;
        self.dump_unsynced = 0;
        self.data.clear();
        self.ready = None;
    }
}
