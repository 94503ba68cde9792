//! PTM packet processor: byte stream → [`PtmPacket`] sequence.
//!
//! Header dispatch (first byte of each packet):
//!
//! ```text
//! 0x00        a-sync: five 0x00 then 0x80
//! 0x08        i-sync: 4-byte address (bit 0 = T), info byte,
//!             context ID bytes, cycle count when cycle accurate
//! 0x0C        trigger
//! 0x3C        VMID (one byte)
//! 0x48, 0x4C  timestamp (0x4C: cycle count follows)
//! 0x64        ignore
//! 0x6C        context ID
//! 0x70        waypoint update (compressed address)
//! 0x74        exception return
//! 0bxxxx_xx10 atom: E count in bits [5:2], trailing N when bit 6 set,
//!             cycle count when cycle accurate
//! 0bxxxx_xxx1 branch address (compressed, 1–5 bytes + exception byte)
//! remainder   reserved
//! ```
//!
//! Compressed addresses replace the low bits of the previous waypoint
//! address: byte 0 carries address bits \[6:1\] (branch) or \[7:1\]
//! (waypoint update) with bit 7 continuing, middle bytes 7 bits each,
//! and the final byte the top bits plus the T / NS state and, for
//! branches, an exception indicator.

use crate::datapath::{PacketProcessor, PacketSink};
use crate::error::{Error, ErrorKind, Severity};
use crate::ptm::packet::IsyncReason;
use crate::ptm::{PtmConfig, PtmPacket};
use crate::types::{DataPathResp, OpFlags, TraceIndex};

const ASYNC_ZEROS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcState {
    WaitSync,
    ProcHdr,
    ProcData(PktFn),
    SendPkt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PktFn {
    Async,
    Isync,
    BranchAddr,
    WaypointUpdate,
    Atom,
    Timestamp { cc: bool },
    ContextId,
    Vmid,
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

/// The PTM packet processor. Holds the running waypoint address used
/// to reconstruct compressed branch addresses.
pub struct PtmPktProc {
    config: PtmConfig,
    op_flags: OpFlags,
    state: ProcState,
    synced: bool,
    sync_start: bool,
    sent_notsync: bool,
    dump_unsynced: usize,
    header: u8,
    data: Vec<u8>,
    pkt_index: TraceIndex,
    ready: Option<PtmPacket>,

    // address reconstruction state
    curr_addr: u32,
    curr_thumb: bool,
    curr_ns: bool,
}

impl PtmPktProc {
    pub fn new(config: PtmConfig) -> PtmPktProc {
        PtmPktProc {
            config,
            op_flags: OpFlags::empty(),
            state: ProcState::WaitSync,
            synced: false,
            sync_start: false,
            sent_notsync: false,
            dump_unsynced: 0,
            header: 0,
            data: Vec::new(),
            pkt_index: 0,
            ready: None,
            curr_addr: 0,
            curr_thumb: false,
            curr_ns: false,
        }
    }

    pub fn set_op_flags(&mut self, flags: OpFlags) {
        self.op_flags = flags;
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

    fn stage(&mut self, pkt: PtmPacket) {
        self.ready = Some(pkt);
        self.state = ProcState::SendPkt;
    }

    fn process_hdr(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        let Some(header) = self.read_byte(block, used) else {
            return Ok(());
        };
        self.header = header;

        if header & 0x01 != 0 {
            self.state = ProcState::ProcData(PktFn::BranchAddr);
            return Ok(());
        }
        if header & 0x03 == 0x02 {
            self.state = ProcState::ProcData(PktFn::Atom);
            return Ok(());
        }

        match header {
            0x00 => self.state = ProcState::ProcData(PktFn::Async),
            0x08 => self.state = ProcState::ProcData(PktFn::Isync),
            0x0C => self.stage(PtmPacket::Trigger),
            0x3C => self.state = ProcState::ProcData(PktFn::Vmid),
            0x48 | 0x4C => {
                self.state = ProcState::ProcData(PktFn::Timestamp {
                    cc: header == 0x4C,
                })
            }
            0x64 => self.stage(PtmPacket::Ignore),
            0x6C => self.state = ProcState::ProcData(PktFn::ContextId),
            0x70 => self.state = ProcState::ProcData(PktFn::WaypointUpdate),
            0x74 => self.stage(PtmPacket::ExceptionRet),
            _ => return Err(BadPacket::ReservedHdr(header)),
        }
        Ok(())
    }

    fn run_pkt_fn(
        &mut self,
        f: PktFn,
        block: &[u8],
        used: &mut usize,
    ) -> Result<(), BadPacket> {
        match f {
            PktFn::Async => self.pkt_async(block, used),
            PktFn::Isync => self.pkt_isync(block, used),
            PktFn::BranchAddr => self.pkt_branch_addr(block, used),
            PktFn::WaypointUpdate => self.pkt_waypoint(block, used),
            PktFn::Atom => self.pkt_atom(block, used),
            PktFn::Timestamp { cc } => self.pkt_timestamp(cc, block, used),
            PktFn::ContextId => self.pkt_context_id(block, used),
            PktFn::Vmid => self.pkt_vmid(block, used),
        }
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
                self.stage(PtmPacket::Async);
                Ok(())
            }
            AsyncScan::Error => Err(BadPacket::Sequence(
                "a-sync packet: unexpected non-zero value",
            )),
            AsyncScan::NeedData => Ok(()),
        }
    }

    // continued value in self.data from `start`, 7 bits per byte, at
    // most `max_bytes`; the final allowed byte carries 8 bits. `None`
    // until the value is complete.
    fn scan_cont(data: &[u8], start: usize, max_bytes: usize) -> Option<(u64, usize)> {
        let mut value = 0u64;
        for (i, byte) in data[start..].iter().enumerate() {
            if i == max_bytes - 1 {
                value |= (*byte as u64) << (7 * i);
                return Some((value, start + i + 1));
            }
            value |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Some((value, start + i + 1));
            }
        }
        None
    }

    fn pkt_isync(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        let cid_len = self.config.cid_bytes();
        let fixed = 1 + 4 + 1 + cid_len; // header, address, info, context id
        while self.data.len() < fixed {
            if self.read_byte(block, used).is_none() {
                return Ok(());
            }
        }

        // cycle count trails when cycle accurate
        let mut cc = None;
        if self.config.cc_enabled() {
            loop {
                match Self::scan_cont(&self.data, fixed, 5) {
                    Some((val, _)) => {
                        cc = Some(val as u32);
                        break;
                    }
                    None => {
                        if self.read_byte(block, used).is_none() {
                            return Ok(());
                        }
                    }
                }
            }
        }

        let raw = u32::from_le_bytes([self.data[1], self.data[2], self.data[3], self.data[4]]);
        let thumb = raw & 1 != 0;
        let addr = raw & !1;
        let info = self.data[5];
        let reason = match (info >> 1) & 0x3 {
            0 => IsyncReason::Periodic,
            1 => IsyncReason::TraceOn,
            2 => IsyncReason::Overflow,
            _ => IsyncReason::DebugExit,
        };
        let ctxt_id = if cid_len > 0 {
            let mut id = 0u32;
            for (i, byte) in self.data[6..6 + cid_len].iter().enumerate() {
                id |= (*byte as u32) << (8 * i);
            }
            Some(id)
        } else {
            None
        };

        self.curr_addr = addr;
        self.curr_thumb = thumb;
        self.curr_ns = info & 0x01 != 0;

        self.stage(PtmPacket::Isync {
            addr,
            thumb,
            ns: info & 0x01 != 0,
            reason,
            ctxt_id,
            cycle_count: cc,
        });
        Ok(())
    }

    // Apply `bits` low bits of `partial` to the running address.
    fn merge_addr(&self, partial: u32, bits: u32) -> u32 {
        let mask = if bits >= 32 { !0 } else { (1u32 << bits) - 1 };
        (self.curr_addr & !mask) | (partial & mask)
    }

    fn pkt_branch_addr(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        // gather address bytes: continuation in bit 7, at most 5
        loop {
            let have = self.data.len();
            if have >= 1 && (self.data[have - 1] & 0x80 == 0 || have == 5) {
                break;
            }
            if self.read_byte(block, used).is_none() {
                return Ok(());
            }
        }

        let n = self.data.len();
        let full = n == 5;
        let last = self.data[n - 1];

        // exception byte trails the full form when flagged
        let mut exception = None;
        if full && last & 0x40 != 0 {
            if self.data.len() < 6 && self.read_byte(block, used).is_none() {
                return Ok(());
            }
            exception = Some((self.data[5] & 0x7F) as u16);
        }

        let mut partial = ((self.data[0] >> 1) & 0x3F) as u32;
        partial <<= 1;
        let mut bits = 7u32;
        for byte in &self.data[1..n.min(4)] {
            partial |= ((byte & 0x7F) as u32) << bits;
            bits += 7;
        }
        let mut thumb = self.curr_thumb;
        let mut ns = self.curr_ns;
        if full {
            partial |= ((last & 0x0F) as u32) << 28;
            bits = 32;
            thumb = last & 0x10 != 0;
            ns = last & 0x20 != 0;
        }

        let addr = self.merge_addr(partial, bits);
        self.curr_addr = addr;
        self.curr_thumb = thumb;
        self.curr_ns = ns;

        self.stage(PtmPacket::BranchAddr {
            addr,
            thumb,
            exception,
            ns,
        });
        Ok(())
    }

    fn pkt_waypoint(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        // same compressed scheme, bits [7:1] in the first byte
        loop {
            let have = self.data.len();
            if have >= 2 && (self.data[have - 1] & 0x80 == 0 || have == 6) {
                break;
            }
            if self.read_byte(block, used).is_none() {
                return Ok(());
            }
        }

        let payload = &self.data[1..];
        let n = payload.len();
        let full = n == 5;

        let mut partial = ((payload[0] & 0x7F) as u32) << 1;
        let mut bits = 8u32;
        for byte in &payload[1..n.min(4)] {
            partial |= ((byte & 0x7F) as u32) << bits;
            bits += 7;
        }
        let mut thumb = self.curr_thumb;
        if full {
            let last = payload[4];
            partial |= ((last & 0x07) as u32) << 29;
            bits = 32;
            thumb = last & 0x08 != 0;
        }

        let addr = self.merge_addr(partial, bits);
        self.curr_addr = addr;
        self.curr_thumb = thumb;

        self.stage(PtmPacket::WaypointUpdate { addr, thumb });
        Ok(())
    }

    fn pkt_atom(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        let e_count = (self.header >> 2) & 0xF;
        let n_atom = self.header & 0x40 != 0;
        let count = e_count + n_atom as u8;
        if count == 0 {
            return Err(BadPacket::Sequence("atom packet with no atoms"));
        }

        let mut cc = None;
        if self.config.cc_enabled() {
            loop {
                match Self::scan_cont(&self.data, 1, 5) {
                    Some((val, _)) => {
                        cc = Some(val as u32);
                        break;
                    }
                    None => {
                        if self.read_byte(block, used).is_none() {
                            return Ok(());
                        }
                    }
                }
            }
        }

        self.stage(PtmPacket::Atom {
            count,
            en_bits: (1u32 << e_count) - 1,
            cycle_count: cc,
        });
        Ok(())
    }

    fn pkt_timestamp(&mut self, cc: bool, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        loop {
            match Self::scan_cont(&self.data, 1, 9) {
                Some((ts, end)) => {
                    if !cc {
                        self.stage(PtmPacket::Timestamp {
                            ts,
                            cycle_count: None,
                        });
                        return Ok(());
                    }
                    match Self::scan_cont(&self.data, end, 5) {
                        Some((count, _)) => {
                            self.stage(PtmPacket::Timestamp {
                                ts,
                                cycle_count: Some(count as u32),
                            });
                            return Ok(());
                        }
                        None => {
                            if self.read_byte(block, used).is_none() {
                                return Ok(());
                            }
                        }
                    }
                }
                None => {
                    if self.read_byte(block, used).is_none() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn pkt_context_id(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        let cid_len = self.config.cid_bytes();
        if cid_len == 0 {
            return Err(BadPacket::Sequence(
                "context ID packet without programmed context ID tracing",
            ));
        }
        while self.data.len() < 1 + cid_len {
            if self.read_byte(block, used).is_none() {
                return Ok(());
            }
        }
        let mut id = 0u32;
        for (i, byte) in self.data[1..1 + cid_len].iter().enumerate() {
            id |= (*byte as u32) << (8 * i);
        }
        self.stage(PtmPacket::ContextId { id });
        Ok(())
    }

    fn pkt_vmid(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        if self.data.len() < 2 && self.read_byte(block, used).is_none() {
            return Ok(());
        }
        self.stage(PtmPacket::Vmid {
            vmid: self.data[1],
        });
        Ok(())
    }

    fn wait_for_sync(
        &mut self,
        block_index: TraceIndex,
        block: &[u8],
        used: &mut usize,
        sink: &mut dyn PacketSink<PtmPacket>,
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
                        self.stage(PtmPacket::Async);
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

    fn flush_unsynced(&mut self, sink: &mut dyn PacketSink<PtmPacket>) -> DataPathResp {
        let mut resp = DataPathResp::Cont;
        let dump = self.dump_unsynced.min(self.data.len());
        sink.on_unsynced_bytes(self.pkt_index, &self.data[..dump]);

        if !self.sent_notsync {
            resp = sink.on_packet(self.pkt_index, &PtmPacket::NotSync);
            self.sent_notsync = true;
        }

        self.data.drain(..dump);
        self.dump_unsynced = 0;
        resp
    }

    fn output_packet(&mut self, sink: &mut dyn PacketSink<PtmPacket>) -> DataPathResp {
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
        sink: &mut dyn PacketSink<PtmPacket>,
    ) -> DataPathResp {
        let (kind, pkt) = match bad {
            BadPacket::Sequence(msg) => {
                (ErrorKind::BadPacketSequence(msg), PtmPacket::BadSequence)
            }
            BadPacket::ReservedHdr(header) => (
                ErrorKind::InvalidPacketHeader { header },
                PtmPacket::Reserved { header },
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

impl PacketProcessor for PtmPktProc {
    type Packet = PtmPacket;

    fn process(
        &mut self,
        index: TraceIndex,
        data: &[u8],
        sink: &mut dyn PacketSink<PtmPacket>,
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

    fn eot(&mut self, sink: &mut dyn PacketSink<PtmPacket>) -> DataPathResp {
        if matches!(self.state, ProcState::ProcData(_)) {
            self.ready = Some(PtmPacket::IncompleteEot);
            return self.output_packet(sink);
        }
        DataPathResp::Cont
    }

    fn flush(&mut self, _sink: &mut dyn PacketSink<PtmPacket>) -> DataPathResp {
        DataPathResp::Cont
    }

    fn reset(&mut self) {
        self.state = ProcState::WaitSync;
        self.synced = false;
        self.sync_start = false;
        self.sent_notsync = false;
        self.dump_unsynced = 0;
        self.header = 0;
        self.data.clear();
        self.ready = None;
        self.curr_addr = 0;
        self.curr_thumb = false;
        self.curr_ns = false;
    }
}
