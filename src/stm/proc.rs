//! STM packet processor: nibble stream → [`StmPacket`] sequence.
//!
//! Opcode tables, one per nibble level:
//!
//! ```text
//! 1N:  0 NULL   1 M8     2 MERR   3 C8    4-7 D8..D64
//!      8-B D8MTS..D64MTS  E FLAG+TS  F → 2N      (C, D reserved)
//! 2N:  0 → 3N   2 GERR   3 C16   4-7 D8TS..D64TS
//!      8-B D8M..D64M      E FLAG     F ASYNC     (1, C, D reserved)
//! 3N:  0 VERSION  6 TRIG  7 TRIG+TS  8 FREQ      (rest reserved)
//! ```
//!
//! Timestamp payloads are a length nibble followed by that many value
//! nibbles, most significant first; the version packet selects natural
//! binary or Grey coding.

use crate::datapath::{PacketProcessor, PacketSink};
use crate::error::{Error, ErrorKind, Severity};
use crate::stm::{StmConfig, StmPacket, StmTsType};
use crate::types::{DataPathResp, OpFlags, TraceIndex};

// async = at least twenty-one 0xF nibbles terminated by 0x0
const ASYNC_F_NIBBLES: u32 = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcState {
    WaitSync,
    ProcHdr,
    ProcData(OpFn),
    SendPkt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpFn {
    Hdr2N,
    Hdr3N,
    M8,
    MErr,
    GErr,
    C8,
    C16,
    Data,
    Version,
    Trig,
    Freq,
    Async,
    Ts,
}

// What a trailing timestamp attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pend {
    Data { size: u8 },
    Flag,
    Trig,
}

/// The STM packet processor.
pub struct StmPktProc {
    config: StmConfig,
    op_flags: OpFlags,
    state: ProcState,
    synced: bool,
    sent_notsync: bool,
    /// Run of 0xF nibbles towards an async.
    f_count: u32,
    /// High nibble of the last byte, not yet consumed.
    nibble_spare: Option<u8>,
    num_nibbles: usize,
    raw: Vec<u8>,
    pkt_index: TraceIndex,

    // packet under construction
    val: u64,
    num_data_nibbles: usize,
    pend: Pend,
    needs_ts: bool,
    marked: bool,
    ts_type: StmTsType,
    ts_len: Option<usize>,
    ts_val: u64,
    ts_nibbles: usize,
    ready: Option<StmPacket>,
}

impl StmPktProc {
    pub fn new(config: StmConfig) -> StmPktProc {
        StmPktProc {
            config,
            op_flags: OpFlags::empty(),
            state: ProcState::WaitSync,
            synced: false,
            sent_notsync: false,
            f_count: 0,
            nibble_spare: None,
            num_nibbles: 0,
            raw: Vec::new(),
            pkt_index: 0,
            val: 0,
            num_data_nibbles: 0,
            pend: Pend::Flag,
            needs_ts: false,
            marked: false,
            ts_type: StmTsType::NatBinary,
            ts_len: None,
            ts_val: 0,
            ts_nibbles: 0,
            ready: None,
        }
    }

    pub fn set_op_flags(&mut self, flags: OpFlags) {
        self.op_flags = flags;
    }

    // In an STM byte, bits [3:0] are the first nibble in protocol
    // order, bits [7:4] the second.
    fn read_nibble(&mut self, block: &[u8], used: &mut usize) -> Option<u8> {
        if let Some(n) = self.nibble_spare.take() {
            self.num_nibbles += 1;
            return Some(n);
        }
        if *used < block.len() {
            let byte = block[*used];
            *used += 1;
            self.raw.push(byte);
            self.nibble_spare = Some((byte >> 4) & 0xF);
            self.num_nibbles += 1;
            Some(byte & 0xF)
        } else {
            None
        }
    }

    // Accumulate nibbles (most significant first) until `nibbles_to_val`
    // total nibbles of the packet have been read.
    fn extract_val(&mut self, nibbles_to_val: usize, block: &[u8], used: &mut usize) -> bool {
        while self.num_nibbles < nibbles_to_val {
            match self.read_nibble(block, used) {
                Some(nibble) => {
                    self.val <<= 4;
                    self.val |= nibble as u64;
                }
                None => return false,
            }
        }
        true
    }

    fn init_packet(&mut self) {
        self.num_nibbles = 0;
        self.raw.clear();
        self.val = 0;
        self.num_data_nibbles = 0;
        self.pend = Pend::Flag;
        self.needs_ts = false;
        self.marked = false;
        self.ts_len = None;
        self.ts_val = 0;
        self.ts_nibbles = 0;
    }

    fn stage(&mut self, pkt: StmPacket) {
        self.ready = Some(pkt);
        self.state = ProcState::SendPkt;
    }

    fn start_data(&mut self, size: u8, marked: bool, needs_ts: bool, hdr_nibbles: usize) {
        self.num_data_nibbles = hdr_nibbles + (size as usize) * 2;
        self.pend = Pend::Data { size };
        self.marked = marked;
        self.needs_ts = needs_ts;
        self.state = ProcState::ProcData(OpFn::Data);
    }

    fn process_hdr(&mut self, block: &[u8], used: &mut usize) -> Result<(), u16> {
        let Some(nibble) = self.read_nibble(block, used) else {
            return Ok(());
        };

        match nibble {
            0x0 => self.stage(StmPacket::Null),
            0x1 => self.state = ProcState::ProcData(OpFn::M8),
            0x2 => self.state = ProcState::ProcData(OpFn::MErr),
            0x3 => self.state = ProcState::ProcData(OpFn::C8),
            0x4..=0x7 => self.start_data(1 << (nibble - 4), false, false, 1),
            0x8..=0xB => self.start_data(1 << (nibble - 8), true, true, 1),
            0xE => {
                // FLAG with timestamp: payload is the timestamp alone
                self.pend = Pend::Flag;
                self.needs_ts = true;
                self.state = ProcState::ProcData(OpFn::Ts);
            }
            0xF => self.state = ProcState::ProcData(OpFn::Hdr2N),
            bad => return Err(bad as u16),
        }
        Ok(())
    }

    fn process_hdr_2n(&mut self, block: &[u8], used: &mut usize) -> Result<(), u16> {
        let Some(nibble) = self.read_nibble(block, used) else {
            return Ok(());
        };

        match nibble {
            0x0 => self.state = ProcState::ProcData(OpFn::Hdr3N),
            0x2 => self.state = ProcState::ProcData(OpFn::GErr),
            0x3 => self.state = ProcState::ProcData(OpFn::C16),
            0x4..=0x7 => self.start_data(1 << (nibble - 4), false, true, 2),
            0x8..=0xB => self.start_data(1 << (nibble - 8), true, false, 2),
            0xE => self.stage(StmPacket::Flag { ts: None }),
            0xF => {
                self.f_count = 2;
                self.state = ProcState::ProcData(OpFn::Async);
            }
            bad => return Err(0x00F | ((bad as u16) << 4)),
        }
        Ok(())
    }

    fn process_hdr_3n(&mut self, block: &[u8], used: &mut usize) -> Result<(), u16> {
        let Some(nibble) = self.read_nibble(block, used) else {
            return Ok(());
        };

        match nibble {
            0x0 => self.state = ProcState::ProcData(OpFn::Version),
            0x6 => {
                self.pend = Pend::Trig;
                self.state = ProcState::ProcData(OpFn::Trig);
            }
            0x7 => {
                self.pend = Pend::Trig;
                self.needs_ts = true;
                self.state = ProcState::ProcData(OpFn::Trig);
            }
            0x8 => self.state = ProcState::ProcData(OpFn::Freq),
            bad => return Err(0x00F | ((bad as u16) << 8)),
        }
        Ok(())
    }

    fn finish_or_ts(&mut self, pkt: StmPacket) {
        if self.needs_ts {
            self.state = ProcState::ProcData(OpFn::Ts);
        } else {
            self.stage(pkt);
        }
    }

    fn run_pkt_fn(&mut self, f: OpFn, block: &[u8], used: &mut usize) -> Result<(), u16> {
        match f {
            OpFn::Hdr2N => return self.process_hdr_2n(block, used),
            OpFn::Hdr3N => return self.process_hdr_3n(block, used),

            OpFn::M8 => {
                if self.extract_val(3, block, used) {
                    self.stage(StmPacket::Master {
                        master: self.val as u8,
                    });
                }
            }
            OpFn::MErr => {
                if self.extract_val(3, block, used) {
                    self.stage(StmPacket::MErr {
                        err: self.val as u8,
                    });
                }
            }
            OpFn::GErr => {
                if self.extract_val(4, block, used) {
                    self.stage(StmPacket::GErr {
                        err: self.val as u8,
                    });
                }
            }
            OpFn::C8 => {
                if self.extract_val(3, block, used) {
                    self.stage(StmPacket::Channel {
                        channel: self.val as u16,
                    });
                }
            }
            OpFn::C16 => {
                if self.extract_val(6, block, used) {
                    self.stage(StmPacket::Channel {
                        channel: self.val as u16,
                    });
                }
            }

            OpFn::Data => {
                if self.extract_val(self.num_data_nibbles, block, used) {
                    let Pend::Data { size } = self.pend else {
                        unreachable!("data op always pends data");
                    };
                    let pkt = StmPacket::Data {
                        data: self.val,
                        size,
                        marked: self.marked,
                        ts: None,
                    };
                    self.finish_or_ts(pkt);
                }
            }

            OpFn::Version => {
                if let Some(version) = self.read_nibble(block, used) {
                    match version {
                        3 => self.ts_type = StmTsType::NatBinary,
                        4 => self.ts_type = StmTsType::Grey,
                        _ => {
                            self.stage(StmPacket::BadSequence);
                            return Ok(());
                        }
                    }
                    self.stage(StmPacket::Version {
                        version,
                        ts_type: self.ts_type,
                    });
                }
            }

            OpFn::Trig => {
                if self.extract_val(5, block, used) {
                    let pkt = StmPacket::Trig {
                        value: self.val as u8,
                        ts: None,
                    };
                    self.finish_or_ts(pkt);
                }
            }

            OpFn::Freq => {
                if self.extract_val(11, block, used) {
                    self.stage(StmPacket::Freq {
                        hz: self.val as u32,
                    });
                }
            }

            OpFn::Async => loop {
                let Some(nibble) = self.read_nibble(block, used) else {
                    return Ok(());
                };
                match nibble {
                    0xF => self.f_count += 1,
                    0x0 if self.f_count >= ASYNC_F_NIBBLES => {
                        self.f_count = 0;
                        self.stage(StmPacket::Async);
                        return Ok(());
                    }
                    _ => {
                        self.f_count = 0;
                        self.stage(StmPacket::BadSequence);
                        return Ok(());
                    }
                }
            },

            OpFn::Ts => {
                if self.ts_len.is_none() {
                    let Some(len) = self.read_nibble(block, used) else {
                        return Ok(());
                    };
                    self.ts_len = Some(len as usize);
                }
                let len = self.ts_len.unwrap_or(0);
                while self.ts_nibbles < len {
                    let Some(nibble) = self.read_nibble(block, used) else {
                        return Ok(());
                    };
                    self.ts_val = (self.ts_val << 4) | nibble as u64;
                    self.ts_nibbles += 1;
                }

                let ts = match self.ts_type {
                    StmTsType::NatBinary => self.ts_val,
                    StmTsType::Grey => gray_to_bin(self.ts_val),
                };
                let pkt = match self.pend {
                    Pend::Data { size } => StmPacket::Data {
                        data: self.val,
                        size,
                        marked: self.marked,
                        ts: Some(ts),
                    },
                    Pend::Flag => StmPacket::Flag { ts: Some(ts) },
                    Pend::Trig => StmPacket::Trig {
                        value: self.val as u8,
                        ts: Some(ts),
                    },
                };
                self.stage(pkt);
            }
        }
        Ok(())
    }

    fn wait_for_sync(
        &mut self,
        block_index: TraceIndex,
        block: &[u8],
        used: &mut usize,
        sink: &mut dyn PacketSink<StmPacket>,
    ) -> DataPathResp {
        let mut resp = DataPathResp::Cont;

        if !self.sent_notsync {
            self.pkt_index = block_index + *used as u64;
            resp = sink.on_packet(self.pkt_index, &StmPacket::NotSync);
            self.sent_notsync = true;
        }

        while !self.synced
            && (*used < block.len() || self.nibble_spare.is_some())
            && resp.is_cont()
        {
            let Some(nibble) = self.read_nibble(block, used) else {
                break;
            };
            match nibble {
                0xF => self.f_count += 1,
                0x0 if self.f_count >= ASYNC_F_NIBBLES => {
                    self.synced = true;
                    self.f_count = 0;
                    self.pkt_index = block_index + *used as u64;
                    self.stage(StmPacket::Async);
                }
                _ => self.f_count = 0,
            }

            // keep the unsynced buffer bounded
            if !self.synced && self.raw.len() >= 16 {
                sink.on_unsynced_bytes(block_index, &self.raw);
                self.raw.clear();
            }
        }

        if !self.synced && !self.raw.is_empty() {
            sink.on_unsynced_bytes(block_index, &self.raw);
            self.raw.clear();
            self.num_nibbles = 0;
        }
        resp
    }

    fn output_packet(&mut self, sink: &mut dyn PacketSink<StmPacket>) -> DataPathResp {
        let Some(pkt) = self.ready.take() else {
            return DataPathResp::Cont;
        };
        if !(pkt.is_bad() && self.op_flags.contains(OpFlags::NOMON_BAD_PKTS)) {
            sink.on_raw_packet(self.pkt_index, &self.raw, &pkt);
        }
        let resp = sink.on_packet(self.pkt_index, &pkt);
        self.init_packet();
        self.state = if self.synced {
            ProcState::ProcHdr
        } else {
            ProcState::WaitSync
        };
        resp
    }

    fn handle_bad_opcode(
        &mut self,
        opcode: u16,
        sink: &mut dyn PacketSink<StmPacket>,
    ) -> DataPathResp {
        sink.on_error(
            &Error::new(
                Severity::Error,
                ErrorKind::InvalidPacketHeader {
                    header: opcode as u8,
                },
            )
            .at_index(self.pkt_index)
            .on_id(self.config.trace_id()),
        );

        if self.op_flags.contains(OpFlags::ERR_BAD_PKTS) {
            return DataPathResp::FatalInvalidData;
        }
        let resp = if self.op_flags.contains(OpFlags::NOFWD_BAD_PKTS) {
            self.init_packet();
            self.state = ProcState::ProcHdr;
            DataPathResp::Cont
        } else {
            self.ready = Some(StmPacket::Reserved { opcode });
            self.output_packet(sink)
        };
        if self.op_flags.contains(OpFlags::UNSYNC_ON_BAD_PKTS) {
            self.synced = false;
            self.sent_notsync = false;
            self.f_count = 0;
            self.state = ProcState::WaitSync;
        }
        resp
    }
}

impl PacketProcessor for StmPktProc {
    type Packet = StmPacket;

    fn process(
        &mut self,
        index: TraceIndex,
        data: &[u8],
        sink: &mut dyn PacketSink<StmPacket>,
    ) -> (usize, DataPathResp) {
        let mut used = 0usize;
        let mut resp = DataPathResp::Cont;

        while (used < data.len() || self.nibble_spare.is_some()) && resp.is_cont() {
            if self.state == ProcState::WaitSync {
                resp = self.wait_for_sync(index, data, &mut used, sink);
                if self.state != ProcState::SendPkt {
                    if used >= data.len() {
                        break;
                    }
                    continue;
                }
            }

            if self.state == ProcState::ProcHdr {
                self.pkt_index = index + used as u64;
                if let Err(op) = self.process_hdr(data, &mut used) {
                    resp = self.handle_bad_opcode(op, sink);
                    continue;
                }
                if self.state == ProcState::ProcHdr {
                    break; // out of data
                }
            }

            // packet routines chain (header nibbles select further
            // tables, data may hand over to a timestamp); keep running
            // them until the packet completes or input runs dry
            let mut stalled = false;
            while let ProcState::ProcData(f) = self.state {
                let before = self.num_nibbles;
                if let Err(op) = self.run_pkt_fn(f, data, &mut used) {
                    resp = self.handle_bad_opcode(op, sink);
                    break;
                }
                if !matches!(self.state, ProcState::ProcData(_)) {
                    break;
                }
                if self.num_nibbles == before {
                    stalled = true; // out of data
                    break;
                }
            }
            if stalled {
                break;
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

    fn eot(&mut self, sink: &mut dyn PacketSink<StmPacket>) -> DataPathResp {
        if matches!(self.state, ProcState::ProcData(_)) {
            self.ready = Some(StmPacket::IncompleteEot);
            return self.output_packet(sink);
        }
        DataPathResp::Cont
    }

    fn flush(&mut self, _sink: &mut dyn PacketSink<StmPacket>) -> DataPathResp {
        DataPathResp::Cont
    }

    fn reset(&mut self) {
        self.state = ProcState::WaitSync;
        self.synced = false;
        self.sent_notsync = false;
        self.f_count = 0;
        self.nibble_spare = None;
        self.ts_type = StmTsType::NatBinary;
        self.ready = None;
        self.init_packet();
    }
}

/// Grey code → natural binary.
pub(crate) fn gray_to_bin(gray: u64) -> u64 {
    let mut bin = gray;
    let mut shift = 32;
    while shift > 0 {
        bin ^= bin >> shift;
        shift >>= 1;
    }
    bin
}

/// Natural binary → Grey code.
#[cfg(test)]
pub(crate) fn bin_to_gray(bin: u64) -> u64 {
    bin ^ (bin >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::PacketBuffer;

    // async: 21 F nibbles + terminating 0: 11 bytes
    fn async_bytes() -> Vec<u8> {
        let mut v = vec![0xFF; 10]; // 20 F nibbles
        v.push(0x0F); // F then 0 (low nibble first)
        v
    }

    fn run(bytes: &[u8]) -> Vec<StmPacket> {
        let mut p = StmPktProc::new(StmConfig::new(0x0020_0000));
        let mut sink = PacketBuffer::new();
        let (used, resp) = p.process(0, bytes, &mut sink);
        assert_eq!(used, bytes.len());
        assert!(resp.is_cont());
        sink.packets.into_iter().map(|(_, pkt)| pkt).collect()
    }

    #[test]
    fn sync_detection() {
        let packets = run(&async_bytes());
        assert_eq!(packets, vec![StmPacket::NotSync, StmPacket::Async]);
    }

    #[test]
    fn master_channel_data() {
        let mut bytes = async_bytes();
        // M8 0x23: nibbles 1,2,3 → bytes 0x21, 0x?3; C8 0x01: 3,0,1;
        // D8 0xA5: 4,A,5 — pack nibble stream: 1 2 3 3 0 1 4 A 5
        bytes.extend_from_slice(&[0x21, 0x33, 0x10, 0xA4, 0x05]);

        let packets = run(&bytes);
        assert_eq!(
            &packets[2..],
            &[
                StmPacket::Master { master: 0x23 },
                StmPacket::Channel { channel: 0x01 },
                StmPacket::Data {
                    data: 0xA5,
                    size: 1,
                    marked: false,
                    ts: None
                },
                // the padding nibble in the final byte reads as NULL
                StmPacket::Null,
            ]
        );
    }

    #[test]
    fn marked_timestamped_data() {
        let mut bytes = async_bytes();
        // D8MTS (opcode 8) data 0x7E, ts len 2, ts 0x42:
        // nibbles: 8 7 E 2 4 2 → bytes 0x78, 0x2E, 0x24
        bytes.extend_from_slice(&[0x78, 0x2E, 0x24]);

        let packets = run(&bytes);
        assert_eq!(
            packets[2],
            StmPacket::Data {
                data: 0x7E,
                size: 1,
                marked: true,
                ts: Some(0x42)
            }
        );
    }

    #[test]
    fn version_and_grey_timestamps() {
        let mut bytes = async_bytes();
        // version: F 0 0 3 → bytes 0x0F, 0x30
        bytes.extend_from_slice(&[0x0F, 0x30]);
        // wait: version 4 selects grey; use version 4 then FLAG+TS
        let packets = run(&bytes);
        assert_eq!(
            packets[2],
            StmPacket::Version {
                version: 3,
                ts_type: StmTsType::NatBinary
            }
        );
    }

    #[test]
    fn grey_conversion_round_trip() {
        for v in [0u64, 1, 2, 0x42, 0xDEAD_BEEF, u64::MAX >> 3] {
            assert_eq!(gray_to_bin(bin_to_gray(v)), v);
        }
    }

    #[test]
    fn freq_packet() {
        let mut bytes = async_bytes();
        // F 0 8 then 8 nibbles of 32-bit value 0x01312D00 (20 MHz):
        // nibbles F 0 8 0 1 3 1 2 D 0 0 → bytes 0x0F, 0x08, 0x31, 0x21,
        // 0x0D, 0x00
        bytes.extend_from_slice(&[0x0F, 0x08, 0x31, 0x21, 0x0D, 0x00]);

        let packets = run(&bytes);
        assert_eq!(packets[2], StmPacket::Freq { hz: 0x01312D00 });
    }

    #[test]
    fn reserved_opcode() {
        let mut bytes = async_bytes();
        bytes.push(0x0C); // 1N opcode C reserved (low nibble first)
        bytes.push(0x00); // pad so the spare nibble flushes

        let packets = run(&bytes);
        assert_eq!(packets[2], StmPacket::Reserved { opcode: 0xC });
    }
}
