//! ITM packet processor: byte stream → [`ItmPacket`] sequence.

use bitmatch::bitmatch;

use crate::datapath::{PacketProcessor, PacketSink};
use crate::error::{Error, ErrorKind, Severity};
use crate::itm::{ItmConfig, ItmPacket};
use crate::types::{DataPathResp, OpFlags, TraceIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcState {
    WaitSync,
    ProcHdr,
    ProcData(PktFn),
    SendPkt,
}

// Payload routine for the packet in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PktFn {
    Data,
    Async,
    LocalTs,
    GlobalTs1,
    GlobalTs2,
    Extension,
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

/// The ITM packet processor. Feed it the per-ID byte stream; it emits
/// reconstructed packets to a [`PacketSink`].
pub struct ItmPktProc {
    config: ItmConfig,
    op_flags: OpFlags,
    state: ProcState,
    /// Synchronisation found in the stream.
    synced: bool,
    /// Currently scanning a candidate async sequence.
    sync_start: bool,
    sent_notsync: bool,
    /// Unsynced bytes accumulated since the last flush to the monitor.
    dump_unsynced: usize,
    header: u8,
    /// Raw bytes of the packet in flight (header included).
    data: Vec<u8>,
    /// Stream index of the packet in flight.
    pkt_index: TraceIndex,
    /// Completed packet staged for output.
    ready: Option<ItmPacket>,
}

impl ItmPktProc {
    pub fn new(config: ItmConfig) -> ItmPktProc {
        ItmPktProc {
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

    #[bitmatch]
    fn process_hdr(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        let Some(header) = self.read_byte(block, used) else {
            return Ok(());
        };
        self.header = header;

        #[bitmatch]
        match header {
            "0000_0000" => self.state = ProcState::ProcData(PktFn::Async),
            "0111_0000" => {
                self.ready = Some(ItmPacket::Overflow);
                self.state = ProcState::SendPkt;
            }
            // global timestamp, g selects GTS1 / GTS2
            "10g1_0100" => {
                let f = if g == 0 {
                    PktFn::GlobalTs1
                } else {
                    PktFn::GlobalTs2
                };
                self.state = ProcState::ProcData(f);
            }
            "????_0000" => self.state = ProcState::ProcData(PktFn::LocalTs),
            "????_1?00" => self.state = ProcState::ProcData(PktFn::Extension),
            // remaining zero-size encodings are reserved
            "????_??00" => return Err(BadPacket::ReservedHdr(header)),
            // stimulus data packets (SWIT / DWT)
            "????_????" => self.state = ProcState::ProcData(PktFn::Data),
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
            PktFn::Data => self.pkt_data(block, used),
            PktFn::Async => self.pkt_async(block, used),
            PktFn::LocalTs => self.pkt_local_ts(block, used),
            PktFn::GlobalTs1 => self.pkt_global_ts1(block, used),
            PktFn::GlobalTs2 => self.pkt_global_ts2(block, used),
            PktFn::Extension => self.pkt_extension(block, used),
        }
    }

    fn pkt_data(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        let mut req = (self.header & 0x3) as usize;
        if req == 3 {
            req = 4;
        }

        while self.data.len() - 1 < req {
            if self.read_byte(block, used).is_none() {
                return Ok(()); // out of data; resume next block
            }
        }

        let mut value = self.data[1] as u32;
        if req >= 2 {
            value |= (self.data[2] as u32) << 8;
        }
        if req == 4 {
            value |= (self.data[3] as u32) << 16;
            value |= (self.data[4] as u32) << 24;
        }

        let src = (self.header >> 3) & 0x1F;
        self.ready = Some(if self.header & 0x4 != 0 {
            ItmPacket::Dwt {
                disc: src,
                value,
                size: req as u8,
            }
        } else {
            ItmPacket::Swit {
                channel: src,
                value,
                size: req as u8,
            }
        });
        self.state = ProcState::SendPkt;
        Ok(())
    }

    // Read payload bytes until one without the continuation bit. True
    // when the terminator was seen; false when out of input data or at
    // the size cap (caller distinguishes via data length).
    fn read_cont_bytes(&mut self, limit: usize, block: &[u8], used: &mut usize) -> bool {
        while self.data.len() < limit {
            match self.read_byte(block, used) {
                Some(byte) => {
                    if byte & 0x80 == 0 {
                        return true;
                    }
                }
                None => break,
            }
        }
        false
    }

    // Little-endian base-128 value over payload bytes 1..
    fn extract_cont_val32(&self) -> u32 {
        let mut value = 0u32;
        for (i, byte) in self.data[1..].iter().enumerate() {
            value |= ((byte & 0x7F) as u32) << (7 * i);
        }
        value
    }

    fn extract_cont_val64(&self) -> u64 {
        let mut value = 0u64;
        for (i, byte) in self.data[1..].iter().enumerate() {
            value |= ((byte & 0x7F) as u64) << (7 * i);
        }
        value
    }

    fn pkt_local_ts(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        const LIMIT: usize = 5; // header + up to 4 payload bytes

        if self.data.len() == 1 && self.header & 0x80 == 0 {
            // single byte form: 3-bit TS in the header, TC sync
            self.ready = Some(ItmPacket::LocalTs {
                tc: 0,
                ts: ((self.header >> 4) & 0x7) as u32,
                size: 1,
            });
            self.state = ProcState::SendPkt;
            return Ok(());
        }

        if self.read_cont_bytes(LIMIT, block, used) {
            self.ready = Some(ItmPacket::LocalTs {
                tc: (self.header >> 4) & 0x3,
                ts: self.extract_cont_val32(),
                size: (self.data.len() - 1) as u8,
            });
            self.state = ProcState::SendPkt;
        } else if self.data.len() == LIMIT {
            return Err(BadPacket::Sequence(
                "local TS packet: payload continuation value too long",
            ));
        }
        Ok(())
    }

    fn pkt_global_ts1(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        const LIMIT: usize = 5;

        if self.read_cont_bytes(LIMIT, block, used) {
            let mut wrap = false;
            let mut clkch = false;
            // the fourth payload byte carries wrap / clock change bits
            if self.data.len() == 5 {
                let byte = self.data[4];
                wrap = byte & 0x40 != 0;
                clkch = byte & 0x20 != 0;
                self.data[4] = byte & 0x1F;
            }
            self.ready = Some(ItmPacket::GlobalTs1 {
                ts: self.extract_cont_val32(),
                size: (self.data.len() - 1) as u8,
                wrap,
                clkch,
            });
            self.state = ProcState::SendPkt;
        } else if self.data.len() == LIMIT {
            return Err(BadPacket::Sequence(
                "GTS1 packet: payload continuation value too long",
            ));
        }
        Ok(())
    }

    fn pkt_global_ts2(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        const LIMIT: usize = 7; // header + up to 6 payload bytes (64-bit form)

        if self.read_cont_bytes(LIMIT, block, used) {
            let ts = if self.data.len() <= 5 {
                self.extract_cont_val32() as u64
            } else {
                self.extract_cont_val64()
            };
            self.ready = Some(ItmPacket::GlobalTs2 { ts });
            self.state = ProcState::SendPkt;
        } else if self.data.len() == LIMIT {
            return Err(BadPacket::Sequence(
                "GTS2 packet: payload continuation value too long",
            ));
        }
        Ok(())
    }

    fn pkt_extension(&mut self, block: &[u8], used: &mut usize) -> Result<(), BadPacket> {
        const LIMIT: usize = 5;
        // meaningful payload bit length by byte count
        const N_BIT_LENGTH: [u8; 5] = [2, 9, 16, 23, 31];

        let done = if self.header & 0x80 == 0 {
            true // header-only form
        } else {
            self.read_cont_bytes(LIMIT, block, used)
        };

        if done {
            let nbits = N_BIT_LENGTH[self.data.len() - 1];
            let mut value = 0u32;
            if self.data.len() > 1 {
                value = self.extract_cont_val32() << 3;
            }
            value |= ((self.header >> 4) & 0x7) as u32;
            self.ready = Some(ItmPacket::Extension {
                value,
                nbits,
                hw_source: self.header & 0x4 != 0,
            });
            self.state = ProcState::SendPkt;
        } else if self.data.len() == LIMIT {
            return Err(BadPacket::Sequence(
                "extension packet: payload continuation value too long",
            ));
        }
        Ok(())
    }

    // Scan an async sequence: at least five 0x00 then 0x80. The already
    // buffered bytes (header / sync candidate) count towards the five.
    fn read_async_seq(&mut self, block: &[u8], used: &mut usize) -> AsyncScan {
        while self.data.len() < 5 {
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
                self.ready = Some(ItmPacket::Async);
                self.state = ProcState::SendPkt;
                Ok(())
            }
            AsyncScan::Error => Err(BadPacket::Sequence(
                "async packet: unexpected non-zero value",
            )),
            AsyncScan::NeedData => Ok(()),
        }
    }

    fn wait_for_sync(
        &mut self,
        block_index: TraceIndex,
        block: &[u8],
        used: &mut usize,
        sink: &mut dyn PacketSink<ItmPacket>,
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
                        self.ready = Some(ItmPacket::Async);
                        self.state = ProcState::SendPkt;
                    }
                    AsyncScan::Error => {
                        // not an async after all; dump what we scanned
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
                    // potential async header
                    self.sync_start = true;
                    resp = self.flush_unsynced(sink);
                    // data now holds just the candidate zero byte
                    self.pkt_index = block_index + *used as u64 - 1;
                } else {
                    self.dump_unsynced += 1;
                    // periodically flush unsynced bytes during the hunt
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

    // Hand unsynced bytes to the monitor hook, emit a single NotSync
    // packet on first entry into the unsynced state, and drop the
    // flushed bytes from the buffer.
    fn flush_unsynced(&mut self, sink: &mut dyn PacketSink<ItmPacket>) -> DataPathResp {
        let mut resp = DataPathResp::Cont;
        let dump = self.dump_unsynced.min(self.data.len());
        sink.on_unsynced_bytes(self.pkt_index, &self.data[..dump]);

        if !self.sent_notsync {
            resp = sink.on_packet(self.pkt_index, &ItmPacket::NotSync);
            self.sent_notsync = true;
        }

        self.data.drain(..dump);
        self.dump_unsynced = 0;
        resp
    }

    fn output_packet(&mut self, sink: &mut dyn PacketSink<ItmPacket>) -> DataPathResp {
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
        sink: &mut dyn PacketSink<ItmPacket>,
    ) -> DataPathResp {
        let (kind, pkt) = match bad {
            BadPacket::Sequence(msg) => {
                (ErrorKind::BadPacketSequence(msg), ItmPacket::BadSequence)
            }
            BadPacket::ReservedHdr(header) => (
                ErrorKind::InvalidPacketHeader { header },
                ItmPacket::Reserved { header },
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

        // forward the bad packet so the next stage decides what to do
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

impl PacketProcessor for ItmPktProc {
    type Packet = ItmPacket;

    fn process(
        &mut self,
        index: TraceIndex,
        data: &[u8],
        sink: &mut dyn PacketSink<ItmPacket>,
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

    fn eot(&mut self, sink: &mut dyn PacketSink<ItmPacket>) -> DataPathResp {
        if let ProcState::ProcData(_) = self.state {
            // partial packet in flight: flush as incomplete
            self.ready = Some(ItmPacket::IncompleteEot);
            return self.output_packet(sink);
        }
        DataPathResp::Cont
    }

    fn flush(&mut self, _sink: &mut dyn PacketSink<ItmPacket>) -> DataPathResp {
        // full packets are sent immediately; nothing is held back
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::PacketBuffer;

    fn proc() -> ItmPktProc {
        ItmPktProc::new(ItmConfig::new(0x0001_0000))
    }

    fn run(bytes: &[u8]) -> Vec<ItmPacket> {
        let mut p = proc();
        let mut sink = PacketBuffer::new();
        let (used, resp) = p.process(0, bytes, &mut sink);
        assert_eq!(used, bytes.len());
        assert!(resp.is_cont());
        let mut packets: Vec<ItmPacket> =
            sink.packets.into_iter().map(|(_, pkt)| pkt).collect();
        // the stream opens unsynced; drop the initial marker
        assert_eq!(packets.remove(0), ItmPacket::NotSync);
        packets
    }

    const ASYNC: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x80];

    #[test]
    fn sync_then_swit() {
        let mut bytes = ASYNC.to_vec();
        bytes.extend_from_slice(&[0x19, 0xBB]); // SWIT channel 3, 1 byte

        assert_eq!(
            run(&bytes),
            vec![
                ItmPacket::Async,
                ItmPacket::Swit {
                    channel: 3,
                    value: 0xBB,
                    size: 1
                }
            ]
        );
    }

    #[test]
    fn garbage_before_sync_gives_one_notsync() {
        let mut bytes = vec![0xF0, 0x12, 0x33, 0x44, 0x00, 0x22]; // inc. failed candidate
        bytes.extend_from_slice(&ASYNC);

        let packets = run(&bytes);
        assert_eq!(packets, vec![ItmPacket::Async]);
    }

    #[test]
    fn local_ts_forms() {
        let mut bytes = ASYNC.to_vec();
        bytes.push(0x20); // single byte, ts = 2
        bytes.extend_from_slice(&[0xD0, 0x8D, 0x64]); // TC=1, two payload bytes

        let packets = run(&bytes);
        assert_eq!(
            &packets[1..],
            &[
                ItmPacket::LocalTs {
                    tc: 0,
                    ts: 2,
                    size: 1
                },
                ItmPacket::LocalTs {
                    tc: 1,
                    ts: (0x64 << 7) | 0x0D,
                    size: 2
                }
            ]
        );
    }

    #[test]
    fn reserved_header_forwarded() {
        let mut bytes = ASYNC.to_vec();
        bytes.push(0x74); // 0b0111_0100: reserved
        bytes.extend_from_slice(&[0x19, 0xAA]);

        let packets = run(&bytes);
        assert_eq!(packets[1], ItmPacket::Reserved { header: 0x74 });
        // stream continues after the bad header
        assert_eq!(
            packets[2],
            ItmPacket::Swit {
                channel: 3,
                value: 0xAA,
                size: 1
            }
        );
    }

    #[test]
    fn truncated_packet_resumes_across_blocks() {
        let mut p = proc();
        let mut sink = PacketBuffer::new();

        let mut first = ASYNC.to_vec();
        first.extend_from_slice(&[0x1B, 0x01, 0x02]); // SWIT 4-byte, cut short
        let (used, resp) = p.process(0, &first, &mut sink);
        assert_eq!(used, first.len());
        assert!(resp.is_cont());
        assert_eq!(sink.packets.len(), 2); // not-sync marker + async

        let (_, resp) = p.process(used as u64, &[0x03, 0x04], &mut sink);
        assert!(resp.is_cont());
        assert_eq!(
            sink.packets[2].1,
            ItmPacket::Swit {
                channel: 3,
                value: 0x0403_0201,
                size: 4
            }
        );
        // packet indexed at its header byte
        assert_eq!(sink.packets[2].0, 6);
    }

    #[test]
    fn eot_flushes_incomplete() {
        let mut p = proc();
        let mut sink = PacketBuffer::new();

        let mut bytes = ASYNC.to_vec();
        bytes.extend_from_slice(&[0x1B, 0x01]); // partial 4-byte SWIT
        p.process(0, &bytes, &mut sink);
        p.eot(&mut sink);

        assert_eq!(sink.packets.last().unwrap().1, ItmPacket::IncompleteEot);
    }
}
