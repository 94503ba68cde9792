//! CoreSight 16-byte frame demultiplexer (and the matching multiplexer
//! used to build formatted streams for tests and loopback).
//!
//! A formatted frame carries interleaved data for several trace
//! sources. Byte 15 is the flag byte; even-indexed bytes hold either a
//! source ID (low bit set) or a data byte whose low bit was displaced
//! into the flag byte; odd-indexed bytes are always data. When an ID
//! byte appears, the corresponding flag bit selects whether the ID
//! applies from the next byte or only after the following data byte.

use std::collections::VecDeque;

use bitflags::bitflags;

use crate::types::{DataPathResp, TraceId, TraceIndex};

/// Frame synchronisation sequence (appears LSB-first on the wire).
pub const FSYNC: [u8; 4] = [0xFF, 0xFF, 0xFF, 0x7F];
/// Half-word synchronisation sequence.
pub const HSYNC: [u8; 2] = [0xFF, 0x7F];

pub const FRAME_SIZE: usize = 16;

bitflags! {
    /// Demultiplexer configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DemuxFlags: u32 {
        /// Input is memory aligned: frames start at index 0 and contain
        /// no sync sequences.
        const FRAME_MEM_ALIGNED = 1 << 0;
        /// Stream contains FSYNC sequences; alignment is found by
        /// hunting for one.
        const HAS_FSYNC = 1 << 1;
        /// Stream contains HSYNC sequences between frames.
        const HAS_HSYNC = 1 << 2;
        /// Send complete raw frames to the monitor.
        const PACKED_RAW_OUT = 1 << 3;
        /// Send demultiplexed (id, data) runs to the monitor.
        const UNPACKED_RAW_OUT = 1 << 4;
    }
}

/// Frame processing statistics. `frame_bytes` counts every input byte
/// consumed; the remaining counters partition the data bytes by how
/// they were routed, so
/// `valid + no_id + unknown + reserved + overhead == frame_bytes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    /// Total bytes consumed, including IDs, flag bytes and syncs.
    pub frame_bytes: u64,
    /// Data bytes delivered to a configured sink.
    pub valid_id_bytes: u64,
    /// Data bytes seen before any ID byte in the stream.
    pub no_id_bytes: u64,
    /// Data bytes for IDs with no configured sink.
    pub unknown_id_bytes: u64,
    /// Data bytes following a reserved ID; discarded.
    pub reserved_id_bytes: u64,
}

impl DemuxStats {
    /// Bytes that were frame structure rather than payload.
    pub fn overhead_bytes(&self) -> u64 {
        self.frame_bytes
            - self.valid_id_bytes
            - self.no_id_bytes
            - self.unknown_id_bytes
            - self.reserved_id_bytes
    }
}

/// Outcome of offering a data run to the routing sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteResp {
    /// A sink for this ID took `used` bytes of the run. `used` may be
    /// short only when `resp` is not `Cont`; the demux retains the
    /// remainder for the next flush.
    Sink { used: usize, resp: DataPathResp },
    /// No sink is configured for this ID.
    NoSink,
}

/// Receives demultiplexed per-ID byte runs.
pub trait IdDataSink {
    fn on_id_data(&mut self, id: TraceId, index: TraceIndex, data: &[u8]) -> RouteResp;
}

/// Receives raw frames and demultiplexed runs for monitoring.
pub trait RawFrameMonitor {
    fn on_packed_frame(&mut self, _index: TraceIndex, _frame: &[u8]) {}
    fn on_unpacked_run(&mut self, _index: TraceIndex, _id: Option<u8>, _data: &[u8]) {}
}

/// No-op monitor for callers that do not observe raw frames.
#[derive(Debug, Default)]
pub struct NullFrameMonitor;

impl RawFrameMonitor for NullFrameMonitor {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CurrId {
    /// No ID byte seen since reset.
    None,
    Valid(u8),
    Reserved,
}

// A routed run that could not be delivered (sink returned WAIT); held
// until the next flush.
#[derive(Debug)]
struct PendingRun {
    id: u8,
    index: TraceIndex,
    data: Vec<u8>,
}

/// The frame demultiplexer.
pub struct FrameDemux {
    flags: DemuxFlags,
    frame: [u8; FRAME_SIZE],
    frame_len: usize,
    /// Stream index of frame byte 0.
    frame_index: TraceIndex,
    curr_id: CurrId,
    aligned: bool,
    /// Bytes matched so far against a potential FSYNC while hunting.
    fsync_matched: usize,
    stats: DemuxStats,
    pending: VecDeque<PendingRun>,
}

impl FrameDemux {
    pub fn new(flags: DemuxFlags) -> FrameDemux {
        FrameDemux {
            flags,
            frame: [0; FRAME_SIZE],
            frame_len: 0,
            frame_index: 0,
            curr_id: CurrId::None,
            // without FSYNC the caller guarantees alignment
            aligned: !flags.contains(DemuxFlags::HAS_FSYNC),
            fsync_matched: 0,
            stats: DemuxStats::default(),
            pending: VecDeque::new(),
        }
    }

    pub fn stats(&self) -> &DemuxStats {
        &self.stats
    }

    /// Discard all buffered state and return to the unaligned state.
    pub fn reset(&mut self) {
        self.frame_len = 0;
        self.curr_id = CurrId::None;
        self.aligned = !self.flags.contains(DemuxFlags::HAS_FSYNC);
        self.fsync_matched = 0;
        self.stats = DemuxStats::default();
        self.pending.clear();
    }

    /// Drop any partial frame at end of trace.
    pub fn eot(&mut self) {
        self.frame_len = 0;
    }

    /// Drain runs held back by an earlier `Wait`.
    pub fn flush(&mut self, sink: &mut dyn IdDataSink) -> DataPathResp {
        while let Some(run) = self.pending.front_mut() {
            let id = TraceId::new(run.id).expect("only valid IDs are queued");
            match sink.on_id_data(id, run.index, &run.data) {
                RouteResp::NoSink => {
                    self.stats.unknown_id_bytes += run.data.len() as u64;
                    self.pending.pop_front();
                }
                RouteResp::Sink { used, resp } => {
                    self.stats.valid_id_bytes += used as u64;
                    if used == run.data.len() && resp.is_cont() {
                        self.pending.pop_front();
                    } else {
                        run.data.drain(..used);
                        run.index += used as u64;
                        // a short take with Cont still means "blocked"
                        return if resp.is_cont() {
                            DataPathResp::Wait
                        } else {
                            resp
                        };
                    }
                }
            }
        }
        DataPathResp::Cont
    }

    /// Process a block of formatted trace data, routing data bytes to
    /// `sink`. Returns the number of input bytes consumed and the
    /// datapath response. On `Wait`, call [`flush`](Self::flush) until
    /// `Cont` before presenting the remaining input again.
    pub fn process(
        &mut self,
        index: TraceIndex,
        data: &[u8],
        sink: &mut dyn IdDataSink,
        mon: &mut dyn RawFrameMonitor,
    ) -> (usize, DataPathResp) {
        if !self.pending.is_empty() {
            // a previous WAIT was never flushed
            let resp = self.flush(sink);
            if !resp.is_cont() {
                return (0, resp);
            }
        }

        let mut used = 0usize;

        while used < data.len() {
            if self.frame_len == 0 && !self.flags.contains(DemuxFlags::FRAME_MEM_ALIGNED) {
                used += self.strip_syncs(&data[used..]);
                if used >= data.len() || !self.aligned {
                    break;
                }
            }

            if self.frame_len == 0 {
                self.frame_index = index + used as u64;
            }
            let take = (FRAME_SIZE - self.frame_len).min(data.len() - used);
            self.frame[self.frame_len..self.frame_len + take]
                .copy_from_slice(&data[used..used + take]);
            self.frame_len += take;
            used += take;
            self.stats.frame_bytes += take as u64;

            if self.frame_len == FRAME_SIZE {
                self.frame_len = 0;
                let resp = self.route_frame(sink, mon);
                if !resp.is_cont() {
                    return (used, resp);
                }
            }
        }

        (used, DataPathResp::Cont)
    }

    // Consume FSYNC/HSYNC sequences at a frame boundary. While not yet
    // aligned, discards input until a complete FSYNC is found.
    fn strip_syncs(&mut self, data: &[u8]) -> usize {
        let mut used = 0usize;

        if !self.aligned {
            while used < data.len() {
                let byte = data[used];
                used += 1;
                self.stats.frame_bytes += 1;
                if byte == FSYNC[self.fsync_matched] {
                    self.fsync_matched += 1;
                    if self.fsync_matched == FSYNC.len() {
                        self.aligned = true;
                        self.fsync_matched = 0;
                        break;
                    }
                } else {
                    // a mismatching 0xFF only happens in place of the
                    // final 0x7F; the last three bytes still match
                    self.fsync_matched = if byte == 0xFF { 3 } else { 0 };
                }
            }
            if !self.aligned {
                return used;
            }
        }

        // between frames: swallow repeated FSYNC / HSYNC
        loop {
            let rest = &data[used..];
            if self.flags.contains(DemuxFlags::HAS_FSYNC) && rest.starts_with(&FSYNC) {
                used += FSYNC.len();
                self.stats.frame_bytes += FSYNC.len() as u64;
            } else if self.flags.contains(DemuxFlags::HAS_HSYNC) && rest.starts_with(&HSYNC) {
                used += HSYNC.len();
                self.stats.frame_bytes += HSYNC.len() as u64;
            } else {
                break;
            }
        }
        used
    }

    // Split a complete frame into (id, byte) runs and deliver them.
    fn route_frame(
        &mut self,
        sink: &mut dyn IdDataSink,
        mon: &mut dyn RawFrameMonitor,
    ) -> DataPathResp {
        if self.flags.contains(DemuxFlags::PACKED_RAW_OUT) {
            mon.on_packed_frame(self.frame_index, &self.frame);
        }

        let flag_byte = self.frame[15];
        // (id at time of byte, frame offset, value)
        let mut bytes: Vec<(CurrId, usize, u8)> = Vec::with_capacity(15);

        let mut i = 0;
        while i < 15 {
            let byte = self.frame[i];
            if i % 2 == 1 {
                bytes.push((self.curr_id, i, byte));
            } else {
                let flag = (flag_byte >> (i / 2)) & 1;
                if byte & 1 == 1 {
                    let new_id = byte >> 1;
                    let new_curr = if TraceId::is_reserved(new_id) {
                        CurrId::Reserved
                    } else {
                        CurrId::Valid(new_id)
                    };
                    if flag == 1 && i < 14 {
                        // next data byte still belongs to the old ID
                        bytes.push((self.curr_id, i + 1, self.frame[i + 1]));
                        i += 1;
                    }
                    self.curr_id = new_curr;
                } else {
                    bytes.push((self.curr_id, i, byte | flag));
                }
            }
            i += 1;
        }

        // group consecutive bytes with the same ID into runs
        let mut resp = DataPathResp::Cont;
        let mut run_start = 0usize;
        while run_start < bytes.len() {
            let (id, offset, _) = bytes[run_start];
            let mut run_end = run_start + 1;
            while run_end < bytes.len() && bytes[run_end].0 == id {
                run_end += 1;
            }
            let run: Vec<u8> = bytes[run_start..run_end].iter().map(|b| b.2).collect();
            let run_index = self.frame_index + offset as u64;

            if self.flags.contains(DemuxFlags::UNPACKED_RAW_OUT) {
                let raw_id = match id {
                    CurrId::Valid(v) => Some(v),
                    _ => None,
                };
                mon.on_unpacked_run(run_index, raw_id, &run);
            }

            match id {
                CurrId::None => self.stats.no_id_bytes += run.len() as u64,
                CurrId::Reserved => self.stats.reserved_id_bytes += run.len() as u64,
                CurrId::Valid(raw) => {
                    if resp.is_cont() {
                        let tid = TraceId::new(raw).expect("reserved IDs filtered above");
                        match sink.on_id_data(tid, run_index, &run) {
                            RouteResp::NoSink => {
                                self.stats.unknown_id_bytes += run.len() as u64;
                            }
                            RouteResp::Sink { used, resp: r } => {
                                self.stats.valid_id_bytes += used as u64;
                                if !r.is_cont() || used < run.len() {
                                    resp = if r.is_cont() { DataPathResp::Wait } else { r };
                                    if used < run.len() {
                                        self.pending.push_back(PendingRun {
                                            id: raw,
                                            index: run_index + used as u64,
                                            data: run[used..].to_vec(),
                                        });
                                    }
                                }
                            }
                        }
                    } else {
                        // a sink paused mid-frame; hold the rest back
                        self.pending.push_back(PendingRun {
                            id: raw,
                            index: run_index,
                            data: run,
                        });
                    }
                }
            }
            run_start = run_end;
        }

        resp
    }
}

/// Builds 16-byte CoreSight frames from per-ID byte runs. The inverse
/// of [`FrameDemux`]; primarily used to construct formatted test
/// streams.
pub struct FrameMux {
    frames: Vec<u8>,
    curr: [u8; FRAME_SIZE],
    idx: usize,
    curr_id: u8,
    frames_since_id: u32,
}

impl Default for FrameMux {
    fn default() -> FrameMux {
        FrameMux::new()
    }
}

impl FrameMux {
    pub fn new() -> FrameMux {
        FrameMux {
            frames: Vec::new(),
            curr: [0; FRAME_SIZE],
            idx: 0,
            curr_id: 0,
            frames_since_id: 0,
        }
    }

    /// Append `data` for trace source `id`, emitting complete frames
    /// into the internal buffer. With `pad_end`, an incomplete final
    /// frame is padded out with the reserved null ID.
    pub fn mux_data(&mut self, data: &[u8], id: TraceId, pad_end: bool) {
        self.mux_inner(data, id.raw(), pad_end);
    }

    fn mux_inner(&mut self, data: &[u8], id: u8, pad_end: bool) {
        let mut new_id = id != self.curr_id;
        let mut processed = 0usize;

        while processed < data.len() {
            if self.idx % 2 == 1 {
                if self.idx == 15 {
                    self.save_frame();
                } else if new_id {
                    // data already sits in the previous ID/data slot;
                    // move it here (restoring its displaced low bit)
                    // and insert the ID before it, flagged as applying
                    // only after this data byte. The flag bit switches
                    // from LSB storage to the ID-delay marker.
                    let flag_bit = (self.curr[15] >> ((self.idx - 1) / 2)) & 1;
                    self.curr[self.idx] = self.curr[self.idx - 1] | flag_bit;
                    self.curr[15] &= !(1 << ((self.idx - 1) / 2));
                    self.set_id_byte(self.idx - 1, id, false);
                    new_id = false;
                    self.idx += 1;
                } else {
                    self.curr[self.idx] = data[processed];
                    processed += 1;
                    self.idx += 1;
                }
            } else {
                // re-announce the ID periodically
                if self.idx == 0 && self.frames_since_id >= 15 {
                    new_id = true;
                }
                if new_id {
                    self.set_id_byte(self.idx, id, true);
                    new_id = false;
                } else {
                    self.curr[self.idx] = data[processed] & 0xFE;
                    if data[processed] & 1 != 0 {
                        self.curr[15] |= 1 << (self.idx / 2);
                    }
                    processed += 1;
                }
                self.idx += 1;
            }
        }

        if self.idx == 15 {
            self.save_frame();
        }
        if pad_end && self.idx != 0 {
            self.pad_frame();
        }
    }

    /// Drain all complete frames.
    pub fn take_frames(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.frames)
    }

    pub fn has_incomplete_frame(&self) -> bool {
        self.idx != 0
    }

    fn set_id_byte(&mut self, frame_idx: usize, id: u8, next_data_new_id: bool) {
        self.curr[frame_idx] = (id << 1) | 1;
        self.curr_id = id;
        self.frames_since_id = 0;
        if !next_data_new_id {
            self.curr[15] |= 1 << (frame_idx / 2);
        }
    }

    fn pad_frame(&mut self) {
        if self.idx == 14 {
            // just the null ID fits
            self.set_id_byte(14, 0, true);
            self.save_frame();
        } else {
            // null ID plus zero bytes via the normal mux path
            let zeros = [0u8; 14];
            let pad = 14 - self.idx;
            self.mux_inner(&zeros[..pad], 0, false);
        }
    }

    fn save_frame(&mut self) {
        self.frames.extend_from_slice(&self.curr);
        self.curr = [0; FRAME_SIZE];
        self.idx = 0;
        self.frames_since_id += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collector {
        runs: Vec<(u8, TraceIndex, Vec<u8>)>,
        known: Vec<u8>,
    }

    impl IdDataSink for Collector {
        fn on_id_data(&mut self, id: TraceId, index: TraceIndex, data: &[u8]) -> RouteResp {
            if !self.known.is_empty() && !self.known.contains(&id.raw()) {
                return RouteResp::NoSink;
            }
            self.runs.push((id.raw(), index, data.to_vec()));
            RouteResp::Sink {
                used: data.len(),
                resp: DataPathResp::Cont,
            }
        }
    }

    fn bytes_for(c: &Collector, id: u8) -> Vec<u8> {
        c.runs
            .iter()
            .filter(|(i, _, _)| *i == id)
            .flat_map(|(_, _, d)| d.iter().copied())
            .collect()
    }

    #[test]
    fn single_frame_single_id() {
        // ID 0x01 in byte 0, 14 data bytes, flag byte zero.
        #[rustfmt::skip]
        let frame: &[u8] = &[
            0x03, 0xAA, 0xBA, 0xCC, 0xDC, 0xEE, 0xFE, 0x11,
            0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x00,
        ];
        let mut demux = FrameDemux::new(DemuxFlags::FRAME_MEM_ALIGNED);
        let mut sink = Collector::default();
        let (used, resp) = demux.process(0, frame, &mut sink, &mut NullFrameMonitor);

        assert_eq!(used, 16);
        assert!(resp.is_cont());
        assert_eq!(
            bytes_for(&sink, 0x01),
            vec![0xAA, 0xBA, 0xCC, 0xDC, 0xEE, 0xFE, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
        assert_eq!(demux.stats().valid_id_bytes, 14);
        assert_eq!(demux.stats().frame_bytes, 16);
    }

    #[test]
    fn flag_byte_restores_low_bits() {
        // Data byte 0xAB at even index: stored as 0xAA with flag bit 1.
        #[rustfmt::skip]
        let frame: &[u8] = &[
            0x05, 0x00, 0xAA, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0b0000_0010,
        ];
        let mut demux = FrameDemux::new(DemuxFlags::FRAME_MEM_ALIGNED);
        let mut sink = Collector::default();
        demux.process(0, frame, &mut sink, &mut NullFrameMonitor);
        assert_eq!(bytes_for(&sink, 0x02)[1], 0xAB);
    }

    #[test]
    fn delayed_id_switch() {
        // ID 0x02 at byte 0. At byte 4 a new ID 0x03 appears with its
        // flag bit set: the data byte at offset 5 still belongs to 0x02.
        #[rustfmt::skip]
        let frame: &[u8] = &[
            0x05, 0x10, 0x20, 0x30, 0x07, 0x40, 0x50, 0x60,
            0x70, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0b0000_0100,
        ];
        let mut demux = FrameDemux::new(DemuxFlags::FRAME_MEM_ALIGNED);
        let mut sink = Collector::default();
        demux.process(0, frame, &mut sink, &mut NullFrameMonitor);

        assert_eq!(bytes_for(&sink, 0x02), vec![0x10, 0x20, 0x30, 0x40]);
        assert_eq!(
            bytes_for(&sink, 0x03),
            vec![0x50, 0x60, 0x70, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn reserved_id_discards() {
        // ID 0x70 (reserved) then data.
        #[rustfmt::skip]
        let frame: &[u8] = &[
            0xE1, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70,
            0x80, 0x90, 0xA0, 0xB0, 0xC0, 0xD0, 0xE0, 0x00,
        ];
        let mut demux = FrameDemux::new(DemuxFlags::FRAME_MEM_ALIGNED);
        let mut sink = Collector::default();
        demux.process(0, frame, &mut sink, &mut NullFrameMonitor);
        assert!(sink.runs.is_empty());
        assert_eq!(demux.stats().reserved_id_bytes, 14);
    }

    #[test]
    fn fsync_hunting() {
        let mut stream = vec![0x13, 0x57, 0x9B]; // garbage before sync
        stream.extend_from_slice(&FSYNC);
        #[rustfmt::skip]
        stream.extend_from_slice(&[
            0x03, 0xAA, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]);

        let mut demux = FrameDemux::new(DemuxFlags::HAS_FSYNC);
        let mut sink = Collector::default();
        let (used, resp) = demux.process(0, &stream, &mut sink, &mut NullFrameMonitor);
        assert_eq!(used, stream.len());
        assert!(resp.is_cont());
        assert_eq!(bytes_for(&sink, 0x01).len(), 14);
        assert_eq!(demux.stats().overhead_bytes(), 3 + 4 + 2);
    }

    #[test]
    fn mux_demux_round_trip() {
        let payload: Vec<u8> = (0u8..100).collect();
        let id = TraceId::new(0x25).unwrap();

        let mut mux = FrameMux::new();
        mux.mux_data(&payload, id, true);
        let frames = mux.take_frames();
        assert_eq!(frames.len() % FRAME_SIZE, 0);

        let mut demux = FrameDemux::new(DemuxFlags::FRAME_MEM_ALIGNED);
        let mut sink = Collector::default();
        let (used, resp) = demux.process(0, &frames, &mut sink, &mut NullFrameMonitor);

        assert_eq!(used, frames.len());
        assert!(resp.is_cont());
        assert_eq!(bytes_for(&sink, 0x25), payload);
    }

    #[test]
    fn byte_accounting() {
        let mut mux = FrameMux::new();
        mux.mux_data(&[0x11; 23], TraceId::new(0x0A).unwrap(), false);
        mux.mux_data(&[0x22; 19], TraceId::new(0x0B).unwrap(), true);
        let frames = mux.take_frames();

        let mut demux = FrameDemux::new(DemuxFlags::FRAME_MEM_ALIGNED);
        let mut sink = Collector::default();
        demux.process(0, &frames, &mut sink, &mut NullFrameMonitor);

        let s = demux.stats();
        assert_eq!(s.frame_bytes, frames.len() as u64);
        assert_eq!(s.valid_id_bytes, 23 + 19);
        assert_eq!(
            s.valid_id_bytes + s.overhead_bytes() + s.reserved_id_bytes,
            s.frame_bytes
        );
        assert_eq!(bytes_for(&sink, 0x0A), vec![0x11; 23]);
        assert_eq!(bytes_for(&sink, 0x0B), vec![0x22; 19]);
    }
}
