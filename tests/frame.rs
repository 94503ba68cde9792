//! Frame demultiplexer properties: byte accounting, multi-source
//! round trips and reserved-ID discard.

use coresight_decode::frame::{
    DemuxFlags, FrameDemux, FrameMux, IdDataSink, NullFrameMonitor, RouteResp, FRAME_SIZE,
};
use coresight_decode::types::{DataPathResp, TraceId, TraceIndex};

#[derive(Default)]
struct Collector {
    runs: Vec<(u8, Vec<u8>)>,
}

impl IdDataSink for Collector {
    fn on_id_data(&mut self, id: TraceId, _index: TraceIndex, data: &[u8]) -> RouteResp {
        self.runs.push((id.raw(), data.to_vec()));
        RouteResp::Sink {
            used: data.len(),
            resp: DataPathResp::Cont,
        }
    }
}

impl Collector {
    fn bytes_for(&self, id: u8) -> Vec<u8> {
        self.runs
            .iter()
            .filter(|(i, _)| *i == id)
            .flat_map(|(_, d)| d.iter().copied())
            .collect()
    }
}

/// Mux then demux returns every byte to its source ID, for IDs across
/// the whole valid range and payloads with all byte values.
#[test]
fn round_trip_all_valid_ids() {
    for id in [0x01u8, 0x02, 0x25, 0x3F, 0x55, 0x6F] {
        let payload: Vec<u8> = (0..=255u8).collect();

        let mut mux = FrameMux::new();
        mux.mux_data(&payload, TraceId::new(id).unwrap(), true);
        let frames = mux.take_frames();
        assert_eq!(frames.len() % FRAME_SIZE, 0);

        let mut demux = FrameDemux::new(DemuxFlags::FRAME_MEM_ALIGNED);
        let mut sink = Collector::default();
        let (used, resp) = demux.process(0, &frames, &mut sink, &mut NullFrameMonitor);

        assert_eq!(used, frames.len());
        assert!(resp.is_cont());
        assert_eq!(sink.bytes_for(id), payload, "ID {:#x}", id);
    }
}

/// Interleaved sources come back out on their own IDs with byte
/// accounting intact.
#[test]
fn interleaved_sources_and_accounting() {
    let a: Vec<u8> = (0..60u8).collect();
    let b: Vec<u8> = (100..180u8).collect();
    let c: Vec<u8> = vec![0xA5; 33];

    let mut mux = FrameMux::new();
    // interleave in uneven chunks
    mux.mux_data(&a[..17], TraceId::new(0x11).unwrap(), false);
    mux.mux_data(&b[..40], TraceId::new(0x22).unwrap(), false);
    mux.mux_data(&a[17..], TraceId::new(0x11).unwrap(), false);
    mux.mux_data(&c, TraceId::new(0x33).unwrap(), false);
    mux.mux_data(&b[40..], TraceId::new(0x22).unwrap(), true);
    let frames = mux.take_frames();

    let mut demux = FrameDemux::new(DemuxFlags::FRAME_MEM_ALIGNED);
    let mut sink = Collector::default();
    let (used, resp) = demux.process(0, &frames, &mut sink, &mut NullFrameMonitor);

    assert_eq!(used, frames.len());
    assert!(resp.is_cont());
    assert_eq!(sink.bytes_for(0x11), a);
    assert_eq!(sink.bytes_for(0x22), b);
    assert_eq!(sink.bytes_for(0x33), c);

    let stats = demux.stats();
    assert_eq!(stats.frame_bytes, frames.len() as u64);
    assert_eq!(
        stats.valid_id_bytes,
        (a.len() + b.len() + c.len()) as u64
    );
    assert_eq!(
        stats.valid_id_bytes
            + stats.reserved_id_bytes
            + stats.no_id_bytes
            + stats.unknown_id_bytes
            + stats.overhead_bytes(),
        stats.frame_bytes
    );
}

/// Reserved IDs discard their payload and count the discarded bytes.
#[test]
fn reserved_id_payload_discarded() {
    #[rustfmt::skip]
    let frame: &[u8] = &[
        0xE1, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, // ID 0x70: reserved
        0x80, 0x90, 0xA0, 0xB0, 0xC0, 0xD0, 0xE0, 0x00,
    ];

    let mut demux = FrameDemux::new(DemuxFlags::FRAME_MEM_ALIGNED);
    let mut sink = Collector::default();
    demux.process(0, frame, &mut sink, &mut NullFrameMonitor);

    assert!(sink.runs.is_empty());
    assert_eq!(demux.stats().reserved_id_bytes, 14);
}

/// Frames split across arbitrary input block boundaries reassemble.
#[test]
fn arbitrary_block_boundaries() {
    let payload: Vec<u8> = (0..200u8).collect();
    let mut mux = FrameMux::new();
    mux.mux_data(&payload, TraceId::new(0x42).unwrap(), true);
    let frames = mux.take_frames();

    for split in 1..frames.len() {
        let mut demux = FrameDemux::new(DemuxFlags::FRAME_MEM_ALIGNED);
        let mut sink = Collector::default();
        let (used_a, _) = demux.process(0, &frames[..split], &mut sink, &mut NullFrameMonitor);
        assert_eq!(used_a, split);
        let (used_b, resp) = demux.process(
            split as u64,
            &frames[split..],
            &mut sink,
            &mut NullFrameMonitor,
        );
        assert_eq!(used_b, frames.len() - split);
        assert!(resp.is_cont());
        assert_eq!(sink.bytes_for(0x42), payload, "split {}", split);
    }
}
