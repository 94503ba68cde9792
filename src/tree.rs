//! The decode tree: per-trace-ID decode channels behind the frame
//! demultiplexer, sharing one memory mapper and one error sink.
//!
//! Data flows demux → packet processor → packet decoder → element
//! sink. `Wait` responses propagate outward; the caller flushes until
//! `Cont` before presenting new data. A fatal error terminates only
//! the channel that raised it; the rest of the tree keeps decoding.

use std::collections::BTreeMap;

use crate::datapath::{DecodeCtx, PacketDecoder, PacketProcessor, PacketSink};
use crate::element::{TraceElemSink, TraceElement};
use crate::error::{Error, ErrorKind, ErrorSink, LogErrorSink, Severity};
use crate::etmv4::{Etmv4Config, Etmv4Decoder, Etmv4PktProc};
use crate::frame::{
    DemuxFlags, DemuxStats, FrameDemux, IdDataSink, NullFrameMonitor, RawFrameMonitor,
    RouteResp,
};
use crate::itm::{ItmConfig, ItmDecoder, ItmPktProc};
use crate::mem::MemAccMapper;
use crate::ptm::{PtmConfig, PtmDecoder, PtmPktProc};
use crate::stm::{StmConfig, StmDecoder, StmPktProc};
use crate::types::{DataPathOp, DataPathResp, TraceId, TraceIndex};

// Binds a packet decoder (plus the shared services it needs) as the
// packet sink of its processor.
struct DecodeSink<'a, D: PacketDecoder> {
    dec: &'a mut D,
    mem: &'a mut MemAccMapper,
    elem_out: &'a mut dyn TraceElemSink,
    errs: &'a mut dyn ErrorSink,
}

impl<'a, D: PacketDecoder> PacketSink<D::Packet> for DecodeSink<'a, D> {
    fn on_packet(&mut self, index: TraceIndex, pkt: &D::Packet) -> DataPathResp {
        let mut ctx = DecodeCtx {
            mem: &mut *self.mem,
            elem_out: &mut *self.elem_out,
            errs: &mut *self.errs,
        };
        self.dec.on_packet(index, pkt, &mut ctx)
    }

    fn on_error(&mut self, err: &Error) {
        self.errs.report(err);
    }
}

fn chan_data<P, D>(
    proc_: &mut P,
    dec: &mut D,
    index: TraceIndex,
    data: &[u8],
    mem: &mut MemAccMapper,
    out: &mut dyn TraceElemSink,
    errs: &mut dyn ErrorSink,
) -> (usize, DataPathResp)
where
    P: PacketProcessor,
    D: PacketDecoder<Packet = P::Packet>,
{
    let mut sink = DecodeSink {
        dec,
        mem,
        elem_out: out,
        errs,
    };
    proc_.process(index, data, &mut sink)
}

fn chan_eot<P, D>(
    proc_: &mut P,
    dec: &mut D,
    mem: &mut MemAccMapper,
    out: &mut dyn TraceElemSink,
    errs: &mut dyn ErrorSink,
) -> DataPathResp
where
    P: PacketProcessor,
    D: PacketDecoder<Packet = P::Packet>,
{
    let mut sink = DecodeSink {
        dec,
        mem,
        elem_out: out,
        errs,
    };
    let resp = proc_.eot(&mut sink);
    if !resp.is_cont() {
        return resp;
    }
    let DecodeSink {
        dec,
        mem,
        elem_out,
        errs,
    } = sink;
    let mut ctx = DecodeCtx {
        mem,
        elem_out,
        errs,
    };
    dec.eot(&mut ctx)
}

fn chan_flush<P, D>(
    proc_: &mut P,
    dec: &mut D,
    mem: &mut MemAccMapper,
    out: &mut dyn TraceElemSink,
    errs: &mut dyn ErrorSink,
) -> DataPathResp
where
    P: PacketProcessor,
    D: PacketDecoder<Packet = P::Packet>,
{
    // drain the decoder first (it may hold a paused commit), then the
    // processor
    {
        let mut ctx = DecodeCtx {
            mem: &mut *mem,
            elem_out: &mut *out,
            errs: &mut *errs,
        };
        let resp = dec.flush(&mut ctx);
        if !resp.is_cont() {
            return resp;
        }
    }
    let mut sink = DecodeSink {
        dec,
        mem,
        elem_out: out,
        errs,
    };
    proc_.flush(&mut sink)
}

enum Channel {
    Etmv4 {
        proc: Etmv4PktProc,
        dec: Etmv4Decoder,
    },
    Itm {
        proc: ItmPktProc,
        dec: ItmDecoder,
    },
    Stm {
        proc: StmPktProc,
        dec: StmDecoder,
    },
    Ptm {
        proc: PtmPktProc,
        dec: PtmDecoder,
    },
}

impl Channel {
    fn data_in(
        &mut self,
        index: TraceIndex,
        data: &[u8],
        mem: &mut MemAccMapper,
        out: &mut dyn TraceElemSink,
        errs: &mut dyn ErrorSink,
    ) -> (usize, DataPathResp) {
        match self {
            Channel::Etmv4 { proc, dec } => chan_data(proc, dec, index, data, mem, out, errs),
            Channel::Itm { proc, dec } => chan_data(proc, dec, index, data, mem, out, errs),
            Channel::Stm { proc, dec } => chan_data(proc, dec, index, data, mem, out, errs),
            Channel::Ptm { proc, dec } => chan_data(proc, dec, index, data, mem, out, errs),
        }
    }

    fn eot(
        &mut self,
        mem: &mut MemAccMapper,
        out: &mut dyn TraceElemSink,
        errs: &mut dyn ErrorSink,
    ) -> DataPathResp {
        match self {
            Channel::Etmv4 { proc, dec } => chan_eot(proc, dec, mem, out, errs),
            Channel::Itm { proc, dec } => chan_eot(proc, dec, mem, out, errs),
            Channel::Stm { proc, dec } => chan_eot(proc, dec, mem, out, errs),
            Channel::Ptm { proc, dec } => chan_eot(proc, dec, mem, out, errs),
        }
    }

    fn flush(
        &mut self,
        mem: &mut MemAccMapper,
        out: &mut dyn TraceElemSink,
        errs: &mut dyn ErrorSink,
    ) -> DataPathResp {
        match self {
            Channel::Etmv4 { proc, dec } => chan_flush(proc, dec, mem, out, errs),
            Channel::Itm { proc, dec } => chan_flush(proc, dec, mem, out, errs),
            Channel::Stm { proc, dec } => chan_flush(proc, dec, mem, out, errs),
            Channel::Ptm { proc, dec } => chan_flush(proc, dec, mem, out, errs),
        }
    }

    // Reset deepest-first: decoder state before processor state.
    fn reset(&mut self) {
        match self {
            Channel::Etmv4 { proc, dec } => {
                dec.reset();
                proc.reset();
            }
            Channel::Itm { proc, dec } => {
                dec.reset();
                proc.reset();
            }
            Channel::Stm { proc, dec } => {
                dec.reset();
                proc.reset();
            }
            Channel::Ptm { proc, dec } => {
                dec.reset();
                proc.reset();
            }
        }
    }
}

struct ChannelSlot {
    chan: Channel,
    /// Set when the channel raised a fatal error; its data is dropped
    /// from then on while the rest of the tree continues.
    dead: bool,
}

// Routes demultiplexed runs into the channels.
struct Router<'a> {
    channels: &'a mut BTreeMap<u8, ChannelSlot>,
    mapper: &'a mut MemAccMapper,
    out: &'a mut dyn TraceElemSink,
    errs: &'a mut dyn ErrorSink,
}

impl<'a> IdDataSink for Router<'a> {
    fn on_id_data(&mut self, id: TraceId, index: TraceIndex, data: &[u8]) -> RouteResp {
        let Some(slot) = self.channels.get_mut(&id.raw()) else {
            return RouteResp::NoSink;
        };
        if slot.dead {
            // swallow data for dead channels
            return RouteResp::Sink {
                used: data.len(),
                resp: DataPathResp::Cont,
            };
        }

        let (used, resp) = slot.chan.data_in(
            index,
            data,
            &mut *self.mapper,
            &mut *self.out,
            &mut *self.errs,
        );
        if resp.is_fatal() {
            slot.dead = true;
            // the tree keeps going for other IDs
            return RouteResp::Sink {
                used: data.len(),
                resp: DataPathResp::Cont,
            };
        }
        RouteResp::Sink { used, resp }
    }
}

/// How trace data enters the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSrc {
    /// 16-byte CoreSight formatted frames carrying several sources.
    Formatted(DemuxFlags),
    /// A single unformatted source stream.
    Single,
}

/// A full decode tree.
pub struct DecodeTree {
    demux: Option<FrameDemux>,
    channels: BTreeMap<u8, ChannelSlot>,
    mapper: MemAccMapper,
    errs: Box<dyn ErrorSink>,
    mon: Box<dyn RawFrameMonitor>,
}

impl DecodeTree {
    pub fn new(src: TreeSrc) -> DecodeTree {
        DecodeTree {
            demux: match src {
                TreeSrc::Formatted(flags) => Some(FrameDemux::new(flags)),
                TreeSrc::Single => None,
            },
            channels: BTreeMap::new(),
            mapper: MemAccMapper::new(),
            errs: Box::new(LogErrorSink),
            mon: Box::new(NullFrameMonitor),
        }
    }

    /// Replace the error sink (defaults to the `log` facade).
    pub fn set_error_sink(&mut self, errs: Box<dyn ErrorSink>) {
        self.errs = errs;
    }

    /// Attach a raw frame monitor (formatted input only).
    pub fn set_frame_monitor(&mut self, mon: Box<dyn RawFrameMonitor>) {
        self.mon = mon;
    }

    /// The shared memory mapper: add accessors for the traced images
    /// here.
    pub fn mem_mapper(&mut self) -> &mut MemAccMapper {
        &mut self.mapper
    }

    /// Frame statistics, when the tree demultiplexes formatted input.
    pub fn demux_stats(&self) -> Option<&DemuxStats> {
        self.demux.as_ref().map(|d| d.stats())
    }

    fn attach(&mut self, id: u8, chan: Channel) -> Result<(), Error> {
        if TraceId::is_reserved(id) {
            return Err(Error::new(Severity::Error, ErrorKind::InvalidId { id }));
        }
        if self.channels.contains_key(&id) {
            return Err(
                Error::new(Severity::Error, ErrorKind::AttachTooMany).on_id(id)
            );
        }
        self.channels.insert(id, ChannelSlot { chan, dead: false });
        Ok(())
    }

    /// Create an ETMv4-I processor + decoder on the config's trace ID.
    pub fn add_etmv4_decoder(&mut self, config: Etmv4Config) -> Result<(), Error> {
        let dec = Etmv4Decoder::new(config)?;
        self.attach(
            config.trace_id(),
            Channel::Etmv4 {
                proc: Etmv4PktProc::new(config),
                dec,
            },
        )
    }

    /// Create an ITM processor + decoder on the config's trace ID.
    pub fn add_itm_decoder(&mut self, config: ItmConfig) -> Result<(), Error> {
        self.attach(
            config.trace_id(),
            Channel::Itm {
                proc: ItmPktProc::new(config),
                dec: ItmDecoder::new(config),
            },
        )
    }

    /// Create an STM processor + decoder on the config's trace ID.
    pub fn add_stm_decoder(&mut self, config: StmConfig) -> Result<(), Error> {
        self.attach(
            config.trace_id(),
            Channel::Stm {
                proc: StmPktProc::new(config),
                dec: StmDecoder::new(config),
            },
        )
    }

    /// Create a PTM processor + decoder on the config's trace ID.
    pub fn add_ptm_decoder(&mut self, config: PtmConfig) -> Result<(), Error> {
        self.attach(
            config.trace_id(),
            Channel::Ptm {
                proc: PtmPktProc::new(config),
                dec: PtmDecoder::new(config),
            },
        )
    }

    /// Drive the tree. `index` is the caller-monotonic stream position
    /// of `data\[0\]`; after a `Wait`, flush and re-present the
    /// unprocessed remainder at its original index.
    pub fn trace_data_in(
        &mut self,
        op: DataPathOp,
        index: TraceIndex,
        data: &[u8],
        out: &mut dyn TraceElemSink,
    ) -> (usize, DataPathResp) {
        match op {
            DataPathOp::Data => self.data(index, data, out),
            DataPathOp::Eot => (0, self.eot(out)),
            DataPathOp::Flush => (0, self.flush(out)),
            DataPathOp::Reset => {
                self.reset();
                (0, DataPathResp::Cont)
            }
        }
    }

    fn data(
        &mut self,
        index: TraceIndex,
        data: &[u8],
        out: &mut dyn TraceElemSink,
    ) -> (usize, DataPathResp) {
        match &mut self.demux {
            Some(demux) => {
                let mut router = Router {
                    channels: &mut self.channels,
                    mapper: &mut self.mapper,
                    out,
                    errs: self.errs.as_mut(),
                };
                demux.process(index, data, &mut router, self.mon.as_mut())
            }
            None => {
                // single-source tree: all data belongs to the one
                // channel
                let Some(slot) = self.channels.values_mut().next() else {
                    return (0, DataPathResp::FatalNotInit);
                };
                if slot.dead {
                    return (data.len(), DataPathResp::Cont);
                }
                let (used, resp) =
                    slot.chan
                        .data_in(index, data, &mut self.mapper, out, self.errs.as_mut());
                if resp.is_fatal() {
                    slot.dead = true;
                    return (data.len(), DataPathResp::Cont);
                }
                (used, resp)
            }
        }
    }

    fn eot(&mut self, out: &mut dyn TraceElemSink) -> DataPathResp {
        let mut resp = DataPathResp::Cont;
        for slot in self.channels.values_mut() {
            if slot.dead {
                continue;
            }
            let r = slot.chan.eot(&mut self.mapper, out, self.errs.as_mut());
            if !r.is_cont() && resp.is_cont() {
                resp = r;
            }
        }
        if let Some(demux) = &mut self.demux {
            demux.eot();
        }
        resp
    }

    fn flush(&mut self, out: &mut dyn TraceElemSink) -> DataPathResp {
        // unblock the channels first, then drain demux pendings into
        // them
        for slot in self.channels.values_mut() {
            if slot.dead {
                continue;
            }
            let r = slot.chan.flush(&mut self.mapper, out, self.errs.as_mut());
            if !r.is_cont() {
                return r;
            }
        }
        if let Some(demux) = &mut self.demux {
            let mut router = Router {
                channels: &mut self.channels,
                mapper: &mut self.mapper,
                out,
                errs: self.errs.as_mut(),
            };
            return demux.flush(&mut router);
        }
        DataPathResp::Cont
    }

    // Reset deepest-first; nothing in flight survives.
    fn reset(&mut self) {
        for slot in self.channels.values_mut() {
            slot.chan.reset();
            slot.dead = false;
        }
        if let Some(demux) = &mut self.demux {
            demux.reset();
        }
    }
}

/// Convenience element sink that drops every element; useful when only
/// packet-level monitoring or statistics are of interest.
#[derive(Debug, Default)]
pub struct NullElemSink;

impl TraceElemSink for NullElemSink {
    fn on_element(
        &mut self,
        _index_sop: TraceIndex,
        _trace_id: u8,
        _elem: &TraceElement,
    ) -> DataPathResp {
        DataPathResp::Cont
    }
}
