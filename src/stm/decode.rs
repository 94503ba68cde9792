//! STM packet decoder: [`StmPacket`] sequence → software-trace
//! elements over master:channel streams.

use crate::datapath::{DecodeCtx, PacketDecoder};
use crate::element::{SwTraceInfo, SwTraceOp, TraceElement, UnsyncReason};
use crate::error::{Error, ErrorKind, Severity};
use crate::stm::{StmConfig, StmPacket};
use crate::types::{DataPathResp, TraceIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    NoSync,
    WaitSync,
    DecodePkts,
}

/// The STM packet decoder. Tracks the current master / channel pair
/// and the last reported timestamp.
pub struct StmDecoder {
    config: StmConfig,
    state: DecodeState,
    unsync_reason: UnsyncReason,
    master: u8,
    channel: u16,
    /// Last timestamp seen on the stream; attaches to payloads that
    /// did not carry their own.
    last_ts: Option<u64>,
}

impl StmDecoder {
    pub fn new(config: StmConfig) -> StmDecoder {
        StmDecoder {
            config,
            state: DecodeState::NoSync,
            unsync_reason: UnsyncReason::InitDecoder,
            master: 0,
            channel: 0,
            last_ts: None,
        }
    }

    pub fn trace_id(&self) -> u8 {
        self.config.trace_id()
    }

    fn reset_state(&mut self) {
        self.state = DecodeState::NoSync;
        self.master = 0;
        self.channel = 0;
        self.last_ts = None;
    }

    fn src_id(&self) -> u32 {
        ((self.master as u32) << 16) | self.channel as u32
    }

    fn emit(
        &mut self,
        index: TraceIndex,
        info: SwTraceInfo,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        ctx.elem_out
            .on_element(index, self.trace_id(), &TraceElement::SwTrace(info))
    }

    fn decode_packet(
        &mut self,
        index: TraceIndex,
        pkt: &StmPacket,
        ctx: &mut DecodeCtx<'_>,
    ) -> DataPathResp {
        match *pkt {
            StmPacket::BadSequence | StmPacket::Reserved { .. } => {
                ctx.errs.report(
                    &Error::new(
                        Severity::Fatal,
                        ErrorKind::BadDecodePacket("bad packet in STM stream"),
                    )
                    .at_index(index)
                    .on_id(self.trace_id()),
                );
                self.unsync_reason = UnsyncReason::BadPacket;
                self.reset_state();
                DataPathResp::FatalInvalidData
            }

            StmPacket::NotSync => {
                self.unsync_reason = UnsyncReason::BadPacket;
                self.reset_state();
                DataPathResp::Cont
            }

            StmPacket::Async | StmPacket::IncompleteEot | StmPacket::Null => DataPathResp::Cont,

            // version packets configure the packet processor; nothing
            // to report downstream
            StmPacket::Version { .. } => DataPathResp::Cont,

            StmPacket::Master { master } => {
                self.master = master;
                self.channel = 0;
                DataPathResp::Cont
            }

            StmPacket::Channel { channel } => {
                self.channel = channel;
                DataPathResp::Cont
            }

            StmPacket::Data {
                data,
                size,
                marked,
                ts,
            } => {
                if ts.is_some() {
                    self.last_ts = ts;
                }
                let mut info = SwTraceInfo::new(SwTraceOp::Swit);
                info.src_id = self.src_id();
                info.value = data;
                info.value_size = size;
                info.marked = marked;
                info.timestamp = ts.or(self.last_ts);
                self.emit(index, info, ctx)
            }

            StmPacket::Flag { ts } => {
                if ts.is_some() {
                    self.last_ts = ts;
                }
                let mut info = SwTraceInfo::new(SwTraceOp::Marker);
                info.src_id = self.src_id();
                info.timestamp = ts.or(self.last_ts);
                self.emit(index, info, ctx)
            }

            StmPacket::Trig { value, ts } => {
                if ts.is_some() {
                    self.last_ts = ts;
                }
                let mut info = SwTraceInfo::new(SwTraceOp::Trigger);
                info.src_id = self.src_id();
                info.value = value as u64;
                info.value_size = 1;
                info.timestamp = ts.or(self.last_ts);
                self.emit(index, info, ctx)
            }

            StmPacket::Freq { hz } => {
                let mut info = SwTraceInfo::new(SwTraceOp::Freq);
                info.value = hz as u64;
                info.value_size = 4;
                info.freq_change = true;
                self.emit(index, info, ctx)
            }

            StmPacket::MErr { err } => {
                let mut info = SwTraceInfo::new(SwTraceOp::Error);
                info.src_id = (self.master as u32) << 16;
                info.value = err as u64;
                info.value_size = 1;
                self.emit(index, info, ctx)
            }

            StmPacket::GErr { err } => {
                let mut info = SwTraceInfo::new(SwTraceOp::Error);
                info.value = err as u64;
                info.value_size = 1;
                self.emit(index, info, ctx)
            }
        }
    }
}

impl PacketDecoder for StmDecoder {
    type Packet = StmPacket;

    fn on_packet(
        &mut self,
        index: TraceIndex,
        pkt: &StmPacket,
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
                    if matches!(pkt, StmPacket::Async) {
                        self.state = DecodeState::DecodePkts;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElemBuffer;
    use crate::error::LogErrorSink;
    use crate::mem::MemAccMapper;

    fn decode_all(pkts: &[StmPacket]) -> Vec<TraceElement> {
        let mut dec = StmDecoder::new(StmConfig::new(0x0030_0000));
        let mut mem = MemAccMapper::new();
        let mut out = ElemBuffer::new();
        let mut errs = LogErrorSink;
        for (i, pkt) in pkts.iter().enumerate() {
            let mut ctx = DecodeCtx {
                mem: &mut mem,
                elem_out: &mut out,
                errs: &mut errs,
            };
            let resp = dec.on_packet(i as u64, pkt, &mut ctx);
            assert!(resp.is_cont());
        }
        out.elements.into_iter().map(|(_, _, e)| e).collect()
    }

    #[test]
    fn data_carries_master_channel() {
        let elems = decode_all(&[
            StmPacket::Async,
            StmPacket::Master { master: 0x12 },
            StmPacket::Channel { channel: 0x0345 },
            StmPacket::Data {
                data: 0xDEAD,
                size: 2,
                marked: false,
                ts: Some(1000),
            },
            StmPacket::Data {
                data: 0xBEEF,
                size: 2,
                marked: true,
                ts: None,
            },
        ]);

        match (&elems[1], &elems[2]) {
            (TraceElement::SwTrace(first), TraceElement::SwTrace(second)) => {
                assert_eq!(first.src_id, (0x12 << 16) | 0x0345);
                assert_eq!(first.value, 0xDEAD);
                assert_eq!(first.timestamp, Some(1000));
                assert!(second.marked);
                // untimestamped data inherits the last timestamp
                assert_eq!(second.timestamp, Some(1000));
            }
            other => panic!("unexpected elements {:?}", other),
        }
    }

    #[test]
    fn master_select_resets_channel() {
        let elems = decode_all(&[
            StmPacket::Async,
            StmPacket::Master { master: 1 },
            StmPacket::Channel { channel: 7 },
            StmPacket::Master { master: 2 },
            StmPacket::Data {
                data: 1,
                size: 1,
                marked: false,
                ts: None,
            },
        ]);

        match &elems[1] {
            TraceElement::SwTrace(info) => assert_eq!(info.src_id, 2 << 16),
            other => panic!("unexpected element {:?}", other),
        }
    }
}
