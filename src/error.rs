//! Structured error values reported on the decode data path.

use std::fmt;

use crate::types::TraceIndex;

/// Severity of a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Severity {
    Info,
    Warn,
    Error,
    Fatal,
}

/// The set of error conditions the library reports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// Header byte does not decode to any known packet.
    #[error("invalid packet header byte {header:#04x}")]
    InvalidPacketHeader { header: u8 },

    /// Byte sequence within a packet violates the protocol.
    #[error("bad packet byte sequence: {0}")]
    BadPacketSequence(&'static str),

    /// Packet is well formed but cannot occur in the current decode
    /// state or trace mode.
    #[error("packet invalid for current decode state: {0}")]
    BadDecodePacket(&'static str),

    /// Commit requested more elements than are stacked.
    #[error("not enough elements to commit")]
    CommitPacketOverrun,

    /// Instruction set not supported by the instruction decoder.
    #[error("unsupported instruction set")]
    UnsupportedIsa,

    /// Hardware configuration incompatible with the decoder.
    #[error("unsupported hardware configuration: {0}")]
    HwConfigUnsupported(&'static str),

    /// New memory accessor overlaps an existing one in the same space.
    #[error("memory accessor range overlap in matching memory space")]
    MemAccOverlap,

    /// Target memory not accessible at the given address. Soft: the
    /// decoder emits an element and waits for a new address.
    #[error("memory not accessible at address {addr:#x}")]
    MemAccNacc { addr: u64 },

    /// Component used before it was initialised / configured.
    #[error("component not initialised")]
    NotInit,

    /// Resource allocation failure.
    #[error("allocation failure")]
    Mem,

    /// Trace ID outside the valid `0x01..=0x6F` range.
    #[error("invalid trace ID {id:#04x}")]
    InvalidId { id: u8 },

    /// A component attachment point is already fully occupied.
    #[error("too many components attached")]
    AttachTooMany,
}

/// An error on the decode data path: what went wrong, how bad it is,
/// and where in the byte stream / which trace source it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub severity: Severity,
    pub kind: ErrorKind,
    /// Byte index in the trace stream, when known.
    pub index: Option<TraceIndex>,
    /// Trace source the error belongs to, when known.
    pub trace_id: Option<u8>,
}

impl Error {
    pub fn new(severity: Severity, kind: ErrorKind) -> Error {
        Error {
            severity,
            kind,
            index: None,
            trace_id: None,
        }
    }

    /// Attach the stream position the error was detected at.
    pub fn at_index(mut self, index: TraceIndex) -> Error {
        self.index = Some(index);
        self
    }

    /// Attach the trace source ID the error belongs to.
    pub fn on_id(mut self, trace_id: u8) -> Error {
        self.trace_id = Some(trace_id);
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.severity, self.kind)?;
        if let Some(idx) = self.index {
            write!(f, " [index {}]", idx)?;
        }
        if let Some(id) = self.trace_id {
            write!(f, " [trace ID {:#04x}]", id)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// Receiver for errors raised while decoding. The library keeps no
/// global logger; whoever builds the decode tree decides where errors
/// go.
pub trait ErrorSink {
    fn report(&mut self, err: &Error);
}

/// Error sink that forwards to the `log` facade.
#[derive(Debug, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&mut self, err: &Error) {
        match err.severity {
            Severity::Info => log::info!("{}", err),
            Severity::Warn => log::warn!("{}", err),
            Severity::Error | Severity::Fatal => log::error!("{}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = Error::new(
            Severity::Error,
            ErrorKind::InvalidPacketHeader { header: 0x75 },
        )
        .at_index(42)
        .on_id(0x10);

        let text = err.to_string();
        assert!(text.contains("0x75"));
        assert!(text.contains("index 42"));
        assert!(text.contains("0x10"));
    }
}
