//! Memory accessors: address-range backends the mapper reads through.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::MemSpace;

/// Host callback supplying target memory on demand:
/// `(address, space, trace_id, buffer) → bytes written`.
///
/// Must be re-entrant-safe with respect to the decode tree that calls
/// it; the tree does not re-enter itself during a callback.
pub type MemAccCallback = Box<dyn FnMut(u64, MemSpace, u8, &mut [u8]) -> usize>;

enum Backend {
    /// Bytes held in memory.
    Buffer(Vec<u8>),
    /// Region of a file on disk; `offset` is the file position of the
    /// accessor's start address.
    File { file: File, offset: u64 },
    /// Host callback, invoked on demand (and cached by the mapper at
    /// page granularity).
    Callback(MemAccCallback),
}

/// A single range of target memory: `[start, end]` within `space`,
/// backed by a buffer, a file region or a host callback.
pub struct MemAccessor {
    start: u64,
    end: u64,
    space: MemSpace,
    backend: Backend,
}

impl fmt::Debug for MemAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.backend {
            Backend::Buffer(_) => "buffer",
            Backend::File { .. } => "file",
            Backend::Callback(_) => "callback",
        };
        write!(
            f,
            "MemAccessor({:#x}..={:#x}, {:?}, {})",
            self.start, self.end, self.space, kind
        )
    }
}

impl MemAccessor {
    /// Accessor over an in-memory image. Empty buffers are not useful
    /// and not representable (`end` is inclusive); `data` must be
    /// non-empty.
    pub fn from_buffer(start: u64, space: MemSpace, data: Vec<u8>) -> MemAccessor {
        debug_assert!(!data.is_empty());
        MemAccessor {
            start,
            end: start + data.len() as u64 - 1,
            space,
            backend: Backend::Buffer(data),
        }
    }

    /// Accessor over `len` bytes of a file starting at `offset`.
    pub fn from_file<P: AsRef<Path>>(
        start: u64,
        space: MemSpace,
        path: P,
        offset: u64,
        len: u64,
    ) -> std::io::Result<MemAccessor> {
        debug_assert!(len > 0);
        let file = File::open(path)?;
        Ok(MemAccessor {
            start,
            end: start + len - 1,
            space,
            backend: Backend::File { file, offset },
        })
    }

    /// Accessor backed by a host callback for `[start, end]`.
    pub fn from_callback(
        start: u64,
        end: u64,
        space: MemSpace,
        cb: MemAccCallback,
    ) -> MemAccessor {
        MemAccessor {
            start,
            end,
            space,
            backend: Backend::Callback(cb),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Inclusive end address.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn space(&self) -> MemSpace {
        self.space
    }

    pub fn contains(&self, addr: u64) -> bool {
        (self.start..=self.end).contains(&addr)
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        start <= self.end && end >= self.start
    }

    /// Whether the callback backend is in use (the mapper caches these
    /// at page granularity).
    pub fn is_callback(&self) -> bool {
        matches!(self.backend, Backend::Callback(_))
    }

    /// Read bytes at `addr` into `buf`. Reads never cross the accessor
    /// end; the return value may be short (including 0 on I/O failure,
    /// which the caller treats as not-accessible).
    pub fn read(&mut self, addr: u64, space: MemSpace, trace_id: u8, buf: &mut [u8]) -> usize {
        if !self.contains(addr) || buf.is_empty() {
            return 0;
        }
        let avail = (self.end - addr + 1).min(buf.len() as u64) as usize;
        let offset = addr - self.start;

        match &mut self.backend {
            Backend::Buffer(data) => {
                let off = offset as usize;
                buf[..avail].copy_from_slice(&data[off..off + avail]);
                avail
            }
            Backend::File { file, offset: base } => {
                let read = file
                    .seek(SeekFrom::Start(*base + offset))
                    .and_then(|_| file.read(&mut buf[..avail]));
                match read {
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!("memory accessor file read failed at {:#x}: {}", addr, e);
                        0
                    }
                }
            }
            Backend::Callback(cb) => cb(addr, space, trace_id, &mut buf[..avail]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_reads_clip_at_end() {
        let mut acc = MemAccessor::from_buffer(0x1000, MemSpace::ANY, vec![1, 2, 3, 4]);
        assert_eq!(acc.end(), 0x1003);

        let mut buf = [0u8; 8];
        assert_eq!(acc.read(0x1002, MemSpace::EL1N, 0, &mut buf), 2);
        assert_eq!(&buf[..2], &[3, 4]);
        assert_eq!(acc.read(0x1004, MemSpace::EL1N, 0, &mut buf), 0);
    }

    #[test]
    fn callback_receives_request() {
        let mut acc = MemAccessor::from_callback(
            0x0,
            0xFFF,
            MemSpace::N,
            Box::new(|addr, _space, id, buf| {
                buf.fill(id ^ addr as u8);
                buf.len()
            }),
        );
        let mut buf = [0u8; 4];
        assert_eq!(acc.read(0x10, MemSpace::EL1N, 0x21, &mut buf), 4);
        assert_eq!(buf[0], 0x21 ^ 0x10);
    }

    #[test]
    fn overlap_predicate() {
        let acc = MemAccessor::from_buffer(0x100, MemSpace::ANY, vec![0; 0x100]);
        assert!(acc.overlaps(0x1FF, 0x2FF));
        assert!(acc.overlaps(0x00, 0x100));
        assert!(!acc.overlaps(0x200, 0x2FF));
    }
}
