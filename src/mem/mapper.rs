//! The memory access mapper: an ordered accessor set with overlap
//! policing and an optional page cache.

use crate::error::{Error, ErrorKind, Severity};
use crate::mem::cache::PageCache;
use crate::mem::{CacheConfig, MemAccessor, MemSpace};

/// Resolves `(address, memory space, trace ID)` to target memory bytes.
///
/// One mapper may serve several decoders (cores sharing an OS image);
/// the page cache is partitioned by trace ID. Adding or removing an
/// accessor invalidates the whole cache.
pub struct MemAccMapper {
    // ordered by start address; overlap policy enforced on add
    accessors: Vec<MemAccessor>,
    cache: Option<PageCache>,
}

impl Default for MemAccMapper {
    fn default() -> MemAccMapper {
        MemAccMapper::new()
    }
}

impl MemAccMapper {
    /// Mapper with the default page cache (4 KiB × 16 pages).
    pub fn new() -> MemAccMapper {
        MemAccMapper {
            accessors: Vec::new(),
            cache: Some(PageCache::new(CacheConfig::default())),
        }
    }

    /// Mapper without a cache; every read goes to the backend.
    pub fn uncached() -> MemAccMapper {
        MemAccMapper {
            accessors: Vec::new(),
            cache: None,
        }
    }

    /// Replace the cache configuration. Drops all cached pages.
    pub fn set_cache_config(&mut self, cfg: CacheConfig) {
        self.cache = Some(PageCache::new(cfg));
    }

    /// Add an accessor. Two accessors may cover the same addresses only
    /// if their memory spaces are disjoint.
    pub fn add_accessor(&mut self, acc: MemAccessor) -> Result<(), Error> {
        let clash = self.accessors.iter().any(|existing| {
            existing.overlaps(acc.start(), acc.end())
                && existing.space().intersects(acc.space())
        });
        if clash {
            return Err(Error::new(Severity::Error, ErrorKind::MemAccOverlap));
        }

        let pos = self
            .accessors
            .partition_point(|existing| existing.start() < acc.start());
        self.accessors.insert(pos, acc);
        self.invalidate_cache();
        Ok(())
    }

    /// Remove the accessor starting at `start` whose space intersects
    /// `space`. Returns whether one was removed.
    pub fn remove_accessor(&mut self, start: u64, space: MemSpace) -> bool {
        let pos = self
            .accessors
            .iter()
            .position(|a| a.start() == start && a.space().intersects(space));
        match pos {
            Some(pos) => {
                self.accessors.remove(pos);
                self.invalidate_cache();
                true
            }
            None => false,
        }
    }

    pub fn invalidate_cache(&mut self) {
        if let Some(cache) = &mut self.cache {
            cache.invalidate();
        }
    }

    /// Read target memory. Returns the bytes supplied, which may be
    /// fewer than requested — reads never cross an accessor boundary —
    /// or 0 when no accessor covers `addr` in `space` (the caller
    /// treats this as memory-not-accessible).
    pub fn read(
        &mut self,
        addr: u64,
        space: MemSpace,
        trace_id: u8,
        buf: &mut [u8],
    ) -> usize {
        let Some(best) = self.find_accessor(addr, space) else {
            return 0;
        };

        match &mut self.cache {
            Some(cache) => {
                if let Some(n) = cache.read(trace_id, space, addr, buf) {
                    if n > 0 {
                        return n;
                    }
                    // cached page does not cover the address; go direct
                    return self.accessors[best].read(addr, space, trace_id, buf);
                }

                // page miss: fill from the accessor, then serve from
                // the cache. Callback results are cached the same way.
                let page_base = cache.page_base(addr);
                let acc = &mut self.accessors[best];
                let fill_start = page_base.max(acc.start());
                let fill_len = (page_base + cache.page_size() as u64 - fill_start) as usize;
                let mut page = vec![0u8; fill_len];
                let supplied = acc.read(fill_start, space, trace_id, &mut page);
                page.truncate(supplied);
                cache.fill(trace_id, space, fill_start, page);

                cache
                    .read(trace_id, space, addr, buf)
                    .unwrap_or(0)
            }
            None => self.accessors[best].read(addr, space, trace_id, buf),
        }
    }

    // Pick the matching accessor with the narrowest space.
    fn find_accessor(&self, addr: u64, space: MemSpace) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, acc) in self.accessors.iter().enumerate() {
            if acc.start() > addr {
                break;
            }
            if !acc.contains(addr) || !acc.space().intersects(space) {
                continue;
            }
            best = match best {
                Some(b) if self.accessors[b].space().specificity()
                    <= acc.space().specificity() =>
                {
                    Some(b)
                }
                _ => Some(i),
            };
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn buffer(start: u64, space: MemSpace, fill: u8, len: usize) -> MemAccessor {
        MemAccessor::from_buffer(start, space, vec![fill; len])
    }

    #[test]
    fn overlap_same_space_rejected() {
        let mut mapper = MemAccMapper::new();
        mapper.add_accessor(buffer(0x1000, MemSpace::EL1N, 1, 0x100)).unwrap();

        let err = mapper
            .add_accessor(buffer(0x1080, MemSpace::EL1N, 2, 0x100))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MemAccOverlap);

        // same range, disjoint space: fine
        mapper.add_accessor(buffer(0x1000, MemSpace::EL1S, 3, 0x100)).unwrap();

        // general space overlapping a specific one: rejected
        let err = mapper
            .add_accessor(buffer(0x1000, MemSpace::S, 4, 0x10))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MemAccOverlap);
    }

    #[test]
    fn narrowest_space_wins() {
        let mut mapper = MemAccMapper::uncached();
        mapper.add_accessor(buffer(0x0, MemSpace::R, 0xAA, 0x100)).unwrap();
        mapper.add_accessor(buffer(0x0, MemSpace::EL1N, 0xBB, 0x100)).unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(mapper.read(0x10, MemSpace::EL1N, 0, &mut buf), 1);
        assert_eq!(buf[0], 0xBB);

        // realm request is served by the general realm accessor
        assert_eq!(mapper.read(0x10, MemSpace::EL1R, 0, &mut buf), 1);
        assert_eq!(buf[0], 0xAA);
    }

    #[test]
    fn reads_never_cross_accessor_boundary() {
        let mut mapper = MemAccMapper::uncached();
        mapper.add_accessor(buffer(0x0, MemSpace::ANY, 0x11, 0x10)).unwrap();
        mapper.add_accessor(buffer(0x10, MemSpace::ANY, 0x22, 0x10)).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(mapper.read(0xC, MemSpace::EL1N, 0, &mut buf), 4);
        assert_eq!(&buf[..4], &[0x11; 4]);
    }

    #[test]
    fn cache_invalidated_on_add() {
        let mut mapper = MemAccMapper::new();
        mapper.add_accessor(buffer(0x0, MemSpace::EL1N, 0x11, 0x100)).unwrap();

        let mut buf = [0u8; 4];
        mapper.read(0x20, MemSpace::EL1N, 0, &mut buf);
        assert_eq!(buf, [0x11; 4]);

        // new accessor in a different space; the cache must not serve
        // stale pages for it
        mapper.add_accessor(buffer(0x0, MemSpace::EL1S, 0x22, 0x100)).unwrap();
        mapper.read(0x20, MemSpace::EL1S, 0, &mut buf);
        assert_eq!(buf, [0x22; 4]);
    }

    #[test]
    fn callback_results_are_page_cached() {
        let calls = Rc::new(Cell::new(0u32));
        let seen = calls.clone();
        let mut mapper = MemAccMapper::new();
        mapper
            .add_accessor(MemAccessor::from_callback(
                0x0,
                0xFFFF,
                MemSpace::ANY,
                Box::new(move |_addr, _space, _id, buf| {
                    seen.set(seen.get() + 1);
                    buf.fill(0x5A);
                    buf.len()
                }),
            ))
            .unwrap();

        let mut buf = [0u8; 4];
        mapper.read(0x100, MemSpace::EL1N, 1, &mut buf);
        mapper.read(0x104, MemSpace::EL1N, 1, &mut buf);
        mapper.read(0x108, MemSpace::EL1N, 1, &mut buf);
        assert_eq!(buf, [0x5A; 4]);
        // one page fill serves all three reads
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn unmapped_read_is_zero() {
        let mut mapper = MemAccMapper::new();
        let mut buf = [0u8; 4];
        assert_eq!(mapper.read(0xDEAD_0000, MemSpace::ANY, 0, &mut buf), 0);
    }
}
