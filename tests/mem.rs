//! Memory access mapper properties: overlap policy, space matching,
//! cache coherence.

use std::cell::Cell;
use std::rc::Rc;

use coresight_decode::error::ErrorKind;
use coresight_decode::mem::{CacheConfig, MemAccMapper, MemAccessor, MemSpace};

fn buffer(start: u64, space: MemSpace, fill: u8, len: usize) -> MemAccessor {
    MemAccessor::from_buffer(start, space, vec![fill; len])
}

#[test]
fn overlap_rejected_in_matching_space_only() {
    let mut mapper = MemAccMapper::new();
    mapper
        .add_accessor(buffer(0x1_0000, MemSpace::EL1N, 0xAA, 0x1000))
        .unwrap();

    // same space, overlapping: rejected
    let err = mapper
        .add_accessor(buffer(0x1_0800, MemSpace::EL1N, 0xBB, 0x1000))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MemAccOverlap);

    // overlapping but in a disjoint space: accepted
    mapper
        .add_accessor(buffer(0x1_0800, MemSpace::EL1S, 0xCC, 0x1000))
        .unwrap();

    // a general space intersecting an existing specific one: rejected
    let err = mapper
        .add_accessor(buffer(0x1_0000, MemSpace::N, 0xDD, 0x10))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MemAccOverlap);

    // adjacent (non-overlapping) same space: accepted
    mapper
        .add_accessor(buffer(0x1_1000, MemSpace::EL1N, 0xEE, 0x1000))
        .unwrap();
}

#[test]
fn space_resolution_prefers_most_specific() {
    let mut mapper = MemAccMapper::uncached();
    mapper
        .add_accessor(buffer(0x0, MemSpace::ANY, 0x11, 0x100))
        .unwrap();

    let mut buf = [0u8; 1];
    // the catch-all accessor serves every request space
    for space in [MemSpace::EL1N, MemSpace::EL3, MemSpace::EL1R] {
        assert_eq!(mapper.read(0x10, space, 0, &mut buf), 1);
        assert_eq!(buf[0], 0x11);
    }
}

#[test]
fn cache_coherent_across_accessor_add() {
    let mut mapper = MemAccMapper::new();
    mapper
        .add_accessor(buffer(0x0, MemSpace::EL1N, 0x11, 0x2000))
        .unwrap();

    let mut buf = [0u8; 4];
    mapper.read(0x100, MemSpace::EL1N, 7, &mut buf);
    assert_eq!(buf, [0x11; 4]);

    // a new accessor in another space must not see stale pages, and
    // the original must still read correctly afterwards
    mapper
        .add_accessor(buffer(0x0, MemSpace::EL1S, 0x22, 0x2000))
        .unwrap();
    mapper.read(0x100, MemSpace::EL1S, 7, &mut buf);
    assert_eq!(buf, [0x22; 4]);
    mapper.read(0x100, MemSpace::EL1N, 7, &mut buf);
    assert_eq!(buf, [0x11; 4]);
}

#[test]
fn callback_hit_once_per_page() {
    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();

    let mut mapper = MemAccMapper::new();
    mapper.set_cache_config(CacheConfig {
        page_size: 256,
        num_pages: 4,
    });
    mapper
        .add_accessor(MemAccessor::from_callback(
            0x8000,
            0xFFFF,
            MemSpace::ANY,
            Box::new(move |addr, _space, _id, buf| {
                seen.set(seen.get() + 1);
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = (addr as u8).wrapping_add(i as u8);
                }
                buf.len()
            }),
        ))
        .unwrap();

    let mut buf = [0u8; 4];
    for offset in (0..256).step_by(4) {
        assert_eq!(mapper.read(0x8000 + offset, MemSpace::EL1N, 1, &mut buf), 4);
    }
    // every read inside the page was served from one callback fill
    assert_eq!(calls.get(), 1);

    // next page: one more call
    mapper.read(0x8100, MemSpace::EL1N, 1, &mut buf);
    assert_eq!(calls.get(), 2);
}

#[test]
fn short_reads_at_accessor_boundary() {
    let mut mapper = MemAccMapper::uncached();
    mapper
        .add_accessor(buffer(0x0, MemSpace::ANY, 0xAB, 0x10))
        .unwrap();
    mapper
        .add_accessor(buffer(0x10, MemSpace::ANY, 0xCD, 0x10))
        .unwrap();

    // a read spanning the boundary stops at it
    let mut buf = [0u8; 8];
    assert_eq!(mapper.read(0xC, MemSpace::EL1N, 0, &mut buf), 4);
    assert_eq!(&buf[..4], &[0xAB; 4]);

    // and the follow-up read picks up the next accessor
    assert_eq!(mapper.read(0x10, MemSpace::EL1N, 0, &mut buf), 8);
    assert_eq!(buf, [0xCD; 8]);
}

#[test]
fn remove_accessor_unmaps() {
    let mut mapper = MemAccMapper::new();
    mapper
        .add_accessor(buffer(0x1000, MemSpace::EL1N, 0x42, 0x100))
        .unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(mapper.read(0x1000, MemSpace::EL1N, 0, &mut buf), 1);

    assert!(mapper.remove_accessor(0x1000, MemSpace::EL1N));
    assert_eq!(mapper.read(0x1000, MemSpace::EL1N, 0, &mut buf), 0);
    assert!(!mapper.remove_accessor(0x1000, MemSpace::EL1N));
}
