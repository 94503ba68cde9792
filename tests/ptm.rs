//! End-to-end PTM decode: i-sync, atoms and branch addresses against
//! mapped target memory.

use coresight_decode::element::{ElemBuffer, TraceElement, TraceOnReason};
use coresight_decode::mem::{MemAccessor, MemSpace};
use coresight_decode::ptm::PtmConfig;
use coresight_decode::tree::{DecodeTree, TreeSrc};
use coresight_decode::types::DataPathOp;

fn gen_async(v: &mut Vec<u8>) {
    v.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x80]);
}

// i-sync: address (Arm state), info byte, 4-byte context ID
fn gen_isync(v: &mut Vec<u8>, addr: u32, ns: bool, reason: u8, ctxt: u32) {
    v.push(0x08);
    v.extend_from_slice(&addr.to_le_bytes());
    v.push((ns as u8) | ((reason & 0x3) << 1));
    v.extend_from_slice(&ctxt.to_le_bytes());
}

// atom header: E count in bits [5:2], trailing N in bit 6
fn gen_atoms(v: &mut Vec<u8>, e_count: u8, trailing_n: bool) {
    v.push(0x02 | ((e_count & 0xF) << 2) | ((trailing_n as u8) << 6));
}

// config: 4-byte context ID, no cycle accurate tracing
fn config() -> PtmConfig {
    PtmConfig::new(0x4100_F310, 3 << 14, 0x25)
}

// A32 `BNE #-8` style loop body: B #+8 conditional at every word.
// cond NE (0x1), opcode B, imm24 = 0 → target = pc + 8.
fn a32_bcond_image(words: usize) -> Vec<u8> {
    let mut image = Vec::new();
    for _ in 0..words {
        image.extend_from_slice(&0x1A00_0000u32.to_le_bytes());
    }
    image
}

fn tree_with_image(base: u64, image: Vec<u8>) -> DecodeTree {
    let mut tree = DecodeTree::new(TreeSrc::Single);
    tree.add_ptm_decoder(config()).unwrap();
    tree.mem_mapper()
        .add_accessor(MemAccessor::from_buffer(base, MemSpace::ANY, image))
        .unwrap();
    tree
}

fn decode(tree: &mut DecodeTree, bytes: &[u8]) -> Vec<TraceElement> {
    let mut out = ElemBuffer::new();
    let (used, resp) = tree.trace_data_in(DataPathOp::Data, 0, bytes, &mut out);
    assert_eq!(used, bytes.len());
    assert!(!resp.is_fatal());
    out.elements.into_iter().map(|(_, _, e)| e).collect()
}

#[test]
fn isync_establishes_context_and_address() {
    let mut tree = tree_with_image(0x8000, a32_bcond_image(0x40));

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_isync(&mut bytes, 0x8000, true, 1, 0x42); // reason: trace on
    gen_atoms(&mut bytes, 2, false); // two taken branches

    let elems = decode(&mut tree, &bytes);

    assert!(matches!(elems[0], TraceElement::NoSync { .. }));
    assert!(elems.iter().any(|e| matches!(
        e,
        TraceElement::TraceOn {
            reason: TraceOnReason::Normal
        }
    )));
    assert!(elems.iter().any(|e| matches!(
        e,
        TraceElement::PeContext(ctx) if ctx.context_id == Some(0x42)
    )));

    // A32 conditional branches to pc + 8: 0x8000 → 0x8008 → 0x8010
    let ranges: Vec<(u64, u64, bool)> = elems
        .iter()
        .filter_map(|e| match e {
            TraceElement::InstrRange {
                start,
                end,
                last_exec,
                ..
            } => Some((*start, *end, *last_exec)),
            _ => None,
        })
        .collect();
    assert_eq!(
        ranges,
        vec![(0x8000, 0x8004, true), (0x8008, 0x800C, true)]
    );
}

#[test]
fn branch_address_closes_range_and_jumps() {
    let mut tree = tree_with_image(0x8000, a32_bcond_image(0x40));
    tree.mem_mapper()
        .add_accessor(MemAccessor::from_buffer(
            0x10_0000,
            MemSpace::ANY,
            a32_bcond_image(0x10),
        ))
        .unwrap();

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_isync(&mut bytes, 0x8000, true, 0, 0);
    // full 5-byte branch address to 0x0010_0000 (bit 20 = byte 2
    // payload bit 6), Arm state, non-secure
    bytes.extend_from_slice(&[0x81, 0x80, 0xC0, 0x80, 0x20]);
    gen_atoms(&mut bytes, 1, false);

    let elems = decode(&mut tree, &bytes);
    let ranges: Vec<(u64, u64)> = elems
        .iter()
        .filter_map(|e| match e {
            TraceElement::InstrRange { start, end, .. } => Some((*start, *end)),
            _ => None,
        })
        .collect();

    // the branch packet closed the range at 0x8000, the atom then
    // walked from the branch target
    assert_eq!(ranges, vec![(0x8000, 0x8004), (0x10_0000, 0x10_0004)]);
}

#[test]
fn exception_branch_emits_exception_element() {
    let mut tree = tree_with_image(0x8000, a32_bcond_image(0x40));
    tree.mem_mapper()
        .add_accessor(MemAccessor::from_buffer(
            0x1000_0000,
            MemSpace::ANY,
            a32_bcond_image(0x10),
        ))
        .unwrap();

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_isync(&mut bytes, 0x8000, true, 0, 0);
    // full branch to 0x1000_0000 with exception byte 0x11
    bytes.extend_from_slice(&[0x81, 0x80, 0x80, 0x80, 0x41, 0x11]);

    let elems = decode(&mut tree, &bytes);
    assert!(elems.iter().any(|e| matches!(
        e,
        TraceElement::Exception { number: 0x11, .. }
    )));
}

#[test]
fn timestamps_and_context_changes() {
    let mut tree = tree_with_image(0x8000, a32_bcond_image(0x10));

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_isync(&mut bytes, 0x8000, true, 0, 0x10);
    bytes.extend_from_slice(&[0x48, 0xD5, 0x2A]); // timestamp
    bytes.extend_from_slice(&[0x6C, 0x20, 0x00, 0x00, 0x00]); // context 0x20
    bytes.extend_from_slice(&[0x6C, 0x20, 0x00, 0x00, 0x00]); // unchanged: no output
    bytes.push(0x74); // exception return

    let elems = decode(&mut tree, &bytes);

    assert!(elems.iter().any(|e| matches!(
        e,
        TraceElement::Timestamp {
            value,
            ..
        } if *value == (0x55 | (0x2A << 7))
    )));

    let ctx_updates = elems
        .iter()
        .filter(|e| matches!(e, TraceElement::PeContext(ctx) if ctx.context_id == Some(0x20)))
        .count();
    assert_eq!(ctx_updates, 1);

    assert!(elems
        .iter()
        .any(|e| matches!(e, TraceElement::ExceptionRet)));
}
