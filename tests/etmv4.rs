//! End-to-end ETMv4-I decode tests: packet reconstruction, speculative
//! commit, address register stack, exceptions and the instruction walk
//! against mapped target memory.

use coresight_decode::element::{ElemBuffer, TraceElement, TraceOnReason};
use coresight_decode::etmv4::Etmv4Config;
use coresight_decode::instr::InstrType;
use coresight_decode::mem::{MemAccessor, MemSpace};
use coresight_decode::tree::{DecodeTree, TreeSrc};
use coresight_decode::types::DataPathOp;

// ---- stream generators ----

fn gen_async(v: &mut Vec<u8>) {
    v.extend_from_slice(&[0u8; 11]);
    v.push(0x80);
}

// minimal trace info: no sections
fn gen_tinfo(v: &mut Vec<u8>) {
    v.extend_from_slice(&[0x01, 0x00]);
}

// context: EL1, optionally AArch64, non-secure
fn gen_ctxt(v: &mut Vec<u8>, aarch64: bool) {
    let mut info = 0x01 | 0x20;
    if aarch64 {
        info |= 0x10;
    }
    v.extend_from_slice(&[0x81, info]);
}

fn gen_addr32_is0(v: &mut Vec<u8>, addr: u32) {
    v.push(0x9A);
    v.push(((addr >> 2) & 0x7F) as u8);
    v.push(((addr >> 9) & 0x7F) as u8);
    v.push((addr >> 16) as u8);
    v.push((addr >> 24) as u8);
}

fn gen_addr64_is0(v: &mut Vec<u8>, addr: u64) {
    v.push(0x9D);
    v.push(((addr >> 2) & 0x7F) as u8);
    v.push(((addr >> 9) & 0x7F) as u8);
    for i in 2..8 {
        v.push((addr >> (8 * i)) as u8);
    }
}

// one-byte short address, IS0: address bits [8:2]
fn gen_addr_short_is0(v: &mut Vec<u8>, addr: u32) {
    v.push(0x95);
    v.push(((addr >> 2) & 0x7F) as u8);
}

fn gen_addr_match(v: &mut Vec<u8>, idx: u8) {
    v.push(0x90 | idx);
}

fn gen_atom_f1(v: &mut Vec<u8>, executed: bool) {
    v.push(0xF6 | executed as u8);
}

// format 3: three atoms, bit 0 oldest
fn gen_atom_f3(v: &mut Vec<u8>, bits: u8) {
    v.push(0xF8 | (bits & 0x7));
}

fn gen_exception(v: &mut Vec<u8>, number: u8, prev_same: bool) {
    let mut b0 = (number & 0x1F) << 1;
    if prev_same {
        b0 |= 0x40;
    }
    v.extend_from_slice(&[0x06, b0]);
}

fn gen_commit(v: &mut Vec<u8>, count: u8) {
    v.extend_from_slice(&[0x2D, count & 0x7F]);
}

fn gen_cancel(v: &mut Vec<u8>, count: u8) {
    v.extend_from_slice(&[0x2E, count & 0x7F]);
}

// ---- target memory images ----

// A64 `B.EQ #8` repeated: every instruction is a conditional direct
// branch to itself + 8
fn bcond_image(words: usize) -> Vec<u8> {
    let mut image = Vec::with_capacity(words * 4);
    for _ in 0..words {
        image.extend_from_slice(&0x5400_0040u32.to_le_bytes());
    }
    image
}

// A64 NOPs
fn nop_image(words: usize) -> Vec<u8> {
    let mut image = Vec::with_capacity(words * 4);
    for _ in 0..words {
        image.extend_from_slice(&0xD503_201Fu32.to_le_bytes());
    }
    image
}

// ---- harness ----

fn tree_with(cfg: Etmv4Config, images: &[(u64, Vec<u8>)]) -> DecodeTree {
    let mut tree = DecodeTree::new(TreeSrc::Single);
    tree.add_etmv4_decoder(cfg).unwrap();
    for (base, image) in images {
        tree.mem_mapper()
            .add_accessor(MemAccessor::from_buffer(*base, MemSpace::ANY, image.clone()))
            .unwrap();
    }
    tree
}

fn feed(tree: &mut DecodeTree, index: u64, bytes: &[u8], out: &mut ElemBuffer) {
    let (used, resp) = tree.trace_data_in(DataPathOp::Data, index, bytes, out);
    assert_eq!(used, bytes.len());
    assert!(resp.is_cont(), "unexpected response {:?}", resp);
}

fn ranges(out: &ElemBuffer) -> Vec<(u64, u64, bool)> {
    out.elements
        .iter()
        .filter_map(|(_, _, e)| match e {
            TraceElement::InstrRange {
                start,
                end,
                last_exec,
                ..
            } => Some((*start, *end, *last_exec)),
            _ => None,
        })
        .collect()
}

// ---- tests ----

/// F1 atoms E, N, E produce three ranges in order with the matching
/// last-executed flags; taken branches move the PC to their target.
#[test]
fn atom_commit_order() {
    let cfg = Etmv4Config::default();
    let mut tree = tree_with(cfg, &[(0x1000, bcond_image(0x40))]);

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_tinfo(&mut bytes);
    gen_ctxt(&mut bytes, true);
    gen_addr32_is0(&mut bytes, 0x1000);
    gen_atom_f1(&mut bytes, true);
    gen_atom_f1(&mut bytes, false);
    gen_atom_f1(&mut bytes, true);

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &bytes, &mut out);

    assert!(matches!(out.elements[0].2, TraceElement::NoSync { .. }));
    assert!(matches!(out.elements[1].2, TraceElement::PeContext(_)));

    // E at 0x1000 jumps to 0x1008; N at 0x1008 falls through to
    // 0x100C; E at 0x100C jumps on
    assert_eq!(
        ranges(&out),
        vec![
            (0x1000, 0x1004, true),
            (0x1008, 0x100C, false),
            (0x100C, 0x1010, true),
        ]
    );

    // the final instruction classification rides on the element
    match &out.elements[2].2 {
        TraceElement::InstrRange { last_i_type, .. } => {
            assert_eq!(*last_i_type, InstrType::Branch)
        }
        other => panic!("unexpected element {:?}", other),
    }
}

/// Exact-match address packets reference the three-entry address
/// register stack: match 0 is the newest entry, match 2 the oldest.
#[test]
fn address_register_stack_matches() {
    let cfg = Etmv4Config::default();
    let mut tree = tree_with(
        cfg,
        &[
            (0x1000, bcond_image(0x40)),
            (0x2000, bcond_image(0x40)),
            (0x3000, bcond_image(0x40)),
        ],
    );

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_tinfo(&mut bytes);
    gen_ctxt(&mut bytes, true);
    for addr in [0x1000u32, 0x2000, 0x3000] {
        gen_addr32_is0(&mut bytes, addr);
        gen_atom_f1(&mut bytes, true);
    }
    gen_addr_match(&mut bytes, 0); // newest: 0x3000
    gen_atom_f1(&mut bytes, true);
    gen_addr_match(&mut bytes, 2); // oldest of the three: 0x1000
    gen_atom_f1(&mut bytes, true);

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &bytes, &mut out);

    let starts: Vec<u64> = ranges(&out).iter().map(|r| r.0).collect();
    assert_eq!(starts, vec![0x1000, 0x2000, 0x3000, 0x3000, 0x1000]);
}

/// Short addresses take their missing upper bits from the newest stack
/// entry; 32-bit long addresses on a 64-bit decoder take their upper
/// word from the stack top.
#[test]
fn short_and_narrow_address_composition() {
    let base = 0x40_0000_1000u64;
    let cfg = Etmv4Config::default();
    let mut tree = tree_with(
        cfg,
        &[
            (base, bcond_image(0x80)),
            (0x40_0000_2000, bcond_image(0x40)),
        ],
    );

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_tinfo(&mut bytes);
    gen_ctxt(&mut bytes, true);
    gen_addr64_is0(&mut bytes, base);
    gen_atom_f1(&mut bytes, true);
    // short address: bits [8:2] say 0x90; the rest comes from the stack
    gen_addr_short_is0(&mut bytes, 0x90);
    gen_atom_f1(&mut bytes, true);
    // 32-bit long address composes its upper word from the stack top
    gen_addr32_is0(&mut bytes, 0x2000);
    gen_atom_f1(&mut bytes, true);

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &bytes, &mut out);

    let starts: Vec<u64> = ranges(&out).iter().map(|r| r.0).collect();
    assert_eq!(starts, vec![base, 0x40_0000_1090, 0x40_0000_2000]);
}

/// Exception, context, address: one PE context element, then one
/// exception element whose preferred return equals the address.
#[test]
fn exception_reconstruction() {
    let cfg = Etmv4Config::default();
    let mut tree = tree_with(cfg, &[]);

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_tinfo(&mut bytes);
    gen_exception(&mut bytes, 0x11, false);
    gen_ctxt(&mut bytes, false);
    gen_addr32_is0(&mut bytes, 0x4000);

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &bytes, &mut out);

    let tail: Vec<&TraceElement> = out.elements.iter().map(|(_, _, e)| e).collect();
    assert!(matches!(tail[0], TraceElement::NoSync { .. }));
    assert!(matches!(tail[1], TraceElement::PeContext(_)));
    assert_eq!(
        tail[2],
        &TraceElement::Exception {
            number: 0x11,
            preferred_ret: 0x4000
        }
    );
}

/// With a non-zero maximum speculation depth, nothing commits until
/// the bound is exceeded; a commit packet drains the remainder.
#[test]
fn speculation_depth_bound_and_commit() {
    let mut cfg = Etmv4Config::default();
    cfg.reg_idr8 = 4; // max spec depth
    let mut tree = tree_with(cfg, &[(0x1000, bcond_image(0x80))]);

    let mut head = Vec::new();
    gen_async(&mut head);
    gen_tinfo(&mut head);
    gen_ctxt(&mut head, true);
    gen_addr32_is0(&mut head, 0x1000);
    gen_atom_f3(&mut head, 0b111); // 3 E atoms: within the bound

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &head, &mut out);
    assert!(ranges(&out).is_empty(), "nothing may commit below the bound");

    // 3 more atoms: 6 uncommitted > 4, the oldest two commit
    let mut more = Vec::new();
    gen_atom_f3(&mut more, 0b111);
    feed(&mut tree, head.len() as u64, &more, &mut out);
    assert_eq!(ranges(&out).len(), 2);

    // explicit commit of the remaining four
    let mut rest = Vec::new();
    gen_commit(&mut rest, 4);
    feed(&mut tree, (head.len() + more.len()) as u64, &rest, &mut out);
    assert_eq!(ranges(&out).len(), 6);

    // ranges chain through the taken branches
    let starts: Vec<u64> = ranges(&out).iter().map(|r| r.0).collect();
    assert_eq!(
        starts,
        vec![0x1000, 0x1008, 0x1010, 0x1018, 0x1020, 0x1028]
    );
}

/// Cancelled speculation never reaches the output.
#[test]
fn cancel_discards_newest_atoms() {
    let mut cfg = Etmv4Config::default();
    cfg.reg_idr8 = 8;
    let mut tree = tree_with(cfg, &[(0x1000, bcond_image(0x40))]);

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_tinfo(&mut bytes);
    gen_ctxt(&mut bytes, true);
    gen_addr32_is0(&mut bytes, 0x1000);
    gen_atom_f3(&mut bytes, 0b111);
    gen_cancel(&mut bytes, 2);
    gen_commit(&mut bytes, 1);

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &bytes, &mut out);

    assert_eq!(ranges(&out), vec![(0x1000, 0x1004, true)]);
}

/// A mispredict packet inverts the newest uncommitted atom.
#[test]
fn mispredict_flips_newest_atom() {
    let mut cfg = Etmv4Config::default();
    cfg.reg_idr8 = 8;
    let mut tree = tree_with(cfg, &[(0x1000, bcond_image(0x40))]);

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_tinfo(&mut bytes);
    gen_ctxt(&mut bytes, true);
    gen_addr32_is0(&mut bytes, 0x1000);
    gen_atom_f1(&mut bytes, true);
    bytes.push(0x30); // mispredict
    gen_commit(&mut bytes, 1);

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &bytes, &mut out);

    assert_eq!(ranges(&out), vec![(0x1000, 0x1004, false)]);
}

/// When target memory runs out mid-range the partial range is emitted
/// first, then the not-accessible marker; a fresh address resumes
/// decode.
#[test]
fn mem_nacc_soft_handling() {
    let cfg = Etmv4Config::default();
    let mut tree = tree_with(
        cfg,
        &[(0x1000, nop_image(2)), (0x2000, bcond_image(0x40))],
    );

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_tinfo(&mut bytes);
    gen_ctxt(&mut bytes, true);
    gen_addr32_is0(&mut bytes, 0x1000);
    gen_atom_f1(&mut bytes, true);
    gen_addr32_is0(&mut bytes, 0x2000);
    gen_atom_f1(&mut bytes, true);

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &bytes, &mut out);

    let elems: Vec<&TraceElement> = out.elements.iter().map(|(_, _, e)| e).collect();
    // partial range over the two NOPs, then the NACC marker
    let pos = elems
        .iter()
        .position(|e| {
            matches!(
                e,
                TraceElement::InstrRange {
                    start: 0x1000,
                    end: 0x1008,
                    ..
                }
            )
        })
        .expect("partial range before the NACC");
    assert_eq!(elems[pos + 1], &TraceElement::AddrNacc { addr: 0x1008 });

    // decode resumed at the fresh address
    assert_eq!(ranges(&out).last(), Some(&(0x2000, 0x2004, true)));
}

/// Timestamps, events and cycle counts attach in stream order before
/// the P0 element they precede.
#[test]
fn metadata_precedes_p0_output() {
    let cfg = Etmv4Config::default();
    let mut tree = tree_with(cfg, &[(0x1000, bcond_image(0x40))]);

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_tinfo(&mut bytes);
    gen_ctxt(&mut bytes, true);
    gen_addr32_is0(&mut bytes, 0x1000);
    bytes.extend_from_slice(&[0x02, 0x55]); // timestamp 0x55
    bytes.push(0x75); // event, mask 0b0101
    bytes.extend_from_slice(&[0x0E, 0x20]); // cycle count format 2
    gen_atom_f1(&mut bytes, true);

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &bytes, &mut out);

    let elems: Vec<&TraceElement> = out.elements.iter().map(|(_, _, e)| e).collect();
    let range_pos = elems
        .iter()
        .position(|e| matches!(e, TraceElement::InstrRange { .. }))
        .unwrap();
    assert_eq!(
        elems[range_pos - 3],
        &TraceElement::Timestamp {
            value: 0x55,
            cycle_count: None
        }
    );
    assert_eq!(elems[range_pos - 2], &TraceElement::Event { value: 0x5 });
    assert_eq!(elems[range_pos - 1], &TraceElement::CycleCount { count: 0x20 });
}

/// Overflow marks the next trace-on element.
#[test]
fn overflow_reason_on_trace_on() {
    let cfg = Etmv4Config::default();
    let mut tree = tree_with(cfg, &[(0x1000, bcond_image(0x40))]);

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_tinfo(&mut bytes);
    gen_ctxt(&mut bytes, true);
    gen_addr32_is0(&mut bytes, 0x1000);
    bytes.extend_from_slice(&[0x00, 0x05]); // overflow
    bytes.push(0x04); // trace on
    gen_atom_f1(&mut bytes, true);

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &bytes, &mut out);

    assert!(out.elements.iter().any(|(_, _, e)| matches!(
        e,
        TraceElement::TraceOn {
            reason: TraceOnReason::Overflow
        }
    )));
}

/// Unsupported hardware configurations are rejected at creation time.
#[test]
fn unsupported_config_rejected() {
    let mut cfg = Etmv4Config::default();
    cfg.reg_configr = 1 << 12; // return stack
    let mut tree = DecodeTree::new(TreeSrc::Single);
    assert!(tree.add_etmv4_decoder(cfg).is_err());
}

/// End of trace flushes an end-of-trace element.
#[test]
fn eot_emits_end_of_trace() {
    let cfg = Etmv4Config::default();
    let mut tree = tree_with(cfg, &[]);

    let mut bytes = Vec::new();
    gen_async(&mut bytes);
    gen_tinfo(&mut bytes);

    let mut out = ElemBuffer::new();
    feed(&mut tree, 0, &bytes, &mut out);
    tree.trace_data_in(DataPathOp::Eot, bytes.len() as u64, &[], &mut out);

    assert!(matches!(
        out.elements.last().unwrap().2,
        TraceElement::EoTrace
    ));
}
