//! End-to-end data-path scenarios over the loopback harness.

mod common;

use std::sync::Arc;

use common::{md_with_eq, pt_with_eq, region_of, setup, test_limits, LoopConnector, Loopback};
use ptl4_core::{
    le_append, AckReq, AtomOp, AtomType, Ct, Event, EventKind, EventQueue, IoVec, LeInit,
    LeOptions, Md, MdOptions, Ni, NiFail, OpArgs, ProcessId, PtOptions, PtState, PtlList, Region,
};

fn drain(eq: &EventQueue) -> Vec<Event> {
    std::iter::from_fn(|| eq.pop()).collect()
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

#[test]
fn put_with_ack() {
    let (lo, ni) = setup();
    let (pt, eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem = vec![0u8; 32];
    let _le = le_append(
        &ni,
        pt,
        LeInit::new(region_of(&mut elem), LeOptions::OP_PUT),
        PtlList::Priority,
    )
    .unwrap();

    let mut src = vec![0xAA; 16];
    let (md, init_eq) = md_with_eq(&mut src);
    ni.put(&md, 0, 16, AckReq::Ack, OpArgs::to(ni.id(), pt))
        .unwrap();
    lo.run();

    assert_eq!(&elem[..16], &[0xAA; 16]);
    assert_eq!(&elem[16..], &[0u8; 16]);

    let tgt_events = drain(&eq);
    assert_eq!(kinds(&tgt_events), [EventKind::Put]);
    assert_eq!(tgt_events[0].ni_fail, NiFail::Ok);
    assert_eq!(tgt_events[0].mlength, 16);
    assert_eq!(tgt_events[0].moffset, 0);
    assert_eq!(tgt_events[0].start, Some(elem.as_ptr() as usize));
    assert_eq!(tgt_events[0].initiator, ni.id());
    assert_eq!(tgt_events[0].uid, 7);

    let init_events = drain(&init_eq);
    assert_eq!(kinds(&init_events), [EventKind::Send, EventKind::Ack]);
    let ack = &init_events[1];
    assert_eq!(ack.ni_fail, NiFail::Ok);
    assert_eq!(ack.mlength, 16);
    assert_eq!(ack.moffset, 0);
}

#[test]
fn get_truncates_to_element() {
    let (lo, ni) = setup();
    let (pt, eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem: Vec<u8> = (0..32u8).collect();
    let _le = le_append(
        &ni,
        pt,
        LeInit::new(region_of(&mut elem), LeOptions::OP_GET),
        PtlList::Priority,
    )
    .unwrap();

    let mut dst = vec![0u8; 64];
    let (md, init_eq) = md_with_eq(&mut dst);
    ni.get(&md, 0, 40, OpArgs::to(ni.id(), pt)).unwrap();
    lo.run();

    assert_eq!(&dst[..32], &elem[..]);
    assert_eq!(&dst[32..], &[0u8; 32]);

    assert_eq!(kinds(&drain(&eq)), [EventKind::Get]);
    let init_events = drain(&init_eq);
    assert_eq!(kinds(&init_events), [EventKind::Reply]);
    assert_eq!(init_events[0].ni_fail, NiFail::Ok);
    assert_eq!(init_events[0].mlength, 32);
    assert_eq!(init_events[0].moffset, 0);
}

#[test]
fn atomic_sum_u32() {
    let (lo, ni) = setup();
    let (pt, eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem: Vec<u8> = [10u32; 4].iter().flat_map(|v| v.to_le_bytes()).collect();
    let _le = le_append(
        &ni,
        pt,
        LeInit::new(region_of(&mut elem), LeOptions::OP_PUT),
        PtlList::Priority,
    )
    .unwrap();

    let mut src: Vec<u8> = [1u32, 2, 3, 4].iter().flat_map(|v| v.to_le_bytes()).collect();
    let (md, init_eq) = md_with_eq(&mut src);
    ni.atomic(
        &md,
        0,
        16,
        AckReq::Ack,
        AtomOp::Sum,
        AtomType::Uint32,
        OpArgs::to(ni.id(), pt),
    )
    .unwrap();
    lo.run();

    let got: Vec<u8> = [11u32, 12, 13, 14].iter().flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(elem, got);

    assert_eq!(kinds(&drain(&eq)), [EventKind::Atomic]);
    let init_events = drain(&init_eq);
    assert_eq!(kinds(&init_events), [EventKind::Send, EventKind::Ack]);
    assert_eq!(init_events[1].mlength, 16);
    assert_eq!(init_events[1].moffset, 0);
}

#[test]
fn cswap_returns_prior_value() {
    let (lo, ni) = setup();
    let (pt, eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem = 5u64.to_le_bytes().to_vec();
    let _le = le_append(
        &ni,
        pt,
        LeInit::new(
            region_of(&mut elem),
            LeOptions::OP_PUT | LeOptions::OP_GET,
        ),
        PtlList::Priority,
    )
    .unwrap();

    let mut new_val = 99u64.to_le_bytes().to_vec();
    let (put_md, init_eq) = md_with_eq(&mut new_val);
    let mut prior = vec![0u8; 8];
    let get_md = Md::bind(region_of(&mut prior), MdOptions::empty());

    ni.swap(
        &get_md,
        0,
        &put_md,
        0,
        8,
        5,
        AtomOp::Cswap,
        AtomType::Uint64,
        OpArgs::to(ni.id(), pt),
    )
    .unwrap();
    lo.run();

    assert_eq!(elem, 99u64.to_le_bytes());
    assert_eq!(prior, 5u64.to_le_bytes());

    assert_eq!(kinds(&drain(&eq)), [EventKind::Atomic]);
    assert_eq!(
        kinds(&drain(&init_eq)),
        [EventKind::Send, EventKind::Reply]
    );
}

#[test]
fn fetch_atomic_event_order() {
    let (lo, ni) = setup();
    let (pt, _eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem = 100u64.to_le_bytes().to_vec();
    let _le = le_append(
        &ni,
        pt,
        LeInit::new(
            region_of(&mut elem),
            LeOptions::OP_PUT | LeOptions::OP_GET,
        ),
        PtlList::Priority,
    )
    .unwrap();

    let shared_eq = Arc::new(EventQueue::new(64));
    let mut addend = 23u64.to_le_bytes().to_vec();
    let put_md = Md::bind_with_events(
        region_of(&mut addend),
        MdOptions::empty(),
        Some(shared_eq.clone()),
        None,
    );
    let mut prior = vec![0u8; 8];
    let get_md = Md::bind_with_events(
        region_of(&mut prior),
        MdOptions::empty(),
        Some(shared_eq.clone()),
        None,
    );

    ni.fetch_atomic(
        &get_md,
        0,
        &put_md,
        0,
        8,
        AtomOp::Sum,
        AtomType::Uint64,
        OpArgs::to(ni.id(), pt),
    )
    .unwrap();
    lo.run();

    assert_eq!(elem, 123u64.to_le_bytes());
    assert_eq!(prior, 100u64.to_le_bytes());

    // send always precedes the reply on one operation
    assert_eq!(
        kinds(&drain(&shared_eq)),
        [EventKind::Send, EventKind::Reply]
    );
}

#[test]
fn bulk_put_and_get() {
    let (lo, ni) = setup();
    let (pt, eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem = vec![0u8; 4096];
    let _le = le_append(
        &ni,
        pt,
        LeInit::new(
            region_of(&mut elem),
            LeOptions::OP_PUT | LeOptions::OP_GET,
        ),
        PtlList::Priority,
    )
    .unwrap();

    // larger than the inline bound: travels as a segment descriptor
    let mut src: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
    let (md, init_eq) = md_with_eq(&mut src);
    ni.put(&md, 0, 2048, AckReq::Ack, OpArgs::to(ni.id(), pt))
        .unwrap();
    lo.run();
    assert_eq!(&elem[..2048], &src[..]);
    assert_eq!(kinds(&drain(&init_eq)), [EventKind::Send, EventKind::Ack]);

    let mut dst = vec![0u8; 2048];
    let (get_md, get_eq) = md_with_eq(&mut dst);
    ni.get(&get_md, 0, 2048, OpArgs::to(ni.id(), pt)).unwrap();
    lo.run();
    assert_eq!(&dst[..], &elem[..2048]);
    assert_eq!(kinds(&drain(&get_eq)), [EventKind::Reply]);

    assert_eq!(kinds(&drain(&eq)), [EventKind::Put, EventKind::Get]);
}

#[test]
fn vectored_put_spills_to_indirect_descriptor() {
    let (lo, ni) = setup();
    let (pt, eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem = vec![0u8; 4096];
    let _le = le_append(
        &ni,
        pt,
        LeInit::new(region_of(&mut elem), LeOptions::OP_PUT),
        PtlList::Priority,
    )
    .unwrap();

    // eight ranges beat the inline segment bound of four
    let mut chunks: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i + 1; 300]).collect();
    let region = unsafe {
        Region::vectored(chunks.iter_mut().map(|c| IoVec {
            base: c.as_mut_ptr(),
            len: c.len(),
        }))
    };
    let md = Md::bind(region, MdOptions::empty());
    ni.put(&md, 0, 2400, AckReq::Ack, OpArgs::to(ni.id(), pt))
        .unwrap();
    lo.run();

    let expect: Vec<u8> = chunks.iter().flatten().copied().collect();
    assert_eq!(&elem[..2400], &expect[..]);
    assert_eq!(kinds(&drain(&eq)), [EventKind::Put]);
}

#[test]
fn permission_failures_move_no_data() {
    let (lo, ni) = setup();
    let (pt, eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem = vec![0u8; 32];
    let _le = le_append(
        &ni,
        pt,
        LeInit::new(region_of(&mut elem), LeOptions::OP_PUT).uid(9),
        PtlList::Priority,
    )
    .unwrap();

    let mut src = vec![0xCC; 16];
    let (md, init_eq) = md_with_eq(&mut src);
    ni.put(&md, 0, 16, AckReq::Ack, OpArgs::to(ni.id(), pt))
        .unwrap();
    lo.run();

    assert_eq!(elem, vec![0u8; 32]);
    // the violation produces no comm event, but the ack still arrives
    assert!(drain(&eq).is_empty());
    let init_events = drain(&init_eq);
    assert_eq!(kinds(&init_events), [EventKind::Send, EventKind::Ack]);
    assert_eq!(init_events[1].ni_fail, NiFail::PermViolation);

    // an element that only allows gets rejects the operation instead
    let (pt2, _eq2) = pt_with_eq(&ni, PtOptions::empty());
    let mut elem2 = vec![0u8; 32];
    let _le2 = le_append(
        &ni,
        pt2,
        LeInit::new(region_of(&mut elem2), LeOptions::OP_GET),
        PtlList::Priority,
    )
    .unwrap();
    ni.put(&md, 0, 16, AckReq::Ack, OpArgs::to(ni.id(), pt2))
        .unwrap();
    lo.run();
    let init_events = drain(&init_eq);
    assert_eq!(init_events[1].ni_fail, NiFail::OpViolation);
    assert_eq!(elem2, vec![0u8; 32]);
}

#[test]
fn use_once_unlinks_after_first_match() {
    let (lo, ni) = setup();
    let (pt, eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem = vec![0u8; 32];
    let le = le_append(
        &ni,
        pt,
        LeInit::new(
            region_of(&mut elem),
            LeOptions::OP_PUT | LeOptions::USE_ONCE,
        ),
        PtlList::Priority,
    )
    .unwrap();

    let mut src = vec![0xDD; 8];
    let (md, init_eq) = md_with_eq(&mut src);
    ni.put(&md, 0, 8, AckReq::Ack, OpArgs::to(ni.id(), pt))
        .unwrap();
    lo.run();

    assert!(!le.is_linked());
    assert_eq!(&elem[..8], &[0xDD; 8]);
    assert_eq!(
        kinds(&drain(&eq)),
        [EventKind::AutoUnlink, EventKind::Put]
    );

    // the identical request now finds nothing
    ni.put(&md, 0, 8, AckReq::Ack, OpArgs::to(ni.id(), pt))
        .unwrap();
    lo.run();
    let init_events = drain(&init_eq);
    assert_eq!(init_events.last().unwrap().ni_fail, NiFail::Dropped);
    assert!(drain(&eq).is_empty());
}

#[test]
fn manage_local_appends_and_unlinks_at_min_free() {
    let (lo, ni) = setup();
    let (pt, eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem = vec![0u8; 64];
    let le = le_append(
        &ni,
        pt,
        LeInit::new(
            region_of(&mut elem),
            LeOptions::OP_PUT | LeOptions::MANAGE_LOCAL,
        )
        .min_free(32),
        PtlList::Priority,
    )
    .unwrap();

    let mut a = vec![0x11; 16];
    let (md_a, init_eq) = md_with_eq(&mut a);
    ni.put(&md_a, 0, 16, AckReq::Ack, OpArgs::to(ni.id(), pt))
        .unwrap();
    lo.run();
    assert_eq!(le.manage_offset(), 16);
    assert!(le.is_linked());

    // crossing min_free unlinks the element
    let mut b = vec![0x22; 20];
    let md_b = Md::bind_with_events(
        region_of(&mut b),
        MdOptions::empty(),
        Some(init_eq.clone()),
        None,
    );
    ni.put(&md_b, 0, 20, AckReq::Ack, OpArgs::to(ni.id(), pt))
        .unwrap();
    lo.run();
    assert_eq!(le.manage_offset(), 36);
    assert!(!le.is_linked());
    assert_eq!(&elem[..16], &[0x11; 16]);
    assert_eq!(&elem[16..36], &[0x22; 20]);

    let acks: Vec<_> = drain(&init_eq)
        .into_iter()
        .filter(|e| e.kind == EventKind::Ack)
        .collect();
    assert_eq!(acks[0].moffset, 0);
    assert_eq!(acks[1].moffset, 16);

    // third delivery has nowhere to land
    ni.put(&md_a, 0, 16, AckReq::Ack, OpArgs::to(ni.id(), pt))
        .unwrap();
    lo.run();
    let init_events = drain(&init_eq);
    assert_eq!(init_events.last().unwrap().ni_fail, NiFail::Dropped);

    let tgt_kinds = kinds(&drain(&eq));
    assert_eq!(
        tgt_kinds,
        [EventKind::Put, EventKind::AutoUnlink, EventKind::Put]
    );
}

#[test]
fn offset_past_element_truncates_to_zero() {
    let (lo, ni) = setup();
    let (pt, eq) = pt_with_eq(&ni, PtOptions::empty());

    let mut elem = vec![0x77; 32];
    let _le = le_append(
        &ni,
        pt,
        LeInit::new(region_of(&mut elem), LeOptions::OP_PUT),
        PtlList::Priority,
    )
    .unwrap();

    let mut src = vec![0xEE; 8];
    let (md, init_eq) = md_with_eq(&mut src);
    let mut args = OpArgs::to(ni.id(), pt);
    args.remote_offset = 40;
    ni.put(&md, 0, 8, AckReq::Ack, args).unwrap();
    lo.run();

    assert_eq!(elem, vec![0x77; 32]);
    let init_events = drain(&init_eq);
    assert_eq!(kinds(&init_events), [EventKind::Send, EventKind::Ack]);
    assert_eq!(init_events[1].ni_fail, NiFail::Ok);
    assert_eq!(init_events[1].mlength, 0);

    let tgt_events = drain(&eq);
    assert_eq!(kinds(&tgt_events), [EventKind::Put]);
    assert_eq!(tgt_events[0].mlength, 0);
}

#[test]
fn counting_events_count_bytes_and_acks() {
    let (lo, ni) = setup();
    let (pt, _eq) = pt_with_eq(&ni, PtOptions::empty());

    let ct = Arc::new(Ct::new());
    let mut elem = vec![0u8; 64];
    let _le = le_append(
        &ni,
        pt,
        LeInit::new(
            region_of(&mut elem),
            LeOptions::OP_PUT | LeOptions::EVENT_CT_COMM | LeOptions::EVENT_CT_BYTES,
        )
        .ct(ct.clone()),
        PtlList::Priority,
    )
    .unwrap();

    let init_ct = Arc::new(Ct::new());
    let mut src = vec![0x55; 16];
    let md = Md::bind_with_events(
        region_of(&mut src),
        MdOptions::EVENT_CT_ACK,
        None,
        Some(init_ct.clone()),
    );

    ni.put(&md, 0, 16, AckReq::CtAck, OpArgs::to(ni.id(), pt))
        .unwrap();
    ni.put(&md, 0, 8, AckReq::CtAck, OpArgs::to(ni.id(), pt))
        .unwrap();
    lo.run();

    let tgt_counts = ct.get();
    assert_eq!(tgt_counts.success, 24);
    assert_eq!(tgt_counts.failure, 0);

    // counting acks count operations when byte counting is off
    let init_counts = init_ct.get();
    assert_eq!(init_counts.success, 2);
    assert_eq!(init_counts.failure, 0);
}

#[test]
fn flow_control_disables_after_drain() {
    let lo = Loopback::new();
    let ni_a = Ni::builder(ProcessId::new(1, 1))
        .uid(7)
        .limits(test_limits())
        .build(Box::new(LoopConnector(lo.clone())));
    let ni_b = Ni::builder(ProcessId::new(2, 2))
        .uid(7)
        .limits(test_limits())
        .build(Box::new(LoopConnector(lo.clone())));
    lo.register(&ni_a);
    lo.register(&ni_b);

    // responses toward the initiator stall until released, keeping target
    // operations in flight
    lo.hold_connects_to(ni_a.id());

    let (pt, eq_b) = pt_with_eq(&ni_b, PtOptions::FLOWCTRL);
    let mut elem = vec![0u8; 64];
    let _le = le_append(
        &ni_b,
        pt,
        LeInit::new(region_of(&mut elem), LeOptions::OP_PUT).match_bits(1, 0),
        PtlList::Priority,
    )
    .unwrap();

    let mut src = vec![0x99; 16];
    let (md, eq_a) = md_with_eq(&mut src);

    let mut matching = OpArgs::to(ni_b.id(), pt);
    matching.match_bits = 1;
    ni_a.put(&md, 0, 16, AckReq::Ack, matching).unwrap();
    lo.run();

    // the first request matched and parked waiting for its response path
    assert_eq!(ni_b.pt_state(pt), Some(PtState::Enabled));

    let mut missing = OpArgs::to(ni_b.id(), pt);
    missing.match_bits = 2;
    ni_a.put(&md, 0, 16, AckReq::Ack, missing).unwrap();
    lo.run();

    // the no-match tripped flow control, but in-flight operations still
    // drain before the entry fully disables
    assert_eq!(ni_b.pt_state(pt), Some(PtState::AutoDisabled));
    assert!(drain(&eq_b).is_empty());

    lo.release_held();
    lo.run();

    assert_eq!(ni_b.pt_state(pt), Some(PtState::Disabled));
    let tgt_events = drain(&eq_b);
    assert_eq!(
        kinds(&tgt_events),
        [EventKind::Put, EventKind::PtDisabled]
    );
    assert_eq!(&elem[..16], &[0x99; 16]);

    // later arrivals bounce off the disabled entry
    ni_a.put(&md, 0, 16, AckReq::Ack, matching).unwrap();
    lo.run();
    assert!(drain(&eq_b).is_empty());

    let acks: Vec<_> = drain(&eq_a)
        .into_iter()
        .filter(|e| e.kind == EventKind::Ack)
        .map(|e| e.ni_fail)
        .collect();
    assert_eq!(
        acks,
        [NiFail::Ok, NiFail::PtDisabled, NiFail::PtDisabled]
    );
}
