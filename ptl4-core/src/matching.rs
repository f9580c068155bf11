//! Matching and permission rules.

use std::collections::VecDeque;
use std::sync::Arc;

use ptl4_wire::{NiFail, Operation, ReqHdr};

use crate::buf::MsgBuf;
use crate::le::{Le, LeOptions};
use crate::ni::Ni;
use crate::pt::PtInner;
use crate::{NID_ANY, PID_ANY, RANK_ANY, UID_ANY};

/// Whether a request matches an element: identity filter, then the
/// no-truncate bound, then the ignored-bits comparison.
pub(crate) fn check_match(ni: &Ni, req: &ReqHdr, me: &Le) -> bool {
    if ni.is_logical() {
        if !(me.match_id.nid == RANK_ANY || me.match_id.nid == req.src_nid) {
            return false;
        }
    } else {
        if !(me.match_id.nid == NID_ANY || me.match_id.nid == req.src_nid) {
            return false;
        }
        if !(me.match_id.pid == PID_ANY || me.match_id.pid == req.src_pid) {
            return false;
        }
    }

    if me.options.contains(LeOptions::NO_TRUNCATE) {
        let offset = if me.options.contains(LeOptions::MANAGE_LOCAL) {
            me.manage_offset()
        } else {
            req.offset
        };
        if offset + req.length > me.region.len() {
            return false;
        }
    }

    (req.match_bits | me.ignore_bits) == (me.match_bits | me.ignore_bits)
}

/// Whether a matched element permits the operation: the uid filter first,
/// then the operation against the element's allowed directions.
pub(crate) fn check_perm(req: &ReqHdr, le: &Le) -> Result<(), NiFail> {
    if !(le.uid == UID_ANY || le.uid == req.uid) {
        return Err(NiFail::PermViolation);
    }

    let allowed = match req.operation {
        Operation::Put | Operation::Atomic => le.options.contains(LeOptions::OP_PUT),
        Operation::Get => le.options.contains(LeOptions::OP_GET),
        Operation::Fetch | Operation::Swap => le
            .options
            .contains(LeOptions::OP_PUT | LeOptions::OP_GET),
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(NiFail::OpViolation)
    }
}

/// Collect the buffered requests on the unexpected list that `le` matches,
/// removing them from the list. A use-once element claims at most one.
/// The table entry lock must be held.
pub(crate) fn match_unexpected(
    ni: &Ni,
    pt: &mut PtInner,
    le: &Arc<Le>,
) -> Vec<Arc<MsgBuf>> {
    let mut out = Vec::new();
    let mut keep = VecDeque::new();

    while let Some(buf) = pt.unexpected.pop_front() {
        let done = le.options.contains(LeOptions::USE_ONCE) && !out.is_empty();
        let hit = !done
            && (!ni.is_matching() || check_match(ni, buf.req(), le))
            && check_perm(buf.req(), le).is_ok();
        if hit {
            out.push(buf);
        } else {
            keep.push_back(buf);
        }
    }
    pt.unexpected = keep;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptl4_wire::{AckReq, AtomOp, AtomType};

    use crate::mem::Region;
    use crate::{LeInit, ProcessId};

    fn req(src: ProcessId, match_bits: u64, uid: u32) -> ReqHdr {
        ReqHdr {
            operation: Operation::Put,
            ni_type: 0,
            data_in: false,
            data_out: true,
            handle: 0,
            ack_req: AckReq::Ack,
            atom_type: AtomType::Int8,
            atom_op: AtomOp::Min,
            dst_nid: 0,
            dst_pid: 0,
            src_nid: src.nid,
            src_pid: src.pid,
            match_bits,
            hdr_data: 0,
            operand: 0,
            pt_index: 0,
            uid,
            length: 8,
            offset: 0,
        }
    }

    fn element(len: usize, init: impl FnOnce(LeInit) -> LeInit) -> Le {
        let region = unsafe { Region::contiguous(std::ptr::null_mut(), len) };
        let args = init(LeInit::new(region, LeOptions::OP_PUT));
        Le {
            region: args.region,
            options: args.options,
            match_bits: args.match_bits,
            ignore_bits: args.ignore_bits,
            match_id: args.match_id,
            uid: args.uid,
            min_free: args.min_free,
            user_ptr: args.user_ptr,
            ct: None,
            pt_index: 0,
            list: ptl4_wire::PtlList::Priority,
            offset: std::sync::atomic::AtomicU64::new(0),
            linked: std::sync::atomic::AtomicBool::new(true),
        }
    }

    fn physical_ni() -> Arc<Ni> {
        struct NoConnect;
        impl crate::Connector for NoConnect {
            fn assign_transport(&self, _: ProcessId) -> Arc<dyn crate::Transport> {
                unimplemented!("matching tests never touch a transport")
            }
            fn init_connect(
                &self,
                _: &Arc<Ni>,
                _: &Arc<crate::Conn>,
            ) -> std::io::Result<()> {
                unimplemented!("matching tests never connect")
            }
        }
        Ni::builder(ProcessId::new(1, 1)).build(Box::new(NoConnect))
    }

    #[test]
    fn ignore_bits_mask_comparison() {
        let ni = physical_ni();
        let me = element(64, |i| i.match_bits(0xab00, 0x00ff));
        assert!(check_match(&ni, &req(ProcessId::new(2, 2), 0xab12, 0), &me));
        assert!(!check_match(&ni, &req(ProcessId::new(2, 2), 0xac12, 0), &me));
    }

    #[test]
    fn identity_filter_physical() {
        let ni = physical_ni();
        let me = element(64, |i| i.match_id(ProcessId::new(7, 9)));
        assert!(check_match(&ni, &req(ProcessId::new(7, 9), 0, 0), &me));
        assert!(!check_match(&ni, &req(ProcessId::new(7, 8), 0, 0), &me));
        assert!(!check_match(&ni, &req(ProcessId::new(6, 9), 0, 0), &me));

        let any = element(64, |i| i);
        assert!(check_match(&ni, &req(ProcessId::new(3, 4), 0, 0), &any));
    }

    #[test]
    fn no_truncate_rejects_oversize() {
        let ni = physical_ni();
        let me = element(4, |i| i);
        // request length 8 over a 4-byte element
        assert!(check_match(&ni, &req(ProcessId::new(2, 2), 0, 0), &me));
        let strict = element(4, |mut i| {
            i.options |= LeOptions::NO_TRUNCATE;
            i
        });
        assert!(!check_match(&ni, &req(ProcessId::new(2, 2), 0, 0), &strict));
    }

    #[test]
    fn ignore_bits_fuzz() {
        use rand::{Rng, SeedableRng};

        let ni = physical_ni();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for _ in 0..1000 {
            let posted: u64 = rng.gen();
            let ignore: u64 = rng.gen();
            let presented: u64 = rng.gen();
            let me = element(64, |i| i.match_bits(posted, ignore));
            let hit = check_match(&ni, &req(ProcessId::new(2, 2), presented, 0), &me);
            assert_eq!(hit, (posted & !ignore) == (presented & !ignore));
        }
    }

    #[test]
    fn perm_checks_uid_then_op() {
        let me = element(64, |i| i.uid(7));
        assert!(check_perm(&req(ProcessId::new(2, 2), 0, 7), &me).is_ok());
        assert_eq!(
            check_perm(&req(ProcessId::new(2, 2), 0, 8), &me),
            Err(NiFail::PermViolation)
        );

        let get_only = element(64, |mut i| {
            i.options = LeOptions::OP_GET;
            i
        });
        assert_eq!(
            check_perm(&req(ProcessId::new(2, 2), 0, 0), &get_only),
            Err(NiFail::OpViolation)
        );

        let mut fetch = req(ProcessId::new(2, 2), 0, 0);
        fetch.operation = Operation::Fetch;
        let both = element(64, |mut i| {
            i.options = LeOptions::OP_PUT | LeOptions::OP_GET;
            i
        });
        assert!(check_perm(&fetch, &both).is_ok());
        assert_eq!(check_perm(&fetch, &me), Err(NiFail::OpViolation));
    }
}
