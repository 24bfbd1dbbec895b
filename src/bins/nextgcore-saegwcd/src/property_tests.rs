//! Property-Based Tests for Session Coordination
//!
//! Sequence arithmetic, retransmission detection, identifier routing,
//! handle stability, bearer id allocation and CSID group lookups, checked
//! with proptest.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::net::IpAddr;

    use crate::arena::Arena;
    use crate::config::SaegwcConfig;
    use crate::context::{derive_seid, partition_of_seid, partition_of_teid, NodeShared, SessionGraph};
    use crate::csid::CsidRegistry;
    use crate::error::SaegwcError;
    use crate::gateway::{route, Route};
    use crate::message::{Envelope, GtpBody, GtpMessage, ModifyBearerRequest};
    use crate::types::{Ebi, GtpInterface, Imsi};
    use crate::xact::{RetransmitState, Seq24, SeqVerdict};

    // ========================================================================
    // Strategies
    // ========================================================================

    fn arb_seq() -> impl Strategy<Value = Seq24> {
        any::<u32>().prop_map(Seq24::new)
    }

    fn arb_ebi() -> impl Strategy<Value = Ebi> {
        (Ebi::MIN..=Ebi::MAX).prop_map(|v| Ebi::new(v).unwrap())
    }

    fn peer() -> IpAddr {
        "10.0.0.9".parse().unwrap()
    }

    // ========================================================================
    // Sequence Numbers
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_seq_stays_in_24_bits(raw in any::<u32>()) {
            prop_assert!(Seq24::new(raw).value() <= Seq24::MAX);
        }

        #[test]
        fn prop_successor_is_newer(seq in arb_seq()) {
            let next = seq.next();
            prop_assert!(next.is_newer_than(seq));
            prop_assert!(!seq.is_newer_than(next));
            prop_assert!(!seq.is_newer_than(seq));
            prop_assert_eq!(next.distance_from(seq), 1);
        }

        #[test]
        fn prop_retransmission_verdicts(seq in arb_seq(), back in 1u32..(1 << 23)) {
            let mut state = RetransmitState::new();
            prop_assert_eq!(state.check(seq), SeqVerdict::New);
            state.accept(seq);
            prop_assert_eq!(state.check(seq), SeqVerdict::Duplicate);
            prop_assert_eq!(state.check(seq.next()), SeqVerdict::New);
            let older = Seq24::new(seq.value().wrapping_sub(back));
            prop_assert_eq!(state.check(older), SeqVerdict::Stale);
        }
    }

    // ========================================================================
    // Identifier Routing
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_seid_keeps_owner_partition(teid in any::<u32>(), ebi in arb_ebi()) {
            let seid = derive_seid(teid, ebi);
            prop_assert_eq!(partition_of_seid(seid), partition_of_teid(teid));
            prop_assert_eq!((seid & 0xffff_ffff) as u8, ebi.value());
            prop_assert_eq!((seid >> 32) as u32, teid);
        }

        #[test]
        fn prop_session_message_routed_by_teid(teid in 1u32.., seq in arb_seq()) {
            let shared = NodeShared::new(SaegwcConfig::default(), 1, 1);
            let partitions = shared.partitions();
            let envelope = Envelope::Gtp {
                peer: peer(),
                iface: GtpInterface::S11,
                msg: GtpMessage::new(
                    teid,
                    seq,
                    GtpBody::ModifyBearerRequest(ModifyBearerRequest::default()),
                ),
            };
            prop_assert_eq!(
                route(&shared, &envelope),
                Route::Partition(partition_of_teid(teid) % partitions)
            );
        }
    }

    // ========================================================================
    // Handles
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_removed_handles_stay_dead(
            values in prop::collection::vec(any::<u32>(), 1..64),
            remove_mask in prop::collection::vec(any::<bool>(), 64),
        ) {
            let mut arena = Arena::new();
            let handles: Vec<_> = values.iter().map(|v| arena.insert(*v)).collect();
            let mut live = values.len();
            for (i, handle) in handles.iter().enumerate() {
                if remove_mask[i] {
                    prop_assert_eq!(arena.remove(*handle), Some(values[i]));
                    live -= 1;
                }
            }
            prop_assert_eq!(arena.len(), live);

            // Reused slots must not revive old handles
            for _ in 0..values.len() {
                arena.insert(u32::MAX);
            }
            for (i, handle) in handles.iter().enumerate() {
                if remove_mask[i] {
                    prop_assert!(arena.get(*handle).is_none());
                } else {
                    prop_assert_eq!(arena.get(*handle), Some(&values[i]));
                }
            }
        }
    }

    // ========================================================================
    // Bearer Ids
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_dedicated_bearer_ids_avoid_default(default in arb_ebi(), wanted in 0usize..=14) {
            let mut graph = SessionGraph::new(4);
            let ue = graph.create_ue(Imsi::new("001010000000001").unwrap());
            let pdn = graph.create_pdn(ue, "internet", default, 0x100).unwrap();
            graph.create_bearer(pdn, Some(default.value())).unwrap();

            // ids 2..=15 minus the default one
            let available = if default.value() < Ebi::MIN_DEDICATED { 14 } else { 13 };
            let requested = wanted.min(available);
            let mut ids = HashSet::new();
            for _ in 0..requested {
                let bearer = graph.create_bearer(pdn, None).unwrap();
                let ebi = graph.bearer(bearer).unwrap().ebi;
                prop_assert!((Ebi::MIN_DEDICATED..=Ebi::MAX).contains(&ebi.value()));
                prop_assert_ne!(ebi, default);
                prop_assert!(ids.insert(ebi));
            }
            if requested == available {
                prop_assert_eq!(graph.create_bearer(pdn, None), Err(SaegwcError::BearerIdExhausted));
            }
        }
    }

    // ========================================================================
    // CSID Groups
    // ========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_csid_sessions_yielded_once(
            bindings in prop::collection::vec((0u16..8, 0u64..32), 1..64),
        ) {
            let mut registry = CsidRegistry::new(0);
            for (csid, seid) in &bindings {
                registry.bind(peer(), *csid, *seid);
            }
            let expected: HashSet<u64> = bindings.iter().map(|(_, seid)| *seid).collect();

            let all: Vec<u64> = registry.sessions_for(peer()).collect();
            let unique: HashSet<u64> = all.iter().copied().collect();
            prop_assert_eq!(all.len(), unique.len());
            prop_assert_eq!(&unique, &expected);

            let csids: Vec<u16> = (0..8).collect();
            let listed: HashSet<u64> = registry.sessions_for_csids(peer(), &csids).collect();
            prop_assert_eq!(&listed, &expected);
        }

        #[test]
        fn prop_unbound_sessions_disappear(
            bindings in prop::collection::vec((0u16..4, 0u64..16), 1..32),
            drop_seid in 0u64..16,
        ) {
            let mut registry = CsidRegistry::new(1);
            for (csid, seid) in &bindings {
                registry.bind(peer(), *csid, *seid);
            }
            registry.unbind(drop_seid);
            prop_assert!(registry.sessions_for(peer()).all(|seid| seid != drop_seid));
            for (csid, seid) in &bindings {
                if *seid != drop_seid {
                    prop_assert!(registry.is_bound(peer(), *csid, *seid));
                }
            }
        }
    }
}
