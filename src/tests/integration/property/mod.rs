//! Property-based tests for session flows
//!
//! Routing of new subscribers, identifier ownership and complete cleanup
//! after detach, over generated IMSIs and partition counts.

use proptest::prelude::*;

use nextgcore_saegwcd::context::partition_of_teid;
use nextgcore_saegwcd::event::SessState;

use crate::common::{delete_session_request, imsi, TestContext};

// ============================================================================
// Strategies for generating test data
// ============================================================================

/// Subscriber numbers for the test PLMN
fn arb_subscriber() -> impl Strategy<Value = u64> {
    1u64..9_999_999_999
}

fn arb_partitions() -> impl Strategy<Value = usize> {
    1usize..8
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A new subscriber is served by the partition its IMSI hashes to, and
    /// the S11 TEID it gets routes back to that partition
    #[test]
    fn prop_attach_lands_on_imsi_partition(n in arb_subscriber(), partitions in arb_partitions()) {
        let mut ctx = TestContext::new(partitions, false);
        let ue = imsi(n);
        let teid = ctx.attach(ue.clone(), 0x100);

        let pdns = ctx.pdns();
        prop_assert_eq!(pdns.len(), 1);
        let expected = (ue.as_u64() % partitions as u64) as usize;
        prop_assert_eq!(pdns[0].partition, expected);
        prop_assert_eq!(pdns[0].state, SessState::Connected);
        prop_assert_eq!(partition_of_teid(teid) % partitions, expected);
    }

    /// Detaching every attached UE leaves no session state behind
    #[test]
    fn prop_detach_leaves_nothing(
        subscribers in prop::collection::hash_set(arb_subscriber(), 1..6),
        partitions in arb_partitions(),
    ) {
        let mut ctx = TestContext::new(partitions, false);
        let mut teids = Vec::new();
        for (i, n) in subscribers.iter().enumerate() {
            let mme_teid = 0x1000 + i as u32;
            teids.push((ctx.attach(imsi(*n), mme_teid), mme_teid));
        }
        prop_assert_eq!(ctx.pdn_count(), subscribers.len());
        prop_assert_eq!(ctx.peers.up_session_count(), subscribers.len());

        for (teid, _) in &teids {
            let seq = ctx.next_seq();
            ctx.send(delete_session_request(*teid, seq));
        }
        prop_assert_eq!(ctx.pdn_count(), 0);
        prop_assert_eq!(ctx.ue_count(), 0);
        prop_assert_eq!(ctx.pending_records(), 0);
        prop_assert_eq!(ctx.peers.up_session_count(), 0);
        prop_assert_eq!(ctx.gw.shared().identities.teid_count(), 0);
        prop_assert_eq!(ctx.gw.shared().identities.seid_count(), 0);
    }
}
