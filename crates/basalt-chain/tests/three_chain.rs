//! End-to-end consensus scenarios over the deterministic test network:
//! three-chain commits, fork pruning, leader rotation and out-of-order
//! delivery.

use basalt_chain::messages::ProposalMessage;
use basalt_chain::qc_chain::{QcChain, QcChainConfig};
use basalt_chain::safety::SafetyState;
use basalt_chain::testing::{
    proposal_msg, test_block, test_finalizer_keys, test_policy, test_replica, TestNetwork,
};
use basalt_core::crypto::Digest;
use proptest::prelude::*;

const REPLICAS: [&str; 4] = ["alpha", "bravo", "charlie", "delta"];

/// Four equal-weight finalizers, threshold 3.
fn four_replica_network() -> TestNetwork {
    let keys = test_finalizer_keys(4);
    let policy = test_policy(&keys, 3);
    let mut net = TestNetwork::new();
    for (name, key) in REPLICAS.iter().zip(keys) {
        net.add_replica(test_replica(name, key, policy.clone()));
    }
    net
}

/// Build blocks 1..=n with a fixed leader, propagating after each beat.
/// Returns the proposal ids in chain order.
fn build_chain(net: &mut TestNetwork, leader: &str, blocks: u64) -> Vec<Digest> {
    (1..=blocks)
        .map(|num| {
            let id = net.beat(leader, test_block(num)).unwrap();
            net.propagate().unwrap();
            id
        })
        .collect()
}

#[test]
fn test_three_chain_commit() -> anyhow::Result<()> {
    let mut net = four_replica_network();

    // A <- B <- C <- D, each carrying a QC for its parent
    let mut ids = Vec::new();
    for num in 1..=4u64 {
        ids.push(net.beat("alpha", test_block(num))?);
        net.propagate()?;
    }
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    for name in REPLICAS {
        let chain = net.chain(name);
        // QC(D) closes the three-chain B <- C <- D over A
        assert_eq!(chain.b_exec(), a, "{} should have finalized A", name);
        // and the two-chain locks B
        assert_eq!(chain.b_lock(), b, "{} should be locked on B", name);
        assert!(chain.fork_store().contains(&c));
    }
    assert!(net.warnings.is_empty());
    Ok(())
}

#[test]
fn test_no_commit_before_three_links() {
    let mut net = four_replica_network();

    let ids = build_chain(&mut net, "alpha", 3);
    for name in REPLICAS {
        let chain = net.chain(name);
        // QC(C) gives only two links over A: locked, not final
        assert_eq!(chain.b_exec(), Digest::ZERO, "{} finalized too early", name);
        assert_eq!(chain.b_lock(), ids[0]);
    }
}

#[test]
fn test_fork_pruning_after_commit() -> anyhow::Result<()> {
    let mut net = four_replica_network();

    // Main line: A <- B1, everyone votes B1 first
    let a = net.beat("alpha", test_block(1))?;
    net.propagate()?;
    let b1 = net.beat("alpha", test_block(2))?;
    net.propagate()?;

    // A competing B2 at the same height, justified by the same QC(A)
    let qc_a = net
        .chain("alpha")
        .fork_store()
        .qc_of(&a)
        .cloned()
        .expect("QC(A) formed while block 1 propagated");
    let b2 = ProposalMessage {
        proposal_id: ProposalMessage::compute_id(
            Digest::hash(b"rival block"),
            Digest::hash(b"rival actions"),
            a,
            2,
            0,
            Some(a),
        ),
        block_num: 2,
        phase_counter: 0,
        parent_id: a,
        justify: Some(qc_a),
    };
    let b2_id = b2.proposal_id;
    net.deliver_to("alpha", proposal_msg(b2))?;
    assert!(net.chain("alpha").fork_store().contains(&b2_id));
    // alpha already voted at that height: storing B2 is fine, voting is not
    assert_eq!(net.pending_messages(), 0);

    // Extend the main line until B1 finalizes
    let _c1 = net.beat("alpha", test_block(3))?;
    net.propagate()?;
    let _d1 = net.beat("alpha", test_block(4))?;
    net.propagate()?;
    assert_eq!(net.chain("alpha").b_exec(), a);
    // B2 survives the commit of A: it still descends from the commit target
    assert!(net.chain("alpha").fork_store().contains(&b2_id));

    let _e1 = net.beat("alpha", test_block(5))?;
    net.propagate()?;

    // The commit of B1 kills the rival branch
    let alpha = net.chain("alpha");
    assert_eq!(alpha.b_exec(), b1);
    assert!(!alpha.fork_store().contains(&b2_id), "B2 must be evicted");
    assert!(alpha.fork_store().contains(&b1));
    Ok(())
}

#[test]
fn test_rotating_leaders_advance_finality() {
    let mut net = four_replica_network();

    let mut ids = Vec::new();
    for num in 1..=8u64 {
        let leader = REPLICAS[(num as usize - 1) % REPLICAS.len()];
        ids.push(net.beat(leader, test_block(num)).unwrap());
        net.propagate().unwrap();
    }

    for name in REPLICAS {
        let chain = net.chain(name);
        // QC(block 8) finalizes block 5
        assert_eq!(chain.b_exec(), ids[4], "{} lags finality", name);
        // Finalized prefixes agree: b_exec of every replica lies on the
        // one chain that was built
        assert!(ids.contains(&chain.b_exec()));
    }
    assert!(net.warnings.is_empty());
}

#[test]
fn test_conflicting_proposal_gets_no_votes() {
    let mut net = four_replica_network();
    let a = net.beat("alpha", test_block(1)).unwrap();
    net.propagate().unwrap();
    let _b1 = net.beat("alpha", test_block(2)).unwrap();
    net.propagate().unwrap();

    let qc_a = net.chain("bravo").fork_store().qc_of(&a).cloned().unwrap();
    let rival = ProposalMessage {
        proposal_id: ProposalMessage::compute_id(
            Digest::hash(b"equivocation"),
            Digest::hash(b"equivocation actions"),
            a,
            2,
            0,
            Some(a),
        ),
        block_num: 2,
        phase_counter: 0,
        parent_id: a,
        justify: Some(qc_a),
    };

    // Every replica already voted at height 2: none may vote again
    for name in REPLICAS {
        net.deliver_to(name, proposal_msg(rival.clone())).unwrap();
    }
    assert_eq!(net.pending_messages(), 0, "an equivocating proposal earned votes");
}

/// Build a five-proposal chain on a single-replica network (threshold 1, so
/// certificates form from the leader's own vote) and return the proposals.
fn solo_chain(blocks: u64) -> Vec<ProposalMessage> {
    let keys = test_finalizer_keys(1);
    let policy = test_policy(&keys, 1);
    let mut net = TestNetwork::new();
    net.add_replica(test_replica("solo", keys.into_iter().next().unwrap(), policy));

    let ids: Vec<Digest> = (1..=blocks)
        .map(|num| net.beat("solo", test_block(num)).unwrap())
        .collect();
    let chain = net.chain("solo");
    ids.iter()
        .map(|id| (**chain.fork_store().get(id).unwrap()).clone())
        .collect()
}

/// A pure observer under the solo policy: validates certificates but holds
/// no finalizer key.
fn observer() -> QcChain {
    let keys = test_finalizer_keys(1);
    let policy = test_policy(&keys, 1);
    QcChain::with_clock(
        QcChainConfig { replica: "observer".into(), finalizer_keys: vec![], ..Default::default() },
        policy,
        SafetyState::in_memory(),
        Box::new(|| 0),
    )
}

#[test]
fn test_out_of_order_delivery_reaches_the_same_commit() {
    let proposals = solo_chain(5);
    let a = proposals[0].proposal_id;

    // Worst case: fully reversed
    let mut chain = observer();
    for p in proposals.iter().rev() {
        chain.on_proposal(Some(7), p.clone()).unwrap();
    }
    assert_eq!(chain.b_exec(), a);
    assert_eq!(chain.fork_store().len(), 5);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // Any delivery order of the same proposals converges on the same
    // finalized block: late-arriving antecedents are buffered and replayed,
    // and the commit rule is re-evaluated on every QC arrival.
    #[test]
    fn prop_delivery_order_does_not_change_finality(
        order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let proposals = solo_chain(5);
        let a = proposals[0].proposal_id;

        let mut chain = observer();
        for &i in &order {
            chain.on_proposal(Some(7), proposals[i].clone()).unwrap();
        }
        prop_assert_eq!(chain.b_exec(), a);
        prop_assert_eq!(chain.b_lock(), proposals[1].proposal_id);
        prop_assert_eq!(chain.fork_store().len(), 5);
    }
}
