//! Crash-restart behavior of the persisted safety state: a correct
//! finalizer never votes at or below a height it already voted at, even
//! after losing everything but the safety file.

use basalt_chain::messages::ProposalMessage;
use basalt_chain::qc_chain::{Outbound, QcChain, QcChainConfig};
use basalt_chain::safety::SafetyState;
use basalt_chain::testing::{test_finalizer_keys, test_policy};
use basalt_core::crypto::Digest;
use std::path::Path;

fn root_proposal(tag: &str, block_num: u64) -> ProposalMessage {
    ProposalMessage {
        proposal_id: ProposalMessage::compute_id(
            Digest::hash(tag.as_bytes()),
            Digest::hash(b"actions"),
            Digest::ZERO,
            block_num,
            0,
            None,
        ),
        block_num,
        phase_counter: 0,
        parent_id: Digest::ZERO,
        justify: None,
    }
}

fn finalizer_chain(safety_path: &Path) -> QcChain {
    let keys = test_finalizer_keys(1);
    let policy = test_policy(&keys, 1);
    QcChain::with_clock(
        QcChainConfig {
            replica: "restarting".into(),
            finalizer_keys: keys,
            ..Default::default()
        },
        policy,
        SafetyState::load(safety_path).unwrap(),
        Box::new(|| 0),
    )
}

fn emitted_votes(chain: &mut QcChain) -> usize {
    chain
        .take_outbound()
        .iter()
        .filter(|o| matches!(o, Outbound::Vote { .. }))
        .count()
}

#[test]
fn test_restart_refuses_to_vote_below_persisted_height() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("safety.json");

    // Vote at height 100, then crash before any QC arrives
    let mut chain = finalizer_chain(&path);
    chain.on_proposal(Some(1), root_proposal("block-100", 100)).unwrap();
    assert_eq!(emitted_votes(&mut chain), 1);
    drop(chain);

    // After restart, a replayed proposal at height 99 must be refused
    let mut chain = finalizer_chain(&path);
    chain.on_proposal(Some(1), root_proposal("block-99", 99)).unwrap();
    assert_eq!(emitted_votes(&mut chain), 0, "voted below persisted v_height");

    // Replaying the height-100 proposal is refused too: same height
    chain.on_proposal(Some(1), root_proposal("block-100", 100)).unwrap();
    assert_eq!(emitted_votes(&mut chain), 0, "double-voted at persisted v_height");

    // A strictly higher proposal is fine
    chain.on_proposal(Some(1), root_proposal("block-101", 101)).unwrap();
    assert_eq!(emitted_votes(&mut chain), 1);
}

#[test]
fn test_unpersisted_state_does_not_protect() {
    // Control: with a fresh (never-flushed) safety file the height-99
    // proposal IS votable, which is exactly why flushing before sending
    // matters.
    let dir = tempfile::tempdir().unwrap();
    let mut chain = finalizer_chain(&dir.path().join("never-written.json"));
    chain.on_proposal(Some(1), root_proposal("block-99", 99)).unwrap();
    assert_eq!(emitted_votes(&mut chain), 1);
}

#[test]
fn test_safety_file_survives_across_many_votes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("safety.json");

    let mut chain = finalizer_chain(&path);
    for num in [10u64, 20, 30] {
        chain.on_proposal(Some(1), root_proposal(&format!("b{}", num), num)).unwrap();
    }
    drop(chain);

    let mut chain = finalizer_chain(&path);
    // Everything at or below the highest persisted vote is refused
    for num in [5u64, 10, 29, 30] {
        chain.on_proposal(Some(1), root_proposal(&format!("replay-{}", num), num)).unwrap();
        assert_eq!(emitted_votes(&mut chain), 0, "voted at replayed height {}", num);
    }
}
