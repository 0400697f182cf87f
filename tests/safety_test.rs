mod common;

use common::{OutboundItem, cluster, exchange, leader_index};
use tripcoin::crypto::generate_keypair_from_id;
use tripcoin::types::{ConsensusMessage, ConsensusMessageType};

fn prepare_for(height: u64, hash: &str, validator: &str, view: u64) -> ConsensusMessage {
    ConsensusMessage::new(
        ConsensusMessageType::Prepare,
        height,
        hash.into(),
        validator.into(),
        view,
    )
}

/// Scenario: a PREPARE claiming one validator's identity but signed with a
/// different key is dropped silently and leaves the round table unchanged.
#[tokio::test]
async fn test_forged_signature_is_dropped() {
    let nodes = cluster(4).await;
    let target = &nodes[0];

    // Impersonate node 1 using an outsider's key.
    let (_, outsider_key) = generate_keypair_from_id(99);
    let mut forged = prepare_for(1, "abcd", &nodes[1].address, 0);
    forged.signature = tripcoin::crypto::sign(&outsider_key, &forged.signing_bytes()).to_hex();

    // Two honest prepares plus the forgery: were the forgery admitted, the
    // quorum of 3 would trip a COMMIT broadcast.
    for honest in [2usize, 3] {
        let mut m = prepare_for(1, "abcd", &nodes[honest].address, 0);
        m.sign(&nodes[honest].key);
        target.replica.deliver(m).await;
    }
    target.replica.deliver(forged).await;

    assert_eq!(target.replica.status().drops.invalid_signature, 1);
    let commits: Vec<OutboundItem> = target
        .take_outbox()
        .into_iter()
        .filter(|i| matches!(i, OutboundItem::Message(m) if m.kind == ConsensusMessageType::Commit))
        .collect();
    assert!(commits.is_empty(), "forged prepare must not count toward quorum");

    // The genuine third prepare completes the quorum.
    let mut genuine = prepare_for(1, "abcd", &nodes[1].address, 0);
    genuine.sign(&nodes[1].key);
    target.replica.deliver(genuine).await;
    let commits: Vec<OutboundItem> = target
        .take_outbox()
        .into_iter()
        .filter(|i| matches!(i, OutboundItem::Message(m) if m.kind == ConsensusMessageType::Commit))
        .collect();
    assert_eq!(commits.len(), 1);
}

/// Only the leader of the current view may originate PRE-PREPARE.
#[tokio::test]
async fn test_pre_prepare_from_non_leader_is_rejected() {
    let nodes = cluster(4).await;
    let leader = leader_index(&nodes, 0);
    let impostor = (leader + 1) % nodes.len();
    let target = (leader + 2) % nodes.len();

    let mut m = ConsensusMessage::new(
        ConsensusMessageType::PrePrepare,
        1,
        "abcd".into(),
        nodes[impostor].address.clone(),
        0,
    );
    m.sign(&nodes[impostor].key);
    nodes[target].replica.deliver(m).await;

    assert_eq!(nodes[target].replica.status().drops.wrong_leader, 1);
    assert!(nodes[target].take_outbox().is_empty());
}

/// A message from an address outside the registry snapshot is dropped.
#[tokio::test]
async fn test_unknown_validator_is_dropped() {
    let nodes = cluster(4).await;
    let (outsider_pk, outsider_key) = generate_keypair_from_id(42);

    let mut m = prepare_for(1, "abcd", &outsider_pk.address(), 0);
    m.sign(&outsider_key);
    nodes[0].replica.deliver(m).await;

    assert_eq!(nodes[0].replica.status().drops.unknown_validator, 1);
    assert!(nodes[0].take_outbox().is_empty());
}

/// With N=4 and quorum 3, one Byzantine peer voting a conflicting hash
/// cannot split finality at a height.
#[tokio::test]
async fn test_single_byzantine_peer_cannot_split_finality() {
    let nodes = cluster(4).await;
    let leader = leader_index(&nodes, 0);
    let byzantine = (leader + 1) % nodes.len();
    let honest: Vec<usize> = (0..nodes.len()).filter(|i| *i != byzantine).collect();

    // The Byzantine peer floods validly-signed votes for a hash nobody
    // proposed.
    for &i in &honest {
        let mut fake_prepare = prepare_for(1, "deadbeef", &nodes[byzantine].address, 0);
        fake_prepare.sign(&nodes[byzantine].key);
        nodes[i].replica.deliver(fake_prepare).await;

        let mut fake_commit = ConsensusMessage::new(
            ConsensusMessageType::Commit,
            1,
            "deadbeef".into(),
            nodes[byzantine].address.clone(),
            0,
        );
        fake_commit.sign(&nodes[byzantine].key);
        nodes[i].replica.deliver(fake_commit).await;
    }

    // Honest protocol proceeds without the Byzantine peer.
    nodes[leader].replica.on_round_tick().await;
    exchange(&nodes, &honest).await;

    let mut hashes = Vec::new();
    for &i in &honest {
        assert_eq!(nodes[i].blocks.chain_height().await.unwrap(), Some(1));
        let block = nodes[i].blocks.get_block_by_height(1).await.unwrap().unwrap();
        assert_ne!(block.hash, "deadbeef");
        hashes.push(block.hash.clone());
    }
    hashes.dedup();
    assert_eq!(hashes.len(), 1, "honest peers disagree on height 1");
}
