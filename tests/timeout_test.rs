mod common;

use common::{OutboundItem, cluster_with_config, exchange, leader_index};
use std::time::Duration;
use tripcoin::replica::ReplicaConfig;
use tripcoin::types::{ConsensusMessage, ConsensusMessageType};

fn fast_config() -> ReplicaConfig {
    ReplicaConfig {
        view_change_timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Scenario: the view-0 leader goes silent. The three followers reach a
/// VIEW-CHANGE quorum, the view-1 leader takes over with a NEW-VIEW, and the
/// crashed leader later rejoins by adopting its payload.
#[tokio::test]
async fn test_leader_failure_triggers_view_change() {
    let nodes = cluster_with_config(4, fast_config()).await;
    let old_leader = leader_index(&nodes, 0);
    let followers: Vec<usize> = (0..nodes.len()).filter(|i| *i != old_leader).collect();

    // Leader silence runs past the timeout; every follower opens a view
    // change toward view 1.
    tokio::time::sleep(Duration::from_millis(80)).await;
    for &i in &followers {
        nodes[i].replica.poll_view_change().await;
        assert!(nodes[i].replica.status().is_view_changing);
    }
    exchange(&nodes, &followers).await;

    // Secondary timer: quorum of 3 VIEW-CHANGEs is in, the transition
    // completes.
    tokio::time::sleep(Duration::from_millis(80)).await;
    for &i in &followers {
        nodes[i].replica.poll_view_change().await;
    }

    let new_leader = leader_index(&nodes, 1);
    assert!(followers.contains(&new_leader));
    let status = nodes[new_leader].replica.status();
    assert_eq!(status.view, 1);
    assert!(status.is_primary);
    assert!(!status.is_view_changing);

    // The new primary's NEW-VIEW brings everyone, including the crashed
    // leader, to view 1.
    let announcements = nodes[new_leader].take_outbox();
    let new_view: Vec<ConsensusMessage> = announcements
        .iter()
        .filter_map(|item| match item {
            OutboundItem::Message(m) if m.kind == ConsensusMessageType::NewView => Some(m.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(new_view.len(), 1);

    for i in 0..nodes.len() {
        if i == new_leader {
            continue;
        }
        nodes[i].replica.deliver(new_view[0].clone()).await;
        let status = nodes[i].replica.status();
        assert_eq!(status.view, 1, "node {i} did not adopt the new view");
        assert!(!status.is_view_changing);
    }

    // Consensus resumes under the new leader with all four peers.
    nodes[new_leader].replica.on_round_tick().await;
    let everyone: Vec<usize> = (0..nodes.len()).collect();
    exchange(&nodes, &everyone).await;
    for node in &nodes {
        assert_eq!(node.blocks.chain_height().await.unwrap(), Some(1));
    }
}

/// A lone suspicious follower cannot complete a view change; it escalates
/// to ever-higher targets instead.
#[tokio::test]
async fn test_view_change_without_quorum_escalates() {
    let nodes = cluster_with_config(4, fast_config()).await;
    let old_leader = leader_index(&nodes, 0);
    let lonely = (old_leader + 1) % nodes.len();

    tokio::time::sleep(Duration::from_millis(80)).await;
    nodes[lonely].replica.poll_view_change().await;
    let first: Vec<u64> = nodes[lonely]
        .take_outbox()
        .iter()
        .filter_map(|item| match item {
            OutboundItem::Message(m) if m.kind == ConsensusMessageType::ViewChange => m.new_view,
            _ => None,
        })
        .collect();
    assert_eq!(first, vec![1]);

    // Nobody joins; the secondary deadline passes and the target climbs.
    tokio::time::sleep(Duration::from_millis(80)).await;
    nodes[lonely].replica.poll_view_change().await;
    let second: Vec<u64> = nodes[lonely]
        .take_outbox()
        .iter()
        .filter_map(|item| match item {
            OutboundItem::Message(m) if m.kind == ConsensusMessageType::ViewChange => m.new_view,
            _ => None,
        })
        .collect();
    assert_eq!(second, vec![2]);
    assert_eq!(nodes[lonely].replica.status().view, 0);
}

/// A NEW-VIEW that cannot prove a quorum of VIEW-CHANGEs is ignored.
#[tokio::test]
async fn test_new_view_without_quorum_proof_is_rejected() {
    let nodes = cluster_with_config(4, fast_config()).await;
    let claimed_leader = leader_index(&nodes, 1);
    let target = (claimed_leader + 1) % nodes.len();

    // One genuine VIEW-CHANGE is not a quorum of three.
    let mut lone_proof = ConsensusMessage::new(
        ConsensusMessageType::ViewChange,
        0,
        String::new(),
        nodes[claimed_leader].address.clone(),
        0,
    );
    lone_proof.new_view = Some(1);
    lone_proof.last_prepared_seq_num = Some(0);
    lone_proof.view_change_proof = Some(vec![]);
    lone_proof.sign(&nodes[claimed_leader].key);

    let mut new_view = ConsensusMessage::new(
        ConsensusMessageType::NewView,
        0,
        String::new(),
        nodes[claimed_leader].address.clone(),
        1,
    );
    new_view.view_change_messages = Some(vec![lone_proof]);
    new_view.preprepare_messages = Some(vec![]);
    new_view.sign(&nodes[claimed_leader].key);

    nodes[target].replica.deliver(new_view).await;
    assert_eq!(nodes[target].replica.status().view, 0);
}

/// A NEW-VIEW from anyone but the claimed view's leader is ignored.
#[tokio::test]
async fn test_new_view_from_wrong_sender_is_rejected() {
    let nodes = cluster_with_config(4, fast_config()).await;
    let new_leader = leader_index(&nodes, 1);
    let impostor = (new_leader + 1) % nodes.len();
    let target = (new_leader + 2) % nodes.len();

    let mut new_view = ConsensusMessage::new(
        ConsensusMessageType::NewView,
        0,
        String::new(),
        nodes[impostor].address.clone(),
        1,
    );
    new_view.view_change_messages = Some(vec![]);
    new_view.preprepare_messages = Some(vec![]);
    new_view.sign(&nodes[impostor].key);

    nodes[target].replica.deliver(new_view).await;
    assert_eq!(nodes[target].replica.status().view, 0);
    assert_eq!(nodes[target].replica.status().drops.wrong_leader, 1);
}
