#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tripcoin::block_store::BlockStore;
use tripcoin::crypto::{PrivateKey, PublicKey, generate_keypair_from_id};
use tripcoin::ledger::Ledger;
use tripcoin::mempool::{Mempool, MempoolConfig};
use tripcoin::registry::Registry;
use tripcoin::replica::{Outbound, Replica, ReplicaConfig};
use tripcoin::store::{KvStore, MemoryStore};
use tripcoin::stream::{CONSENSUS_GROUP, CONSENSUS_STREAM, MessageStream, QueueHandler};
use tripcoin::types::{Block, ConsensusMessage, Transaction, ValidatorInfo};

/// Everything a replica broadcast, captured instead of gossiped.
#[derive(Clone, Debug)]
pub enum OutboundItem {
    Message(ConsensusMessage),
    Block(Block),
}

struct CapturingOutbound {
    items: Arc<Mutex<Vec<OutboundItem>>>,
}

#[async_trait]
impl Outbound for CapturingOutbound {
    async fn broadcast(&self, message: ConsensusMessage) {
        self.items.lock().unwrap().push(OutboundItem::Message(message));
    }

    async fn broadcast_block(&self, block: Block) {
        self.items.lock().unwrap().push(OutboundItem::Block(block));
    }
}

/// One in-process validator over its own MemoryStore.
pub struct TestNode {
    pub address: String,
    pub public_key: PublicKey,
    pub key: PrivateKey,
    pub kv: Arc<dyn KvStore>,
    pub blocks: Arc<BlockStore>,
    pub ledger: Arc<Ledger>,
    pub registry: Arc<Registry>,
    pub mempool: Arc<Mempool>,
    pub stream: Arc<MessageStream>,
    pub replica: Arc<Replica>,
    outbox: Arc<Mutex<Vec<OutboundItem>>>,
}

impl TestNode {
    pub fn take_outbox(&self) -> Vec<OutboundItem> {
        std::mem::take(&mut self.outbox.lock().unwrap())
    }

    /// Rebuild the replica over the same storage, as after a process restart.
    pub async fn restart(&mut self, cfg: ReplicaConfig) {
        let outbox = Arc::new(Mutex::new(Vec::new()));
        let outbound = Arc::new(CapturingOutbound {
            items: outbox.clone(),
        });
        let replica = Arc::new(Replica::new(
            self.key.clone(),
            cfg,
            self.registry.clone(),
            self.mempool.clone(),
            self.blocks.clone(),
            self.ledger.clone(),
            self.stream.clone(),
            outbound,
        ));
        replica.bootstrap().await.unwrap();
        self.replica = replica;
        self.outbox = outbox;
    }

    /// Apply this node's own enqueued messages, acking each; returns how
    /// many were processed.
    pub async fn drain_queue(&self) -> usize {
        let mut processed = 0;
        loop {
            let batch = self
                .kv
                .stream_read_group(CONSENSUS_STREAM, CONSENSUS_GROUP, "test", 50, 0)
                .await
                .unwrap();
            if batch.is_empty() {
                return processed;
            }
            for entry in batch {
                let raw = entry
                    .fields
                    .iter()
                    .find(|(k, _)| k == "message")
                    .map(|(_, v)| v.clone())
                    .unwrap();
                let message: ConsensusMessage = serde_json::from_str(&raw).unwrap();
                self.replica.process_queued(message).await.unwrap();
                self.kv
                    .stream_ack(CONSENSUS_STREAM, CONSENSUS_GROUP, &entry.id)
                    .await
                    .unwrap();
                processed += 1;
            }
        }
    }
}

pub async fn cluster(n: u64) -> Vec<TestNode> {
    cluster_with_config(n, ReplicaConfig::default()).await
}

/// Build `n` validators sharing one registered set, each with isolated
/// storage and a capturing outbound.
pub async fn cluster_with_config(n: u64, cfg: ReplicaConfig) -> Vec<TestNode> {
    let keys: Vec<(PublicKey, PrivateKey)> =
        (0..n).map(generate_keypair_from_id).collect();
    let infos: Vec<ValidatorInfo> = keys
        .iter()
        .map(|(pk, _)| ValidatorInfo::from_public_key(pk, 100))
        .collect();

    let mut nodes = Vec::with_capacity(n as usize);
    for (pk, sk) in &keys {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let blocks = Arc::new(BlockStore::new(kv.clone()));
        blocks.ensure_genesis().await.unwrap();

        let ledger = Arc::new(Ledger::new(kv.clone(), 50, 21_000_000));
        let registry = Arc::new(Registry::new(kv.clone(), blocks.clone(), pk.address()));
        for info in &infos {
            registry.register(info).await.unwrap();
        }

        let mempool = Arc::new(Mempool::new(MempoolConfig::default(), ledger.clone()));
        let stream = Arc::new(MessageStream::new(kv.clone()));
        stream.init().await.unwrap();

        let outbox = Arc::new(Mutex::new(Vec::new()));
        let outbound = Arc::new(CapturingOutbound {
            items: outbox.clone(),
        });

        let replica = Arc::new(Replica::new(
            sk.clone(),
            cfg,
            registry.clone(),
            mempool.clone(),
            blocks.clone(),
            ledger.clone(),
            stream.clone(),
            outbound,
        ));
        replica.bootstrap().await.unwrap();

        nodes.push(TestNode {
            address: pk.address(),
            public_key: pk.clone(),
            key: sk.clone(),
            kv,
            blocks,
            ledger,
            registry,
            mempool,
            stream,
            replica,
            outbox,
        });
    }
    nodes
}

/// Index of the leader of `view` within the node list.
pub fn leader_index(nodes: &[TestNode], view: u64) -> usize {
    let leader = nodes[0].registry.leader_of(view).unwrap();
    nodes.iter().position(|n| n.address == leader).unwrap()
}

/// Run message exchange among `participants` to quiescence: every broadcast
/// is delivered to every other participant, and each node applies its own
/// queued messages.
pub async fn exchange(nodes: &[TestNode], participants: &[usize]) {
    loop {
        let mut any = false;
        for &i in participants {
            for item in nodes[i].take_outbox() {
                any = true;
                for &j in participants {
                    if j == i {
                        continue;
                    }
                    match &item {
                        OutboundItem::Message(m) => nodes[j].replica.deliver(m.clone()).await,
                        OutboundItem::Block(b) => {
                            nodes[j].replica.deliver_block_proposal(b.clone()).await
                        }
                    }
                }
            }
            if nodes[i].drain_queue().await > 0 {
                any = true;
            }
        }
        if !any {
            break;
        }
    }
}

pub async fn exchange_all(nodes: &[TestNode]) {
    let participants: Vec<usize> = (0..nodes.len()).collect();
    exchange(nodes, &participants).await;
}

pub fn transfer(hash: &str, from: &str, to: &str, amount: u64) -> Transaction {
    Transaction {
        hash: hash.into(),
        from: from.into(),
        to: to.into(),
        amount,
        gas_limit: 2,
        size: 1,
        fee: 0,
    }
}
