use crate::authenticator::{BlockRejection, verify_block};
use crate::block_store::{BlockStore, BlockStoreError};
use crate::crypto::{PrivateKey, PublicKey};
use crate::ledger::{Ledger, LedgerError};
use crate::mempool::Mempool;
use crate::registry::Registry;
use crate::store::StoreError;
use crate::stream::{MessageStream, QueueHandler};
use crate::types::{
    Block, BlockBody, BlockType, ConsensusMessage, ConsensusMessageType, MAX_BLOCK_TX,
    ROUND_INTERVAL, VIEW_CHANGE_TIMEOUT, ValidatorStatus, View, forge_block,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("Block store error: {0}")]
    BlockStore(#[from] BlockStoreError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Store deadline exceeded")]
    StoreDeadline,
    #[error("Invariant breach: {0}")]
    InvariantBreach(String),
}

/// Side effects emitted by the state machine. Table mutation happens under
/// the lock; everything here runs after it is released.
#[derive(Debug, Clone)]
pub enum ConsensusAction {
    Broadcast(ConsensusMessage),
    BroadcastBlock(Block),
    Enqueue(ConsensusMessage),
    Finalize { height: u64, hash: String },
}

/// Outbound capability supplied at construction; the replica never imports
/// the gateway.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn broadcast(&self, message: ConsensusMessage);
    async fn broadcast_block(&self, block: Block);
}

/// Where a message entered: fresh from the network, or replayed off the
/// durable queue. Queue entries only update tables and cross quorums; they
/// never re-broadcast or re-enqueue.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Origin {
    Network,
    Queue,
}

/// Silent-drop accounting for protocol violations.
#[derive(Default)]
pub struct DropCounters {
    invalid_signature: AtomicU64,
    stale_view: AtomicU64,
    wrong_leader: AtomicU64,
    duplicate: AtomicU64,
    unknown_validator: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DropSnapshot {
    pub invalid_signature: u64,
    pub stale_view: u64,
    pub wrong_leader: u64,
    pub duplicate: u64,
    pub unknown_validator: u64,
    pub malformed: u64,
}

impl DropCounters {
    pub fn snapshot(&self) -> DropSnapshot {
        DropSnapshot {
            invalid_signature: self.invalid_signature.load(Ordering::Relaxed),
            stale_view: self.stale_view.load(Ordering::Relaxed),
            wrong_leader: self.wrong_leader.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            unknown_validator: self.unknown_validator.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub view: View,
    pub is_primary: bool,
    pub is_view_changing: bool,
    pub last_executed_block: u64,
    pub total_validators: usize,
    pub mempool_size: usize,
    pub drops: DropSnapshot,
}

#[derive(Clone, Copy, Debug)]
pub struct ReplicaConfig {
    pub view_change_timeout: Duration,
    pub max_block_tx: usize,
    pub store_deadline: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            view_change_timeout: VIEW_CHANGE_TIMEOUT,
            max_block_tx: MAX_BLOCK_TX,
            store_deadline: ROUND_INTERVAL,
        }
    }
}

/// Mutable consensus state. One coarse lock, held only across table
/// mutation and quorum checks.
struct Tables {
    current_view: View,
    is_primary: bool,
    is_view_changing: bool,
    last_executed: u64,
    processing: HashSet<String>,
    pre_prepare: HashMap<String, HashMap<String, ConsensusMessage>>,
    prepare: HashMap<String, HashMap<String, ConsensusMessage>>,
    commit: HashMap<String, HashMap<String, ConsensusMessage>>,
    view_change: HashMap<View, HashMap<String, ConsensusMessage>>,
    /// Keys we already broadcast COMMIT for, per view.
    commit_sent: HashSet<(String, View)>,
    view_change_target: Option<View>,
    view_change_deadline: Option<Instant>,
    last_leader_activity: Instant,
    /// Blocks waiting for a missing parent, keyed by the parent hash.
    parent_waiting: HashMap<String, Vec<Block>>,
    /// PRE-PREPAREs that arrived before their block proposal did.
    proposal_waiting: HashMap<String, ConsensusMessage>,
}

impl Tables {
    fn new() -> Self {
        Self {
            current_view: 0,
            is_primary: false,
            is_view_changing: false,
            last_executed: 0,
            processing: HashSet::new(),
            pre_prepare: HashMap::new(),
            prepare: HashMap::new(),
            commit: HashMap::new(),
            view_change: HashMap::new(),
            commit_sent: HashSet::new(),
            view_change_target: None,
            view_change_deadline: None,
            last_leader_activity: Instant::now(),
            parent_waiting: HashMap::new(),
            proposal_waiting: HashMap::new(),
        }
    }

    fn drop_round_tables(&mut self, key: &str) {
        self.processing.remove(key);
        self.pre_prepare.remove(key);
        self.prepare.remove(key);
        self.commit.remove(key);
        self.commit_sent.retain(|(k, _)| k != key);
    }
}

/// What the locked section decided; the async follow-up happens after the
/// lock is released.
enum Decision {
    None,
    Actions(Vec<ConsensusAction>),
    AuthenticateProposal { block_hash: String },
    AdoptNewView(ConsensusMessage),
}

/// The PBFT replica: three-phase happy path, view-change recovery, leader
/// proposal, and finalization.
pub struct Replica {
    local_address: String,
    public_key: PublicKey,
    key: PrivateKey,
    cfg: ReplicaConfig,
    registry: Arc<Registry>,
    mempool: Arc<Mempool>,
    blocks: Arc<BlockStore>,
    ledger: Arc<Ledger>,
    stream: Arc<MessageStream>,
    outbound: Arc<dyn Outbound>,
    tables: Mutex<Tables>,
    counters: DropCounters,
    finalized_tx: broadcast::Sender<Block>,
}

impl Replica {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: PrivateKey,
        cfg: ReplicaConfig,
        registry: Arc<Registry>,
        mempool: Arc<Mempool>,
        blocks: Arc<BlockStore>,
        ledger: Arc<Ledger>,
        stream: Arc<MessageStream>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        let public_key = key.public_key();
        let (finalized_tx, _) = broadcast::channel(64);
        Self {
            local_address: public_key.address(),
            public_key,
            key,
            cfg,
            registry,
            mempool,
            blocks,
            ledger,
            stream,
            outbound,
            tables: Mutex::new(Tables::new()),
            counters: DropCounters::default(),
            finalized_tx,
        }
    }

    /// Align replica state with the persisted chain and the current set.
    pub async fn bootstrap(&self) -> Result<(), ReplicaError> {
        let height = self.blocks.chain_height().await?.unwrap_or(0);
        let mut t = self.tables.lock().unwrap();
        t.last_executed = height;
        t.is_primary = self.registry.leader_of(t.current_view).as_deref()
            == Some(self.local_address.as_str());
        log::info!(
            "Replica bootstrapped at height {} (view {}, primary: {})",
            height,
            t.current_view,
            t.is_primary
        );
        Ok(())
    }

    pub fn subscribe_finalized(&self) -> broadcast::Receiver<Block> {
        self.finalized_tx.subscribe()
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn status(&self) -> NodeStatus {
        let t = self.tables.lock().unwrap();
        NodeStatus {
            view: t.current_view,
            is_primary: t.is_primary,
            is_view_changing: t.is_view_changing,
            last_executed_block: t.last_executed,
            total_validators: self.registry.total_validators(),
            mempool_size: self.mempool.len(),
            drops: self.counters.snapshot(),
        }
    }

    // -------------------------------------------------------------------------
    // Ingest
    // -------------------------------------------------------------------------

    /// Gateway entrypoint for consensus messages from peers.
    pub async fn deliver(&self, message: ConsensusMessage) {
        if let Err(e) = self.handle(message, Origin::Network).await {
            log::error!("Consensus handling failed: {e}");
        }
    }

    /// Gateway entrypoint for a proposed block body. Stored pending; if the
    /// matching PRE-PREPARE already arrived, handling resumes.
    pub async fn deliver_block_proposal(&self, block: Block) {
        if let Err(e) = self.blocks.save_pending_block(&block).await {
            log::warn!("Failed to store pending block {}: {e}", block.hash);
            return;
        }
        let waiting = {
            let mut t = self.tables.lock().unwrap();
            t.proposal_waiting.remove(&block.hash)
        };
        if let Some(message) = waiting {
            if let Err(e) = self.handle(message, Origin::Network).await {
                log::error!("Deferred PRE-PREPARE handling failed: {e}");
            }
        }
    }

    /// Shared admission + dispatch for both origins.
    async fn handle(&self, m: ConsensusMessage, origin: Origin) -> Result<(), ReplicaError> {
        if let Err(field) = m.check_shape() {
            log::debug!("Dropping malformed {:?} message (missing {field})", m.kind);
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let snapshot = match self.registry.snapshot(m.view) {
            Ok(s) => s,
            Err(e) => {
                log::debug!("Refusing snapshot for view {}: {e}", m.view);
                self.counters.stale_view.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        let Some(public_key) = snapshot.public_key_of(&m.validator).map(str::to_owned) else {
            self.counters.unknown_validator.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        if !m.verify(&public_key) {
            self.counters.invalid_signature.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.registry.touch(&m.validator);

        let decision = {
            let mut t = self.tables.lock().unwrap();

            let from_view_change = matches!(
                m.kind,
                ConsensusMessageType::ViewChange | ConsensusMessageType::NewView
            );
            if m.view < t.current_view && !from_view_change {
                self.counters.stale_view.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            // Leader liveness: only the current leader's traffic defers the
            // view-change timer.
            if snapshot.leader_of(t.current_view) == Some(m.validator.as_str()) {
                t.last_leader_activity = Instant::now();
            }

            match m.kind {
                ConsensusMessageType::PrePrepare => self.admit_pre_prepare(&mut t, m, origin, &snapshot),
                ConsensusMessageType::Prepare => self.admit_prepare(&mut t, m, &snapshot),
                ConsensusMessageType::Commit => self.admit_commit(&mut t, m, &snapshot),
                ConsensusMessageType::ViewChange => self.admit_view_change(&mut t, m),
                ConsensusMessageType::NewView => self.admit_new_view(&mut t, m, &snapshot),
            }
        };

        match decision {
            Decision::None => Ok(()),
            Decision::Actions(actions) => self.execute(actions).await,
            Decision::AuthenticateProposal { block_hash } => {
                self.authenticate_proposal(&block_hash).await
            }
            Decision::AdoptNewView(message) => self.replay_new_view(message, origin).await,
        }
    }

    // -------------------------------------------------------------------------
    // Admission (under the tables lock)
    // -------------------------------------------------------------------------

    fn admit_pre_prepare(
        &self,
        t: &mut Tables,
        m: ConsensusMessage,
        origin: Origin,
        snapshot: &crate::registry::ValidatorSet,
    ) -> Decision {
        if snapshot.leader_of(t.current_view) != Some(m.validator.as_str()) {
            self.counters.wrong_leader.fetch_add(1, Ordering::Relaxed);
            return Decision::None;
        }
        if m.block_height <= t.last_executed {
            // Proposal for a round that already finalized here.
            return Decision::None;
        }

        let key = m.round_key();
        let by_validator = t.pre_prepare.entry(key.clone()).or_default();
        if by_validator.contains_key(&m.validator) && origin == Origin::Queue {
            self.counters.duplicate.fetch_add(1, Ordering::Relaxed);
            return Decision::None;
        }
        let block_hash = m.block_hash.clone();
        let proposer = m.validator.clone();
        by_validator.entry(proposer.clone()).or_insert(m);

        // Queue replays only record; the network path authenticates and
        // answers with a PREPARE.
        if origin == Origin::Queue {
            return Decision::None;
        }

        // Our own proposal was prepared on the origination path.
        if proposer == self.local_address {
            return Decision::None;
        }

        if t.processing.contains(&key) {
            self.counters.duplicate.fetch_add(1, Ordering::Relaxed);
            return Decision::None;
        }
        t.processing.insert(key);
        Decision::AuthenticateProposal { block_hash }
    }

    fn admit_prepare(
        &self,
        t: &mut Tables,
        m: ConsensusMessage,
        snapshot: &crate::registry::ValidatorSet,
    ) -> Decision {
        let key = m.round_key();
        let height = m.block_height;
        let hash = m.block_hash.clone();

        if height <= t.last_executed {
            // Late replay of an already-finalized round.
            return Decision::None;
        }

        let by_validator = t.prepare.entry(key.clone()).or_default();
        if by_validator.contains_key(&m.validator) {
            self.counters.duplicate.fetch_add(1, Ordering::Relaxed);
            return Decision::None;
        }
        by_validator.insert(m.validator.clone(), m);

        let quorum = snapshot.quorum();
        let prepared = t.prepare.get(&key).map(|v| v.len()).unwrap_or(0);
        let view = t.current_view;
        if prepared >= quorum
            && snapshot.is_active(&self.local_address)
            && !t.commit_sent.contains(&(key.clone(), view))
        {
            t.commit_sent.insert((key, view));
            let commit = self.make_message(ConsensusMessageType::Commit, height, hash, view);
            return Decision::Actions(vec![
                ConsensusAction::Broadcast(commit.clone()),
                ConsensusAction::Enqueue(commit),
            ]);
        }
        Decision::None
    }

    fn admit_commit(
        &self,
        t: &mut Tables,
        m: ConsensusMessage,
        snapshot: &crate::registry::ValidatorSet,
    ) -> Decision {
        let key = m.round_key();
        let height = m.block_height;
        let hash = m.block_hash.clone();

        if height <= t.last_executed {
            // Late replay of an already-finalized round.
            return Decision::None;
        }

        let by_validator = t.commit.entry(key.clone()).or_default();
        if by_validator.contains_key(&m.validator) {
            self.counters.duplicate.fetch_add(1, Ordering::Relaxed);
            return Decision::None;
        }
        by_validator.insert(m.validator.clone(), m);

        let quorum = snapshot.quorum();
        let committed = t.commit.get(&key).map(|v| v.len()).unwrap_or(0);
        let prepared = t.prepare.get(&key).map(|v| v.len()).unwrap_or(0);
        // COMMIT quorum counts only once PREPARE quorum has been observed,
        // and heights finalize strictly in order.
        if committed >= quorum && prepared >= quorum && height == t.last_executed + 1 {
            return Decision::Actions(vec![ConsensusAction::Finalize { height, hash }]);
        }
        Decision::None
    }

    fn admit_view_change(&self, t: &mut Tables, m: ConsensusMessage) -> Decision {
        let target = m.new_view.unwrap_or(0);
        if target <= t.current_view {
            self.counters.stale_view.fetch_add(1, Ordering::Relaxed);
            return Decision::None;
        }

        let by_validator = t.view_change.entry(target).or_default();
        if by_validator.contains_key(&m.validator) {
            self.counters.duplicate.fetch_add(1, Ordering::Relaxed);
            return Decision::None;
        }
        by_validator.insert(m.validator.clone(), m.clone());

        // A peer is assembling a higher view than ours: join it.
        let assembling = t.view_change_target.unwrap_or(t.current_view);
        if target > assembling && m.validator != self.local_address {
            return Decision::Actions(self.start_view_change_locked(t, target));
        }
        Decision::None
    }

    fn admit_new_view(
        &self,
        t: &mut Tables,
        m: ConsensusMessage,
        snapshot: &crate::registry::ValidatorSet,
    ) -> Decision {
        if m.view < t.current_view {
            self.counters.stale_view.fetch_add(1, Ordering::Relaxed);
            return Decision::None;
        }
        if snapshot.leader_of(m.view) != Some(m.validator.as_str()) {
            self.counters.wrong_leader.fetch_add(1, Ordering::Relaxed);
            return Decision::None;
        }

        // The proof set must carry a quorum of distinct, validly signed
        // VIEW-CHANGEs targeting exactly this view.
        let proofs = m.view_change_messages.as_deref().unwrap_or_default();
        let mut vouched = HashSet::new();
        for proof in proofs {
            if proof.kind != ConsensusMessageType::ViewChange || proof.new_view != Some(m.view) {
                continue;
            }
            let Some(pk) = snapshot.public_key_of(&proof.validator) else {
                continue;
            };
            if proof.verify(pk) {
                vouched.insert(proof.validator.clone());
            }
        }
        if vouched.len() < snapshot.quorum() {
            log::warn!(
                "NEW-VIEW for view {} carries {} valid proofs, quorum is {}",
                m.view,
                vouched.len(),
                snapshot.quorum()
            );
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            return Decision::None;
        }

        log::info!("Adopting view {} from NEW-VIEW by {}", m.view, m.validator);
        t.current_view = m.view;
        t.is_primary = snapshot.leader_of(m.view) == Some(self.local_address.as_str());
        t.is_view_changing = false;
        t.view_change_target = None;
        t.view_change_deadline = None;
        t.last_leader_activity = Instant::now();
        t.view_change.retain(|target, _| *target > m.view);
        self.registry.observe_view(m.view);

        Decision::AdoptNewView(m)
    }

    // -------------------------------------------------------------------------
    // Async follow-ups (lock released)
    // -------------------------------------------------------------------------

    /// Fetch and authenticate the block a PRE-PREPARE refers to, then answer
    /// with our PREPARE.
    async fn authenticate_proposal(&self, block_hash: &str) -> Result<(), ReplicaError> {
        let Some(block) = self.blocks.get_block_by_hash(block_hash).await? else {
            // The proposal body has not reached us yet; the PRE-PREPARE
            // resumes when it does.
            let mut t = self.tables.lock().unwrap();
            let waiting: Vec<ConsensusMessage> = t
                .pre_prepare
                .values()
                .flat_map(|m| m.values())
                .filter(|m| m.block_hash == block_hash)
                .cloned()
                .collect();
            if let Some(message) = waiting.into_iter().next() {
                let key = message.round_key();
                t.processing.remove(&key);
                t.proposal_waiting.insert(block_hash.to_string(), message);
            }
            return Ok(());
        };

        self.authenticate_block(block).await
    }

    async fn authenticate_block(&self, block: Block) -> Result<(), ReplicaError> {
        let key = format!("{}:{}", block.index, block.hash);
        let view = {
            let t = self.tables.lock().unwrap();
            if block.index <= t.last_executed {
                return Ok(());
            }
            t.current_view
        };
        let snapshot = match self.registry.snapshot(view) {
            Ok(s) => s,
            Err(_) => return Ok(()),
        };

        let parent = if block.index == 0 {
            None
        } else {
            self.blocks.get_block_by_hash(&block.parent_hash).await?
        };

        match verify_block(&block, parent.as_ref(), &snapshot) {
            Ok(()) => {}
            Err(BlockRejection::UnknownParent) => {
                log::info!(
                    "Buffering block {} at height {}: parent {} unknown",
                    block.hash,
                    block.index,
                    block.parent_hash
                );
                let mut t = self.tables.lock().unwrap();
                t.parent_waiting
                    .entry(block.parent_hash.clone())
                    .or_default()
                    .push(block);
                return Ok(());
            }
            Err(rejection) => {
                log::warn!("Rejecting proposed block {}: {rejection}", block.hash);
                self.tables.lock().unwrap().drop_round_tables(&key);
                return Ok(());
            }
        }

        if !snapshot.is_active(&self.local_address) {
            return Ok(());
        }

        let prepare = self.make_message(
            ConsensusMessageType::Prepare,
            block.index,
            block.hash.clone(),
            view,
        );
        self.execute(vec![
            ConsensusAction::Broadcast(prepare.clone()),
            ConsensusAction::Enqueue(prepare),
        ])
        .await
    }

    /// Replay the PRE-PREPAREs carried in an adopted NEW-VIEW through the
    /// ordinary handler.
    async fn replay_new_view(
        &self,
        message: ConsensusMessage,
        origin: Origin,
    ) -> Result<(), ReplicaError> {
        let replays = message.preprepare_messages.unwrap_or_default();
        for replay in replays {
            if replay.kind != ConsensusMessageType::PrePrepare {
                continue;
            }
            Box::pin(self.handle(replay, origin)).await?;
        }
        Ok(())
    }

    async fn execute(&self, actions: Vec<ConsensusAction>) -> Result<(), ReplicaError> {
        for action in actions {
            match action {
                ConsensusAction::Broadcast(message) => {
                    self.outbound.broadcast(message).await;
                }
                ConsensusAction::BroadcastBlock(block) => {
                    self.outbound.broadcast_block(block).await;
                }
                ConsensusAction::Enqueue(message) => {
                    self.stream.enqueue(&message).await?;
                }
                ConsensusAction::Finalize { height, hash } => {
                    self.finalize(height, &hash).await?;
                    // Finalizing one height may unblock the next.
                    self.finalize_ready().await?;
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Finalization
    // -------------------------------------------------------------------------

    /// Irrevocably commit `(height, hash)`. A repeat call is a no-op; a
    /// store failure aborts without partial effects and is retried by a
    /// later round.
    pub async fn finalize(&self, height: u64, hash: &str) -> Result<(), ReplicaError> {
        let key = format!("{height}:{hash}");
        {
            let mut t = self.tables.lock().unwrap();
            if height <= t.last_executed {
                t.drop_round_tables(&key);
                return Ok(());
            }
        }

        let Some(block) = self.blocks.get_block_by_hash(hash).await? else {
            log::error!("Finalized block {hash} at height {height} not retrievable from store");
            return Err(ReplicaError::InvariantBreach(format!(
                "block {hash} missing at finalization"
            )));
        };

        let parent = self.blocks.get_block_by_height(height.saturating_sub(1)).await?;
        if block.index > 0 {
            match parent.as_ref() {
                Some(p) if p.hash == block.parent_hash => {}
                _ => {
                    log::error!(
                        "Refusing to finalize {hash}: parent linkage does not match local chain"
                    );
                    return Err(ReplicaError::InvariantBreach(format!(
                        "parent mismatch at height {height}"
                    )));
                }
            }
        }

        tokio::time::timeout(self.cfg.store_deadline, self.blocks.save_block(&block))
            .await
            .map_err(|_| ReplicaError::StoreDeadline)??;

        // Reward eligibility is sampled at the instant of finalization.
        let reward = {
            let t = self.tables.lock().unwrap();
            !t.is_view_changing
        };
        self.ledger.apply_block(&block, reward).await?;

        {
            let mut t = self.tables.lock().unwrap();
            t.last_executed = t.last_executed.max(height);
            t.drop_round_tables(&key);
        }

        self.mempool.remove(&block.tx_hashes());
        let _ = self.finalized_tx.send(block);
        log::info!("Finalized block {hash} at height {height}");
        Ok(())
    }

    /// Finalize any queued rounds whose quorums are already complete, in
    /// height order.
    async fn finalize_ready(&self) -> Result<(), ReplicaError> {
        loop {
            let next = {
                let t = self.tables.lock().unwrap();
                let quorum = self.registry.quorum();
                let target = t.last_executed + 1;
                t.commit
                    .iter()
                    .filter(|(key, by_validator)| {
                        by_validator.len() >= quorum
                            && t.prepare.get(*key).map(|p| p.len()).unwrap_or(0) >= quorum
                            && key.starts_with(&format!("{target}:"))
                    })
                    .map(|(key, _)| key.clone())
                    .next()
            };
            let Some(key) = next else {
                return Ok(());
            };
            let (height, hash) = match key.split_once(':') {
                Some((h, rest)) => (h.parse::<u64>().unwrap_or(0), rest.to_string()),
                None => return Ok(()),
            };
            self.finalize(height, &hash).await?;
        }
    }

    // -------------------------------------------------------------------------
    // Leader path
    // -------------------------------------------------------------------------

    /// Round tick: the primary drafts and proposes; everyone retries blocks
    /// waiting on parents and any quorum-complete rounds.
    pub async fn on_round_tick(&self) {
        if let Err(e) = self.retry_parent_waiting().await {
            log::warn!("Parent-gap retry failed: {e}");
        }
        if let Err(e) = self.finalize_ready().await {
            log::warn!("Deferred finalization failed: {e}");
        }

        if self.registry.self_status() != ValidatorStatus::Active {
            return;
        }

        let should_propose = {
            let mut t = self.tables.lock().unwrap();
            // The leader schedule may have shifted under us on a registry
            // refresh.
            t.is_primary = self.registry.leader_of(t.current_view).as_deref()
                == Some(self.local_address.as_str());
            let next_height = t.last_executed + 1;
            let already_open = t
                .processing
                .iter()
                .any(|k| k.starts_with(&format!("{next_height}:")));
            t.is_primary && !t.is_view_changing && !already_open
        };
        if !should_propose {
            return;
        }

        if let Err(e) = self.propose().await {
            log::warn!("Proposal round failed: {e}");
        }
    }

    async fn propose(&self) -> Result<(), ReplicaError> {
        let Some(head) = self.blocks.head().await? else {
            return Ok(());
        };

        let transactions = self.mempool.pick(self.cfg.max_block_tx);
        let body = BlockBody {
            transactions,
            process_id: None,
        };
        let block = forge_block(&head, body, BlockType::Transaction, &self.public_key, &self.key);
        self.blocks.save_pending_block(&block).await?;

        let view = {
            let mut t = self.tables.lock().unwrap();
            t.processing.insert(format!("{}:{}", block.index, block.hash));
            t.current_view
        };

        log::info!(
            "Proposing block {} at height {} with {} transactions (view {view})",
            block.hash,
            block.index,
            block.body.transactions.len()
        );

        let pre_prepare = self.make_message(
            ConsensusMessageType::PrePrepare,
            block.index,
            block.hash.clone(),
            view,
        );
        // The proposer's own endorsement: its PREPARE ships with the round.
        let prepare = self.make_message(
            ConsensusMessageType::Prepare,
            block.index,
            block.hash.clone(),
            view,
        );

        self.execute(vec![
            ConsensusAction::BroadcastBlock(block),
            ConsensusAction::Broadcast(pre_prepare.clone()),
            ConsensusAction::Enqueue(pre_prepare),
            ConsensusAction::Broadcast(prepare.clone()),
            ConsensusAction::Enqueue(prepare),
        ])
        .await
    }

    async fn retry_parent_waiting(&self) -> Result<(), ReplicaError> {
        let waiting: Vec<(String, Vec<Block>)> = {
            let mut t = self.tables.lock().unwrap();
            t.parent_waiting.drain().collect()
        };
        for (parent_hash, blocked) in waiting {
            if self.blocks.get_block_by_hash(&parent_hash).await?.is_some() {
                for block in blocked {
                    self.authenticate_block(block).await?;
                }
            } else {
                let mut t = self.tables.lock().unwrap();
                t.parent_waiting.entry(parent_hash).or_default().extend(blocked);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // View change
    // -------------------------------------------------------------------------

    /// Timer poll: detects leader silence, and drives the secondary timer
    /// that completes or escalates an in-flight view change.
    pub async fn poll_view_change(&self) {
        enum Outcome {
            None,
            Actions(Vec<ConsensusAction>),
            Completed { became_primary: bool, view: View, proofs: Vec<ConsensusMessage> },
        }

        let outcome = {
            let mut t = self.tables.lock().unwrap();
            if t.is_view_changing {
                let expired = t
                    .view_change_deadline
                    .map(|d| Instant::now() >= d)
                    .unwrap_or(false);
                if !expired {
                    Outcome::None
                } else {
                    let target = t.view_change_target.unwrap_or(t.current_view + 1);
                    let votes = t.view_change.get(&target).map(|v| v.len()).unwrap_or(0);
                    if votes >= self.registry.quorum() {
                        let proofs: Vec<ConsensusMessage> = t
                            .view_change
                            .remove(&target)
                            .map(|m| m.into_values().collect())
                            .unwrap_or_default();
                        t.current_view = target;
                        t.is_primary = self.registry.leader_of(target).as_deref()
                            == Some(self.local_address.as_str());
                        t.is_view_changing = false;
                        t.view_change_target = None;
                        t.view_change_deadline = None;
                        t.last_leader_activity = Instant::now();
                        t.view_change.retain(|v, _| *v > target);
                        self.registry.observe_view(target);
                        log::info!(
                            "View change complete: now at view {target} (primary: {})",
                            t.is_primary
                        );
                        Outcome::Completed {
                            became_primary: t.is_primary,
                            view: target,
                            proofs,
                        }
                    } else {
                        // Not enough company at this target; escalate.
                        let next = target + 1;
                        log::warn!(
                            "View change to {target} stalled with {votes} votes; escalating to {next}"
                        );
                        Outcome::Actions(self.start_view_change_locked(&mut t, next))
                    }
                }
            } else {
                let silent = t.last_leader_activity.elapsed() >= self.cfg.view_change_timeout;
                if silent
                    && !t.is_primary
                    && self.registry.self_status() == ValidatorStatus::Active
                    && self.registry.total_validators() > 0
                {
                    let target = t.current_view + 1;
                    log::warn!(
                        "Leader of view {} silent for {:?}; starting view change to {target}",
                        t.current_view,
                        self.cfg.view_change_timeout
                    );
                    Outcome::Actions(self.start_view_change_locked(&mut t, target))
                } else {
                    Outcome::None
                }
            }
        };

        match outcome {
            Outcome::None => {}
            Outcome::Actions(actions) => {
                if let Err(e) = self.execute(actions).await {
                    log::warn!("View-change emission failed: {e}");
                }
            }
            Outcome::Completed { became_primary, view, proofs } => {
                if became_primary {
                    if let Err(e) = self.emit_new_view(view, proofs).await {
                        log::error!("NEW-VIEW emission failed: {e}");
                    }
                }
            }
        }
    }

    /// Build, record, and stage our own VIEW-CHANGE toward `target`.
    fn start_view_change_locked(&self, t: &mut Tables, target: View) -> Vec<ConsensusAction> {
        t.is_view_changing = true;
        t.view_change_target = Some(target);
        t.view_change_deadline = Some(Instant::now() + self.cfg.view_change_timeout);

        let mut message = ConsensusMessage::new(
            ConsensusMessageType::ViewChange,
            t.last_executed,
            String::new(),
            self.local_address.clone(),
            t.current_view,
        );
        message.new_view = Some(target);
        message.last_prepared_seq_num = Some(t.last_executed);
        message.view_change_proof = Some(vec![]);
        message.sign(&self.key);

        t.view_change
            .entry(target)
            .or_default()
            .insert(self.local_address.clone(), message.clone());

        vec![
            ConsensusAction::Broadcast(message.clone()),
            ConsensusAction::Enqueue(message),
        ]
    }

    /// The new primary announces its view with the proof set and re-proposes
    /// every unfinalized block in ascending height order.
    async fn emit_new_view(
        &self,
        view: View,
        proofs: Vec<ConsensusMessage>,
    ) -> Result<(), ReplicaError> {
        let last_executed = self.tables.lock().unwrap().last_executed;
        let pending = self.blocks.get_pending_blocks(last_executed + 1).await?;

        let mut replays = Vec::with_capacity(pending.len());
        for block in &pending {
            let pre_prepare = self.make_message(
                ConsensusMessageType::PrePrepare,
                block.index,
                block.hash.clone(),
                view,
            );
            replays.push(pre_prepare);
        }

        let mut new_view = ConsensusMessage::new(
            ConsensusMessageType::NewView,
            last_executed,
            String::new(),
            self.local_address.clone(),
            view,
        );
        new_view.view_change_messages = Some(proofs);
        new_view.preprepare_messages = Some(replays.clone());
        new_view.sign(&self.key);

        log::info!(
            "Emitting NEW-VIEW for view {view} with {} pending re-proposals",
            pending.len()
        );

        let mut actions = vec![
            ConsensusAction::Broadcast(new_view.clone()),
            ConsensusAction::Enqueue(new_view),
        ];
        for (block, pre_prepare) in pending.into_iter().zip(replays) {
            let key = format!("{}:{}", block.index, block.hash);
            let prepare = self.make_message(
                ConsensusMessageType::Prepare,
                block.index,
                block.hash.clone(),
                view,
            );
            self.tables.lock().unwrap().processing.insert(key);
            actions.push(ConsensusAction::BroadcastBlock(block));
            actions.push(ConsensusAction::Broadcast(pre_prepare.clone()));
            actions.push(ConsensusAction::Enqueue(pre_prepare));
            actions.push(ConsensusAction::Broadcast(prepare.clone()));
            actions.push(ConsensusAction::Enqueue(prepare));
        }
        self.execute(actions).await
    }

    fn make_message(
        &self,
        kind: ConsensusMessageType,
        height: u64,
        hash: String,
        view: View,
    ) -> ConsensusMessage {
        let mut message =
            ConsensusMessage::new(kind, height, hash, self.local_address.clone(), view);
        message.sign(&self.key);
        message
    }
}

#[async_trait]
impl QueueHandler for Replica {
    async fn process_queued(
        &self,
        message: ConsensusMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.handle(message, Origin::Queue)
            .await
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}
