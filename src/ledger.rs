use crate::store::{KvStore, StoreError};
use crate::types::{Block, GENESIS_VALIDATOR, SNAPSHOT_INTERVAL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

const KEY_STATE: &str = "blockchain:state";
const KEY_SUPPLY: &str = "tripcoin:supply";
const KEY_SNAPSHOTS: &str = "blockchain:snapshots";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The persisted account state. Contract slots are carried opaquely; the
/// core never executes them.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ChainState {
    pub balances: HashMap<String, u64>,
    pub nonces: HashMap<String, u64>,
    pub contracts: HashMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub height: u64,
    pub state: ChainState,
    pub supply: u64,
}

/// The opaque state transition applied after finalization: transfers, fees
/// to the forging validator, and the block reward bounded by the supply cap.
pub struct Ledger {
    kv: Arc<dyn KvStore>,
    block_reward: u64,
    supply_cap: u64,
    state: RwLock<ChainState>,
    supply: RwLock<u64>,
}

impl Ledger {
    pub fn new(kv: Arc<dyn KvStore>, block_reward: u64, supply_cap: u64) -> Self {
        Self {
            kv,
            block_reward,
            supply_cap,
            state: RwLock::new(ChainState::default()),
            supply: RwLock::new(0),
        }
    }

    /// Load persisted state into memory at startup.
    pub async fn load(&self) -> Result<(), LedgerError> {
        if let Some(raw) = self.kv.get(KEY_STATE).await? {
            *self.state.write().unwrap() = serde_json::from_str(&raw)?;
        }
        if let Some(raw) = self.kv.get(KEY_SUPPLY).await? {
            *self.supply.write().unwrap() = raw.parse().unwrap_or(0);
        }
        Ok(())
    }

    pub fn balance_of(&self, address: &str) -> u64 {
        self.state
            .read()
            .unwrap()
            .balances
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn supply(&self) -> u64 {
        *self.supply.read().unwrap()
    }

    /// Mint a balance outside block flow (bootstrap and tests).
    pub async fn credit(&self, address: &str, amount: u64) -> Result<(), LedgerError> {
        {
            let mut state = self.state.write().unwrap();
            let entry = state.balances.entry(address.to_string()).or_insert(0);
            *entry = entry.saturating_add(amount);
        }
        self.persist().await
    }

    /// Apply a finalized block: debit senders, credit recipients, pay fees
    /// to the forging validator, and mint the reward when `reward` holds.
    /// A transfer whose sender can no longer cover it is skipped, never
    /// partially applied.
    pub async fn apply_block(&self, block: &Block, reward: bool) -> Result<(), LedgerError> {
        {
            let mut state = self.state.write().unwrap();
            for tx in &block.body.transactions {
                let due = tx.amount.saturating_add(tx.fee);
                let from_balance = state.balances.get(&tx.from).copied().unwrap_or(0);
                if from_balance < due {
                    log::warn!(
                        "Skipping transfer {} in block {}: balance {} below {}",
                        tx.hash,
                        block.index,
                        from_balance,
                        due
                    );
                    continue;
                }
                state.balances.insert(tx.from.clone(), from_balance - due);
                let to_balance = state.balances.entry(tx.to.clone()).or_insert(0);
                *to_balance = to_balance.saturating_add(tx.amount);
                if block.validator != GENESIS_VALIDATOR {
                    let fees = state.balances.entry(block.validator.clone()).or_insert(0);
                    *fees = fees.saturating_add(tx.fee);
                }
                let nonce = state.nonces.entry(tx.from.clone()).or_insert(0);
                *nonce += 1;
            }
        }

        if reward && block.validator != GENESIS_VALIDATOR {
            let minted = {
                let mut supply = self.supply.write().unwrap();
                let minted = self.block_reward.min(self.supply_cap.saturating_sub(*supply));
                *supply += minted;
                minted
            };
            if minted > 0 {
                let mut state = self.state.write().unwrap();
                let entry = state.balances.entry(block.validator.clone()).or_insert(0);
                *entry = entry.saturating_add(minted);
            }
        }

        self.persist().await?;
        self.snapshot_if_due(block.index).await
    }

    async fn persist(&self) -> Result<(), LedgerError> {
        let state_json = serde_json::to_string(&*self.state.read().unwrap())?;
        self.kv.set(KEY_STATE, &state_json).await?;
        let supply = self.supply();
        self.kv.set(KEY_SUPPLY, &supply.to_string()).await?;
        Ok(())
    }

    async fn snapshot_if_due(&self, height: u64) -> Result<(), LedgerError> {
        if height == 0 || height % SNAPSHOT_INTERVAL != 0 {
            return Ok(());
        }
        let snapshot = Snapshot {
            height,
            state: self.state.read().unwrap().clone(),
            supply: self.supply(),
        };
        self.kv
            .hset(
                KEY_SNAPSHOTS,
                &height.to_string(),
                &serde_json::to_string(&snapshot)?,
            )
            .await?;
        log::info!("Recorded state snapshot at height {height}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{BlockBody, BlockType, Transaction, forge_block, genesis_block};

    fn tx(hash: &str, from: &str, to: &str, amount: u64, fee: u64) -> Transaction {
        Transaction {
            hash: hash.into(),
            from: from.into(),
            to: to.into(),
            amount,
            gas_limit: 10,
            size: 1,
            fee,
        }
    }

    #[tokio::test]
    async fn test_apply_block_moves_funds_and_pays_validator() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), 50, 21_000_000);
        ledger.credit("alice", 1000).await.unwrap();

        let (pk, sk) = crate::crypto::generate_keypair_from_id(0);
        let body = BlockBody {
            transactions: vec![tx("aa", "alice", "bob", 300, 20)],
            process_id: None,
        };
        let block = forge_block(&genesis_block(), body, BlockType::Transaction, &pk, &sk);
        ledger.apply_block(&block, true).await.unwrap();

        assert_eq!(ledger.balance_of("alice"), 680);
        assert_eq!(ledger.balance_of("bob"), 300);
        // Validator collects the fee plus the full reward.
        assert_eq!(ledger.balance_of(&pk.address()), 70);
        assert_eq!(ledger.supply(), 50);
    }

    #[tokio::test]
    async fn test_reward_respects_supply_cap() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), 50, 30);
        let (pk, sk) = crate::crypto::generate_keypair_from_id(1);
        let block = forge_block(
            &genesis_block(),
            BlockBody::default(),
            BlockType::Transaction,
            &pk,
            &sk,
        );

        ledger.apply_block(&block, true).await.unwrap();
        assert_eq!(ledger.supply(), 30);
        assert_eq!(ledger.balance_of(&pk.address()), 30);

        // Cap reached: nothing further is minted.
        ledger.apply_block(&block, true).await.unwrap();
        assert_eq!(ledger.supply(), 30);
        assert_eq!(ledger.balance_of(&pk.address()), 30);
    }

    #[tokio::test]
    async fn test_no_reward_during_view_change() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), 50, 21_000_000);
        let (pk, sk) = crate::crypto::generate_keypair_from_id(2);
        let block = forge_block(
            &genesis_block(),
            BlockBody::default(),
            BlockType::Transaction,
            &pk,
            &sk,
        );
        ledger.apply_block(&block, false).await.unwrap();
        assert_eq!(ledger.supply(), 0);
        assert_eq!(ledger.balance_of(&pk.address()), 0);
    }

    #[tokio::test]
    async fn test_underfunded_transfer_is_skipped_whole() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), 0, 0);
        ledger.credit("alice", 100).await.unwrap();

        let (pk, sk) = crate::crypto::generate_keypair_from_id(3);
        let body = BlockBody {
            transactions: vec![tx("aa", "alice", "bob", 90, 20)],
            process_id: None,
        };
        let block = forge_block(&genesis_block(), body, BlockType::Transaction, &pk, &sk);
        ledger.apply_block(&block, false).await.unwrap();

        // amount + fee exceeds the balance: no partial debit.
        assert_eq!(ledger.balance_of("alice"), 100);
        assert_eq!(ledger.balance_of("bob"), 0);
    }

    #[tokio::test]
    async fn test_state_persists_and_reloads() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(kv.clone(), 50, 21_000_000);
        ledger.credit("alice", 42).await.unwrap();

        let reloaded = Ledger::new(kv, 50, 21_000_000);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.balance_of("alice"), 42);
    }
}
