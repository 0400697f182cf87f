use crate::store::{KvStore, StoreError};
use crate::types::{Block, genesis_block};
use std::sync::Arc;
use thiserror::Error;

const KEY_BLOCKS: &str = "blockchain:blocks";
const KEY_HEIGHT: &str = "blockchain:height";
const KEY_TX_INDEX: &str = "blockchain:tx-index";
const KEY_PENDING: &str = "blockchain:pending-blocks";

fn height_key(h: u64) -> String {
    format!("blockchain:height:{h}")
}

#[derive(Error, Debug)]
pub enum BlockStoreError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Conflicting block at height {height}: have {have}, got {got}")]
    HeightConflict { height: u64, have: String, got: String },
}

/// Chain-append surface over the durable KV. Finalized blocks are keyed by
/// hash and indexed by height; unfinalized proposals live in a separate
/// pending hash until a COMMIT quorum lands them.
pub struct BlockStore {
    kv: Arc<dyn KvStore>,
}

impl BlockStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Write the genesis record if the chain is empty.
    pub async fn ensure_genesis(&self) -> Result<(), BlockStoreError> {
        if self.kv.get(KEY_HEIGHT).await?.is_none() {
            let genesis = genesis_block();
            log::info!("Initializing chain at genesis {}", genesis.hash);
            self.kv
                .hset(KEY_BLOCKS, &genesis.hash, &serde_json::to_string(&genesis)?)
                .await?;
            self.kv.set(&height_key(0), &genesis.hash).await?;
            self.kv.set(KEY_HEIGHT, "0").await?;
        }
        Ok(())
    }

    pub async fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, BlockStoreError> {
        if let Some(raw) = self.kv.hget(KEY_BLOCKS, hash).await? {
            return Ok(Some(serde_json::from_str(&raw)?));
        }
        // A block under agreement is only in the pending hash.
        if let Some(raw) = self.kv.hget(KEY_PENDING, hash).await? {
            return Ok(Some(serde_json::from_str(&raw)?));
        }
        Ok(None)
    }

    pub async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, BlockStoreError> {
        match self.kv.get(&height_key(height)).await? {
            Some(hash) => self.get_block_by_hash(&hash).await,
            None => Ok(None),
        }
    }

    pub async fn chain_height(&self) -> Result<Option<u64>, BlockStoreError> {
        Ok(self
            .kv
            .get(KEY_HEIGHT)
            .await?
            .and_then(|s| s.parse().ok()))
    }

    /// The latest finalized block.
    pub async fn head(&self) -> Result<Option<Block>, BlockStoreError> {
        match self.chain_height().await? {
            Some(h) => self.get_block_by_height(h).await,
            None => Ok(None),
        }
    }

    /// Persist a finalized block. Idempotent on `(height, hash)`; a second
    /// block at an occupied height is a conflict, never an overwrite.
    pub async fn save_block(&self, block: &Block) -> Result<(), BlockStoreError> {
        if let Some(existing) = self.kv.get(&height_key(block.index)).await? {
            if existing != block.hash {
                return Err(BlockStoreError::HeightConflict {
                    height: block.index,
                    have: existing,
                    got: block.hash.clone(),
                });
            }
            return Ok(());
        }

        self.kv
            .hset(KEY_BLOCKS, &block.hash, &serde_json::to_string(block)?)
            .await?;
        self.kv.set(&height_key(block.index), &block.hash).await?;

        let current = self.chain_height().await?.unwrap_or(0);
        if block.index > current {
            self.kv.set(KEY_HEIGHT, &block.index.to_string()).await?;
        }

        if let Some(process_id) = &block.body.process_id {
            self.kv.hset(KEY_TX_INDEX, process_id, &block.hash).await?;
        }

        self.kv.hdel(KEY_PENDING, &block.hash).await?;
        Ok(())
    }

    pub async fn save_pending_block(&self, block: &Block) -> Result<(), BlockStoreError> {
        self.kv
            .hset(KEY_PENDING, &block.hash, &serde_json::to_string(block)?)
            .await?;
        Ok(())
    }

    pub async fn remove_pending_block(&self, hash: &str) -> Result<(), BlockStoreError> {
        self.kv.hdel(KEY_PENDING, hash).await?;
        Ok(())
    }

    /// Unfinalized proposals at or above `from_height`, ascending. Feeds the
    /// new primary's re-proposal pass after a view change.
    pub async fn get_pending_blocks(&self, from_height: u64) -> Result<Vec<Block>, BlockStoreError> {
        let mut out = Vec::new();
        for (_, raw) in self.kv.hgetall(KEY_PENDING).await? {
            let block: Block = serde_json::from_str(&raw)?;
            if block.index >= from_height {
                out.push(block);
            }
        }
        out.sort_by_key(|b| b.index);
        Ok(out)
    }

    /// The last `n` finalized blocks, newest first.
    pub async fn get_recent_blocks(&self, n: u64) -> Result<Vec<Block>, BlockStoreError> {
        let Some(head) = self.chain_height().await? else {
            return Ok(vec![]);
        };
        let mut out = Vec::new();
        let floor = head.saturating_sub(n.saturating_sub(1));
        for h in (floor..=head).rev() {
            if let Some(block) = self.get_block_by_height(h).await? {
                out.push(block);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair_from_id;
    use crate::store::MemoryStore;
    use crate::types::{BlockBody, BlockType, forge_block};

    async fn store_with_genesis() -> BlockStore {
        let store = BlockStore::new(Arc::new(MemoryStore::new()));
        store.ensure_genesis().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_genesis_is_idempotent() {
        let store = store_with_genesis().await;
        store.ensure_genesis().await.unwrap();
        assert_eq!(store.chain_height().await.unwrap(), Some(0));
        let head = store.head().await.unwrap().unwrap();
        assert_eq!(head.index, 0);
        assert_eq!(head.parent_hash, "0");
        assert_eq!(head.validator, "system");
    }

    #[tokio::test]
    async fn test_save_block_advances_height_and_links() {
        let store = store_with_genesis().await;
        let genesis = store.head().await.unwrap().unwrap();
        let (pk, sk) = generate_keypair_from_id(0);
        let b1 = forge_block(&genesis, BlockBody::default(), BlockType::Transaction, &pk, &sk);

        store.save_block(&b1).await.unwrap();
        assert_eq!(store.chain_height().await.unwrap(), Some(1));
        let fetched = store.get_block_by_height(1).await.unwrap().unwrap();
        assert_eq!(fetched.hash, b1.hash);
        assert_eq!(fetched.parent_hash, genesis.hash);

        // Idempotent on the same (height, hash)
        store.save_block(&b1).await.unwrap();
        assert_eq!(store.chain_height().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_conflicting_height_is_rejected() {
        let store = store_with_genesis().await;
        let genesis = store.head().await.unwrap().unwrap();
        let (pk, sk) = generate_keypair_from_id(0);
        let b1 = forge_block(&genesis, BlockBody::default(), BlockType::Transaction, &pk, &sk);
        let mut b1_alt = forge_block(&genesis, BlockBody::default(), BlockType::Transaction, &pk, &sk);
        b1_alt.nonce = 7;
        b1_alt.hash = crate::types::recompute_block_hash(&b1_alt);

        store.save_block(&b1).await.unwrap();
        let err = store.save_block(&b1_alt).await.unwrap_err();
        assert!(matches!(err, BlockStoreError::HeightConflict { height: 1, .. }));
    }

    #[tokio::test]
    async fn test_pending_blocks_sorted_and_pruned_on_save() {
        let store = store_with_genesis().await;
        let genesis = store.head().await.unwrap().unwrap();
        let (pk, sk) = generate_keypair_from_id(0);
        let b1 = forge_block(&genesis, BlockBody::default(), BlockType::Transaction, &pk, &sk);
        let b2 = forge_block(&b1, BlockBody::default(), BlockType::Transaction, &pk, &sk);

        store.save_pending_block(&b2).await.unwrap();
        store.save_pending_block(&b1).await.unwrap();

        let pending = store.get_pending_blocks(1).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].index, 1);
        assert_eq!(pending[1].index, 2);

        store.save_block(&b1).await.unwrap();
        let pending = store.get_pending_blocks(1).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].index, 2);
    }
}
