use crate::block_store::BlockStore;
use crate::crypto::PublicKey;
use crate::store::{KvStore, StoreError};
use crate::types::{GENESIS_VALIDATOR, ValidatorInfo, ValidatorStatus, View};
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const KEY_VALIDATORS: &str = "validators";

/// How far above the highest adopted view a message may claim before the
/// registry refuses to vouch a snapshot for it.
const DEFAULT_VIEW_HORIZON: u64 = 1000;

/// How many recent blocks to mine for validator addresses when the durable
/// set is empty.
const RECENT_BLOCK_FALLBACK: u64 = 20;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Block store error: {0}")]
    Blocks(#[from] crate::block_store::BlockStoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("View {view} is beyond the snapshot horizon {horizon}")]
    BeyondHorizon { view: View, horizon: View },
}

/// An ordered snapshot of the active set. Ordering by address ascending is
/// part of the contract: leader selection indexes it modulo its length and
/// must agree across peers.
#[derive(Clone, Debug)]
pub struct ValidatorSet {
    pub validators: Vec<ValidatorInfo>,
    pub view: View,
}

impl ValidatorSet {
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn leader_of(&self, view: View) -> Option<&str> {
        if self.validators.is_empty() {
            return None;
        }
        let idx = (view as usize) % self.validators.len();
        Some(&self.validators[idx].address)
    }

    /// `⌊2N/3⌋ + 1`, applied identically to PREPARE, COMMIT and VIEW-CHANGE.
    pub fn quorum(&self) -> usize {
        2 * self.validators.len() / 3 + 1
    }

    pub fn is_active(&self, address: &str) -> bool {
        self.validators
            .iter()
            .any(|v| v.address == address && v.status == ValidatorStatus::Active)
    }

    pub fn public_key_of(&self, address: &str) -> Option<&str> {
        self.validators
            .iter()
            .find(|v| v.address == address)
            .map(|v| v.public_key.as_str())
    }
}

/// Authoritative view of the active validator set, refreshed from the
/// durable store with a finalized-block fallback.
pub struct Registry {
    kv: Arc<dyn KvStore>,
    blocks: Arc<BlockStore>,
    local_address: String,
    view_horizon: u64,
    latest_view: AtomicU64,
    active: RwLock<Vec<ValidatorInfo>>,
}

impl Registry {
    pub fn new(kv: Arc<dyn KvStore>, blocks: Arc<BlockStore>, local_address: String) -> Self {
        Self {
            kv,
            blocks,
            local_address,
            view_horizon: DEFAULT_VIEW_HORIZON,
            latest_view: AtomicU64::new(0),
            active: RwLock::new(Vec::new()),
        }
    }

    /// Record the replica's adopted view; the snapshot horizon floats above it.
    pub fn observe_view(&self, view: View) {
        self.latest_view.fetch_max(view, Ordering::Relaxed);
    }

    /// The set to validate messages tagged with `view` against. Serves the
    /// latest set, refusing views past the configured horizon.
    pub fn snapshot(&self, view: View) -> Result<ValidatorSet, RegistryError> {
        let horizon = self
            .latest_view
            .load(Ordering::Relaxed)
            .saturating_add(self.view_horizon);
        if view > horizon {
            return Err(RegistryError::BeyondHorizon { view, horizon });
        }
        Ok(ValidatorSet {
            validators: self.active.read().unwrap().clone(),
            view,
        })
    }

    pub fn leader_of(&self, view: View) -> Option<String> {
        let active = self.active.read().unwrap();
        if active.is_empty() {
            return None;
        }
        let idx = (view as usize) % active.len();
        Some(active[idx].address.clone())
    }

    pub fn quorum(&self) -> usize {
        2 * self.active.read().unwrap().len() / 3 + 1
    }

    pub fn total_validators(&self) -> usize {
        self.active.read().unwrap().len()
    }

    pub fn is_active(&self, address: &str) -> bool {
        self.active
            .read()
            .unwrap()
            .iter()
            .any(|v| v.address == address && v.status == ValidatorStatus::Active)
    }

    /// ACTIVE when the local address is in the set, STANDBY otherwise.
    /// PENALIZED is read from the store but never entered here.
    pub fn self_status(&self) -> ValidatorStatus {
        if self.is_active(&self.local_address) {
            ValidatorStatus::Active
        } else {
            ValidatorStatus::Standby
        }
    }

    pub fn validators(&self) -> Vec<ValidatorInfo> {
        self.active.read().unwrap().clone()
    }

    /// Mark activity from a validator (message receipt heartbeat).
    pub fn touch(&self, address: &str) {
        let now = unix_millis();
        let mut active = self.active.write().unwrap();
        if let Some(v) = active.iter_mut().find(|v| v.address == address) {
            v.last_active = now;
        }
    }

    /// Reload the active set from the durable store; when it is empty, fall
    /// back to the validators observed in recent finalized blocks.
    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let mut set = Vec::new();
        for (_, raw) in self.kv.hgetall(KEY_VALIDATORS).await? {
            match serde_json::from_str::<ValidatorInfo>(&raw) {
                Ok(info) => set.push(info),
                Err(e) => log::warn!("Skipping undecodable validator record: {e}"),
            }
        }

        if set.is_empty() {
            for block in self.blocks.get_recent_blocks(RECENT_BLOCK_FALLBACK).await? {
                if block.validator == GENESIS_VALIDATOR {
                    continue;
                }
                if set.iter().any(|v: &ValidatorInfo| v.address == block.validator) {
                    continue;
                }
                set.push(ValidatorInfo {
                    address: block.validator.clone(),
                    public_key: String::new(),
                    stake: 0,
                    reputation: 0,
                    last_active: 0,
                    status: ValidatorStatus::Active,
                });
            }
            if !set.is_empty() {
                log::warn!(
                    "Validator store empty; recovered {} addresses from recent blocks",
                    set.len()
                );
            }
        }

        set.sort_by(|a, b| a.address.cmp(&b.address));
        set.dedup_by(|a, b| a.address == b.address);
        *self.active.write().unwrap() = set;
        Ok(())
    }

    /// Register a validator in the durable set and refresh the snapshot.
    pub async fn register(&self, info: &ValidatorInfo) -> Result<(), RegistryError> {
        self.kv
            .hset(KEY_VALIDATORS, &info.address, &serde_json::to_string(info)?)
            .await?;
        self.refresh().await
    }

    /// Persist the in-memory snapshot (lastActive bookkeeping) on shutdown.
    pub async fn flush(&self) -> Result<(), RegistryError> {
        let snapshot = self.active.read().unwrap().clone();
        for info in snapshot {
            self.kv
                .hset(KEY_VALIDATORS, &info.address, &serde_json::to_string(&info)?)
                .await?;
        }
        Ok(())
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn public_key_of(&self, address: &str) -> Option<PublicKey> {
        let active = self.active.read().unwrap();
        let hex = active
            .iter()
            .find(|v| v.address == address)
            .map(|v| v.public_key.clone())?;
        PublicKey::from_hex(&hex).ok()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
