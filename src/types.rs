use crate::crypto::{self, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The View number definition (u64).
pub type View = u64;

// Protocol constants. Intervals are the defaults; a few are overridable
// through `NodeConfig` where the environment table allows it.
pub const MAX_MEMPOOL_SIZE: usize = 5000;
pub const MAX_TX_AGE: Duration = Duration::from_secs(72 * 3600);
pub const DEFAULT_GAS_PRICE: u64 = 10;
pub const DEFAULT_BLOCK_REWARD: u64 = 50;
pub const DEFAULT_SUPPLY_CAP: u64 = 21_000_000;
pub const MAX_BLOCK_TX: usize = 100;

pub const ROUND_INTERVAL: Duration = Duration::from_secs(5);
pub const REGISTRY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
pub const MEMPOOL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const VIEW_CHANGE_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub const STREAM_BATCH_SIZE: usize = 50;
pub const STREAM_BLOCK_MS: u64 = 100;
pub const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const SNAPSHOT_INTERVAL: u64 = 1000;

/// Genesis sentinels.
pub const GENESIS_PARENT_HASH: &str = "0";
pub const GENESIS_VALIDATOR: &str = "system";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValidatorStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "STANDBY")]
    Standby,
    #[serde(rename = "PENALIZED")]
    Penalized,
}

/// A registered validator. `address` is always `hex(SHA-256(publicKey))`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorInfo {
    pub address: String,
    pub public_key: String,
    pub stake: u64,
    pub reputation: u64,
    /// Unix milliseconds of the last observed activity.
    pub last_active: u64,
    pub status: ValidatorStatus,
}

impl ValidatorInfo {
    pub fn from_public_key(pk: &PublicKey, stake: u64) -> Self {
        Self {
            address: pk.address(),
            public_key: pk.to_hex(),
            stake,
            reputation: 0,
            last_active: 0,
            status: ValidatorStatus::Active,
        }
    }
}

/// A pending transfer. `fee` is derived (`gasLimit * GAS_PRICE`) at
/// admission and never trusted from the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub gas_limit: u64,
    pub size: u64,
    #[serde(default)]
    pub fee: u64,
}

impl Transaction {
    /// Structural validation: identity and endpoint fields must be present
    /// and well-formed. A zero `size` would poison fee-density ordering.
    pub fn check_shape(&self) -> Result<(), &'static str> {
        if self.hash.is_empty() || hex::decode(&self.hash).is_err() {
            return Err("hash");
        }
        if self.from.is_empty() {
            return Err("from");
        }
        if self.to.is_empty() {
            return Err("to");
        }
        if self.size == 0 {
            return Err("size");
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlockType {
    #[serde(rename = "TRANSACTION")]
    Transaction,
    #[serde(rename = "CRITICAL_PROCESS")]
    CriticalProcess,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
}

/// A block is a plain record; hashing and forging are free functions below.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    /// ISO-8601 timestamp at forge time.
    pub timestamp: String,
    pub parent_hash: String,
    pub hash: String,
    pub nonce: u64,
    /// Address of the forging validator ("system" for genesis).
    pub validator: String,
    /// Hex signature of `hash`; empty for genesis.
    pub signature: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub body: BlockBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_fees: Option<u64>,
}

impl Block {
    pub fn tx_hashes(&self) -> Vec<String> {
        self.body.transactions.iter().map(|t| t.hash.clone()).collect()
    }
}

/// Compute the block hash: SHA-256 over
/// `index || parentHash || timestamp || canonical(body) || nonce` with an
/// empty signature preimage. The signature is computed over this hash
/// afterwards and the hash is never recomputed once signed.
pub fn compute_block_hash(
    index: u64,
    parent_hash: &str,
    timestamp: &str,
    body: &BlockBody,
    nonce: u64,
) -> String {
    let canonical_body = serde_json::to_string(body).unwrap_or_default();
    let preimage = format!("{index}{parent_hash}{timestamp}{canonical_body}{nonce}");
    crypto::sha256_hex(preimage.as_bytes())
}

/// Recompute the hash of an existing block record (signature excluded).
pub fn recompute_block_hash(block: &Block) -> String {
    compute_block_hash(
        block.index,
        &block.parent_hash,
        &block.timestamp,
        &block.body,
        block.nonce,
    )
}

/// Forge a new block extending `parent`: hash first, then sign the hash.
pub fn forge_block(
    parent: &Block,
    body: BlockBody,
    block_type: BlockType,
    validator: &PublicKey,
    key: &PrivateKey,
) -> Block {
    let index = parent.index + 1;
    let timestamp = chrono::Utc::now().to_rfc3339();
    let total_fees = body.transactions.iter().map(|t| t.fee).sum::<u64>();
    let hash = compute_block_hash(index, &parent.hash, &timestamp, &body, 0);
    let signature = crypto::sign(key, hash.as_bytes()).to_hex();
    Block {
        index,
        timestamp,
        parent_hash: parent.hash.clone(),
        hash,
        nonce: 0,
        validator: validator.address(),
        signature,
        block_type,
        body,
        total_fees: Some(total_fees),
    }
}

/// The genesis record every chain starts from.
pub fn genesis_block() -> Block {
    let body = BlockBody::default();
    let timestamp = "1970-01-01T00:00:00+00:00".to_string();
    let hash = compute_block_hash(0, GENESIS_PARENT_HASH, &timestamp, &body, 0);
    Block {
        index: 0,
        timestamp,
        parent_hash: GENESIS_PARENT_HASH.to_string(),
        hash,
        nonce: 0,
        validator: GENESIS_VALIDATOR.to_string(),
        signature: String::new(),
        block_type: BlockType::Transaction,
        body,
        total_fees: None,
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConsensusMessageType {
    #[serde(rename = "PRE_PREPARE")]
    PrePrepare,
    #[serde(rename = "PREPARE")]
    Prepare,
    #[serde(rename = "COMMIT")]
    Commit,
    #[serde(rename = "VIEW_CHANGE")]
    ViewChange,
    #[serde(rename = "NEW_VIEW")]
    NewView,
}

/// The consensus wire record. One struct with a discriminant plus
/// variant-only optional fields; unknown fields are rejected at parse time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConsensusMessage {
    #[serde(rename = "type")]
    pub kind: ConsensusMessageType,
    pub block_height: u64,
    pub block_hash: String,
    pub validator: String,
    pub view: View,
    pub signature: String,
    // VIEW_CHANGE only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_view: Option<View>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_prepared_seq_num: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_change_proof: Option<Vec<ConsensusMessage>>,
    // NEW_VIEW only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_change_messages: Option<Vec<ConsensusMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preprepare_messages: Option<Vec<ConsensusMessage>>,
}

impl ConsensusMessage {
    pub fn new(
        kind: ConsensusMessageType,
        block_height: u64,
        block_hash: String,
        validator: String,
        view: View,
    ) -> Self {
        Self {
            kind,
            block_height,
            block_hash,
            validator,
            view,
            signature: String::new(),
            new_view: None,
            last_prepared_seq_num: None,
            view_change_proof: None,
            view_change_messages: None,
            preprepare_messages: None,
        }
    }

    /// Table key for the three-phase round tables.
    pub fn round_key(&self) -> String {
        format!("{}:{}", self.block_height, self.block_hash)
    }

    /// The signature covers the serialized message with `signature` blanked.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        serde_json::to_vec(&unsigned).unwrap_or_default()
    }

    pub fn sign(&mut self, key: &PrivateKey) {
        self.signature = crypto::sign(key, &self.signing_bytes()).to_hex();
    }

    pub fn verify(&self, pub_key_hex: &str) -> bool {
        crypto::verify_hex(pub_key_hex, &self.signing_bytes(), &self.signature)
    }

    /// Variant-specific required fields must be present.
    pub fn check_shape(&self) -> Result<(), &'static str> {
        match self.kind {
            ConsensusMessageType::ViewChange => {
                if self.new_view.is_none() {
                    return Err("newView");
                }
                if self.last_prepared_seq_num.is_none() {
                    return Err("lastPreparedSeqNum");
                }
            }
            ConsensusMessageType::NewView => {
                if self.view_change_messages.is_none() {
                    return Err("viewChangeMessages");
                }
            }
            _ => {
                if self.block_hash.is_empty() {
                    return Err("blockHash");
                }
            }
        }
        if self.validator.is_empty() {
            return Err("validator");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair_from_id;

    #[test]
    fn test_block_hash_ignores_signature() {
        let parent = genesis_block();
        let (pk, sk) = generate_keypair_from_id(1);
        let block = forge_block(&parent, BlockBody::default(), BlockType::Transaction, &pk, &sk);

        // Signing happened after hashing; recomputation must still match.
        assert!(!block.signature.is_empty());
        assert_eq!(block.hash, recompute_block_hash(&block));
    }

    #[test]
    fn test_message_signature_covers_blanked_record() {
        let (pk, sk) = generate_keypair_from_id(2);
        let mut m = ConsensusMessage::new(
            ConsensusMessageType::Prepare,
            1,
            "abc123".into(),
            pk.address(),
            0,
        );
        m.sign(&sk);
        assert!(m.verify(&pk.to_hex()));

        // Tampering breaks verification.
        let mut tampered = m.clone();
        tampered.block_height = 2;
        assert!(!tampered.verify(&pk.to_hex()));
    }

    #[test]
    fn test_wire_rejects_unknown_fields() {
        let raw = r#"{
            "type": "PREPARE",
            "blockHeight": 1,
            "blockHash": "ab",
            "validator": "cd",
            "view": 0,
            "signature": "",
            "bogus": true
        }"#;
        assert!(serde_json::from_str::<ConsensusMessage>(raw).is_err());
    }

    #[test]
    fn test_view_change_shape() {
        let mut m = ConsensusMessage::new(
            ConsensusMessageType::ViewChange,
            0,
            String::new(),
            "aa".into(),
            0,
        );
        assert!(m.check_shape().is_err());
        m.new_view = Some(1);
        m.last_prepared_seq_num = Some(0);
        assert!(m.check_shape().is_ok());
    }
}
