use crate::crypto;
use crate::registry::ValidatorSet;
use crate::types::{Block, GENESIS_PARENT_HASH, GENESIS_VALIDATOR, recompute_block_hash};
use std::collections::HashSet;
use thiserror::Error;

/// Verdicts from block authentication. `UnknownParent` is the one
/// non-fatal case: the caller buffers the block and retries after a
/// parent-gap recovery instead of rejecting it.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlockRejection {
    #[error("Block hash does not match its contents")]
    HashMismatch,
    #[error("Malformed genesis block")]
    BadGenesis,
    #[error("Parent block not locally known")]
    UnknownParent,
    #[error("Block index {got} does not extend parent index {parent}")]
    BadIndex { parent: u64, got: u64 },
    #[error("Parent hash does not match the local chain")]
    ParentMismatch,
    #[error("Validator {0} is not in the active set")]
    UnknownValidator(String),
    #[error("Invalid validator signature")]
    BadSignature,
    #[error("Malformed transaction {0}")]
    MalformedTransaction(String),
    #[error("Duplicate transaction {0} within block")]
    DuplicateTransaction(String),
    #[error("Recorded totalFees {recorded} does not match computed {computed}")]
    FeeMismatch { recorded: u64, computed: u64 },
}

/// Stateless verification of a proposed block against its expected parent
/// and the validator set active at its view.
pub fn verify_block(
    block: &Block,
    expected_parent: Option<&Block>,
    validators: &ValidatorSet,
) -> Result<(), BlockRejection> {
    if block.hash != recompute_block_hash(block) {
        return Err(BlockRejection::HashMismatch);
    }

    if block.index == 0 {
        if block.parent_hash != GENESIS_PARENT_HASH || block.validator != GENESIS_VALIDATOR {
            return Err(BlockRejection::BadGenesis);
        }
    } else {
        let parent = expected_parent.ok_or(BlockRejection::UnknownParent)?;
        if block.index != parent.index + 1 {
            return Err(BlockRejection::BadIndex {
                parent: parent.index,
                got: block.index,
            });
        }
        if block.parent_hash != parent.hash {
            return Err(BlockRejection::ParentMismatch);
        }

        let public_key = validators
            .public_key_of(&block.validator)
            .ok_or_else(|| BlockRejection::UnknownValidator(block.validator.clone()))?;
        if !crypto::verify_hex(public_key, block.hash.as_bytes(), &block.signature) {
            return Err(BlockRejection::BadSignature);
        }
    }

    let mut seen = HashSet::new();
    for tx in &block.body.transactions {
        tx.check_shape()
            .map_err(|_| BlockRejection::MalformedTransaction(tx.hash.clone()))?;
        if !seen.insert(tx.hash.as_str()) {
            return Err(BlockRejection::DuplicateTransaction(tx.hash.clone()));
        }
    }

    if let Some(recorded) = block.total_fees {
        let computed = block.body.transactions.iter().map(|t| t.fee).sum::<u64>();
        if recorded != computed {
            return Err(BlockRejection::FeeMismatch { recorded, computed });
        }
    }

    Ok(())
}
