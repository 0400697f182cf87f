use crate::block_store::BlockStore;
use crate::ledger::Ledger;
use crate::mempool::{Mempool, MempoolError};
use crate::registry::Registry;
use crate::replica::{NodeStatus, Replica};
use crate::stream::{MessageStream, StreamHealth};
use crate::types::{Block, Transaction, ValidatorInfo};
use jsonrpsee::core::{RpcResult, async_trait};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObject;
use std::sync::Arc;

/// Reason codes surfaced to submitters; admission failures are the caller's
/// problem, not ours.
const CODE_REJECTED: i32 = -32001;
const CODE_STORE: i32 = -32000;

#[rpc(server)]
pub trait TripcoinRpc {
    #[method(name = "send_transaction")]
    async fn send_transaction(&self, tx: Transaction) -> RpcResult<String>;

    #[method(name = "get_block_by_hash")]
    async fn get_block_by_hash(&self, hash: String) -> RpcResult<Option<Block>>;

    #[method(name = "get_block_by_height")]
    async fn get_block_by_height(&self, height: u64) -> RpcResult<Option<Block>>;

    #[method(name = "get_chain_height")]
    async fn get_chain_height(&self) -> RpcResult<u64>;

    #[method(name = "get_validators")]
    async fn get_validators(&self) -> RpcResult<Vec<ValidatorInfo>>;

    #[method(name = "get_status")]
    async fn get_status(&self) -> RpcResult<NodeStatus>;

    #[method(name = "get_balance")]
    async fn get_balance(&self, address: String) -> RpcResult<u64>;

    #[method(name = "get_stream_info")]
    async fn get_stream_info(&self) -> RpcResult<StreamHealth>;
}

pub struct TripcoinRpcImpl {
    blocks: Arc<BlockStore>,
    mempool: Arc<Mempool>,
    registry: Arc<Registry>,
    replica: Arc<Replica>,
    ledger: Arc<Ledger>,
    stream: Arc<MessageStream>,
    tx_broadcast: tokio::sync::mpsc::Sender<Transaction>,
}

impl TripcoinRpcImpl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blocks: Arc<BlockStore>,
        mempool: Arc<Mempool>,
        registry: Arc<Registry>,
        replica: Arc<Replica>,
        ledger: Arc<Ledger>,
        stream: Arc<MessageStream>,
        tx_broadcast: tokio::sync::mpsc::Sender<Transaction>,
    ) -> Self {
        Self {
            blocks,
            mempool,
            registry,
            replica,
            ledger,
            stream,
            tx_broadcast,
        }
    }
}

fn store_error<E: std::fmt::Display>(e: E) -> ErrorObject<'static> {
    ErrorObject::owned(CODE_STORE, format!("Store error: {e}"), None::<()>)
}

fn rejection(e: MempoolError) -> ErrorObject<'static> {
    let reason = match &e {
        MempoolError::Malformed(_) => "MALFORMED",
        MempoolError::Duplicate => "DUPLICATE",
        MempoolError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
    };
    ErrorObject::owned(CODE_REJECTED, format!("{reason}: {e}"), None::<()>)
}

#[async_trait]
impl TripcoinRpcServer for TripcoinRpcImpl {
    async fn send_transaction(&self, tx: Transaction) -> RpcResult<String> {
        let hash = tx.hash.clone();
        self.mempool.add(tx.clone()).map_err(rejection)?;

        // Gossip the admitted transaction to the other validators.
        let sender = self.tx_broadcast.clone();
        tokio::spawn(async move {
            let _ = sender.send(tx).await;
        });

        Ok(hash)
    }

    async fn get_block_by_hash(&self, hash: String) -> RpcResult<Option<Block>> {
        self.blocks.get_block_by_hash(&hash).await.map_err(store_error)
    }

    async fn get_block_by_height(&self, height: u64) -> RpcResult<Option<Block>> {
        self.blocks.get_block_by_height(height).await.map_err(store_error)
    }

    async fn get_chain_height(&self) -> RpcResult<u64> {
        Ok(self
            .blocks
            .chain_height()
            .await
            .map_err(store_error)?
            .unwrap_or(0))
    }

    async fn get_validators(&self) -> RpcResult<Vec<ValidatorInfo>> {
        Ok(self.registry.validators())
    }

    async fn get_status(&self) -> RpcResult<NodeStatus> {
        Ok(self.replica.status())
    }

    async fn get_balance(&self, address: String) -> RpcResult<u64> {
        Ok(self.ledger.balance_of(&address))
    }

    async fn get_stream_info(&self) -> RpcResult<StreamHealth> {
        self.stream.health().await.map_err(store_error)
    }
}
