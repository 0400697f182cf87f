use crate::replica::NodeStatus;
use crate::types::{Block, Transaction};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;

/// Thin HTTP client for driving a node from tools and scripts.
pub struct TripcoinClient {
    client: HttpClient,
}

impl TripcoinClient {
    pub fn new(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let client = HttpClientBuilder::default().build(url)?;
        Ok(Self { client })
    }

    pub async fn send_transaction(
        &self,
        tx: Transaction,
    ) -> Result<String, Box<dyn std::error::Error>> {
        let hash: String = self
            .client
            .request("send_transaction", rpc_params![tx])
            .await?;
        Ok(hash)
    }

    pub async fn get_block_by_height(
        &self,
        height: u64,
    ) -> Result<Option<Block>, Box<dyn std::error::Error>> {
        let block: Option<Block> = self
            .client
            .request("get_block_by_height", rpc_params![height])
            .await?;
        Ok(block)
    }

    pub async fn get_chain_height(&self) -> Result<u64, Box<dyn std::error::Error>> {
        let height: u64 = self.client.request("get_chain_height", rpc_params![]).await?;
        Ok(height)
    }

    pub async fn get_status(&self) -> Result<NodeStatus, Box<dyn std::error::Error>> {
        let status: NodeStatus = self.client.request("get_status", rpc_params![]).await?;
        Ok(status)
    }

    pub async fn get_balance(&self, address: &str) -> Result<u64, Box<dyn std::error::Error>> {
        let balance: u64 = self
            .client
            .request("get_balance", rpc_params![address])
            .await?;
        Ok(balance)
    }
}
