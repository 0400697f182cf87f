use jsonrpsee::server::Server;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tripcoin::block_store::BlockStore;
use tripcoin::config::NodeConfig;
use tripcoin::crypto::PrivateKey;
use tripcoin::gateway::{Gateway, GatewayEvent};
use tripcoin::ledger::Ledger;
use tripcoin::mempool::{Mempool, MempoolConfig};
use tripcoin::registry::Registry;
use tripcoin::replica::{Replica, ReplicaConfig};
use tripcoin::rpc::{TripcoinRpcImpl, TripcoinRpcServer};
use tripcoin::store::{KvStore, RedisStore};
use tripcoin::stream::{MessageStream, QueueHandler};
use tripcoin::types::{
    MEMPOOL_SWEEP_INTERVAL, REGISTRY_REFRESH_INTERVAL, ROUND_INTERVAL, ValidatorInfo,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // 1. Configuration and signing keys. Both are fatal when missing.
    let cfg = NodeConfig::from_env()?;
    let key = PrivateKey::from_seed_hex(&cfg.validator_seed)?;
    let public_key = key.public_key();
    let address = public_key.address();
    log::info!("Starting validator {address}");

    // 2. Durable KV + stream endpoint. Unreachable KV is fatal.
    let kv: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&cfg.redis_url).await?);
    kv.ping().await?;

    // 3. Persistence and chain state.
    let blocks = Arc::new(BlockStore::new(kv.clone()));
    blocks.ensure_genesis().await?;

    let ledger = Arc::new(Ledger::new(kv.clone(), cfg.block_reward, cfg.supply_cap));
    ledger.load().await?;

    let registry = Arc::new(Registry::new(kv.clone(), blocks.clone(), address.clone()));
    registry
        .register(&ValidatorInfo::from_public_key(&public_key, cfg.validator_stake))
        .await?;
    registry.refresh().await?;

    let mempool = Arc::new(Mempool::new(
        MempoolConfig {
            gas_price: cfg.gas_price,
            ..Default::default()
        },
        ledger.clone(),
    ));

    let stream = Arc::new(MessageStream::new(kv.clone()));
    stream.init().await?;

    // 4. Gateway and the replica behind its outbound capability.
    let mut gateway = Gateway::new(cfg.gossip_port).await?;
    let outbound = Arc::new(gateway.handle());

    let replica = Arc::new(Replica::new(
        key,
        ReplicaConfig::default(),
        registry.clone(),
        mempool.clone(),
        blocks.clone(),
        ledger.clone(),
        stream.clone(),
        outbound.clone(),
    ));
    replica.bootstrap().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    outbound.spawn_seed_dialer(cfg.seed_nodes.clone(), shutdown_rx.clone());

    // 5. Stream consumer workers. Each owns its pending list under a stable
    // consumer name.
    let mut consumer_handles = Vec::new();
    for worker in 0..cfg.stream_workers.max(1) {
        let stream = stream.clone();
        let handler: Arc<dyn QueueHandler> = replica.clone();
        let shutdown = shutdown_rx.clone();
        let consumer = format!("{}-{worker}", &address[..8]);
        consumer_handles.push(tokio::spawn(async move {
            stream.run_consumer(&consumer, handler, shutdown).await;
        }));
    }

    // 6. RPC surface.
    let (tx_sender, mut tx_receiver) = mpsc::channel(256);
    let server = Server::builder()
        .build(format!("0.0.0.0:{}", cfg.port))
        .await?;
    let rpc = TripcoinRpcImpl::new(
        blocks.clone(),
        mempool.clone(),
        registry.clone(),
        replica.clone(),
        ledger.clone(),
        stream.clone(),
        tx_sender,
    );
    let rpc_handle = server.start(rpc.into_rpc());
    log::info!("RPC server listening on port {}", cfg.port);

    // 7. Timers.
    let mut round_timer = time::interval(ROUND_INTERVAL);
    let mut refresh_timer = time::interval(REGISTRY_REFRESH_INTERVAL);
    let mut sweep_timer = time::interval(MEMPOOL_SWEEP_INTERVAL);
    let mut view_change_timer = time::interval(Duration::from_millis(500));

    // 8. Main event loop.
    loop {
        tokio::select! {
            // Transactions admitted over RPC gossip out to the other peers.
            Some(tx) = tx_receiver.recv() => {
                outbound.broadcast_transaction(tx).await;
            }
            Some(event) = gateway.next_event() => match event {
                GatewayEvent::MessageReceived(message) => {
                    replica.deliver(message).await;
                }
                GatewayEvent::BlockReceived(block) => {
                    replica.deliver_block_proposal(block).await;
                }
                GatewayEvent::TransactionReceived(tx) => {
                    if let Err(e) = mempool.add(tx) {
                        log::debug!("Rejected gossiped transaction: {e}");
                    }
                }
                GatewayEvent::PeerConnected { peer_id, address } => {
                    log::info!("Peer connected: {peer_id}");
                    if let Err(e) = kv.hset("validatorPeers", &peer_id, &address).await {
                        log::warn!("Failed to record peer mapping: {e}");
                    }
                }
            },
            _ = round_timer.tick() => {
                replica.on_round_tick().await;
            }
            _ = refresh_timer.tick() => {
                if let Err(e) = registry.refresh().await {
                    log::warn!("Registry refresh failed: {e}");
                }
            }
            _ = sweep_timer.tick() => {
                mempool.sweep();
            }
            _ = view_change_timer.tick() => {
                replica.poll_view_change().await;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }

    // 9. Drain: consumers stop taking batches, pending acks settle, the
    // registry snapshot is flushed. Pending mempool entries stay put.
    for handle in consumer_handles {
        let _ = handle.await;
    }
    if let Err(e) = registry.flush().await {
        log::warn!("Registry flush failed: {e}");
    }
    let _ = rpc_handle.stop();
    rpc_handle.stopped().await;
    log::info!("Validator {address} shutdown complete");
    Ok(())
}
