use crate::replica::Outbound;
use crate::types::{Block, ConsensusMessage, Transaction};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    Multiaddr, gossipsub, mdns, noise, swarm::NetworkBehaviour, swarm::SwarmEvent, tcp, yamux,
};
use std::collections::hash_map::DefaultHasher;
use std::error::Error;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::sync::mpsc;

const TOPIC_CONSENSUS: &str = "tripcoin-consensus";
const TOPIC_BLOCKS: &str = "tripcoin-blocks";
const TOPIC_TRANSACTIONS: &str = "tripcoin-transactions";

/// Gossipsub for validator traffic plus mDNS for local discovery.
#[derive(NetworkBehaviour)]
pub struct GatewayBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
}

/// Events surfaced from the network task to the node.
#[derive(Debug)]
pub enum GatewayEvent {
    MessageReceived(ConsensusMessage),
    BlockReceived(Block),
    TransactionReceived(Transaction),
    PeerConnected { peer_id: String, address: String },
}

#[derive(Debug)]
enum GatewayCommand {
    BroadcastMessage(ConsensusMessage),
    BroadcastBlock(Block),
    BroadcastTransaction(Transaction),
    Dial(Multiaddr),
}

/// The network interface. Owns the swarm in a background task and talks to
/// the rest of the node over channels only.
pub struct Gateway {
    command_sender: mpsc::Sender<GatewayCommand>,
    event_receiver: mpsc::Receiver<GatewayEvent>,
}

impl Gateway {
    pub async fn new(port: u16) -> Result<Self, Box<dyn Error>> {
        let (command_sender, mut command_receiver) = mpsc::channel(256);
        let (event_sender, event_receiver) = mpsc::channel(256);

        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key| {
                let message_id_fn = |message: &gossipsub::Message| {
                    let mut s = DefaultHasher::new();
                    message.data.hash(&mut s);
                    gossipsub::MessageId::from(s.finish().to_string())
                };
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .message_id_fn(message_id_fn)
                    .build()
                    .map_err(std::io::Error::other)?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )?;

                let mdns = mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )?;

                Ok(GatewayBehaviour { gossipsub, mdns })
            })?
            .build();

        let addr = format!("/ip4/0.0.0.0/tcp/{port}").parse()?;
        swarm.listen_on(addr)?;

        for topic in [TOPIC_CONSENSUS, TOPIC_BLOCKS, TOPIC_TRANSACTIONS] {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&gossipsub::IdentTopic::new(topic))?;
        }

        tokio::spawn(async move {
            let consensus_topic = gossipsub::IdentTopic::new(TOPIC_CONSENSUS).hash();
            let blocks_topic = gossipsub::IdentTopic::new(TOPIC_BLOCKS).hash();
            let tx_topic = gossipsub::IdentTopic::new(TOPIC_TRANSACTIONS).hash();

            loop {
                tokio::select! {
                    event = swarm.select_next_some() => match event {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            log::info!("Gateway listening on {address}");
                        },
                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                            let _ = event_sender.send(GatewayEvent::PeerConnected {
                                peer_id: peer_id.to_string(),
                                address: endpoint.get_remote_address().to_string(),
                            }).await;
                        },
                        SwarmEvent::OutgoingConnectionError { error, .. } => {
                            log::debug!("Outgoing connection error: {error}");
                        },
                        SwarmEvent::Behaviour(GatewayBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                            for (peer_id, multiaddr) in list {
                                log::info!("mDNS discovered peer {peer_id}");
                                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                                let _ = event_sender.send(GatewayEvent::PeerConnected {
                                    peer_id: peer_id.to_string(),
                                    address: multiaddr.to_string(),
                                }).await;
                            }
                        },
                        SwarmEvent::Behaviour(GatewayBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                            for (peer_id, _multiaddr) in list {
                                log::debug!("mDNS peer expired: {peer_id}");
                                swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                            }
                        },
                        SwarmEvent::Behaviour(GatewayBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. })) => {
                            if message.topic == consensus_topic {
                                match serde_json::from_slice::<ConsensusMessage>(&message.data) {
                                    Ok(m) => { let _ = event_sender.send(GatewayEvent::MessageReceived(m)).await; }
                                    Err(e) => log::debug!("Undecodable consensus payload: {e}"),
                                }
                            } else if message.topic == blocks_topic {
                                match serde_json::from_slice::<Block>(&message.data) {
                                    Ok(b) => { let _ = event_sender.send(GatewayEvent::BlockReceived(b)).await; }
                                    Err(e) => log::debug!("Undecodable block payload: {e}"),
                                }
                            } else if message.topic == tx_topic {
                                match serde_json::from_slice::<Transaction>(&message.data) {
                                    Ok(t) => { let _ = event_sender.send(GatewayEvent::TransactionReceived(t)).await; }
                                    Err(e) => log::debug!("Undecodable transaction payload: {e}"),
                                }
                            }
                        },
                        _ => {}
                    },
                    command = command_receiver.recv() => match command {
                        Some(command) => publish(&mut swarm, command),
                        None => break,
                    }
                }
            }
        });

        Ok(Gateway {
            command_sender,
            event_receiver,
        })
    }

    /// A cloneable outbound handle for the replica and the RPC surface.
    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            command_sender: self.command_sender.clone(),
        }
    }

    pub async fn next_event(&mut self) -> Option<GatewayEvent> {
        self.event_receiver.recv().await
    }

    pub async fn dial(&self, addr: &str) {
        self.handle().dial(addr).await;
    }
}

fn publish(swarm: &mut libp2p::Swarm<GatewayBehaviour>, command: GatewayCommand) {
    let (topic, data) = match &command {
        GatewayCommand::BroadcastMessage(m) => (TOPIC_CONSENSUS, serde_json::to_vec(m)),
        GatewayCommand::BroadcastBlock(b) => (TOPIC_BLOCKS, serde_json::to_vec(b)),
        GatewayCommand::BroadcastTransaction(t) => (TOPIC_TRANSACTIONS, serde_json::to_vec(t)),
        GatewayCommand::Dial(addr) => {
            if let Err(e) = swarm.dial(addr.clone()) {
                log::debug!("Dial error: {e}");
            }
            return;
        }
    };
    let data = match data {
        Ok(d) => d,
        Err(e) => {
            log::error!("Failed to serialize outbound payload: {e}");
            return;
        }
    };
    if let Err(e) = swarm
        .behaviour_mut()
        .gossipsub
        .publish(gossipsub::IdentTopic::new(topic), data)
    {
        match e {
            gossipsub::PublishError::Duplicate => {}
            _ => log::debug!("Publish error: {e}"),
        }
    }
}

#[derive(Clone)]
pub struct GatewayHandle {
    command_sender: mpsc::Sender<GatewayCommand>,
}

impl GatewayHandle {
    pub async fn dial(&self, addr: &str) {
        match addr.parse() {
            Ok(multiaddr) => {
                let _ = self
                    .command_sender
                    .send(GatewayCommand::Dial(multiaddr))
                    .await;
            }
            Err(e) => log::warn!("Ignoring undialable seed {addr}: {e}"),
        }
    }

    pub async fn broadcast_transaction(&self, tx: Transaction) {
        let _ = self
            .command_sender
            .send(GatewayCommand::BroadcastTransaction(tx))
            .await;
    }

    /// Dial the configured seed URIs, backing off exponentially from 1 s up
    /// to a 60 s cap, until shutdown.
    pub fn spawn_seed_dialer(
        &self,
        seeds: Vec<String>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                for seed in &seeds {
                    handle.dial(seed).await;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
        });
    }
}

#[async_trait]
impl Outbound for GatewayHandle {
    async fn broadcast(&self, message: ConsensusMessage) {
        let _ = self
            .command_sender
            .send(GatewayCommand::BroadcastMessage(message))
            .await;
    }

    async fn broadcast_block(&self, block: Block) {
        let _ = self
            .command_sender
            .send(GatewayCommand::BroadcastBlock(block))
            .await;
    }
}
