//! The Peer Router (spec.md §4.2): a Kademlia DHT over which nodes
//! advertise the content keys they hold and resolve which peers hold a
//! given key. Everything here runs inside one background task that owns
//! the `libp2p::Swarm`; callers only ever see a cheap, `Clone`-able handle
//! that talks to it over channels, the same shape `peoci::ocidist::Client`
//! uses to keep its moka-backed state behind an `Arc`.

use std::time::Duration;

use futures::StreamExt;
use libp2p::core::Multiaddr;
use libp2p::kad::{self, store::MemoryStore as KadMemoryStore};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identify, identity, noise, tcp, yamux, PeerId, Swarm};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Transport(#[from] libp2p::TransportError<std::io::Error>),
    Noise(#[from] libp2p::noise::Error),
    Behaviour(String),
    RouterStopped,
    BadAddr(#[from] libp2p::multiaddr::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A peer known to hold a given content key, as reported by the DHT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Addresses this node listens for inbound DHT connections on.
    pub listen_addrs: Vec<Multiaddr>,
    /// Peers dialed on startup to join the existing swarm.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// How often a full resync re-announces every advertised key.
    pub reprovide_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addrs: Vec::new(),
            bootstrap_peers: Vec::new(),
            reprovide_interval: Duration::from_secs(22 * 60 * 60),
        }
    }
}

#[derive(NetworkBehaviour)]
struct Behaviour {
    kad: kad::Behaviour<KadMemoryStore>,
    identify: identify::Behaviour,
}

enum Command {
    Advertise {
        key: kad::RecordKey,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Unadvertise {
        key: kad::RecordKey,
    },
    Resolve {
        key: kad::RecordKey,
        tx: mpsc::Sender<Peer>,
    },
    HasPeers {
        reply: oneshot::Sender<bool>,
    },
}

/// Cheap, cloneable handle to a running router. Dropping every clone stops
/// the background task once its command channel closes.
#[derive(Clone)]
pub struct PeerRouter {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
}

impl PeerRouter {
    pub async fn spawn(config: Config) -> Result<(PeerRouter, JoinHandle<()>), Error> {
        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(keypair.public());

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key| {
                let peer_id = PeerId::from(key.public());
                let kad = kad::Behaviour::new(peer_id, KadMemoryStore::new(peer_id));
                let identify = identify::Behaviour::new(identify::Config::new(
                    "/cluster-mirror/0.1.0".to_string(),
                    key.public(),
                ));
                Behaviour { kad, identify }
            })
            .map_err(|e| Error::Behaviour(format!("{e:?}")))?
            .build();

        for addr in &config.listen_addrs {
            swarm.listen_on(addr.clone())?;
        }
        for addr in &config.bootstrap_peers {
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!("router: failed dialing bootstrap peer {addr}: {e:?}");
            }
        }

        swarm
            .behaviour_mut()
            .kad
            .set_mode(Some(kad::Mode::Server));

        let (commands, command_rx) = mpsc::channel(64);
        let worker = Worker {
            swarm,
            commands: command_rx,
            advertised: Default::default(),
            pending_start_providing: Default::default(),
            pending_get_providers: Default::default(),
            reprovide_interval: config.reprovide_interval,
        };
        let handle = tokio::spawn(worker.run());

        Ok((
            PeerRouter {
                local_peer_id,
                commands,
            },
            handle,
        ))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub async fn advertise(&self, key: impl AsRef<[u8]>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Advertise {
                key: kad::RecordKey::new(&key.as_ref()),
                reply,
            })
            .await
            .map_err(|_| Error::RouterStopped)?;
        rx.await.map_err(|_| Error::RouterStopped)?
    }

    pub async fn unadvertise(&self, key: impl AsRef<[u8]>) -> Result<(), Error> {
        self.commands
            .send(Command::Unadvertise {
                key: kad::RecordKey::new(&key.as_ref()),
            })
            .await
            .map_err(|_| Error::RouterStopped)
    }

    /// Streams peers holding `key`. Only the first item is subject to
    /// `first_item_deadline`: once a peer has been yielded, the stream is
    /// drained to completion (or until the receiver is dropped) with no
    /// further time bound, since a caller that already started forwarding
    /// from one peer must never have its other candidates silently cut.
    pub async fn resolve(&self, key: impl AsRef<[u8]>, first_item_deadline: Duration) -> mpsc::Receiver<Peer> {
        let (internal_tx, mut internal_rx) = mpsc::channel(32);
        let (external_tx, external_rx) = mpsc::channel(32);

        if self
            .commands
            .send(Command::Resolve {
                key: kad::RecordKey::new(&key.as_ref()),
                tx: internal_tx,
            })
            .await
            .is_err()
        {
            return external_rx;
        }

        tokio::spawn(async move {
            let first = tokio::time::timeout(first_item_deadline, internal_rx.recv()).await;
            let Ok(Some(peer)) = first else {
                return;
            };
            if external_tx.send(peer).await.is_err() {
                return;
            }
            while let Some(peer) = internal_rx.recv().await {
                if external_tx.send(peer).await.is_err() {
                    break;
                }
            }
        });

        external_rx
    }

    pub async fn has_peers(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::HasPeers { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

struct Worker {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<Command>,
    advertised: std::collections::HashSet<kad::RecordKey>,
    pending_start_providing: std::collections::HashMap<kad::QueryId, oneshot::Sender<Result<(), Error>>>,
    pending_get_providers: std::collections::HashMap<kad::QueryId, mpsc::Sender<Peer>>,
    reprovide_interval: Duration,
}

impl Worker {
    async fn run(mut self) {
        let mut reprovide = tokio::time::interval(self.reprovide_interval);
        reprovide.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            info!("router: command channel closed, shutting down");
                            break;
                        }
                    }
                }
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                _ = reprovide.tick() => self.reprovide_all(),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Advertise { key, reply } => {
                match self.swarm.behaviour_mut().kad.start_providing(key.clone()) {
                    Ok(id) => {
                        self.advertised.insert(key);
                        self.pending_start_providing.insert(id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(Error::Behaviour(format!("{e:?}"))));
                    }
                }
            }
            Command::Unadvertise { key } => {
                self.advertised.remove(&key);
                self.swarm.behaviour_mut().kad.stop_providing(&key);
            }
            Command::Resolve { key, tx } => {
                let id = self.swarm.behaviour_mut().kad.get_providers(key);
                self.pending_get_providers.insert(id, tx);
            }
            Command::HasPeers { reply } => {
                let has_peers = self.swarm.connected_peers().next().is_some();
                let _ = reply.send(has_peers);
            }
        }
    }

    fn reprovide_all(&mut self) {
        debug!("router: reprovide tick, {} keys", self.advertised.len());
        for key in self.advertised.clone() {
            if let Err(e) = self.swarm.behaviour_mut().kad.start_providing(key) {
                warn!("router: reprovide failed: {e:?}");
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                id,
                result,
                ..
            })) => self.handle_query_result(id, result),
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("router: listening on {address}");
            }
            _ => {}
        }
    }

    fn handle_query_result(&mut self, id: kad::QueryId, result: kad::QueryResult) {
        match result {
            kad::QueryResult::StartProviding(result) => {
                if let Some(reply) = self.pending_start_providing.remove(&id) {
                    let _ = reply.send(
                        result
                            .map(|_| ())
                            .map_err(|e| Error::Behaviour(format!("{e:?}"))),
                    );
                }
            }
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                if let Some(tx) = self.pending_get_providers.get(&id) {
                    for peer_id in providers {
                        let addresses = self
                            .swarm
                            .behaviour_mut()
                            .kad
                            .kbucket(peer_id)
                            .map(|bucket| {
                                bucket
                                    .iter()
                                    .filter(|entry| *entry.node.key.preimage() == peer_id)
                                    .flat_map(|entry| entry.node.value.iter().cloned())
                                    .collect()
                            })
                            .unwrap_or_default();
                        let _ = tx.try_send(Peer { peer_id, addresses });
                    }
                }
            }
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord {
                ..
            }))
            | kad::QueryResult::GetProviders(Err(_)) => {
                self.pending_get_providers.remove(&id);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_reprovide_interval() {
        let config = Config::default();
        assert!(config.reprovide_interval >= Duration::from_secs(60 * 60));
    }

    #[tokio::test]
    async fn resolve_times_out_with_no_peers() {
        let (router, _handle) = PeerRouter::spawn(Config::default()).await.unwrap();
        let mut rx = router
            .resolve(b"sha256:deadbeef", Duration::from_millis(50))
            .await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn has_peers_false_when_isolated() {
        let (router, _handle) = PeerRouter::spawn(Config::default()).await.unwrap();
        assert!(!router.has_peers().await);
    }
}
