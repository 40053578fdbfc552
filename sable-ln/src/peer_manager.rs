//! Dialing and accepting BOLT peer connections: seeding candidates from the
//! channel graph, recent peers, the fallback lists, or (eventually) the DNS
//! seeds, and throttling reconnect attempts.

use std::{
    collections::HashMap,
    ops::{BitOr, BitOrAssign},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use anyhow::Context;
use bech32::FromBase32;
use bitcoin::secp256k1::PublicKey;
use once_cell::sync::OnceCell;
use rand::seq::SliceRandom;
use sable_tokio::{shutdown::ShutdownSignal, task::Task};
use tokio::{net::TcpListener, sync::mpsc, time};
use tracing::{info, info_span, warn};

use crate::{
    config::{Config, LnNetwork},
    keys::NodeKeypair,
    now_unix,
    peer_addr::{
        self, choose_preferred_address, NodePk, PeerAddress,
    },
    traits::{ChannelGraph, DnsResolver, PeerConnector, PeerHost, PeerSession},
};

/// How many live peer sessions the background dialer aims for.
pub const NUM_PEERS_TARGET: usize = 4;
/// Don't redial an address more often than this.
pub const PEER_RETRY_INTERVAL: Duration = Duration::from_secs(600);
/// Redial interval for peers we have a channel with.
pub const PEER_RETRY_INTERVAL_FOR_CHANNELS: Duration =
    Duration::from_secs(30);

/// BOLT-9 local feature bits we understand.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LnFeatures(pub u64);

impl LnFeatures {
    pub const OPTION_DATA_LOSS_PROTECT_REQ: Self = Self(1 << 0);
    pub const OPTION_DATA_LOSS_PROTECT_OPT: Self = Self(1 << 1);
    pub const GOSSIP_QUERIES_REQ: Self = Self(1 << 6);
    pub const GOSSIP_QUERIES_OPT: Self = Self(1 << 7);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for LnFeatures {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LnFeatures {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// Well-known nodes we fall back to when neither the graph nor the recent-peer
// list yields a candidate. The duplicate mainnet entries are carried over
// from upstream and are harmless.
const FALLBACK_NODE_LIST_TESTNET: &[(&str, u16, &str)] = &[
    ("ecdsa.net", 9735, "038370f0e7a03eded3e1d41dc081084a87f0afa1c5b22090b4f3abb391eb15d8ff"),
    ("148.251.87.112", 9735, "021a8bd8d8f1f2e208992a2eb755cdc74d44e66b6a0c924d3a3cce949123b9ce40"),
    ("122.199.61.90", 9735, "038863cf8ab91046230f561cd5b386cbff8309fa02e3f0c3ed161a3aeb64a643b9"),
];

const FALLBACK_NODE_LIST_MAINNET: &[(&str, u16, &str)] = &[
    ("52.168.166.221", 9735, "0214382bdce7750dfcb8126df8e2b12de38536902dc36abcebdaeefdeca1df8284"),
    ("35.230.100.60", 9735, "023f5e3582716bed96f6f26cfcd8037e07474d7b4743afdc8b07e692df63464d7e"),
    ("40.69.71.114", 9735, "028303182c9885da93b3b25c9621d22cf34475e63c123942e402ab530c0556e675"),
    ("62.210.110.5", 9735, "0276e09a267592e7451a939c932cf685f0754de382a3ca85d2fb3a864d4c365ad5"),
    ("34.236.113.58", 9735, "02fa50c72ee1e2eb5f1b6d9c3032080c4c864373c4201dfa2966aa34eee1051f97"),
    ("52.168.166.221", 9735, "0214382bdce7750dfcb8126df8e2b12de38536902dc36abcebdaeefdeca1df8284"),
    ("34.236.113.58", 9735, "02fa50c72ee1e2eb5f1b6d9c3032080c4c864373c4201dfa2966aa34eee1051f97"),
];

fn fallback_node_list(network: LnNetwork) -> Vec<PeerAddress> {
    let entries = match network {
        LnNetwork::Mainnet => FALLBACK_NODE_LIST_MAINNET,
        LnNetwork::Testnet => FALLBACK_NODE_LIST_TESTNET,
        LnNetwork::Regtest => return Vec::new(),
    };
    entries
        .iter()
        .map(|(host, port, pk_hex)| {
            let node_pk = pk_hex
                .parse::<NodePk>()
                .expect("fallback node list pubkeys are valid");
            PeerAddress::new(*host, *port, node_pk)
        })
        .collect()
}

/// Maintains the set of live peer sessions for one worker personality. The
/// wallet worker and the gossip worker each own one of these.
pub struct PeerManager {
    keypair: NodeKeypair,
    features: LnFeatures,
    network: LnNetwork,
    config: Config,
    connector: Arc<dyn PeerConnector>,
    graph: Arc<dyn ChannelGraph>,
    dns: Arc<dyn DnsResolver>,
    /// node_pk -> live session. At most one session per pubkey.
    peers: Mutex<HashMap<NodePk, Arc<dyn PeerSession>>>,
    /// PeerAddress -> unix time of the last dial attempt.
    last_tried: Mutex<HashMap<PeerAddress, u64>>,
    /// Back-handle to the owning worker, bound after the worker is built.
    host: OnceCell<Weak<dyn PeerHost>>,
    /// Peer message loops are handed to the worker's task group over this.
    task_tx: mpsc::Sender<Task<()>>,
    shutdown: ShutdownSignal,
}

impl PeerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: NodeKeypair,
        features: LnFeatures,
        network: LnNetwork,
        config: Config,
        connector: Arc<dyn PeerConnector>,
        graph: Arc<dyn ChannelGraph>,
        dns: Arc<dyn DnsResolver>,
        task_tx: mpsc::Sender<Task<()>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            keypair,
            features,
            network,
            config,
            connector,
            graph,
            dns,
            peers: Mutex::new(HashMap::new()),
            last_tried: Mutex::new(HashMap::new()),
            host: OnceCell::new(),
            task_tx,
            shutdown,
        }
    }

    /// Must be called exactly once, right after the owning worker is wrapped
    /// in its [`Arc`].
    pub fn bind_host(&self, host: Weak<dyn PeerHost>) {
        if self.host.set(host).is_err() {
            panic!("PeerManager host already bound");
        }
    }

    fn host(&self) -> Weak<dyn PeerHost> {
        self.host
            .get()
            .cloned()
            .expect("PeerManager host must be bound before connecting")
    }

    pub fn keypair(&self) -> &NodeKeypair {
        &self.keypair
    }

    pub fn node_pk(&self) -> NodePk {
        self.keypair.node_pk()
    }

    pub fn features(&self) -> LnFeatures {
        self.features
    }

    pub fn network(&self) -> LnNetwork {
        self.network
    }

    pub fn num_peers(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn get_peer(&self, node_pk: &NodePk) -> Option<Arc<dyn PeerSession>> {
        self.peers.lock().unwrap().get(node_pk).cloned()
    }

    pub fn contains_peer(&self, node_pk: &NodePk) -> bool {
        self.peers.lock().unwrap().contains_key(node_pk)
    }

    pub fn peers_snapshot(&self) -> Vec<Arc<dyn PeerSession>> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    /// Called (indirectly) by a session's main loop when it exits.
    pub fn remove_peer(
        &self,
        node_pk: &NodePk,
    ) -> Option<Arc<dyn PeerSession>> {
        self.peers.lock().unwrap().remove(node_pk)
    }

    pub fn last_tried_at(&self, addr: &PeerAddress) -> Option<u64> {
        self.last_tried.lock().unwrap().get(addr).copied()
    }

    fn stamp_last_tried(&self, addr: PeerAddress) {
        self.last_tried.lock().unwrap().insert(addr, now_unix());
    }

    /// The background dialer: tops the peer set back up to
    /// [`NUM_PEERS_TARGET`], once per second.
    pub async fn main_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                () = shutdown.recv() => return,
                () = time::sleep(Duration::from_secs(1)) => (),
            }
            let now = now_unix();
            if self.num_peers() >= NUM_PEERS_TARGET {
                continue;
            }
            for candidate in self.get_next_peers_to_try().await {
                let last_tried =
                    self.last_tried_at(&candidate).unwrap_or(0);
                if last_tried + PEER_RETRY_INTERVAL.as_secs() < now {
                    self.spawn_add_peer(candidate);
                }
            }
        }
    }

    /// Dial `addr` and register the resulting session. Returns the existing
    /// session when the pubkey is already connected.
    pub async fn add_peer(
        self: &Arc<Self>,
        addr: &PeerAddress,
    ) -> anyhow::Result<Arc<dyn PeerSession>> {
        if let Some(peer) = self.get_peer(&addr.node_pk) {
            return Ok(peer);
        }
        self.stamp_last_tried(addr.clone());
        info!("adding peer {addr}");
        let peer = self
            .connector
            .connect(&self.keypair, self.features, addr, self.host())
            .await
            .with_context(|| format!("Could not connect to {addr}"))?;
        self.register_peer(peer.clone());
        Ok(peer)
    }

    /// Fire-and-forget [`add_peer`](Self::add_peer): the dial and handshake
    /// run in their own task so they never block a caller's loop. Failures
    /// are logged and discarded.
    pub fn spawn_add_peer(self: &Arc<Self>, addr: PeerAddress) {
        let this = self.clone();
        self.send_to_task_group(Task::spawn("(ln-dial)", async move {
            if let Err(e) = this.add_peer(&addr).await {
                info!("Peer dial failed: {e:#}");
            }
        }));
    }

    /// Dial the peers listed in the host config.
    pub fn add_peers_from_config(self: &Arc<Self>) {
        for peer in &self.config.lightning_peers {
            let node_pk = match peer.pubkey.parse::<NodePk>() {
                Ok(pk) => pk,
                Err(_) => {
                    warn!("Bad pubkey in lightning_peers: {}", peer.pubkey);
                    continue;
                }
            };
            self.spawn_add_peer(PeerAddress::new(
                peer.host.clone(),
                peer.port,
                node_pk,
            ));
        }
    }

    /// Accept inbound BOLT connections iff `lightning_listen` is configured.
    pub async fn maybe_listen(self: Arc<Self>) {
        let listen = match &self.config.lightning_listen {
            Some(listen) => listen.clone(),
            None => return,
        };
        let (host, port) = match peer_addr::split_host_port(&listen) {
            Ok(host_port) => host_port,
            Err(e) => {
                warn!("Bad lightning_listen address: {e}");
                return;
            }
        };
        let listener = match TcpListener::bind((host.as_str(), port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Could not listen on {listen}: {e}");
                return;
            }
        };
        info!("accepting LN connections on {listen}");

        let mut shutdown = self.shutdown.clone();
        loop {
            let (stream, remote) = tokio::select! {
                () = shutdown.recv() => return,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept() failed: {e}");
                        continue;
                    }
                },
            };
            let this = self.clone();
            self.send_to_task_group(Task::spawn(
                "(ln-inbound)",
                async move {
                    let result = this
                        .connector
                        .accept(
                            &this.keypair,
                            this.features,
                            stream,
                            this.host(),
                        )
                        .await;
                    match result {
                        Ok(peer) => this.register_peer(peer),
                        Err(e) => info!(
                            "handshake failure from incoming connection \
                             {remote}: {e:#}"
                        ),
                    }
                },
            ));
        }
    }

    fn register_peer(self: &Arc<Self>, peer: Arc<dyn PeerSession>) {
        let node_pk = peer.node_pk();
        self.peers.lock().unwrap().insert(node_pk, peer.clone());

        let name = format!("(peer-{})", &node_pk.to_string()[..8]);
        let task = Task::spawn_with_span(
            name,
            info_span!("(peer)", %node_pk),
            peer.run_main_loop(),
        );
        self.send_to_task_group(task);
    }

    fn send_to_task_group(&self, task: Task<()>) {
        if let Err(e) = self.task_tx.try_send(task) {
            // Task group gone (shutdown) or saturated; let it run detached.
            match e {
                mpsc::error::TrySendError::Full(task)
                | mpsc::error::TrySendError::Closed(task) => task.detach(),
            }
        }
    }

    /// Candidate selection: recent peers from the graph, then a random
    /// unconnected graph node, then the per-network fallback list. The DNS
    /// seed path stays disabled below.
    async fn get_next_peers_to_try(&self) -> Vec<PeerAddress> {
        self.graph.wait_data_loaded().await;
        let now = now_unix();

        // Prune stale last-tried entries so membership alone disqualifies a
        // candidate below.
        {
            let mut last_tried = self.last_tried.lock().unwrap();
            last_tried.retain(|_, tried| {
                now < *tried + PEER_RETRY_INTERVAL.as_secs()
            });
        }

        // First try from recent peers.
        let connected: std::collections::HashSet<NodePk> =
            self.peers.lock().unwrap().keys().copied().collect();
        for peer in self.graph.get_recent_peers() {
            if connected.contains(&peer.node_pk) {
                continue;
            }
            if self.last_tried_at(&peer).is_some() {
                continue;
            }
            return vec![peer];
        }

        // Try a random unconnected node from the graph.
        for node_pk in self.graph.get_nodes_not_in(&connected) {
            let addrs = self.graph.get_node_addresses(&node_pk);
            let preferred = match choose_preferred_address(&addrs) {
                Some(preferred) => preferred,
                None => continue,
            };
            let peer = PeerAddress::new(
                preferred.host.clone(),
                preferred.port,
                node_pk,
            );
            if self.last_tried_at(&peer).is_some() {
                continue;
            }
            return vec![peer];
        }

        // Fall back to the hardcoded per-network list.
        let fallback = fallback_node_list(self.network);
        if let Some(peer) = fallback.choose(&mut rand::thread_rng()) {
            return vec![peer.clone()];
        }
        if self.network != LnNetwork::Regtest {
            // Unreachable while the fallback lists are non-empty: the DNS
            // seeds ignore the realm byte and return mainnet nodes for every
            // network, so seeding stays disabled upstream.
            return self.peers_from_dns_seed().await;
        }
        Vec::new()
    }

    /// Query a LN DNS seed for peers. Returns several peers per query to
    /// keep the number of DNS round trips down.
    async fn peers_from_dns_seed(&self) -> Vec<PeerAddress> {
        let seeds = self.network.dns_seeds();
        let seed = match seeds.choose(&mut rand::thread_rng()) {
            Some(seed) => *seed,
            None => return Vec::new(),
        };
        info!("asking dns seed {seed} for ln peers");
        let query = format!("r{}.{}", self.network.realm_byte(), seed);
        let mut srv_answers = match self.dns.resolve_srv(&query).await {
            Ok(answers) => answers,
            Err(e) => {
                info!("dns seed query failed: {e:#}");
                return Vec::new();
            }
        };
        srv_answers.shuffle(&mut rand::thread_rng());
        srv_answers.truncate(2 * NUM_PEERS_TARGET);

        // The SRV answers carry bech32 node ids and ports; the host still
        // needs resolving.
        let mut peers = Vec::new();
        for srv in srv_answers {
            let ips = match self.dns.resolve_host(&srv.host).await {
                Ok(ips) if !ips.is_empty() => ips,
                _ => continue,
            };
            let bech32_pk =
                srv.host.split('.').next().unwrap_or_default();
            let node_pk = match node_pk_from_bech32(bech32_pk) {
                Some(node_pk) => node_pk,
                None => {
                    info!("error parsing peer from dns seed: {}", srv.host);
                    continue;
                }
            };
            peers.push(PeerAddress::new(
                ips[0].to_string(),
                srv.port,
                node_pk,
            ));
        }
        info!("got {} ln peers from dns seed", peers.len());
        peers
    }
}

/// Decode the bech32-encoded compressed pubkey the DNS seeds embed in SRV
/// hostnames.
fn node_pk_from_bech32(encoded: &str) -> Option<NodePk> {
    let (_hrp, data, _variant) = bech32::decode(encoded).ok()?;
    let bytes = Vec::<u8>::from_base32(&data).ok()?;
    PublicKey::from_slice(&bytes).ok().map(NodePk)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fallback_lists_parse() {
        assert_eq!(
            fallback_node_list(LnNetwork::Mainnet).len(),
            FALLBACK_NODE_LIST_MAINNET.len()
        );
        assert_eq!(
            fallback_node_list(LnNetwork::Testnet).len(),
            FALLBACK_NODE_LIST_TESTNET.len()
        );
        assert!(fallback_node_list(LnNetwork::Regtest).is_empty());
    }

    #[test]
    fn feature_bits_compose() {
        let mut features = LnFeatures::empty();
        features |= LnFeatures::OPTION_DATA_LOSS_PROTECT_OPT;
        features |= LnFeatures::GOSSIP_QUERIES_OPT;
        assert!(features.contains(LnFeatures::OPTION_DATA_LOSS_PROTECT_OPT));
        assert!(!features.contains(LnFeatures::OPTION_DATA_LOSS_PROTECT_REQ));
    }

    #[test]
    fn bech32_node_ids_decode() {
        use bech32::ToBase32;
        let pk = crate::test_support::dummy_node_pk(5);
        let encoded = bech32::encode(
            "ln",
            pk.0.serialize().to_base32(),
            bech32::Variant::Bech32,
        )
        .unwrap();
        assert_eq!(node_pk_from_bech32(&encoded), Some(pk));
        assert!(node_pk_from_bech32("not-bech32").is_none());
    }
}
