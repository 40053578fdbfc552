//! Shared test fixtures: in-memory implementations of every collaborator
//! trait, a mock channel state object, and a harness that wires a worker to
//! them.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    net::IpAddr,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use anyhow::{bail, Context};
use async_trait::async_trait;
use bitcoin::{
    hashes::Hash as _,
    secp256k1::{PublicKey, Secp256k1, SecretKey},
    OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use sable_tokio::{shutdown::ShutdownSignal, task::Task};
use tokio::{net::TcpStream, sync::mpsc};

use crate::{
    channel::{
        ChannelConstraints, ChannelId, ChannelPhase, ChannelState,
        CommitmentPoints, Htlc, Side, SweepInfo,
    },
    config::{Config, LnNetwork},
    error::InvoiceError,
    invoice::{
        Bolt11Invoice, Direction, InvoiceParams, PaymentHash, RouteHint,
        MIN_FINAL_CLTV_EXPIRY_FOR_INVOICE,
    },
    keys::NodeKeypair,
    logger, now_unix,
    peer_addr::{NodeAddress, NodePk, PeerAddress},
    peer_manager::LnFeatures,
    route::{Route, RouteEdge},
    scid::ShortChannelId,
    traits::{
        ChainWatcher, ChannelGraph, ChannelLoader, DnsResolver, FeeEstimator,
        HostWallet, InvoiceCodec, PathFinder, PathHop, PaymentRequest,
        PeerConnector, PeerHost, PeerSession, RoutingPolicy, SrvRecord,
        TxBroadcast, TxConfirmation, WalletStore, Watchtower,
    },
    worker::{Collaborators, LnWallet},
};

static NEXT_FIXTURE_ID: AtomicU32 = AtomicU32::new(100);

fn next_fixture_id() -> u32 {
    NEXT_FIXTURE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A deterministic node id from a one-byte seed (must be nonzero).
pub fn dummy_node_pk(seed: u8) -> NodePk {
    assert_ne!(seed, 0);
    let secret = SecretKey::from_slice(&[seed; 32])
        .expect("a small repeated byte is a valid secret key");
    NodePk(PublicKey::from_secret_key(&Secp256k1::new(), &secret))
}

/// A minimal unique transaction (one input, one output).
pub fn dummy_tx(seed: u8) -> Transaction {
    Transaction {
        version: 2,
        lock_time: PackedLockTime(u32::from(seed)),
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_inner([seed; 32]), 0),
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: 10_000 + u64::from(seed),
            script_pubkey: Script::new(),
        }],
    }
}

pub fn sweep_info_with(
    name: &str,
    cltv_expiry: Option<u32>,
    csv_delay: Option<u32>,
    tx: Option<Transaction>,
) -> SweepInfo {
    SweepInfo {
        name: name.to_owned(),
        cltv_expiry,
        csv_delay,
        gen_tx: Arc::new(move || tx.clone()),
    }
}

// --- MemStore --- //

pub struct MemStore {
    data: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl WalletStore for MemStore {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.data.lock().unwrap().get(key).cloned()
    }
    fn put(&self, key: &str, value: serde_json::Value) {
        self.data.lock().unwrap().insert(key.to_owned(), value);
    }
    fn write(&self) {}
}

// --- MockChannel --- //

struct MockChannelInner {
    phase: ChannelPhase,
    scid: Option<ShortChannelId>,
    force_closed: bool,
    funding_spent: bool,
    local_msat: u64,
    remote_msat: u64,
    points_coincide: bool,
    /// htlc_id -> (htlc, preimage released by remote).
    received: BTreeMap<u64, (Htlc, bool)>,
    offered: BTreeMap<u64, Htlc>,
    latest_ctn: [u64; 2],
    oldest_unrevoked_ctn: [u64; 2],
    sweep_ctx: BTreeMap<String, SweepInfo>,
    sweep_htlc: Option<SweepInfo>,
    reestablish: bool,
    next_htlc_id: u64,
}

pub struct MockChannel {
    channel_id: ChannelId,
    node_pk: NodePk,
    funding: OutPoint,
    inner: Mutex<MockChannelInner>,
}

fn side_index(side: Side) -> usize {
    match side {
        Side::Local => 0,
        Side::Remote => 1,
    }
}

impl MockChannel {
    pub fn new(
        node_pk: NodePk,
        phase: ChannelPhase,
        local_msat: u64,
        remote_msat: u64,
    ) -> Arc<Self> {
        let n = next_fixture_id();
        let mut txid_bytes = [0u8; 32];
        txid_bytes[..4].copy_from_slice(&n.to_be_bytes());
        txid_bytes[31] = 0xcc;
        Arc::new(Self {
            channel_id: ChannelId::random(),
            node_pk,
            funding: OutPoint::new(Txid::from_inner(txid_bytes), 0),
            inner: Mutex::new(MockChannelInner {
                phase,
                scid: None,
                force_closed: false,
                funding_spent: false,
                local_msat,
                remote_msat,
                points_coincide: false,
                received: BTreeMap::new(),
                offered: BTreeMap::new(),
                latest_ctn: [0, 0],
                oldest_unrevoked_ctn: [0, 0],
                sweep_ctx: BTreeMap::new(),
                sweep_htlc: None,
                reestablish: false,
                next_htlc_id: 0,
            }),
        })
    }

    pub fn make_remote_points_coincide(&self) {
        self.inner.lock().unwrap().points_coincide = true;
    }

    pub fn set_oldest_unrevoked_ctn(&self, side: Side, ctn: u64) {
        self.inner.lock().unwrap().oldest_unrevoked_ctn
            [side_index(side)] = ctn;
    }

    pub fn set_sweep_ctx(&self, map: BTreeMap<String, SweepInfo>) {
        self.inner.lock().unwrap().sweep_ctx = map;
    }

    pub fn set_sweep_htlc(&self, info: SweepInfo) {
        self.inner.lock().unwrap().sweep_htlc = Some(info);
    }

    pub fn set_reestablish_wanted(&self, wanted: bool) {
        self.inner.lock().unwrap().reestablish = wanted;
    }

    fn push_htlc(
        &self,
        direction: Direction,
        amount_msat: u64,
        cltv_expiry: u32,
        released: bool,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let htlc_id = inner.next_htlc_id;
        inner.next_htlc_id += 1;
        let htlc = Htlc {
            htlc_id,
            amount_msat,
            payment_hash: PaymentHash([htlc_id as u8 + 1; 32]),
            cltv_expiry,
            timestamp: now_unix(),
        };
        match direction {
            Direction::Received => {
                inner.received.insert(htlc_id, (htlc, released));
            }
            Direction::Sent => {
                inner.offered.insert(htlc_id, htlc);
            }
        }
        htlc_id
    }

    pub fn add_received_htlc_with_released_preimage(
        &self,
        amount_msat: u64,
        cltv_expiry: u32,
    ) -> u64 {
        self.push_htlc(Direction::Received, amount_msat, cltv_expiry, true)
    }

    pub fn add_received_htlc(
        &self,
        amount_msat: u64,
        cltv_expiry: u32,
    ) -> u64 {
        self.push_htlc(Direction::Received, amount_msat, cltv_expiry, false)
    }

    pub fn add_offered_htlc(
        &self,
        amount_msat: u64,
        cltv_expiry: u32,
    ) -> u64 {
        self.push_htlc(Direction::Sent, amount_msat, cltv_expiry, false)
    }
}

impl ChannelState for MockChannel {
    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }
    fn node_id(&self) -> NodePk {
        self.node_pk
    }
    fn funding_outpoint(&self) -> OutPoint {
        self.funding
    }
    fn get_funding_address(&self) -> String {
        format!("bcrt1qfunding{}", self.funding.txid)
    }

    fn short_channel_id(&self) -> Option<ShortChannelId> {
        self.inner.lock().unwrap().scid
    }
    fn set_short_channel_id(&self, scid: ShortChannelId) {
        let mut inner = self.inner.lock().unwrap();
        // Once set, a short channel id never changes.
        assert!(inner.scid.is_none(), "scid assigned twice");
        inner.scid = Some(scid);
    }

    fn get_state(&self) -> ChannelPhase {
        self.inner.lock().unwrap().phase
    }
    fn set_state(&self, phase: ChannelPhase) {
        self.inner.lock().unwrap().phase = phase;
    }

    fn is_force_closed(&self) -> bool {
        self.inner.lock().unwrap().force_closed
    }
    fn set_force_closed(&self) {
        self.inner.lock().unwrap().force_closed = true;
    }
    fn set_funding_txo_spent(&self, spent: bool) {
        self.inner.lock().unwrap().funding_spent = spent;
    }

    fn constraints(&self) -> ChannelConstraints {
        ChannelConstraints {
            funding_txn_minimum_depth: 3,
        }
    }
    fn balance_msat(&self, side: Side) -> u64 {
        let inner = self.inner.lock().unwrap();
        match side {
            Side::Local => inner.local_msat,
            Side::Remote => inner.remote_msat,
        }
    }
    fn remote_dust_limit_sat(&self) -> u64 {
        546
    }
    fn remote_commitment_points(&self) -> CommitmentPoints {
        let point_a = dummy_node_pk(0x51).0;
        let point_b = if self.inner.lock().unwrap().points_coincide {
            point_a
        } else {
            dummy_node_pk(0x52).0
        };
        CommitmentPoints {
            current: Some(point_a),
            next: Some(point_b),
        }
    }

    fn get_latest_ctn(&self, side: Side) -> u64 {
        self.inner.lock().unwrap().latest_ctn[side_index(side)]
    }
    fn get_oldest_unrevoked_ctn(&self, side: Side) -> u64 {
        self.inner.lock().unwrap().oldest_unrevoked_ctn[side_index(side)]
    }

    fn htlcs_by_direction(
        &self,
        subject: Side,
        direction: Direction,
        _ctn: u64,
    ) -> BTreeMap<u64, Htlc> {
        let inner = self.inner.lock().unwrap();
        let received_view = matches!(
            (subject, direction),
            (Side::Local, Direction::Received)
                | (Side::Remote, Direction::Sent)
        );
        if received_view {
            inner
                .received
                .iter()
                .map(|(id, (htlc, _))| (*id, htlc.clone()))
                .collect()
        } else {
            inner.offered.clone()
        }
    }

    fn was_htlc_preimage_released(
        &self,
        htlc_id: u64,
        htlc_sender: Side,
    ) -> bool {
        if htlc_sender != Side::Remote {
            return false;
        }
        self.inner
            .lock()
            .unwrap()
            .received
            .get(&htlc_id)
            .map(|(_, released)| *released)
            .unwrap_or(false)
    }

    fn get_latest_feerate(&self, _side: Side) -> u32 {
        2_500
    }
    fn should_try_to_reestablish_peer(&self) -> bool {
        self.inner.lock().unwrap().reestablish
    }

    fn force_close_tx(&self) -> Transaction {
        // Deterministic per channel: spends the funding output.
        Transaction {
            version: 2,
            lock_time: PackedLockTime(0),
            input: vec![TxIn {
                previous_output: self.funding,
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: 20_000,
                script_pubkey: Script::new(),
            }],
        }
    }

    fn sweep_ctx(
        &self,
        _closing_tx: &Transaction,
    ) -> BTreeMap<String, SweepInfo> {
        self.inner.lock().unwrap().sweep_ctx.clone()
    }

    fn sweep_htlc(
        &self,
        _closing_tx: &Transaction,
        _spender_tx: &Transaction,
    ) -> Option<SweepInfo> {
        self.inner.lock().unwrap().sweep_htlc.clone()
    }

    fn create_sweeptxs(&self, ctn: u64) -> Vec<Transaction> {
        vec![dummy_tx(50 + ctn as u8)]
    }

    fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "channel_id": self.channel_id.to_hex(),
            "node_id": self.node_pk.to_string(),
            "funding_outpoint": self.funding.to_string(),
        })
    }
}

pub struct MockChannelLoader;

impl ChannelLoader for MockChannelLoader {
    fn load_channel(
        &self,
        value: serde_json::Value,
        _sweep_address: &str,
    ) -> anyhow::Result<Arc<dyn ChannelState>> {
        let node_pk = value
            .get("node_id")
            .and_then(|v| v.as_str())
            .context("missing node_id")?
            .parse::<NodePk>()
            .context("bad node_id")?;
        Ok(MockChannel::new(node_pk, ChannelPhase::Disconnected, 0, 0))
    }
}

// --- MockPeer --- //

enum PayBehavior {
    Reject,
    Resolve { success: bool },
    DeliverTo(Weak<LnWallet>),
}

pub struct MockPeer {
    node_pk: NodePk,
    host: Mutex<Option<Weak<dyn PeerHost>>>,
    behavior: Mutex<PayBehavior>,
    funding_locked: Mutex<Vec<ChannelId>>,
    fee_updates: Mutex<Vec<ChannelId>>,
    network_updates: Mutex<Vec<(ChannelId, u32)>>,
    next_htlc_id: AtomicU64,
}

impl MockPeer {
    pub fn new(node_pk: NodePk) -> Arc<Self> {
        Arc::new(Self {
            node_pk,
            host: Mutex::new(None),
            behavior: Mutex::new(PayBehavior::Resolve { success: true }),
            funding_locked: Mutex::new(Vec::new()),
            fee_updates: Mutex::new(Vec::new()),
            network_updates: Mutex::new(Vec::new()),
            next_htlc_id: AtomicU64::new(0),
        })
    }

    fn bind_host(&self, host: Weak<dyn PeerHost>) {
        *self.host.lock().unwrap() = Some(host);
    }

    fn host(&self) -> Option<Arc<dyn PeerHost>> {
        self.host.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// HTLCs sent through this peer settle against `remote`'s invoice
    /// store, as if it were the node at the other end.
    pub fn deliver_to(&self, remote: &Arc<LnWallet>) {
        *self.behavior.lock().unwrap() =
            PayBehavior::DeliverTo(Arc::downgrade(remote));
    }

    pub fn resolve_payments_with(&self, success: bool) {
        *self.behavior.lock().unwrap() = PayBehavior::Resolve { success };
    }

    pub fn reject_payments(&self) {
        *self.behavior.lock().unwrap() = PayBehavior::Reject;
    }

    pub fn funding_locked_sent(&self) -> Vec<ChannelId> {
        self.funding_locked.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerSession for MockPeer {
    fn node_pk(&self) -> NodePk {
        self.node_pk
    }

    fn is_initialized(&self) -> bool {
        true
    }
    async fn wait_initialized(&self) {}

    async fn run_main_loop(self: Arc<Self>) {
        std::future::pending::<()>().await
    }

    async fn pay(
        &self,
        route: &Route,
        _chan: Arc<dyn ChannelState>,
        amount_msat: u64,
        payment_hash: PaymentHash,
        min_final_cltv_expiry: u64,
    ) -> anyhow::Result<Htlc> {
        let htlc_id = self.next_htlc_id.fetch_add(1, Ordering::Relaxed);
        let htlc = Htlc {
            htlc_id,
            amount_msat,
            payment_hash,
            cltv_expiry: min_final_cltv_expiry as u32,
            timestamp: now_unix(),
        };
        let scid = route[0].short_channel_id;
        let host = self.host().context("peer has no host")?;
        match &*self.behavior.lock().unwrap() {
            PayBehavior::Reject => bail!("peer rejected the htlc"),
            PayBehavior::Resolve { success } => {
                host.htlc_settled(scid, htlc_id, *success);
            }
            PayBehavior::DeliverTo(remote) => {
                let success = match remote.upgrade() {
                    Some(remote) => {
                        let known =
                            remote.get_preimage(&payment_hash).is_some();
                        if known {
                            PeerHost::htlc_fulfilled(
                                remote.as_ref(),
                                payment_hash,
                            );
                        }
                        known
                    }
                    None => false,
                };
                host.htlc_settled(scid, htlc_id, success);
            }
        }
        Ok(htlc)
    }

    async fn channel_establishment_flow(
        &self,
        funding_sat: u64,
        push_msat: u64,
        _temp_channel_id: ChannelId,
    ) -> anyhow::Result<Arc<dyn ChannelState>> {
        let chan = MockChannel::new(
            self.node_pk,
            ChannelPhase::Opening,
            funding_sat * 1000 - push_msat,
            push_msat,
        );
        Ok(chan)
    }

    async fn reestablish_channel(
        &self,
        _chan: Arc<dyn ChannelState>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn send_funding_locked(&self, chan: Arc<dyn ChannelState>) {
        self.funding_locked.lock().unwrap().push(chan.channel_id());
    }

    async fn update_fee(
        &self,
        chan: Arc<dyn ChannelState>,
    ) -> anyhow::Result<()> {
        self.fee_updates.lock().unwrap().push(chan.channel_id());
        Ok(())
    }

    fn on_network_update(&self, chan: Arc<dyn ChannelState>, conf: u32) {
        self.network_updates
            .lock()
            .unwrap()
            .push((chan.channel_id(), conf));
    }

    async fn close_channel(
        &self,
        _chan_id: ChannelId,
    ) -> anyhow::Result<Txid> {
        Ok(dummy_tx(0x77).txid())
    }
}

// --- MockConnector --- //

pub struct MockConnector {
    staged: Mutex<VecDeque<Arc<MockPeer>>>,
    reject_reason: Mutex<Option<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            staged: Mutex::new(VecDeque::new()),
            reject_reason: Mutex::new(None),
        }
    }

    pub fn stage_peer(&self, peer: Arc<MockPeer>) {
        self.staged.lock().unwrap().push_back(peer);
    }

    /// The next handshake fails (e.g. required features missing).
    pub fn reject_next(&self, reason: &str) {
        *self.reject_reason.lock().unwrap() = Some(reason.to_owned());
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        _keypair: &NodeKeypair,
        _features: LnFeatures,
        addr: &PeerAddress,
        host: Weak<dyn PeerHost>,
    ) -> anyhow::Result<Arc<dyn PeerSession>> {
        if let Some(reason) = self.reject_reason.lock().unwrap().take() {
            bail!("handshake failed: {reason}");
        }
        let peer = self
            .staged
            .lock()
            .unwrap()
            .pop_front()
            .with_context(|| format!("no staged peer for {addr}"))?;
        assert_eq!(peer.node_pk(), addr.node_pk);
        peer.bind_host(host);
        Ok(peer)
    }

    async fn accept(
        &self,
        _keypair: &NodeKeypair,
        _features: LnFeatures,
        _stream: TcpStream,
        host: Weak<dyn PeerHost>,
    ) -> anyhow::Result<Arc<dyn PeerSession>> {
        if let Some(reason) = self.reject_reason.lock().unwrap().take() {
            bail!("handshake failed: {reason}");
        }
        let peer = self
            .staged
            .lock()
            .unwrap()
            .pop_front()
            .context("no staged peer for inbound connection")?;
        peer.bind_host(host);
        Ok(peer)
    }
}

// --- MockGraph --- //

pub struct MockGraph {
    recent_peers: Mutex<Vec<PeerAddress>>,
    node_addresses: Mutex<HashMap<NodePk, Vec<NodeAddress>>>,
    last_good: Mutex<HashMap<NodePk, PeerAddress>>,
    policies_for_node: Mutex<HashMap<(ShortChannelId, NodePk), RoutingPolicy>>,
    edge_policies: Mutex<HashMap<(NodePk, ShortChannelId), RoutingPolicy>>,
    channel_ids: Mutex<HashSet<ShortChannelId>>,
    removed: Mutex<HashSet<ShortChannelId>>,
}

impl MockGraph {
    pub fn new() -> Self {
        Self {
            recent_peers: Mutex::new(Vec::new()),
            node_addresses: Mutex::new(HashMap::new()),
            last_good: Mutex::new(HashMap::new()),
            policies_for_node: Mutex::new(HashMap::new()),
            edge_policies: Mutex::new(HashMap::new()),
            channel_ids: Mutex::new(HashSet::new()),
            removed: Mutex::new(HashSet::new()),
        }
    }

    pub fn add_channel_id(&self, scid: ShortChannelId) {
        self.channel_ids.lock().unwrap().insert(scid);
    }

    pub fn set_policy_for_node(
        &self,
        scid: ShortChannelId,
        node: NodePk,
        policy: RoutingPolicy,
    ) {
        self.add_channel_id(scid);
        self.policies_for_node
            .lock()
            .unwrap()
            .insert((scid, node), policy);
    }

    pub fn set_routing_policy(
        &self,
        prev_node: NodePk,
        scid: ShortChannelId,
        policy: RoutingPolicy,
    ) {
        self.edge_policies
            .lock()
            .unwrap()
            .insert((prev_node, scid), policy);
    }

    pub fn set_recent_peers(&self, peers: Vec<PeerAddress>) {
        *self.recent_peers.lock().unwrap() = peers;
    }

    pub fn set_node_addresses(
        &self,
        node: NodePk,
        addrs: Vec<NodeAddress>,
    ) {
        self.node_addresses.lock().unwrap().insert(node, addrs);
    }

    pub fn removed_channels(&self) -> HashSet<ShortChannelId> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelGraph for MockGraph {
    async fn wait_data_loaded(&self) {}

    fn get_recent_peers(&self) -> Vec<PeerAddress> {
        self.recent_peers.lock().unwrap().clone()
    }

    fn get_nodes_not_in(&self, exclude: &HashSet<NodePk>) -> Vec<NodePk> {
        self.node_addresses
            .lock()
            .unwrap()
            .keys()
            .filter(|pk| !exclude.contains(pk))
            .take(200)
            .copied()
            .collect()
    }

    fn get_node_addresses(&self, node: &NodePk) -> Vec<NodeAddress> {
        self.node_addresses
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    fn get_last_good_address(&self, node: &NodePk) -> Option<PeerAddress> {
        self.last_good.lock().unwrap().get(node).cloned()
    }

    fn remove_channel(&self, scid: ShortChannelId) {
        self.removed.lock().unwrap().insert(scid);
        self.channel_ids.lock().unwrap().remove(&scid);
    }

    fn has_channel_info(&self, scid: ShortChannelId) -> bool {
        self.channel_ids.lock().unwrap().contains(&scid)
    }

    fn get_policy_for_node(
        &self,
        scid: ShortChannelId,
        node: &NodePk,
    ) -> Option<RoutingPolicy> {
        self.policies_for_node
            .lock()
            .unwrap()
            .get(&(scid, *node))
            .copied()
    }

    fn get_routing_policy_for_channel(
        &self,
        prev_node: &NodePk,
        scid: ShortChannelId,
    ) -> Option<RoutingPolicy> {
        self.edge_policies
            .lock()
            .unwrap()
            .get(&(*prev_node, scid))
            .copied()
    }

    fn num_nodes(&self) -> usize {
        self.node_addresses.lock().unwrap().len()
    }
    fn num_channels(&self) -> usize {
        self.channel_ids.lock().unwrap().len()
    }
    fn get_channel_ids(&self) -> HashSet<ShortChannelId> {
        self.channel_ids.lock().unwrap().clone()
    }

    fn prune_old_policies(&self, _max_age: Duration) {}
    fn prune_orphaned_channels(&self) {}
}

// --- MockPathFinder --- //

/// Finds only direct paths: a live, funded channel to the destination with
/// enough local balance.
pub struct MockPathFinder;

impl PathFinder for MockPathFinder {
    fn find_path_for_payment(
        &self,
        _from: NodePk,
        to: NodePk,
        amount_msat: u64,
        my_channels: &[Arc<dyn ChannelState>],
    ) -> Option<Vec<PathHop>> {
        my_channels
            .iter()
            .find(|chan| {
                chan.node_id() == to
                    && chan.get_state() == ChannelPhase::Open
                    && !chan.is_force_closed()
                    && chan.short_channel_id().is_some()
                    && chan.balance_msat(Side::Local) >= amount_msat
            })
            .map(|chan| {
                vec![PathHop {
                    node_id: to,
                    short_channel_id: chan.short_channel_id().unwrap(),
                }]
            })
    }

    fn create_route_from_path(
        &self,
        path: &[PathHop],
        _from: NodePk,
    ) -> Route {
        path.iter()
            .map(|hop| RouteEdge {
                node_id: hop.node_id,
                short_channel_id: hop.short_channel_id,
                fee_base_msat: 0,
                fee_proportional_millionths: 0,
                cltv_expiry_delta: 0,
            })
            .collect()
    }
}

// --- MockWatcher --- //

#[derive(Default)]
struct MockWatcherInner {
    heights: HashMap<Txid, (i32, u32, u32, Option<u64>)>,
    transactions: HashMap<Txid, Transaction>,
    watched: Vec<(String, String)>,
}

pub struct MockWatcher {
    inner: Mutex<MockWatcherInner>,
    local_height: AtomicU32,
}

impl MockWatcher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockWatcherInner::default()),
            local_height: AtomicU32::new(700_000),
        }
    }

    pub fn local_height(&self) -> u32 {
        self.local_height.load(Ordering::Relaxed)
    }

    pub fn set_local_height(&self, height: u32) {
        self.local_height.store(height, Ordering::Relaxed);
    }

    pub fn confirm_tx(
        &self,
        txid: Txid,
        block_height: i32,
        tx_pos: u32,
        conf: u32,
    ) {
        self.inner
            .lock()
            .unwrap()
            .heights
            .insert(txid, (block_height, tx_pos, conf, Some(now_unix())));
    }

    pub fn mark_tx_local(&self, txid: Txid) {
        self.inner
            .lock()
            .unwrap()
            .heights
            .insert(txid, (crate::traits::TX_HEIGHT_LOCAL, 0, 0, None));
    }

    pub fn store_transaction(&self, tx: Transaction) {
        self.inner
            .lock()
            .unwrap()
            .transactions
            .insert(tx.txid(), tx);
    }

    pub fn watched_channels(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().watched.clone()
    }
}

#[async_trait]
impl ChainWatcher for MockWatcher {
    fn get_tx_height(&self, txid: &Txid) -> TxConfirmation {
        match self.inner.lock().unwrap().heights.get(txid) {
            Some((height, _pos, conf, timestamp)) => TxConfirmation {
                height: *height,
                conf: *conf,
                timestamp: *timestamp,
            },
            None => TxConfirmation::unconfirmed(),
        }
    }

    fn get_txpos(&self, txid: &Txid) -> Option<(u32, u32)> {
        self.inner
            .lock()
            .unwrap()
            .heights
            .get(txid)
            .filter(|(height, ..)| *height > 0)
            .map(|(height, pos, ..)| (*height as u32, *pos))
    }

    fn get_local_height(&self) -> u32 {
        self.local_height()
    }

    fn add_channel(&self, funding_outpoint: String, funding_address: String) {
        self.inner
            .lock()
            .unwrap()
            .watched
            .push((funding_outpoint, funding_address));
    }

    fn is_up_to_date(&self) -> bool {
        true
    }

    async fn get_transaction(
        &self,
        txid: &Txid,
    ) -> anyhow::Result<Transaction> {
        self.inner
            .lock()
            .unwrap()
            .transactions
            .get(txid)
            .cloned()
            .with_context(|| format!("unknown tx {txid}"))
    }
}

// --- MockBroadcaster --- //

pub struct MockBroadcaster {
    txs: Mutex<Vec<Transaction>>,
    fail: Mutex<Option<String>>,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self {
            txs: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
        }
    }

    pub fn broadcasted(&self) -> Vec<Transaction> {
        self.txs.lock().unwrap().clone()
    }

    pub fn fail_with(&self, reason: &str) {
        *self.fail.lock().unwrap() = Some(reason.to_owned());
    }
}

#[async_trait]
impl TxBroadcast for MockBroadcaster {
    async fn broadcast(&self, tx: &Transaction) -> anyhow::Result<()> {
        if let Some(reason) = self.fail.lock().unwrap().clone() {
            bail!("{reason}");
        }
        self.txs.lock().unwrap().push(tx.clone());
        Ok(())
    }
}

// --- MockHostWallet --- //

pub struct MockHostWallet {
    labels: Mutex<HashMap<String, String>>,
    future_txs: Mutex<Vec<(Transaction, u32)>>,
    requests: Mutex<Vec<PaymentRequest>>,
}

impl MockHostWallet {
    pub fn new() -> Self {
        Self {
            labels: Mutex::new(HashMap::new()),
            future_txs: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn label_for(&self, key: &str) -> Option<String> {
        self.labels.lock().unwrap().get(key).cloned()
    }

    pub fn future_txs(&self) -> Vec<(Transaction, u32)> {
        self.future_txs.lock().unwrap().clone()
    }

    pub fn payment_requests(&self) -> Vec<PaymentRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HostWallet for MockHostWallet {
    fn receiving_address(&self) -> String {
        "bcrt1qsweepaddress".to_owned()
    }

    fn set_label(&self, key: &str, label: &str) {
        self.labels
            .lock()
            .unwrap()
            .insert(key.to_owned(), label.to_owned());
    }

    fn add_future_tx(
        &self,
        tx: &Transaction,
        wait_blocks: u32,
    ) -> anyhow::Result<()> {
        self.future_txs
            .lock()
            .unwrap()
            .push((tx.clone(), wait_blocks));
        Ok(())
    }

    fn add_payment_request(&self, request: PaymentRequest) {
        self.requests.lock().unwrap().push(request);
    }

    fn is_up_to_date(&self) -> bool {
        true
    }
}

// --- MockWatchtower --- //

pub struct MockWatchtower {
    ctn: Mutex<i64>,
    pushed: Mutex<Vec<(String, i64, String, String)>>,
}

impl MockWatchtower {
    pub fn with_ctn(ctn: i64) -> Self {
        Self {
            ctn: Mutex::new(ctn),
            pushed: Mutex::new(Vec::new()),
        }
    }

    pub fn pushed_ctns(&self) -> Vec<i64> {
        self.pushed
            .lock()
            .unwrap()
            .iter()
            .map(|(_, ctn, _, _)| *ctn)
            .collect()
    }
}

#[async_trait]
impl Watchtower for MockWatchtower {
    async fn get_ctn(
        &self,
        _outpoint: &str,
        _addr: &str,
    ) -> anyhow::Result<i64> {
        Ok(*self.ctn.lock().unwrap())
    }

    async fn add_sweep_tx(
        &self,
        outpoint: &str,
        ctn: i64,
        prevout: &str,
        tx_hex: &str,
    ) -> anyhow::Result<()> {
        self.pushed.lock().unwrap().push((
            outpoint.to_owned(),
            ctn,
            prevout.to_owned(),
            tx_hex.to_owned(),
        ));
        Ok(())
    }
}

// --- MockFeeEstimator / MockDns / MockCodec --- //

pub struct MockFeeEstimator;

impl FeeEstimator for MockFeeEstimator {
    fn eta_target_to_fee(&self, _num_blocks: u32) -> Option<u64> {
        Some(100_000)
    }
}

pub struct MockDns;

impl MockDns {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DnsResolver for MockDns {
    async fn resolve_srv(
        &self,
        _query: &str,
    ) -> anyhow::Result<Vec<SrvRecord>> {
        Ok(Vec::new())
    }

    async fn resolve_host(&self, _host: &str) -> anyhow::Result<Vec<IpAddr>> {
        Ok(Vec::new())
    }
}

/// A codec whose "wire format" is an opaque handle into a shared table.
/// Sharing one codec between two harnesses lets one worker decode invoices
/// the other encoded.
pub struct MockCodec {
    invoices: Mutex<HashMap<String, Bolt11Invoice>>,
    next_id: AtomicU64,
}

impl MockCodec {
    pub fn new() -> Self {
        Self {
            invoices: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn register(&self, invoice: Bolt11Invoice) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let encoded = format!("lnmock{id}");
        self.invoices
            .lock()
            .unwrap()
            .insert(encoded.clone(), invoice);
        encoded
    }
}

impl InvoiceCodec for MockCodec {
    fn decode(
        &self,
        invoice: &str,
        _network: LnNetwork,
    ) -> Result<Bolt11Invoice, InvoiceError> {
        self.invoices
            .lock()
            .unwrap()
            .get(invoice)
            .cloned()
            .ok_or_else(|| InvoiceError::Malformed(invoice.to_owned()))
    }

    fn encode(
        &self,
        params: &InvoiceParams,
        node_privkey: &SecretKey,
    ) -> anyhow::Result<String> {
        let payee = NodePk(PublicKey::from_secret_key(
            &Secp256k1::new(),
            node_privkey,
        ));
        Ok(self.register(Bolt11Invoice {
            payment_hash: params.payment_hash,
            payee,
            amount_msat: params.amount_msat,
            timestamp: params.timestamp,
            expiry: params.expiry,
            min_final_cltv_expiry: params.min_final_cltv_expiry,
            description: params.description.clone(),
            route_hints: params.route_hints.clone(),
        }))
    }
}

// --- Harness --- //

pub struct TestHarness {
    pub wallet: Arc<LnWallet>,
    pub connector: Arc<MockConnector>,
    pub graph: Arc<MockGraph>,
    pub watcher: Arc<MockWatcher>,
    pub broadcaster: Arc<MockBroadcaster>,
    pub host_wallet: Arc<MockHostWallet>,
    pub codec: Arc<MockCodec>,
    pub shutdown: ShutdownSignal,
    _task_rx: mpsc::Receiver<Task<()>>,
}

#[derive(Default)]
pub struct TestHarnessBuilder {
    codec: Option<Arc<MockCodec>>,
    local_watchtower: Option<Arc<dyn Watchtower>>,
}

impl TestHarnessBuilder {
    pub fn with_codec(mut self, codec: Arc<MockCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_local_watchtower(
        mut self,
        watchtower: Arc<dyn Watchtower>,
    ) -> Self {
        self.local_watchtower = Some(watchtower);
        self
    }

    pub async fn build(self) -> TestHarness {
        logger::init_for_testing();

        let connector = Arc::new(MockConnector::new());
        let graph = Arc::new(MockGraph::new());
        let watcher = Arc::new(MockWatcher::new());
        let broadcaster = Arc::new(MockBroadcaster::new());
        let host_wallet = Arc::new(MockHostWallet::new());
        let codec =
            self.codec.unwrap_or_else(|| Arc::new(MockCodec::new()));
        let shutdown = ShutdownSignal::new();

        let deps = Collaborators {
            connector: connector.clone(),
            graph: graph.clone(),
            path_finder: Arc::new(MockPathFinder),
            watcher: watcher.clone(),
            broadcaster: broadcaster.clone(),
            host_wallet: host_wallet.clone(),
            store: Arc::new(MemStore::new()),
            channel_loader: Arc::new(MockChannelLoader),
            local_watchtower: self.local_watchtower,
            fee_estimator: Arc::new(MockFeeEstimator),
            codec: codec.clone(),
            dns: Arc::new(MockDns::new()),
        };
        let (wallet, task_rx) = LnWallet::new(
            deps,
            Config::default(),
            LnNetwork::Regtest,
            shutdown.clone(),
        )
        .expect("harness wallet must build");

        TestHarness {
            wallet,
            connector,
            graph,
            watcher,
            broadcaster,
            host_wallet,
            codec,
            shutdown,
            _task_rx: task_rx,
        }
    }
}

impl TestHarness {
    pub async fn new() -> Self {
        TestHarnessBuilder::default().build().await
    }

    /// A channel to a fresh unique peer. OPEN channels come funded: scid
    /// assigned and the funding tx buried.
    pub fn add_channel(
        &self,
        phase: ChannelPhase,
        local_msat: u64,
        remote_msat: u64,
    ) -> Arc<MockChannel> {
        let seed = (next_fixture_id() % 120) as u8 + 100;
        self.add_channel_to(
            phase,
            local_msat,
            remote_msat,
            dummy_node_pk(seed),
        )
    }

    pub fn add_channel_to(
        &self,
        phase: ChannelPhase,
        local_msat: u64,
        remote_msat: u64,
        node_pk: NodePk,
    ) -> Arc<MockChannel> {
        let chan = MockChannel::new(node_pk, phase, local_msat, remote_msat);
        if phase != ChannelPhase::Opening {
            let n = next_fixture_id();
            chan.set_short_channel_id(ShortChannelId::from_components(
                600_000 + n,
                n,
                0,
            ));
            self.watcher.confirm_tx(
                chan.funding_outpoint().txid,
                600_000 + n as i32,
                n,
                6,
            );
        }
        self.wallet
            .save_channel(chan.clone() as Arc<dyn ChannelState>);
        chan
    }

    /// An OPENING channel whose funding tx is not yet confirmed.
    pub fn add_unfunded_channel(
        &self,
        phase: ChannelPhase,
    ) -> Arc<MockChannel> {
        let seed = (next_fixture_id() % 120) as u8 + 100;
        let chan = MockChannel::new(
            dummy_node_pk(seed),
            phase,
            100_000_000,
            100_000_000,
        );
        self.wallet
            .save_channel(chan.clone() as Arc<dyn ChannelState>);
        chan
    }

    /// Stage and connect a mock peer session for `node_pk`.
    pub async fn connect_mock_peer(&self, node_pk: NodePk) -> Arc<MockPeer> {
        let peer = MockPeer::new(node_pk);
        self.connector.stage_peer(peer.clone());
        self.wallet
            .peer_manager()
            .add_peer(&PeerAddress::new("127.0.0.1", 9735, node_pk))
            .await
            .expect("mock connect cannot fail");
        peer
    }

    pub fn make_invoice(
        &self,
        amount_sat: Option<u64>,
        timestamp: u64,
        expiry: u64,
    ) -> Bolt11Invoice {
        Bolt11Invoice {
            payment_hash: PaymentHash([0x42; 32]),
            payee: dummy_node_pk(1),
            amount_msat: amount_sat.map(|sat| sat * 1000),
            timestamp,
            expiry,
            min_final_cltv_expiry: MIN_FINAL_CLTV_EXPIRY_FOR_INVOICE,
            description: String::new(),
            route_hints: Vec::new(),
        }
    }

    pub fn invoice_from_peer(
        &self,
        payee: NodePk,
        amount_sat: Option<u64>,
        route_hints: Vec<RouteHint>,
    ) -> Bolt11Invoice {
        Bolt11Invoice {
            payment_hash: PaymentHash([0x43; 32]),
            payee,
            amount_msat: amount_sat.map(|sat| sat * 1000),
            timestamp: now_unix(),
            expiry: 3600,
            min_final_cltv_expiry: MIN_FINAL_CLTV_EXPIRY_FOR_INVOICE,
            description: "test".to_owned(),
            route_hints,
        }
    }
}

// --- End-to-end scenarios --- //

#[cfg(test)]
mod scenarios {
    use super::*;
    use crate::{
        error::PaymentFailure,
        event::LnEvent,
        invoice::InvoiceStatus,
    };

    /// Two workers, one channel: B invoices 100k sat for "coffee", A pays.
    /// Both sides finish with status PAID and B observes
    /// `payment_received`.
    #[tokio::test]
    async fn successful_direct_payment() {
        let codec = Arc::new(MockCodec::new());
        let a = TestHarnessBuilder::default()
            .with_codec(codec.clone())
            .build()
            .await;
        let b = TestHarnessBuilder::default()
            .with_codec(codec.clone())
            .build()
            .await;

        let chan = a.add_channel_to(
            ChannelPhase::Open,
            500_000_000,
            500_000_000,
            b.wallet.node_pk(),
        );

        let key = b
            .wallet
            .add_request_coroutine(Some(100_000), "coffee", 3600)
            .await
            .unwrap();
        let invoice =
            b.host_wallet.payment_requests()[0].invoice.clone();
        let payment_hash: PaymentHash = key.parse().unwrap();

        let peer = a.connect_mock_peer(b.wallet.node_pk()).await;
        peer.deliver_to(&b.wallet);

        let mut b_events = b.wallet.events().subscribe();
        let paid =
            a.wallet.pay_invoice(&invoice, None, 1).await.unwrap();
        assert!(paid);

        match b_events.recv().await {
            LnEvent::PaymentReceived {
                payment_hash_hex,
                status,
            } => {
                assert_eq!(payment_hash_hex, key);
                assert_eq!(status, InvoiceStatus::Paid);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            b.wallet.get_invoice_status(&payment_hash),
            InvoiceStatus::Paid
        );
        assert_eq!(
            a.wallet.get_invoice_status(&payment_hash),
            InvoiceStatus::Paid
        );
        assert_eq!(chan.get_state(), ChannelPhase::Open);
    }

    /// Paying the same invoice twice fails up front.
    #[tokio::test]
    async fn paying_a_paid_invoice_is_rejected() {
        let codec = Arc::new(MockCodec::new());
        let a = TestHarnessBuilder::default()
            .with_codec(codec.clone())
            .build()
            .await;
        let b = TestHarnessBuilder::default()
            .with_codec(codec.clone())
            .build()
            .await;

        a.add_channel_to(
            ChannelPhase::Open,
            500_000_000,
            500_000_000,
            b.wallet.node_pk(),
        );
        b.wallet
            .add_request_coroutine(Some(100_000), "coffee", 3600)
            .await
            .unwrap();
        let invoice =
            b.host_wallet.payment_requests()[0].invoice.clone();
        let peer = a.connect_mock_peer(b.wallet.node_pk()).await;
        peer.deliver_to(&b.wallet);

        assert!(a.wallet.pay_invoice(&invoice, None, 1).await.unwrap());

        let err =
            a.wallet.pay_invoice(&invoice, None, 1).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PaymentFailure>(),
            Some(PaymentFailure::AlreadyPaid)
        ));
        assert_eq!(
            format!("{}", PaymentFailure::AlreadyPaid),
            "This invoice has been paid already"
        );
    }

    /// Force-closing the only channel invalidates all routes through it.
    #[tokio::test]
    async fn force_close_invalidates_routes() {
        let h = TestHarness::new().await;
        let chan =
            h.add_channel(ChannelPhase::Open, 500_000_000, 500_000_000);
        let payee = chan.node_id();

        // Route exists while the channel lives.
        let invoice = h.invoice_from_peer(payee, Some(100_000), Vec::new());
        assert!(h
            .wallet
            .create_route_from_invoice(&invoice)
            .await
            .is_ok());

        h.wallet
            .force_close_channel(&chan.channel_id())
            .await
            .unwrap();

        // The commitment tx went out...
        assert_eq!(
            h.broadcaster.broadcasted(),
            vec![chan.force_close_tx()]
        );
        // ...and no path remains.
        let err = h
            .wallet
            .create_route_from_invoice(&invoice)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentFailure::NoPathFound));
        assert_eq!(format!("{err}"), "No path found");
    }

    /// A peer that fails the handshake (e.g. no DATA_LOSS_PROTECT) never
    /// appears in the peer map.
    #[tokio::test]
    async fn failed_handshake_leaves_no_peer() {
        let h = TestHarness::new().await;
        let node_pk = dummy_node_pk(21);
        h.connector.reject_next("peer does not support data loss protect");

        let result = h
            .wallet
            .peer_manager()
            .add_peer(&PeerAddress::new("127.0.0.1", 9735, node_pk))
            .await;

        assert!(result.is_err());
        assert!(!h.wallet.peer_manager().contains_peer(&node_pk));
        assert_eq!(h.wallet.peer_manager().num_peers(), 0);
    }
}
