//! Interfaces of the worker's external collaborators: the per-peer wire
//! engine, the channel graph and path finder, the on-chain watcher, the host
//! wallet, and the watchtower. The host wires concrete implementations in at
//! worker construction; tests wire in mocks.

use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bitcoin::{secp256k1::SecretKey, Transaction, Txid};
use tokio::net::TcpStream;

use crate::{
    channel::{ChannelId, ChannelState, Htlc},
    config::LnNetwork,
    error::InvoiceError,
    invoice::{Bolt11Invoice, Direction, InvoiceParams, PaymentHash, Preimage},
    keys::NodeKeypair,
    peer_addr::{NodeAddress, NodePk, PeerAddress},
    peer_manager::LnFeatures,
    route::Route,
    scid::ShortChannelId,
};

/// Height marker for transactions we only hold locally (not yet seen in the
/// mempool or a block).
pub const TX_HEIGHT_LOCAL: i32 = -2;

/// Where a transaction sits on-chain, as reported by the watcher.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TxConfirmation {
    pub height: i32,
    pub conf: u32,
    pub timestamp: Option<u64>,
}

impl TxConfirmation {
    pub fn unconfirmed() -> Self {
        Self {
            height: 0,
            conf: 0,
            timestamp: None,
        }
    }
}

/// A routing policy stored in the channel graph for one direction of a
/// channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RoutingPolicy {
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

/// One hop of a path through the channel graph.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathHop {
    pub node_id: NodePk,
    pub short_channel_id: ShortChannelId,
}

/// An SRV record returned by a LN DNS seed.
#[derive(Clone, Debug)]
pub struct SrvRecord {
    /// Bech32-encoded node id, dot, seed domain.
    pub host: String,
    pub port: u16,
}

/// An entry in the host wallet's payment-request book.
#[derive(Clone, Debug)]
pub struct PaymentRequest {
    pub amount_sat: Option<u64>,
    pub time: u64,
    pub expiry: u64,
    pub message: String,
    pub rhash_hex: String,
    pub invoice: String,
}

/// The per-peer wire engine: transport, handshake, and BOLT message handling
/// live behind this interface. One session per connected node.
#[async_trait]
pub trait PeerSession: Send + Sync {
    fn node_pk(&self) -> NodePk;

    /// Whether the BOLT `init` exchange has completed.
    fn is_initialized(&self) -> bool;
    async fn wait_initialized(&self);

    /// The session's long-lived message loop. Runs until disconnect; the
    /// session notifies its [`PeerHost`] on exit.
    async fn run_main_loop(self: Arc<Self>);

    /// Add an HTLC over `route` and send the onion. Returns the added HTLC;
    /// its settlement is reported asynchronously through
    /// [`PeerHost::htlc_settled`].
    async fn pay(
        &self,
        route: &Route,
        chan: Arc<dyn ChannelState>,
        amount_msat: u64,
        payment_hash: PaymentHash,
        min_final_cltv_expiry: u64,
    ) -> anyhow::Result<Htlc>;

    /// Run the interactive open-channel flow with this peer.
    async fn channel_establishment_flow(
        &self,
        funding_sat: u64,
        push_msat: u64,
        temp_channel_id: ChannelId,
    ) -> anyhow::Result<Arc<dyn ChannelState>>;

    async fn reestablish_channel(
        &self,
        chan: Arc<dyn ChannelState>,
    ) -> anyhow::Result<()>;

    fn send_funding_locked(&self, chan: Arc<dyn ChannelState>);

    /// Renegotiate the channel's on-chain feerate.
    async fn update_fee(&self, chan: Arc<dyn ChannelState>)
        -> anyhow::Result<()>;

    /// React to a new confirmation count of the channel's funding tx.
    fn on_network_update(&self, chan: Arc<dyn ChannelState>, conf: u32);

    /// Run the cooperative close flow. Returns the closing txid.
    async fn close_channel(&self, chan_id: ChannelId) -> anyhow::Result<Txid>;
}

/// What a [`PeerSession`] may ask of the worker that owns it. Sessions hold
/// this as a [`Weak`] handle so the worker-owns-peer reference cycle stays
/// breakable.
pub trait PeerHost: Send + Sync {
    /// The session's message loop exited; drop the peer and mark its
    /// channels disconnected.
    fn peer_closed(&self, node_pk: &NodePk);

    /// Persist a channel the session just mutated.
    fn save_channel(&self, chan: Arc<dyn ChannelState>) {
        let _ = chan;
    }

    /// An HTLC we offered was fulfilled (true) or failed (false).
    fn htlc_settled(
        &self,
        scid: ShortChannelId,
        htlc_id: u64,
        success: bool,
    ) {
        let _ = (scid, htlc_id, success);
    }

    /// An incoming HTLC paying one of our invoices was settled.
    fn htlc_fulfilled(&self, payment_hash: PaymentHash) {
        let _ = payment_hash;
    }

    /// The preimage for an incoming HTLC, if we issued the invoice.
    fn get_preimage(&self, payment_hash: &PaymentHash) -> Option<Preimage> {
        let _ = payment_hash;
        None
    }

    /// A payment finished on `chan_id`; notify the host UI.
    fn payment_completed(
        &self,
        chan_id: ChannelId,
        direction: Direction,
        htlc: Htlc,
    ) {
        let _ = (chan_id, direction, htlc);
    }
}

/// Builds [`PeerSession`]s: the encrypted transport and BOLT handshake live
/// behind this interface. Both directions fail (with an error) for peers
/// that do not advertise the features we require, e.g. DATA_LOSS_PROTECT.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Dial out, run the initiator handshake.
    async fn connect(
        &self,
        keypair: &NodeKeypair,
        features: LnFeatures,
        addr: &PeerAddress,
        host: Weak<dyn PeerHost>,
    ) -> anyhow::Result<Arc<dyn PeerSession>>;

    /// Run the responder handshake on an accepted socket.
    async fn accept(
        &self,
        keypair: &NodeKeypair,
        features: LnFeatures,
        stream: TcpStream,
        host: Weak<dyn PeerHost>,
    ) -> anyhow::Result<Arc<dyn PeerSession>>;
}

/// Deserializes persisted channel state objects. The inverse of
/// [`ChannelState::to_value`]; lives with the channel machinery, outside
/// this crate.
pub trait ChannelLoader: Send + Sync {
    fn load_channel(
        &self,
        value: serde_json::Value,
        sweep_address: &str,
    ) -> anyhow::Result<Arc<dyn ChannelState>>;
}

/// The gossip-fed channel graph.
#[async_trait]
pub trait ChannelGraph: Send + Sync {
    /// Resolves once the graph has been loaded from disk.
    async fn wait_data_loaded(&self);

    /// Peers we recently had a working connection to, best first.
    fn get_recent_peers(&self) -> Vec<PeerAddress>;

    /// Up to 200 randomly sorted nodes not in `exclude`.
    fn get_nodes_not_in(&self, exclude: &HashSet<NodePk>) -> Vec<NodePk>;

    fn get_node_addresses(&self, node: &NodePk) -> Vec<NodeAddress>;

    fn get_last_good_address(&self, node: &NodePk) -> Option<PeerAddress>;

    /// Forget a closed channel.
    fn remove_channel(&self, scid: ShortChannelId);

    /// Whether the graph knows the channel at all.
    fn has_channel_info(&self, scid: ShortChannelId) -> bool;

    /// The policy `node` announced for its direction of `scid`.
    fn get_policy_for_node(
        &self,
        scid: ShortChannelId,
        node: &NodePk,
    ) -> Option<RoutingPolicy>;

    /// The policy for the edge entered at `prev_node` over `scid`. Stored
    /// policies reflect recent failure feedback, so they take precedence
    /// over invoice hints.
    fn get_routing_policy_for_channel(
        &self,
        prev_node: &NodePk,
        scid: ShortChannelId,
    ) -> Option<RoutingPolicy>;

    fn num_nodes(&self) -> usize;
    fn num_channels(&self) -> usize;
    fn get_channel_ids(&self) -> HashSet<ShortChannelId>;

    fn prune_old_policies(&self, max_age: Duration);
    fn prune_orphaned_channels(&self);
}

/// Path finding over the channel graph plus our own (private) channels.
pub trait PathFinder: Send + Sync {
    fn find_path_for_payment(
        &self,
        from: NodePk,
        to: NodePk,
        amount_msat: u64,
        my_channels: &[Arc<dyn ChannelState>],
    ) -> Option<Vec<PathHop>>;

    fn create_route_from_path(
        &self,
        path: &[PathHop],
        from: NodePk,
    ) -> Route;
}

/// The on-chain watcher: confirmation depths and spentness callbacks.
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    fn get_tx_height(&self, txid: &Txid) -> TxConfirmation;

    /// `(block_height, position_in_block)` of a mined tx.
    fn get_txpos(&self, txid: &Txid) -> Option<(u32, u32)>;

    fn get_local_height(&self) -> u32;

    /// Watch a channel funding output for confirmation and spentness.
    fn add_channel(&self, funding_outpoint: String, funding_address: String);

    fn is_up_to_date(&self) -> bool;

    async fn get_transaction(&self, txid: &Txid)
        -> anyhow::Result<Transaction>;
}

/// Pushes raw transactions to the network.
#[async_trait]
pub trait TxBroadcast: Send + Sync {
    async fn broadcast(&self, tx: &Transaction) -> anyhow::Result<()>;
}

/// The surrounding on-chain wallet.
pub trait HostWallet: Send + Sync {
    /// A fresh receiving address; used as the sweep destination.
    fn receiving_address(&self) -> String;

    fn set_label(&self, key: &str, label: &str);

    /// Queue a tx to be broadcast once `wait_blocks` more blocks arrive.
    fn add_future_tx(
        &self,
        tx: &Transaction,
        wait_blocks: u32,
    ) -> anyhow::Result<()>;

    fn add_payment_request(&self, request: PaymentRequest);

    fn is_up_to_date(&self) -> bool;
}

/// String-keyed JSON persistence supplied by the host wallet. Storage errors
/// are fatal to the wallet; implementations fail loudly rather than
/// returning.
pub trait WalletStore: Send + Sync {
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    fn put(&self, key: &str, value: serde_json::Value);
    /// Flush to disk.
    fn write(&self);
}

/// A watchtower, local or remote: stores penalty transactions per revoked
/// commitment number.
#[async_trait]
pub trait Watchtower: Send + Sync {
    /// The highest commitment number the tower has sweep txs for, or `-1`
    /// when it has none for this channel.
    async fn get_ctn(&self, outpoint: &str, addr: &str)
        -> anyhow::Result<i64>;

    async fn add_sweep_tx(
        &self,
        outpoint: &str,
        ctn: i64,
        prevout: &str,
        tx_hex: &str,
    ) -> anyhow::Result<()>;
}

/// On-chain fee estimation from the host network.
pub trait FeeEstimator: Send + Sync {
    /// Estimated sat/kvbyte to confirm within `num_blocks` blocks.
    fn eta_target_to_fee(&self, num_blocks: u32) -> Option<u64>;
}

/// The BOLT-11 encode/decode boundary.
pub trait InvoiceCodec: Send + Sync {
    fn decode(
        &self,
        invoice: &str,
        network: LnNetwork,
    ) -> Result<Bolt11Invoice, InvoiceError>;

    fn encode(
        &self,
        params: &InvoiceParams,
        node_privkey: &SecretKey,
    ) -> anyhow::Result<String>;
}

/// DNS lookups for the LN seed path.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve_srv(&self, query: &str)
        -> anyhow::Result<Vec<SrvRecord>>;

    async fn resolve_host(&self, host: &str) -> anyhow::Result<Vec<IpAddr>>;
}
