//! The `LnWallet` worker: owns the channel map, the invoice and preimage
//! stores, the peer manager, and every background loop. Constructed once per
//! wallet, then driven by the host's task group.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use anyhow::Context;
use bitcoin::Txid;
use once_cell::sync::OnceCell;
use rand::seq::SliceRandom;
use sable_tokio::{
    shutdown::ShutdownSignal, task::Task, DEFAULT_CHANNEL_SIZE,
};
use serde::Serialize;
use tokio::{runtime::Handle, sync::mpsc, time};
use tracing::{info, warn};

use crate::{
    channel::{ChannelId, ChannelPhase, ChannelState, Htlc, Side},
    config::{Config, LnNetwork},
    error::ConnStringError,
    event::{LnEvent, LnEventBus},
    invoice::{Direction, InvoiceStatus, PaymentHash, Preimage},
    keys::NodeKeypair,
    now_unix,
    payments::PendingPayments,
    peer_addr::{
        choose_preferred_address, parse_conn_string, NodePk, PeerAddress,
    },
    peer_manager::{
        LnFeatures, PeerManager, PEER_RETRY_INTERVAL_FOR_CHANNELS,
    },
    scid::ShortChannelId,
    store::{ChannelTimestamps, WalletDb},
    traits::{
        ChainWatcher, ChannelGraph, ChannelLoader, DnsResolver, FeeEstimator,
        HostWallet, InvoiceCodec, PathFinder, PeerConnector, PeerHost,
        PeerSession, TxBroadcast, WalletStore, Watchtower,
    },
};

/// How long a foreign-thread `open_channel` call waits for the flow.
pub const OPEN_CHANNEL_TIMEOUT: Duration = Duration::from_secs(20);
/// How long a foreign-thread `add_request` call waits.
pub const ADD_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// How long we wait for a fresh peer to finish its `init` exchange.
pub const LN_P2P_NETWORK_TIMEOUT: Duration = Duration::from_secs(20);

/// Confirmation target used for channel feerates.
const FEE_LN_ETA_TARGET: u32 = 2;
/// sat/kvbyte used when the fee estimator has no estimate.
const FEERATE_FALLBACK_STATIC_FEE: u64 = 150_000;
/// sat/kvbyte hardcoded on regtest.
const FEERATE_REGTEST_HARDCODED: u64 = 180_000;

/// The external collaborators a worker is wired with at construction.
/// No global singletons: everything the worker talks to comes through here.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn PeerConnector>,
    pub graph: Arc<dyn ChannelGraph>,
    pub path_finder: Arc<dyn PathFinder>,
    pub watcher: Arc<dyn ChainWatcher>,
    pub broadcaster: Arc<dyn TxBroadcast>,
    pub host_wallet: Arc<dyn HostWallet>,
    pub store: Arc<dyn WalletStore>,
    pub channel_loader: Arc<dyn ChannelLoader>,
    pub local_watchtower: Option<Arc<dyn Watchtower>>,
    pub fee_estimator: Arc<dyn FeeEstimator>,
    pub codec: Arc<dyn InvoiceCodec>,
    pub dns: Arc<dyn DnsResolver>,
}

/// All maps the worker owns, guarded by one mutex. Readers snapshot under
/// the lock; writers hold it across the mutate-and-persist pair.
pub(crate) struct WalletState {
    pub(crate) channels: HashMap<ChannelId, Arc<dyn ChannelState>>,
    pub(crate) invoices: HashMap<PaymentHash, crate::invoice::InvoiceInfo>,
    pub(crate) preimages: HashMap<PaymentHash, Preimage>,
    pub(crate) channel_timestamps: HashMap<String, ChannelTimestamps>,
}

/// One row of [`LnWallet::list_channels`]. Channels are identified by their
/// funding outpoint here because other implementations use the channel point
/// to identify channels.
#[derive(Clone, Debug, Serialize)]
pub struct ChannelSummary {
    pub short_channel_id: Option<String>,
    pub full_channel_id: String,
    pub channel_point: String,
    pub state: String,
    pub remote_pubkey: String,
    pub local_balance_sat: u64,
    pub remote_balance_sat: u64,
}

/// One funding/closing history row derived from the timestamps map.
#[derive(Clone, Debug, Serialize)]
pub struct ChannelHistoryEntry {
    pub channel_id: String,
    pub funding_txid: String,
    pub funding_height: i32,
    pub funding_timestamp: Option<u64>,
    pub closing_txid: Option<String>,
    pub closing_height: Option<i32>,
    pub closing_timestamp: Option<u64>,
}

pub struct LnWallet {
    pub(crate) peer_manager: Arc<PeerManager>,
    pub(crate) graph: Arc<dyn ChannelGraph>,
    pub(crate) path_finder: Arc<dyn PathFinder>,
    pub(crate) watcher: Arc<dyn ChainWatcher>,
    pub(crate) broadcaster: Arc<dyn TxBroadcast>,
    pub(crate) host_wallet: Arc<dyn HostWallet>,
    pub(crate) db: WalletDb,
    pub(crate) local_watchtower: Option<Arc<dyn Watchtower>>,
    pub(crate) fee_estimator: Arc<dyn FeeEstimator>,
    pub(crate) codec: Arc<dyn InvoiceCodec>,
    pub(crate) config: Config,
    pub(crate) network: LnNetwork,
    pub(crate) events: LnEventBus,
    pub(crate) state: Mutex<WalletState>,
    pub(crate) pending_payments: PendingPayments,
    pub(crate) sweep_address: String,
    /// Set in [`start`](Self::start); used to marshal calls arriving from
    /// foreign (UI) threads onto the worker's runtime.
    runtime: OnceCell<Handle>,
    pub(crate) shutdown: ShutdownSignal,
    task_tx: mpsc::Sender<Task<()>>,
}

impl LnWallet {
    /// Build the worker: load (or create) the node identity, deserialize the
    /// persisted channels, and wire the peer manager. Returns the worker and
    /// the receiver over which per-peer tasks are handed to the host's task
    /// group.
    pub fn new(
        deps: Collaborators,
        config: Config,
        network: LnNetwork,
        shutdown: ShutdownSignal,
    ) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<Task<()>>)> {
        let db = WalletDb::new(deps.store.clone());
        let xprv = db.load_or_create_xprv(network);
        let keypair = NodeKeypair::from_xprv(&xprv)
            .context("Bad persisted LN node key")?;

        let features = LnFeatures::OPTION_DATA_LOSS_PROTECT_OPT
            | LnFeatures::OPTION_DATA_LOSS_PROTECT_REQ;

        let (task_tx, task_rx) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
        let peer_manager = Arc::new(PeerManager::new(
            keypair,
            features,
            network,
            config.clone(),
            deps.connector.clone(),
            deps.graph.clone(),
            deps.dns.clone(),
            task_tx.clone(),
            shutdown.clone(),
        ));

        let sweep_address = deps.host_wallet.receiving_address();

        let mut channels = HashMap::new();
        for value in db.load_channel_values() {
            let chan = deps
                .channel_loader
                .load_channel(value, &sweep_address)
                .context("Could not deserialize persisted channel")?;
            channels.insert(chan.channel_id(), chan);
        }

        let state = WalletState {
            channels,
            invoices: db.load_invoices(),
            preimages: db.load_preimages(),
            channel_timestamps: db.load_channel_timestamps(),
        };

        let wallet = Arc::new(Self {
            peer_manager,
            graph: deps.graph,
            path_finder: deps.path_finder,
            watcher: deps.watcher,
            broadcaster: deps.broadcaster,
            host_wallet: deps.host_wallet,
            db,
            local_watchtower: deps.local_watchtower,
            fee_estimator: deps.fee_estimator,
            codec: deps.codec,
            config,
            network,
            events: LnEventBus::new(),
            state: Mutex::new(state),
            pending_payments: PendingPayments::new(),
            sweep_address,
            runtime: OnceCell::new(),
            shutdown,
            task_tx,
        });

        let host: Weak<dyn PeerHost> =
            Arc::downgrade(&wallet) as Weak<dyn PeerHost>;
        wallet.peer_manager.bind_host(host);

        Ok((wallet, task_rx))
    }

    /// Register watches for the persisted channels and return the worker's
    /// long-lived tasks. Must be called from within the runtime that will
    /// drive the tasks.
    pub fn start(self: &Arc<Self>) -> Vec<Task<()>> {
        let _ = self.runtime.set(Handle::current());

        for chan in self.channels_snapshot() {
            self.watcher.add_channel(
                chan.funding_outpoint().to_string(),
                chan.get_funding_address(),
            );
        }
        self.peer_manager.add_peers_from_config();

        // Shortcut tick so channels whose funding tx is already verified
        // don't wait for the next network event.
        let this = self.clone();
        self.spawn_ephemeral(Task::spawn("(ln-initial-tick)", async move {
            this.on_network_update(crate::event::NetworkEvent::NetworkUpdated)
                .await;
        }));

        let mut tasks = vec![
            Task::spawn(
                "(peer-manager)",
                self.peer_manager.clone().main_loop(),
            ),
            Task::spawn(
                "(ln-listen)",
                self.peer_manager.clone().maybe_listen(),
            ),
            Task::spawn(
                "(ln-reestablish)",
                self.clone().reestablish_peers_and_channels(),
            ),
        ];
        if self.local_watchtower.is_some() {
            tasks.push(Task::spawn(
                "(watchtower-local)",
                self.clone().sync_with_local_watchtower(),
            ));
        }
        if self.config.watchtower_url.is_some() {
            tasks.push(Task::spawn(
                "(watchtower-remote)",
                self.clone().sync_with_remote_watchtower(),
            ));
        }
        tasks
    }

    pub fn events(&self) -> &LnEventBus {
        &self.events
    }

    pub fn node_pk(&self) -> NodePk {
        self.peer_manager.node_pk()
    }

    pub(crate) fn keypair(&self) -> &NodeKeypair {
        self.peer_manager.keypair()
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    pub(crate) fn spawn_ephemeral(&self, task: Task<()>) {
        if let Err(e) = self.task_tx.try_send(task) {
            match e {
                mpsc::error::TrySendError::Full(task)
                | mpsc::error::TrySendError::Closed(task) => task.detach(),
            }
        }
    }

    fn runtime(&self) -> &Handle {
        self.runtime.get().expect("LnWallet::start has not run yet")
    }

    /// Run `fut` on the worker runtime and block the calling (foreign)
    /// thread on the result, up to `timeout`. The task keeps running if the
    /// timeout fires.
    pub(crate) fn block_on_with_timeout<T: Send + 'static>(
        &self,
        name: &'static str,
        timeout: Duration,
        fut: impl std::future::Future<Output = anyhow::Result<T>>
            + Send
            + 'static,
    ) -> anyhow::Result<T> {
        let handle = self.runtime().clone();
        let join = handle.spawn(fut);
        handle
            .block_on(async move { time::timeout(timeout, join).await })
            .with_context(|| format!("{name} timed out"))?
            .with_context(|| format!("{name} task died"))?
    }

    // --- Channel store --- //

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().unwrap()
    }

    pub fn channels_snapshot(&self) -> Vec<Arc<dyn ChannelState>> {
        self.lock_state().channels.values().cloned().collect()
    }

    pub fn get_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Option<Arc<dyn ChannelState>> {
        self.lock_state().channels.get(channel_id).cloned()
    }

    pub fn channels_for_peer(
        &self,
        node_pk: &NodePk,
    ) -> Vec<Arc<dyn ChannelState>> {
        self.lock_state()
            .channels
            .values()
            .filter(|chan| chan.node_id() == *node_pk)
            .cloned()
            .collect()
    }

    /// Find a channel by its funding outpoint string (`txid:index`).
    pub fn channel_by_txo(
        &self,
        outpoint: &str,
    ) -> Option<Arc<dyn ChannelState>> {
        self.channels_snapshot()
            .into_iter()
            .find(|chan| chan.funding_outpoint().to_string() == outpoint)
    }

    pub fn get_channel_by_short_id(
        &self,
        scid: ShortChannelId,
    ) -> Option<Arc<dyn ChannelState>> {
        self.channels_snapshot()
            .into_iter()
            .find(|chan| chan.short_channel_id() == Some(scid))
    }

    /// Insert/replace and persist a channel.
    ///
    /// Panics if the channel's remote `next_per_commitment_point` equals its
    /// `current_per_commitment_point`: persisting that state would lose the
    /// ability to validate the remote's next revocation.
    pub fn save_channel(&self, chan: Arc<dyn ChannelState>) {
        let points = chan.remote_commitment_points();
        assert!(
            !points.next_equals_current(),
            "Tried to save channel with next_point == current_point, \
             this should not happen"
        );
        {
            let mut state = self.lock_state();
            state.channels.insert(chan.channel_id(), chan.clone());
            self.persist_channels(&state);
        }
        self.events.notify(LnEvent::Channel {
            channel_id: chan.channel_id(),
        });
    }

    /// Persist the full channel list without the state check.
    pub fn save_channels(&self) {
        let state = self.lock_state();
        self.persist_channels(&state);
    }

    fn persist_channels(&self, state: &WalletState) {
        let dumped = state
            .channels
            .values()
            .map(|chan| chan.to_value())
            .collect::<Vec<_>>();
        self.db.save_channel_values(dumped);
    }

    /// Forget a closed channel. Panics when called on a channel that is not
    /// closed.
    // TODO: also require that the closing tx is deep-mined and the htlcs
    // are swept.
    pub fn remove_channel(&self, channel_id: &ChannelId) {
        {
            let mut state = self.lock_state();
            let chan = state
                .channels
                .get(channel_id)
                .expect("remove_channel: unknown channel");
            assert!(chan.is_closed(), "Tried to remove an open channel");
            state.channels.remove(channel_id);
            self.persist_channels(&state);
        }
        self.on_channels_updated();
    }

    pub(crate) fn on_channels_updated(&self) {
        self.events.notify(LnEvent::Channels);
    }

    // --- Wallet-level queries --- //

    /// Sum of our side of every non-closed channel, in sat.
    pub fn get_balance_sat(&self) -> u64 {
        self.channels_snapshot()
            .iter()
            .filter(|chan| !chan.is_closed())
            .map(|chan| chan.balance_msat(Side::Local))
            .sum::<u64>()
            / 1000
    }

    pub fn list_channels(&self) -> Vec<ChannelSummary> {
        self.channels_snapshot()
            .iter()
            .map(|chan| ChannelSummary {
                short_channel_id: chan
                    .short_channel_id()
                    .map(|scid| scid.to_string()),
                full_channel_id: chan.channel_id().to_hex(),
                channel_point: chan.funding_outpoint().to_string(),
                state: chan.get_state().to_string(),
                remote_pubkey: chan.node_id().to_string(),
                local_balance_sat: chan.balance_msat(Side::Local) / 1000,
                remote_balance_sat: chan.balance_msat(Side::Remote) / 1000,
            })
            .collect()
    }

    /// Funding/closing rows for the history view.
    pub fn channel_history(&self) -> Vec<ChannelHistoryEntry> {
        let state = self.lock_state();
        let mut entries = state
            .channel_timestamps
            .iter()
            .map(|(channel_id, ts)| ChannelHistoryEntry {
                channel_id: channel_id.clone(),
                funding_txid: ts.0.clone(),
                funding_height: ts.1,
                funding_timestamp: ts.2,
                closing_txid: ts.3.clone(),
                closing_height: ts.4,
                closing_timestamp: ts.5,
            })
            .collect::<Vec<_>>();
        entries.sort_by_key(|e| e.funding_timestamp);
        entries
    }

    /// A random initialized peer all of whose channels with us are closed;
    /// a reasonable default counterparty for the next channel.
    pub fn suggest_peer(&self) -> Option<NodePk> {
        let candidates = self
            .peer_manager
            .peers_snapshot()
            .into_iter()
            .filter(|peer| peer.is_initialized())
            .map(|peer| peer.node_pk())
            .filter(|node_pk| {
                self.channels_for_peer(node_pk)
                    .iter()
                    .all(|chan| chan.is_closed())
            })
            .collect::<Vec<_>>();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    pub fn get_and_inc_counter_for_channel_keys(&self) -> i64 {
        self.db.get_and_inc_counter_for_channel_keys()
    }

    pub(crate) fn current_feerate_per_kw(&self) -> u64 {
        if self.network == LnNetwork::Regtest {
            return FEERATE_REGTEST_HARDCODED / 4;
        }
        let per_kvbyte = self
            .fee_estimator
            .eta_target_to_fee(FEE_LN_ETA_TARGET)
            .unwrap_or(FEERATE_FALLBACK_STATIC_FEE);
        std::cmp::max(253, per_kvbyte / 4)
    }

    // --- Peer / channel entry points --- //

    /// Resolve a `node_pk[@host:port]` connect string to a live peer,
    /// dialing if necessary.
    pub async fn add_peer(
        &self,
        connect_str: &str,
    ) -> anyhow::Result<Arc<dyn PeerSession>> {
        let (node_pk, rest) = parse_conn_string(connect_str)?;
        if let Some(peer) = self.peer_manager.get_peer(&node_pk) {
            return Ok(peer);
        }
        let (host, port) = match rest {
            Some(host_port) => host_port,
            None => {
                let addrs = self.graph.get_node_addresses(&node_pk);
                let preferred = choose_preferred_address(&addrs)
                    .ok_or(ConnStringError::NoKnownAddresses(node_pk))?;
                (preferred.host.clone(), preferred.port)
            }
        };
        // Resolve early so a bad hostname fails as a conn string error
        // rather than deep inside the transport.
        tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|_| ConnStringError::Unresolvable(host.clone()))?;
        self.peer_manager
            .add_peer(&PeerAddress::new(host, port, node_pk))
            .await
    }

    /// Open a channel with `connect_str`, funding it with
    /// `local_amount_sat` and pushing `push_sat` to the remote. Blocking;
    /// callable from foreign threads.
    pub fn open_channel(
        self: &Arc<Self>,
        connect_str: &str,
        local_amount_sat: u64,
        push_sat: u64,
    ) -> anyhow::Result<ChannelId> {
        let this = self.clone();
        let connect_str = connect_str.to_owned();
        self.block_on_with_timeout(
            "open_channel",
            OPEN_CHANNEL_TIMEOUT,
            async move {
                this.open_channel_coroutine(
                    &connect_str,
                    local_amount_sat,
                    push_sat,
                )
                .await
            },
        )
    }

    async fn open_channel_coroutine(
        self: &Arc<Self>,
        connect_str: &str,
        local_amount_sat: u64,
        push_sat: u64,
    ) -> anyhow::Result<ChannelId> {
        let peer = self.add_peer(connect_str).await?;
        // The peer might just have been connected to.
        time::timeout(LN_P2P_NETWORK_TIMEOUT, peer.wait_initialized())
            .await
            .context("Peer did not initialize in time")?;
        let chan = peer
            .channel_establishment_flow(
                local_amount_sat + push_sat,
                push_sat * 1000,
                ChannelId::random(),
            )
            .await
            .context("Channel establishment failed")?;
        self.save_channel(chan.clone());
        self.watcher.add_channel(
            chan.funding_outpoint().to_string(),
            chan.get_funding_address(),
        );
        self.on_channels_updated();
        Ok(chan.channel_id())
    }

    /// Cooperatively close a channel through its peer.
    pub async fn close_channel(
        &self,
        channel_id: &ChannelId,
    ) -> anyhow::Result<Txid> {
        let chan = self
            .get_channel(channel_id)
            .with_context(|| format!("Unknown channel: {channel_id}"))?;
        let peer = self
            .peer_manager
            .get_peer(&chan.node_id())
            .context("Peer not connected")?;
        peer.close_channel(*channel_id).await
    }

    /// Unilaterally close: broadcast our latest commitment tx.
    pub async fn force_close_channel(
        &self,
        channel_id: &ChannelId,
    ) -> anyhow::Result<Txid> {
        let chan = self
            .get_channel(channel_id)
            .with_context(|| format!("Unknown channel: {channel_id}"))?;
        let tx = chan.force_close_tx();
        let txid = tx.txid();
        chan.set_force_closed();
        self.save_channel(chan);
        self.on_channels_updated();
        self.broadcaster.broadcast(&tx).await.map_err(|e| {
            info!("could NOT publish {txid}: {e:#}");
            e
        })?;
        Ok(txid)
    }

    // --- Reestablishment loop --- //

    /// Redial peers we have a channel with, and reestablish channels whose
    /// peer is already connected. 1s cadence, gated on on-chain sync.
    pub(crate) async fn reestablish_peers_and_channels(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                () = shutdown.recv() => return,
                () = time::sleep(Duration::from_secs(1)) => (),
            }
            // Wait until on-chain state is synchronized.
            if !(self.host_wallet.is_up_to_date()
                && self.watcher.is_up_to_date())
            {
                continue;
            }
            for chan in self.channels_snapshot() {
                if chan.is_closed() {
                    continue;
                }
                if self.network != LnNetwork::Regtest {
                    let chan_feerate =
                        u64::from(chan.get_latest_feerate(Side::Local));
                    let recommended = self.current_feerate_per_kw();
                    if 2 * chan_feerate < recommended {
                        warn!(
                            "fee level for channel {} is {chan_feerate} \
                             sat/kiloweight, current recommended feerate is \
                             {recommended} sat/kiloweight, consider force \
                             closing!",
                            chan.channel_id()
                        );
                    }
                }
                if !chan.should_try_to_reestablish_peer() {
                    continue;
                }
                match self.peer_manager.get_peer(&chan.node_id()) {
                    Some(peer) => {
                        let chan = chan.clone();
                        self.spawn_ephemeral(Task::spawn(
                            "(reestablish-chan)",
                            async move {
                                if let Err(e) =
                                    peer.reestablish_channel(chan).await
                                {
                                    info!("reestablish failed: {e:#}");
                                }
                            },
                        ));
                    }
                    None => {
                        let this = self.clone();
                        self.spawn_ephemeral(Task::spawn(
                            "(reestablish-peer)",
                            async move {
                                this.reestablish_peer_for_given_channel(chan)
                                    .await;
                            },
                        ));
                    }
                }
            }
        }
    }

    async fn reestablish_peer_for_given_channel(
        self: &Arc<Self>,
        chan: Arc<dyn ChannelState>,
    ) {
        let now = now_unix();
        let retry_secs = PEER_RETRY_INTERVAL_FOR_CHANNELS.as_secs();
        // Try the last good address first.
        if let Some(peer) = self.graph.get_last_good_address(&chan.node_id())
        {
            let last_tried =
                self.peer_manager.last_tried_at(&peer).unwrap_or(0);
            if last_tried + retry_secs < now {
                if let Err(e) = self.peer_manager.add_peer(&peer).await {
                    info!("reconnect failed: {e:#}");
                }
                return;
            }
        }
        // Otherwise a random address for the node.
        let addrs = self.graph.get_node_addresses(&chan.node_id());
        let choice = match addrs.choose(&mut rand::thread_rng()) {
            Some(choice) => choice,
            None => return,
        };
        let peer = PeerAddress::new(
            choice.host.clone(),
            choice.port,
            chan.node_id(),
        );
        let last_tried = self.peer_manager.last_tried_at(&peer).unwrap_or(0);
        if last_tried + retry_secs < now {
            if let Err(e) = self.peer_manager.add_peer(&peer).await {
                info!("reconnect failed: {e:#}");
            }
        }
    }
}

// --- What peers may ask of the wallet --- //

impl PeerHost for LnWallet {
    fn peer_closed(&self, node_pk: &NodePk) {
        for chan in self.channels_for_peer(node_pk) {
            chan.set_state(ChannelPhase::Disconnected);
            self.events.notify(LnEvent::Channel {
                channel_id: chan.channel_id(),
            });
        }
        self.peer_manager.remove_peer(node_pk);
    }

    fn save_channel(&self, chan: Arc<dyn ChannelState>) {
        LnWallet::save_channel(self, chan)
    }

    fn htlc_settled(
        &self,
        scid: ShortChannelId,
        htlc_id: u64,
        success: bool,
    ) {
        self.pending_payments.resolve((scid, htlc_id), success);
    }

    fn htlc_fulfilled(&self, payment_hash: PaymentHash) {
        self.set_invoice_status(payment_hash, InvoiceStatus::Paid);
    }

    fn get_preimage(&self, payment_hash: &PaymentHash) -> Option<Preimage> {
        LnWallet::get_preimage(self, payment_hash)
    }

    fn payment_completed(
        &self,
        chan_id: ChannelId,
        direction: Direction,
        htlc: Htlc,
    ) {
        let preimage = LnWallet::get_preimage(self, &htlc.payment_hash);
        self.events.notify(LnEvent::LnPaymentCompleted {
            timestamp: now_unix(),
            direction,
            htlc,
            preimage,
            channel_id: chan_id,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{TestHarness, TestHarnessBuilder};

    #[tokio::test]
    async fn save_channel_persists_and_notifies() {
        let h = TestHarness::new().await;
        let chan = h.add_channel(ChannelPhase::Open, 500_000_000, 500_000_000);
        let mut events = h.wallet.events().subscribe();

        h.wallet.save_channel(chan.clone());

        match events.recv().await {
            LnEvent::Channel { channel_id } =>
                assert_eq!(channel_id, chan.channel_id()),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.wallet.db.load_channel_values().len(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "next_point == current_point")]
    async fn save_channel_rejects_stale_commitment_point() {
        let h = TestHarness::new().await;
        let chan = h.add_channel(ChannelPhase::Open, 1_000, 1_000);
        chan.make_remote_points_coincide();
        h.wallet.save_channel(chan);
    }

    #[tokio::test]
    async fn remove_channel_requires_closed() {
        let h = TestHarness::new().await;
        let chan = h.add_channel(ChannelPhase::Open, 1_000, 1_000);
        chan.set_state(ChannelPhase::Closed);
        h.wallet.remove_channel(&chan.channel_id());
        assert!(h.wallet.get_channel(&chan.channel_id()).is_none());
    }

    #[tokio::test]
    async fn balance_ignores_closed_channels() {
        let h = TestHarness::new().await;
        h.add_channel(ChannelPhase::Open, 250_000_000, 0);
        let closed = h.add_channel(ChannelPhase::Open, 99_000_000, 0);
        closed.set_state(ChannelPhase::Closed);
        assert_eq!(h.wallet.get_balance_sat(), 250_000);
    }

    #[tokio::test]
    async fn peer_closed_marks_channels_disconnected() {
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 1_000, 1_000);
        let node_pk = chan.node_id();
        let peer = h.connect_mock_peer(node_pk).await;
        assert!(h.wallet.peer_manager().contains_peer(&node_pk));

        h.wallet.peer_closed(&node_pk);

        assert!(!h.wallet.peer_manager().contains_peer(&node_pk));
        assert_eq!(chan.get_state(), ChannelPhase::Disconnected);
        drop(peer);
    }

    #[tokio::test]
    async fn at_most_one_session_per_pubkey() {
        let h = TestHarness::new().await;
        let node_pk = crate::test_support::dummy_node_pk(33);
        let first = h.connect_mock_peer(node_pk).await;

        // Dialing an already-connected pubkey hands back the live session
        // without consuming a new connection.
        let again = h
            .wallet
            .peer_manager()
            .add_peer(&PeerAddress::new("127.0.0.1", 9735, node_pk))
            .await
            .unwrap();
        assert_eq!(again.node_pk(), first.node_pk());
        assert_eq!(h.wallet.peer_manager().num_peers(), 1);
    }

    #[tokio::test]
    async fn lookup_by_txo_and_scid() {
        let h = TestHarness::new().await;
        let chan = h.add_channel(ChannelPhase::Open, 1_000, 1_000);
        let scid = chan.short_channel_id().unwrap();
        let outpoint = chan.funding_outpoint().to_string();

        assert!(h.wallet.get_channel_by_short_id(scid).is_some());
        assert!(h.wallet.channel_by_txo(&outpoint).is_some());
        assert!(h
            .wallet
            .get_channel_by_short_id(ShortChannelId::from_components(
                1, 1, 1
            ))
            .is_none());
    }
}
