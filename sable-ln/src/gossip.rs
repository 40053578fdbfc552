//! The gossip worker: a second worker personality with a throwaway identity
//! that runs only the peer manager plus channel-graph maintenance and the
//! unknown-channel-id query queue.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use sable_tokio::{
    shutdown::ShutdownSignal, task::Task, DEFAULT_CHANNEL_SIZE,
};
use tokio::{sync::mpsc, time};
use tracing::info;

use crate::{
    config::{Config, LnNetwork},
    event::{LnEvent, LnEventBus},
    keys::NodeKeypair,
    peer_addr::NodePk,
    peer_manager::{LnFeatures, PeerManager},
    scid::ShortChannelId,
    traits::{ChannelGraph, DnsResolver, PeerConnector, PeerHost},
};

/// Drop graph policies older than this during maintenance.
const GRAPH_POLICY_MAX_AGE: Duration =
    Duration::from_secs(14 * 24 * 3600);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(120);
/// How many unknown channel ids one query drains.
const IDS_PER_QUERY: usize = 500;

pub struct LnGossip {
    pub peer_manager: Arc<PeerManager>,
    graph: Arc<dyn ChannelGraph>,
    events: LnEventBus,
    /// Channel ids announced by peers that the graph does not know yet.
    unknown_ids: Mutex<HashSet<ShortChannelId>>,
    shutdown: ShutdownSignal,
}

impl LnGossip {
    /// Build the gossip worker with a fresh random identity. Returns the
    /// worker and the receiver over which per-peer tasks are handed to the
    /// host's task group.
    pub fn new(
        network: LnNetwork,
        config: Config,
        connector: Arc<dyn PeerConnector>,
        graph: Arc<dyn ChannelGraph>,
        dns: Arc<dyn DnsResolver>,
        shutdown: ShutdownSignal,
    ) -> (Arc<Self>, mpsc::Receiver<Task<()>>) {
        let keypair = NodeKeypair::random(network);
        // Peers expect DATA_LOSS_PROTECT even from a gossip-only node.
        let features = LnFeatures::OPTION_DATA_LOSS_PROTECT_OPT
            | LnFeatures::GOSSIP_QUERIES_OPT
            | LnFeatures::GOSSIP_QUERIES_REQ;

        let (task_tx, task_rx) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
        let peer_manager = Arc::new(PeerManager::new(
            keypair,
            features,
            network,
            config,
            connector,
            graph.clone(),
            dns,
            task_tx,
            shutdown.clone(),
        ));

        let gossip = Arc::new(Self {
            peer_manager,
            graph,
            events: LnEventBus::new(),
            unknown_ids: Mutex::new(HashSet::new()),
            shutdown,
        });
        let host: Weak<dyn PeerHost> =
            Arc::downgrade(&gossip) as Weak<dyn PeerHost>;
        gossip.peer_manager.bind_host(host);
        (gossip, task_rx)
    }

    pub fn start(self: &Arc<Self>) -> Vec<Task<()>> {
        vec![
            Task::spawn(
                "(gossip-peer-manager)",
                self.peer_manager.clone().main_loop(),
            ),
            Task::spawn("(gossip-maintain-db)", self.clone().maintain_db()),
        ]
    }

    pub fn events(&self) -> &LnEventBus {
        &self.events
    }

    /// Periodic graph maintenance: while there is nothing left to query,
    /// prune old policies and orphaned channels. Also refreshes the status
    /// line.
    async fn maintain_db(self: Arc<Self>) {
        self.graph.wait_data_loaded().await;
        let mut shutdown = self.shutdown.clone();
        loop {
            if self.unknown_ids.lock().unwrap().is_empty() {
                self.graph.prune_old_policies(GRAPH_POLICY_MAX_AGE);
                self.graph.prune_orphaned_channels();
            }
            self.refresh_status();
            tokio::select! {
                () = shutdown.recv() => return,
                () = time::sleep(MAINTENANCE_INTERVAL) => (),
            }
        }
    }

    /// Publish `ln_status` so the host UI can show sync progress.
    pub fn refresh_status(&self) {
        let known = self.graph.num_channels();
        let unknown = self.unknown_ids.lock().unwrap().len();
        let num_nodes = self.graph.num_nodes();
        let num_peers = self
            .peer_manager
            .peers_snapshot()
            .iter()
            .filter(|peer| peer.is_initialized())
            .count();
        info!("Channels: {known}. Missing: {unknown}");
        self.events.notify(LnEvent::LnStatus {
            num_peers,
            num_nodes,
            known_channels: known,
            unknown_channels: unknown,
        });
    }

    /// Peers reported channel ids; remember the ones the graph is missing.
    pub fn add_new_ids(
        &self,
        ids: impl IntoIterator<Item = ShortChannelId>,
    ) {
        let known = self.graph.get_channel_ids();
        let mut unknown = self.unknown_ids.lock().unwrap();
        for id in ids {
            if !known.contains(&id) {
                unknown.insert(id);
            }
        }
    }

    /// Drain up to 500 unknown ids for the next `query_short_channel_ids`.
    pub fn get_ids_to_query(&self) -> Vec<ShortChannelId> {
        let mut unknown = self.unknown_ids.lock().unwrap();
        let batch = unknown
            .iter()
            .take(IDS_PER_QUERY)
            .copied()
            .collect::<Vec<_>>();
        for id in &batch {
            unknown.remove(id);
        }
        batch
    }
}

impl PeerHost for LnGossip {
    fn peer_closed(&self, node_pk: &NodePk) {
        self.peer_manager.remove_peer(node_pk);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{MockConnector, MockDns, MockGraph};

    fn make_gossip() -> (Arc<LnGossip>, Arc<MockGraph>) {
        let graph = Arc::new(MockGraph::new());
        let (gossip, _task_rx) = LnGossip::new(
            LnNetwork::Regtest,
            Config::default(),
            Arc::new(MockConnector::new()),
            graph.clone(),
            Arc::new(MockDns::new()),
            ShutdownSignal::new(),
        );
        (gossip, graph)
    }

    #[test]
    fn unknown_ids_exclude_known_channels() {
        let (gossip, graph) = make_gossip();
        let known = ShortChannelId::from_components(1, 1, 1);
        let unknown = ShortChannelId::from_components(2, 2, 2);
        graph.add_channel_id(known);

        gossip.add_new_ids([known, unknown]);
        assert_eq!(gossip.get_ids_to_query(), vec![unknown]);
    }

    #[test]
    fn query_drains_in_batches() {
        let (gossip, _graph) = make_gossip();
        let ids = (0..700)
            .map(|i| ShortChannelId::from_components(i, 0, 0))
            .collect::<Vec<_>>();
        gossip.add_new_ids(ids);

        let first = gossip.get_ids_to_query();
        assert_eq!(first.len(), 500);
        let second = gossip.get_ids_to_query();
        assert_eq!(second.len(), 200);
        assert!(gossip.get_ids_to_query().is_empty());
    }
}
