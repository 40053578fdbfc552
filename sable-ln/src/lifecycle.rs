//! The channel lifecycle driver: walks every non-closed channel on each
//! network tick, assigns short channel ids once the funding tx is deep
//! enough, triggers `funding_locked`, and force-closes channels whose HTLCs
//! are about to expire unsafely.

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, info};

use crate::{
    channel::{ChannelPhase, ChannelState, Htlc, Side},
    event::{LnEvent, NetworkEvent},
    invoice::Direction,
    scid::ShortChannelId,
    traits::{TxConfirmation, TX_HEIGHT_LOCAL},
    worker::LnWallet,
};

/// Blocks of grace before the expiry of a received HTLC whose preimage we
/// already released: if the remote has not cleaned it up by then, we claim
/// on-chain.
pub const NBLOCK_DEADLINE_BEFORE_EXPIRY_FOR_RECEIVED_HTLCS: u32 = 28;
/// Blocks of grace after the expiry of an HTLC we offered, before we time it
/// out on-chain.
pub const NBLOCK_DEADLINE_AFTER_EXPIRY_FOR_OFFERED_HTLCS: u32 = 1;

/// Never force-close over less than this many sats of endangered HTLCs.
const MIN_VALUE_WORTH_CLOSING_CHANNEL_OVER_SAT: u64 = 500_000;

impl LnWallet {
    /// The funding tx of one of our channels was first observed on-chain.
    pub fn on_channel_open(
        &self,
        funding_outpoint: &str,
        funding_txid: &str,
        funding_height: TxConfirmation,
    ) {
        let chan = match self.channel_by_txo(funding_outpoint) {
            Some(chan) => chan,
            None => return,
        };
        debug!("on_channel_open {funding_outpoint}");
        {
            let mut state = self.lock_state();
            state.channel_timestamps.insert(
                chan.channel_id().to_hex(),
                (
                    funding_txid.to_owned(),
                    funding_height.height,
                    funding_height.timestamp,
                    None,
                    None,
                    None,
                ),
            );
            self.db.save_channel_timestamps(&state.channel_timestamps);
        }
        chan.set_funding_txo_spent(false);
        self.events.notify(LnEvent::Channel {
            channel_id: chan.channel_id(),
        });
    }

    /// One lifecycle tick: called for every `wallet_updated`,
    /// `network_updated`, `verified` and `fee` callback from the host.
    pub async fn on_network_update(self: Arc<Self>, event: NetworkEvent) {
        for chan in self.channels_snapshot() {
            if chan.is_closed() {
                continue;
            }
            if chan.get_state() != ChannelPhase::Closed
                && self.should_channel_be_closed_due_to_expiring_htlcs(&chan)
            {
                info!("force-closing due to expiring htlcs");
                if let Err(e) =
                    self.force_close_channel(&chan.channel_id()).await
                {
                    info!("force close failed: {e:#}");
                }
                continue;
            }
            if chan.short_channel_id().is_none() {
                self.save_short_chan_id(&chan);
            }
            if chan.get_state() == ChannelPhase::Opening
                && chan.short_channel_id().is_some()
            {
                match self.peer_manager.get_peer(&chan.node_id()) {
                    Some(peer) => peer.send_funding_locked(chan.clone()),
                    None => continue,
                }
            } else if chan.get_state() == ChannelPhase::Open {
                let peer = match self.peer_manager.get_peer(&chan.node_id())
                {
                    Some(peer) => peer,
                    None => {
                        info!("peer not found for {}", chan.node_id());
                        return;
                    }
                };
                if event == NetworkEvent::Fee {
                    if let Err(e) = peer.update_fee(chan.clone()).await {
                        info!("fee update failed: {e:#}");
                    }
                }
                let conf = self
                    .watcher
                    .get_tx_height(&chan.funding_outpoint().txid)
                    .conf;
                peer.on_network_update(chan.clone(), conf);
            } else if chan.is_force_closed()
                && chan.get_state() != ChannelPhase::Closed
            {
                let txid = chan.force_close_tx().txid();
                let height = self.watcher.get_tx_height(&txid).height;
                info!("force closing tx {txid}, height {height}");
                if height == TX_HEIGHT_LOCAL {
                    info!("REBROADCASTING CLOSING TX");
                    if let Err(e) =
                        self.force_close_channel(&chan.channel_id()).await
                    {
                        info!("rebroadcast failed: {e:#}");
                    }
                }
            }
        }
    }

    /// Read the funding tx's depth; once it confirms, compute the predicted
    /// short channel id, and once it is deep enough, commit and persist it.
    pub(crate) fn save_short_chan_id(&self, chan: &Arc<dyn ChannelState>) {
        let funding = chan.funding_outpoint();
        let conf = self.watcher.get_tx_height(&funding.txid).conf;
        let min_depth = chan.constraints().funding_txn_minimum_depth;
        if conf > 0 {
            let (block_height, tx_pos) =
                match self.watcher.get_txpos(&funding.txid) {
                    Some(pos) => pos,
                    None => return,
                };
            let predicted = ShortChannelId::from_components(
                block_height,
                tx_pos,
                funding.vout as u16,
            );
            if conf >= min_depth && min_depth > 0 {
                chan.set_short_channel_id(predicted);
                info!("save_short_channel_id: {predicted}");
                self.save_channel(chan.clone());
                self.on_channels_updated();
                return;
            }
        }
        info!(
            "funding tx is still not at sufficient depth. actual depth: \
             {conf}"
        );
    }

    /// The expiring-HTLC safety predicate: sum the sats of (a) received
    /// HTLCs whose preimage the remote already saw and whose expiry is
    /// dangerously close, and (b) offered HTLCs already past their expiry
    /// plus grace. Close when the total outweighs the cost of closing.
    pub(crate) fn should_channel_be_closed_due_to_expiring_htlcs(
        &self,
        chan: &Arc<dyn ChannelState>,
    ) -> bool {
        let local_height = i64::from(self.watcher.get_local_height());
        let mut htlcs_we_could_reclaim: HashMap<(Direction, u64), Htlc> =
            HashMap::new();

        // A received HTLC for which we already released the preimage, but
        // whose CLTV is dangerously close to the present: the remote may be
        // stalling revocation, so claim on-chain.
        let recv_deadline =
            i64::from(NBLOCK_DEADLINE_BEFORE_EXPIRY_FOR_RECEIVED_HTLCS);
        let received_views = [
            (Side::Local, chan.get_latest_ctn(Side::Local)),
            (Side::Remote, chan.get_oldest_unrevoked_ctn(Side::Local)),
            (Side::Remote, chan.get_latest_ctn(Side::Local)),
        ];
        for (subject, ctn) in received_views {
            let direction = match subject {
                Side::Local => Direction::Received,
                Side::Remote => Direction::Sent,
            };
            for (htlc_id, htlc) in
                chan.htlcs_by_direction(subject, direction, ctn)
            {
                if !chan.was_htlc_preimage_released(htlc_id, Side::Remote) {
                    continue;
                }
                if i64::from(htlc.cltv_expiry) - recv_deadline
                    > local_height
                {
                    continue;
                }
                htlcs_we_could_reclaim
                    .insert((Direction::Received, htlc_id), htlc);
            }
        }

        // An offered HTLC which expired (plus some grace): time it out
        // on-chain.
        let offered_deadline =
            i64::from(NBLOCK_DEADLINE_AFTER_EXPIRY_FOR_OFFERED_HTLCS);
        let offered_views = [
            (Side::Local, chan.get_latest_ctn(Side::Local)),
            (Side::Remote, chan.get_oldest_unrevoked_ctn(Side::Local)),
            (Side::Remote, chan.get_latest_ctn(Side::Local)),
        ];
        for (subject, ctn) in offered_views {
            let direction = match subject {
                Side::Local => Direction::Sent,
                Side::Remote => Direction::Received,
            };
            for (htlc_id, htlc) in
                chan.htlcs_by_direction(subject, direction, ctn)
            {
                if i64::from(htlc.cltv_expiry) + offered_deadline
                    > local_height
                {
                    continue;
                }
                htlcs_we_could_reclaim
                    .insert((Direction::Sent, htlc_id), htlc);
            }
        }

        let total_value_sat: u64 = htlcs_we_could_reclaim
            .values()
            .map(|htlc| htlc.amount_msat / 1000)
            .sum();
        let num_htlcs = htlcs_we_could_reclaim.len() as u64;
        let min_value_worth_closing_channel_over_sat = std::cmp::max(
            num_htlcs * 10 * chan.remote_dust_limit_sat(),
            MIN_VALUE_WORTH_CLOSING_CHANNEL_OVER_SAT,
        );
        total_value_sat > min_value_worth_closing_channel_over_sat
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        event::NetworkEvent,
        test_support::{TestHarness, TestHarnessBuilder},
    };

    #[tokio::test]
    async fn scid_assigned_once_funding_is_deep_enough() {
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_unfunded_channel(ChannelPhase::Opening);
        let funding_txid = chan.funding_outpoint().txid;
        let chan_obj = chan.clone() as Arc<dyn ChannelState>;

        // Not yet confirmed: no scid.
        h.wallet.save_short_chan_id(&chan_obj);
        assert!(chan.short_channel_id().is_none());

        // One conf, but min depth is 3.
        h.watcher.confirm_tx(funding_txid, 600_000, 5, 1);
        h.wallet.save_short_chan_id(&chan_obj);
        assert!(chan.short_channel_id().is_none());

        // Deep enough.
        h.watcher.confirm_tx(funding_txid, 600_000, 5, 3);
        h.wallet.save_short_chan_id(&chan_obj);
        let scid = chan.short_channel_id().unwrap();
        assert_eq!(scid.block_height(), 600_000);
        assert_eq!(scid.tx_index(), 5);
        assert_eq!(
            scid.output_index(),
            chan.funding_outpoint().vout as u16
        );
    }

    #[tokio::test]
    async fn opening_channel_gets_funding_locked_on_tick() {
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_unfunded_channel(ChannelPhase::Opening);
        let peer = h.connect_mock_peer(chan.node_id()).await;
        h.watcher.confirm_tx(chan.funding_outpoint().txid, 600_000, 5, 3);

        h.wallet
            .clone()
            .on_network_update(NetworkEvent::Verified)
            .await;

        assert!(chan.short_channel_id().is_some());
        assert_eq!(peer.funding_locked_sent(), vec![chan.channel_id()]);
    }

    #[tokio::test]
    async fn expiring_received_htlc_forces_close() {
        // S5: one received HTLC, preimage released, expiry one block inside
        // the deadline, 600k sats. The next tick force-closes.
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 0, 0);
        let height = h.watcher.local_height();
        chan.add_received_htlc_with_released_preimage(
            600_000_000,
            height + NBLOCK_DEADLINE_BEFORE_EXPIRY_FOR_RECEIVED_HTLCS - 1,
        );

        assert!(h
            .wallet
            .should_channel_be_closed_due_to_expiring_htlcs(
                &(chan.clone() as Arc<dyn ChannelState>)
            ));

        h.wallet
            .clone()
            .on_network_update(NetworkEvent::Verified)
            .await;

        assert!(chan.is_force_closed());
        let broadcast = h.broadcaster.broadcasted();
        assert_eq!(broadcast.len(), 1);
        assert_eq!(broadcast[0].txid(), chan.force_close_tx().txid());
    }

    #[tokio::test]
    async fn small_expiring_htlcs_are_not_worth_closing_over() {
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 0, 0);
        let height = h.watcher.local_height();
        // 400k sats < the 500k floor.
        chan.add_received_htlc_with_released_preimage(
            400_000_000,
            height + NBLOCK_DEADLINE_BEFORE_EXPIRY_FOR_RECEIVED_HTLCS - 1,
        );
        assert!(!h
            .wallet
            .should_channel_be_closed_due_to_expiring_htlcs(
                &(chan as Arc<dyn ChannelState>)
            ));
    }

    #[tokio::test]
    async fn unreleased_preimage_does_not_trigger_close() {
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 0, 0);
        let height = h.watcher.local_height();
        chan.add_received_htlc(600_000_000, height + 1);
        assert!(!h
            .wallet
            .should_channel_be_closed_due_to_expiring_htlcs(
                &(chan as Arc<dyn ChannelState>)
            ));
    }

    #[tokio::test]
    async fn expired_offered_htlc_forces_close() {
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 0, 0);
        let height = h.watcher.local_height();
        chan.add_offered_htlc(
            700_000_000,
            height - NBLOCK_DEADLINE_AFTER_EXPIRY_FOR_OFFERED_HTLCS,
        );
        assert!(h
            .wallet
            .should_channel_be_closed_due_to_expiring_htlcs(
                &(chan as Arc<dyn ChannelState>)
            ));
    }

    #[tokio::test]
    async fn on_channel_open_records_timestamps() {
        let h = TestHarness::new().await;
        let chan = h.add_channel(ChannelPhase::Open, 0, 0);
        let outpoint = chan.funding_outpoint().to_string();
        let txid = chan.funding_outpoint().txid.to_string();

        h.wallet.on_channel_open(
            &outpoint,
            &txid,
            TxConfirmation {
                height: 600_000,
                conf: 1,
                timestamp: Some(1_700_000_000),
            },
        );

        let history = h.wallet.channel_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].funding_txid, txid);
        assert_eq!(history[0].funding_height, 600_000);
        assert!(history[0].closing_txid.is_none());
    }
}
