//! The on-chain reaction loop: invoked once per channel close, it records
//! the closing metadata, enumerates every output owed to us, and broadcasts
//! or schedules each sweep, chaining a second sweep behind HTLC
//! success/timeout transactions.

use std::{collections::HashMap, str::FromStr};

use bitcoin::{Transaction, Txid};
use tracing::{debug, info};

use crate::{
    channel::{ChannelPhase, SweepInfo},
    event::LnEvent,
    traits::TxConfirmation,
    worker::LnWallet,
};

impl LnWallet {
    /// The funding output of one of our channels was spent: `closing_tx`
    /// confirmed, and `spenders` maps every spent prevout (`txid:index`) of
    /// the close to the txid spending it.
    #[allow(clippy::too_many_arguments)]
    pub async fn on_channel_closed(
        &self,
        funding_outpoint: &str,
        spenders: &HashMap<String, Txid>,
        funding_txid: &str,
        funding_height: TxConfirmation,
        closing_txid: &str,
        closing_height: TxConfirmation,
        closing_tx: &Transaction,
    ) {
        let chan = match self.channel_by_txo(funding_outpoint) {
            Some(chan) => chan,
            None => return,
        };
        debug!("on_channel_closed {funding_outpoint}");
        {
            let mut state = self.lock_state();
            state.channel_timestamps.insert(
                chan.channel_id().to_hex(),
                (
                    funding_txid.to_owned(),
                    funding_height.height,
                    funding_height.timestamp,
                    Some(closing_txid.to_owned()),
                    Some(closing_height.height),
                    closing_height.timestamp,
                ),
            );
            self.db.save_channel_timestamps(&state.channel_timestamps);
        }
        chan.set_funding_txo_spent(true);
        chan.set_state(ChannelPhase::Closed);
        self.on_channels_updated();
        self.events.notify(LnEvent::Channel {
            channel_id: chan.channel_id(),
        });
        // The channel is gone from the public graph too.
        if let Some(scid) = chan.short_channel_id() {
            self.graph.remove_channel(scid);
        }

        // Detect who closed and collect the sweep outputs.
        let sweep_info_map = chan.sweep_ctx(closing_tx);
        info!("sweep_info_dict length: {}", sweep_info_map.len());
        for (prevout, sweep_info) in sweep_info_map {
            let name = sweep_info.name.clone();
            match spenders.get(&prevout) {
                Some(spender_txid) => {
                    // Someone already spent this output. If it was spent by
                    // an HTLC-success/timeout tx of ours, that tx's output
                    // can be swept a second time.
                    let spender_tx = match self
                        .watcher
                        .get_transaction(spender_txid)
                        .await
                    {
                        Ok(tx) => tx,
                        Err(e) => {
                            info!(
                                "could not fetch spender {spender_txid}: \
                                 {e:#}"
                            );
                            continue;
                        }
                    };
                    match chan.sweep_htlc(closing_tx, &spender_tx) {
                        Some(e_htlc_tx) => {
                            let second_stage =
                                format!("{spender_txid}:0");
                            if spenders.contains_key(&second_stage) {
                                info!(
                                    "htlc is already spent {name}: {prevout}"
                                );
                            } else {
                                info!(
                                    "trying to redeem htlc {name}: {prevout}"
                                );
                                self.try_redeem(&second_stage, &e_htlc_tx)
                                    .await;
                            }
                        }
                        None => {
                            info!("outpoint already spent {name}: {prevout}")
                        }
                    }
                }
                None => {
                    info!("trying to redeem {name}: {prevout}");
                    self.try_redeem(&prevout, &sweep_info).await;
                }
            }
        }
    }

    /// Build and broadcast one sweep tx, or schedule it as a future tx when
    /// its CLTV/CSV lock has not run out yet.
    pub(crate) async fn try_redeem(
        &self,
        prevout: &str,
        sweep_info: &SweepInfo,
    ) {
        let name = &sweep_info.name;
        let (prev_txid, _prev_index) =
            match prevout.split_once(':') {
                Some(parts) => parts,
                None => {
                    info!("bad prevout for {name}: {prevout}");
                    return;
                }
            };

        let mut broadcast = true;
        let mut wait_blocks = 0u32;
        if let Some(cltv_expiry) = sweep_info.cltv_expiry {
            let local_height = self.watcher.get_local_height();
            if cltv_expiry > local_height {
                info!(
                    "waiting for {name}: CLTV ({local_height} > \
                     {cltv_expiry}), prevout {prevout}"
                );
                broadcast = false;
                wait_blocks = wait_blocks.max(cltv_expiry - local_height);
            }
        }
        if let Some(csv_delay) = sweep_info.csv_delay {
            let conf = Txid::from_str(prev_txid)
                .map(|txid| self.watcher.get_tx_height(&txid).conf)
                .unwrap_or(0);
            if csv_delay > conf {
                info!(
                    "waiting for {name}: CSV ({conf} >= {csv_delay}), \
                     prevout: {prevout}"
                );
                broadcast = false;
                wait_blocks = wait_blocks.max(csv_delay - conf);
            }
        }

        let tx = match (sweep_info.gen_tx)() {
            Some(tx) => tx,
            None => {
                info!("{name} could not claim output: {prevout}, dust");
                return;
            }
        };
        self.host_wallet.set_label(&tx.txid().to_string(), name);

        if broadcast {
            match self.broadcaster.broadcast(&tx).await {
                Ok(()) => info!(
                    "success: broadcasting {name} for prevout: {prevout}"
                ),
                Err(e) => info!(
                    "could NOT publish {name} for prevout: {prevout}, {e:#}"
                ),
            }
        } else {
            // A local future tx is fine; its fee is recomputed at
            // broadcast time.
            match self.host_wallet.add_future_tx(&tx, wait_blocks) {
                Ok(()) => {
                    info!("adding future tx: {name}. prevout: {prevout}")
                }
                Err(e) => info!(
                    "could not add future tx: {name}. prevout: {prevout} \
                     {e:#}"
                ),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        channel::ChannelState,
        test_support::{dummy_tx, sweep_info_with, TestHarnessBuilder},
    };

    #[tokio::test]
    async fn close_records_metadata_and_sweeps() {
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 100_000_000, 0);
        let scid = chan.short_channel_id().unwrap();
        let outpoint = chan.funding_outpoint().to_string();
        let funding_txid = chan.funding_outpoint().txid.to_string();
        let closing_tx = dummy_tx(7);

        let sweep_tx = dummy_tx(8);
        chan.set_sweep_ctx(
            [(
                format!("{}:0", closing_tx.txid()),
                sweep_info_with("our_ctx_to_local", None, None, Some(sweep_tx.clone())),
            )]
            .into(),
        );

        h.wallet
            .on_channel_closed(
                &outpoint,
                &HashMap::new(),
                &funding_txid,
                TxConfirmation {
                    height: 600_000,
                    conf: 10,
                    timestamp: Some(1_700_000_000),
                },
                &closing_tx.txid().to_string(),
                TxConfirmation {
                    height: 600_100,
                    conf: 1,
                    timestamp: Some(1_700_060_000),
                },
                &closing_tx,
            )
            .await;

        assert_eq!(chan.get_state(), ChannelPhase::Closed);
        assert!(h.graph.removed_channels().contains(&scid));
        let history = h.wallet.channel_history();
        assert_eq!(
            history[0].closing_txid.as_deref(),
            Some(closing_tx.txid().to_string().as_str())
        );
        // The unspent output was swept immediately.
        assert_eq!(h.broadcaster.broadcasted(), vec![sweep_tx.clone()]);
        assert_eq!(
            h.host_wallet.label_for(&sweep_tx.txid().to_string()),
            Some("our_ctx_to_local".to_owned())
        );
    }

    #[tokio::test]
    async fn csv_locked_sweep_becomes_future_tx() {
        let h = TestHarnessBuilder::default().build().await;
        let tx = dummy_tx(9);
        let info =
            sweep_info_with("our_ctx_to_local", None, Some(144), Some(tx.clone()));
        // Closing tx has 1 conf, csv is 144: not broadcastable yet.
        let closing_txid = dummy_tx(7).txid();
        h.watcher.confirm_tx(closing_txid, 600_000, 0, 1);

        h.wallet
            .try_redeem(&format!("{closing_txid}:0"), &info)
            .await;

        assert!(h.broadcaster.broadcasted().is_empty());
        let future = h.host_wallet.future_txs();
        assert_eq!(future.len(), 1);
        assert_eq!(future[0].0, tx);
        assert_eq!(future[0].1, 143);
    }

    #[tokio::test]
    async fn cltv_locked_sweep_becomes_future_tx() {
        let h = TestHarnessBuilder::default().build().await;
        let height = h.watcher.local_height();
        let tx = dummy_tx(10);
        let info = sweep_info_with(
            "their_ctx_htlc",
            Some(height + 20),
            None,
            Some(tx.clone()),
        );

        h.wallet
            .try_redeem(&format!("{}:1", dummy_tx(7).txid()), &info)
            .await;

        assert!(h.broadcaster.broadcasted().is_empty());
        assert_eq!(h.host_wallet.future_txs()[0].1, 20);
    }

    #[tokio::test]
    async fn dust_sweeps_are_dropped() {
        let h = TestHarnessBuilder::default().build().await;
        let info = sweep_info_with("their_ctx_htlc", None, None, None);
        h.wallet
            .try_redeem(&format!("{}:0", dummy_tx(7).txid()), &info)
            .await;
        assert!(h.broadcaster.broadcasted().is_empty());
        assert!(h.host_wallet.future_txs().is_empty());
    }

    #[tokio::test]
    async fn spent_htlc_output_chains_a_second_sweep() {
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 100_000_000, 0);
        let outpoint = chan.funding_outpoint().to_string();
        let funding_txid = chan.funding_outpoint().txid.to_string();
        let closing_tx = dummy_tx(7);
        let htlc_tx = dummy_tx(11);
        let second_sweep = dummy_tx(12);

        let first_prevout = format!("{}:0", closing_tx.txid());
        chan.set_sweep_ctx(
            [(
                first_prevout.clone(),
                sweep_info_with("their_ctx_htlc", None, None, None),
            )]
            .into(),
        );
        chan.set_sweep_htlc(sweep_info_with(
            "second_stage_htlc",
            None,
            None,
            Some(second_sweep.clone()),
        ));
        h.watcher.store_transaction(htlc_tx.clone());

        let spenders =
            HashMap::from([(first_prevout, htlc_tx.txid())]);
        h.wallet
            .on_channel_closed(
                &outpoint,
                &spenders,
                &funding_txid,
                TxConfirmation {
                    height: 600_000,
                    conf: 10,
                    timestamp: None,
                },
                &closing_tx.txid().to_string(),
                TxConfirmation {
                    height: 600_100,
                    conf: 1,
                    timestamp: None,
                },
                &closing_tx,
            )
            .await;

        // The chained sweep spends `htlc_txid:0`.
        assert_eq!(h.broadcaster.broadcasted(), vec![second_sweep]);
    }
}
