//! Watchtower sync: every 5 seconds, push the penalty transactions of every
//! revoked commitment state the tower does not know yet, to the local tower
//! and/or a remote one spoken to over HTTP JSON-RPC.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use serde_json::json;
use tokio::time;
use tracing::info;

use crate::{
    channel::{ChannelState, Side},
    traits::Watchtower,
    worker::LnWallet,
};

const WATCHTOWER_SYNC_INTERVAL: Duration = Duration::from_secs(5);

impl LnWallet {
    /// Sync every channel with the host's local watchtower, forever.
    pub(crate) async fn sync_with_local_watchtower(self: Arc<Self>) {
        let watchtower = match &self.local_watchtower {
            Some(watchtower) => watchtower.clone(),
            None => return,
        };
        let mut shutdown = self.shutdown.clone();
        loop {
            for chan in self.channels_snapshot() {
                if let Err(e) = self
                    .sync_channel_with_watchtower(&chan, watchtower.as_ref())
                    .await
                {
                    info!("local watchtower sync failed: {e:#}");
                }
            }
            tokio::select! {
                () = shutdown.recv() => return,
                () = time::sleep(WATCHTOWER_SYNC_INTERVAL) => (),
            }
        }
    }

    /// Sync every channel with the configured remote watchtower, forever.
    /// Connection errors are logged and retried on the next tick.
    pub(crate) async fn sync_with_remote_watchtower(self: Arc<Self>) {
        let url = match &self.config.watchtower_url {
            Some(url) => url.clone(),
            None => return,
        };
        let watchtower = RemoteWatchtower::new(url.clone());
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                () = shutdown.recv() => return,
                () = time::sleep(WATCHTOWER_SYNC_INTERVAL) => (),
            }
            for chan in self.channels_snapshot() {
                if let Err(e) = self
                    .sync_channel_with_watchtower(&chan, &watchtower)
                    .await
                {
                    info!("could not contact remote watchtower {url}: {e:#}");
                    break;
                }
            }
        }
    }

    /// Push the penalty sweeps for every commitment number the tower is
    /// missing, up to but excluding the oldest unrevoked remote ctn.
    pub(crate) async fn sync_channel_with_watchtower(
        &self,
        chan: &Arc<dyn ChannelState>,
        watchtower: &dyn Watchtower,
    ) -> anyhow::Result<()> {
        let outpoint = chan.funding_outpoint().to_string();
        let addr = chan.get_funding_address();
        let current_ctn =
            chan.get_oldest_unrevoked_ctn(Side::Remote) as i64;
        let watchtower_ctn =
            watchtower.get_ctn(&outpoint, &addr).await?;
        for ctn in (watchtower_ctn + 1)..current_ctn {
            let sweeptxs = chan.create_sweeptxs(ctn as u64);
            for tx in sweeptxs {
                let prevout = tx
                    .input
                    .first()
                    .map(|input| input.previous_output.to_string())
                    .context("penalty tx has no inputs")?;
                watchtower
                    .add_sweep_tx(
                        &outpoint,
                        ctn,
                        &prevout,
                        &serialize_hex(&tx),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

/// A watchtower reached over HTTP JSON-RPC 2.0.
pub struct RemoteWatchtower {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl RemoteWatchtower {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(0),
        }
    }

    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("watchtower request failed")?
            .error_for_status()
            .context("watchtower returned an HTTP error")?
            .json::<serde_json::Value>()
            .await
            .context("watchtower returned malformed JSON")?;
        if let Some(error) = response.get("error") {
            if !error.is_null() {
                return Err(anyhow!("watchtower error: {error}"));
            }
        }
        Ok(response
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl Watchtower for RemoteWatchtower {
    async fn get_ctn(
        &self,
        outpoint: &str,
        addr: &str,
    ) -> anyhow::Result<i64> {
        let result = self
            .request("get_ctn", json!([outpoint, addr]))
            .await?;
        result
            .as_i64()
            .context("watchtower get_ctn returned a non-integer")
    }

    async fn add_sweep_tx(
        &self,
        outpoint: &str,
        ctn: i64,
        prevout: &str,
        tx_hex: &str,
    ) -> anyhow::Result<()> {
        self.request(
            "add_sweep_tx",
            json!([outpoint, ctn, prevout, tx_hex]),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        channel::ChannelPhase,
        test_support::{MockWatchtower, TestHarnessBuilder},
    };

    #[tokio::test]
    async fn pushes_each_missing_ctn_exclusive_of_current() {
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 0, 0);
        // Remote side's oldest unrevoked ctn is 5; tower knows up to 1.
        chan.set_oldest_unrevoked_ctn(Side::Remote, 5);
        let tower = MockWatchtower::with_ctn(1);

        h.wallet
            .sync_channel_with_watchtower(
                &(chan.clone() as Arc<dyn ChannelState>),
                &tower,
            )
            .await
            .unwrap();

        // ctns 2, 3, 4 pushed; 5 itself excluded.
        assert_eq!(tower.pushed_ctns(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn fresh_tower_receives_everything_but_current() {
        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 0, 0);
        chan.set_oldest_unrevoked_ctn(Side::Remote, 2);
        let tower = MockWatchtower::with_ctn(-1);

        h.wallet
            .sync_channel_with_watchtower(
                &(chan as Arc<dyn ChannelState>),
                &tower,
            )
            .await
            .unwrap();

        assert_eq!(tower.pushed_ctns(), vec![0, 1]);
    }
}
