//! The invoice/preimage store and the receive flow: creating invoices with
//! routing hints derived from our live channels, and moving invoice statuses
//! as HTLCs settle.

use std::sync::Arc;

use anyhow::Context;
use rand::RngCore;
use tracing::{info, warn};

use crate::{
    channel::{ChannelPhase, Side},
    error::UnknownPaymentHash,
    event::LnEvent,
    invoice::{
        Direction, InvoiceInfo, InvoiceParams, InvoiceStatus, PaymentHash,
        Preimage, RouteHint, RouteHintHop,
        MIN_FINAL_CLTV_EXPIRY_FOR_INVOICE,
    },
    now_unix,
    traits::PaymentRequest,
    worker::LnWallet,
};

impl LnWallet {
    /// Create a receive invoice. Blocking; callable from foreign threads.
    /// Returns the hex payment hash under which the host wallet can find
    /// the request.
    pub fn add_request(
        self: &Arc<Self>,
        amount_sat: Option<u64>,
        message: &str,
        expiry: u64,
    ) -> anyhow::Result<String> {
        let this = self.clone();
        let message = message.to_owned();
        self.block_on_with_timeout(
            "add_request",
            crate::worker::ADD_REQUEST_TIMEOUT,
            async move {
                this.add_request_coroutine(amount_sat, &message, expiry)
                    .await
            },
        )
    }

    pub(crate) async fn add_request_coroutine(
        self: &Arc<Self>,
        amount_sat: Option<u64>,
        message: &str,
        expiry: u64,
    ) -> anyhow::Result<String> {
        let timestamp = now_unix();
        let routing_hints =
            self.calc_routing_hints_for_invoice(amount_sat);
        if routing_hints.is_empty() {
            info!(
                "Warning. No routing hints added to invoice. Other clients \
                 will likely not be able to send to us."
            );
        }

        let mut preimage_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage_bytes);
        let preimage = Preimage(preimage_bytes);
        let payment_hash = preimage.payment_hash();

        let params = InvoiceParams {
            payment_hash,
            amount_msat: amount_sat.map(|sat| sat * 1000),
            timestamp,
            expiry,
            min_final_cltv_expiry: MIN_FINAL_CLTV_EXPIRY_FOR_INVOICE,
            description: message.to_owned(),
            route_hints: routing_hints,
        };
        let invoice = self
            .codec
            .encode(&params, &self.keypair().privkey)
            .context("Could not encode invoice")?;
        let key = payment_hash.to_string();

        self.save_preimage(payment_hash, preimage);
        self.save_invoice_info(InvoiceInfo {
            payment_hash,
            amount_sat,
            direction: Direction::Received,
            status: InvoiceStatus::Unpaid,
        });
        self.host_wallet.add_payment_request(PaymentRequest {
            amount_sat,
            time: timestamp,
            expiry,
            message: message.to_owned(),
            rhash_hex: key.clone(),
            invoice,
        });
        self.host_wallet.set_label(&key, message);
        Ok(key)
    }

    /// Routing hints (BOLT-11 `r` tags) for an invoice of `amount_sat`: one
    /// single-hop hint per OPEN channel with enough remote balance.
    pub(crate) fn calc_routing_hints_for_invoice(
        &self,
        amount_sat: Option<u64>,
    ) -> Vec<RouteHint> {
        let mut hints = Vec::new();
        // Note: this hints at *all* our channels; possibly a privacy leak.
        for chan in self.channels_snapshot() {
            if chan.get_state() != ChannelPhase::Open {
                continue;
            }
            // The on-chain fees of the commitment tx make this check
            // slightly optimistic.
            if let Some(amount_sat) = amount_sat {
                if chan.balance_msat(Side::Remote) / 1000 < amount_sat {
                    continue;
                }
            }
            let scid = match chan.short_channel_id() {
                Some(scid) => scid,
                None => continue,
            };
            // Without a channel update for the incoming direction we fill
            // the hint with wrong-but-structural values; the sender will
            // correct them from the channel update in the onion error, at
            // the cost of an extra round trip.
            let mut fee_base_msat = 0;
            let mut fee_proportional_millionths = 0;
            let mut cltv_expiry_delta = 1;
            let mut missing_info = true;
            if self.graph.has_channel_info(scid) {
                if let Some(policy) =
                    self.graph.get_policy_for_node(scid, &chan.node_id())
                {
                    fee_base_msat = policy.fee_base_msat;
                    fee_proportional_millionths =
                        policy.fee_proportional_millionths;
                    cltv_expiry_delta = policy.cltv_expiry_delta;
                    missing_info = false;
                }
            }
            if missing_info {
                info!(
                    "Warning. Missing channel update for our channel \
                     {scid}; filling invoice with incorrect data."
                );
            }
            hints.push(RouteHint(vec![RouteHintHop {
                node_id: chan.node_id(),
                scid,
                fee_base_msat,
                fee_proportional_millionths,
                cltv_expiry_delta,
            }]));
        }
        hints
    }

    /// Store a preimage. Panics if `SHA-256(preimage) != payment_hash`; the
    /// store never holds a pair that does not verify.
    pub fn save_preimage(
        &self,
        payment_hash: PaymentHash,
        preimage: Preimage,
    ) {
        assert!(
            payment_hash.is_hash_of(&preimage),
            "tried to store a preimage under the wrong payment hash"
        );
        let mut state = self.lock_state();
        state.preimages.insert(payment_hash, preimage);
        self.db.save_preimages(&state.preimages);
    }

    pub fn get_preimage(
        &self,
        payment_hash: &PaymentHash,
    ) -> Option<Preimage> {
        self.lock_state().preimages.get(payment_hash).copied()
    }

    pub fn get_invoice_info(
        &self,
        payment_hash: &PaymentHash,
    ) -> Result<InvoiceInfo, UnknownPaymentHash> {
        self.lock_state()
            .invoices
            .get(payment_hash)
            .copied()
            .ok_or(UnknownPaymentHash(*payment_hash))
    }

    pub fn save_invoice_info(&self, info: InvoiceInfo) {
        let mut state = self.lock_state();
        state.invoices.insert(info.payment_hash, info);
        self.db.save_invoices(&state.invoices);
    }

    pub fn get_invoice_status(
        &self,
        payment_hash: &PaymentHash,
    ) -> InvoiceStatus {
        self.get_invoice_info(payment_hash)
            .map(|info| info.status)
            .unwrap_or(InvoiceStatus::Unknown)
    }

    /// Move an invoice to `status`, persisting the change. Unknown hashes
    /// are ignored: the HTLC was not for us (we may be forwarding). A
    /// received invoice newly becoming paid fires `payment_received`.
    pub fn set_invoice_status(
        &self,
        payment_hash: PaymentHash,
        status: InvoiceStatus,
    ) {
        let info = match self.get_invoice_info(&payment_hash) {
            Ok(info) => info,
            // If we are forwarding.
            Err(UnknownPaymentHash(_)) => return,
        };
        if info.status == InvoiceStatus::Paid
            && status != InvoiceStatus::Paid
        {
            warn!(
                "ignoring status regression for paid invoice \
                 {payment_hash}: {status:?}"
            );
            return;
        }
        let newly_paid = info.status != InvoiceStatus::Paid
            && status == InvoiceStatus::Paid;
        let info = info.with_status(status);
        self.save_invoice_info(info);
        if info.direction == Direction::Received && newly_paid {
            self.events.notify(LnEvent::PaymentReceived {
                payment_hash_hex: payment_hash.to_string(),
                status: InvoiceStatus::Paid,
            });
        }
    }

    /// Drop an invoice from the store.
    pub fn delete_invoice(&self, payment_hash_hex: &str) {
        let payment_hash: PaymentHash = match payment_hash_hex.parse() {
            Ok(hash) => hash,
            Err(_) => return,
        };
        let mut state = self.lock_state();
        if state.invoices.remove(&payment_hash).is_none() {
            return;
        }
        self.db.save_invoices(&state.invoices);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{channel::ChannelState, test_support::TestHarness};

    #[tokio::test]
    #[should_panic(expected = "wrong payment hash")]
    async fn preimage_store_refuses_bad_pairs() {
        let h = TestHarness::new().await;
        h.wallet
            .save_preimage(PaymentHash([0u8; 32]), Preimage([1u8; 32]));
    }

    #[tokio::test]
    async fn preimage_store_roundtrip() {
        let h = TestHarness::new().await;
        let preimage = Preimage([1u8; 32]);
        let hash = preimage.payment_hash();
        h.wallet.save_preimage(hash, preimage);
        assert_eq!(h.wallet.get_preimage(&hash), Some(preimage));
        // Invariant: everything in the store verifies.
        for (hash, preimage) in &h.wallet.lock_state().preimages {
            assert!(hash.is_hash_of(preimage));
        }
    }

    #[tokio::test]
    async fn unknown_hash_is_silently_ignored_on_settle() {
        let h = TestHarness::new().await;
        // A forwarded HTLC settles: not our invoice, no event, no panic.
        let mut events = h.wallet.events().subscribe();
        h.wallet
            .set_invoice_status(PaymentHash([9u8; 32]), InvoiceStatus::Paid);
        assert!(h
            .wallet
            .get_invoice_info(&PaymentHash([9u8; 32]))
            .is_err());
        drop(events);
    }

    #[tokio::test]
    async fn received_invoice_fires_payment_received_once() {
        let h = TestHarness::new().await;
        let preimage = Preimage([3u8; 32]);
        let hash = preimage.payment_hash();
        h.wallet.save_invoice_info(InvoiceInfo {
            payment_hash: hash,
            amount_sat: Some(1_000),
            direction: Direction::Received,
            status: InvoiceStatus::Unpaid,
        });

        let mut events = h.wallet.events().subscribe();
        h.wallet.set_invoice_status(hash, InvoiceStatus::Paid);
        match events.recv().await {
            LnEvent::PaymentReceived {
                payment_hash_hex,
                status,
            } => {
                assert_eq!(payment_hash_hex, hash.to_string());
                assert_eq!(status, InvoiceStatus::Paid);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Settling again must not fire a second notification.
        h.wallet.set_invoice_status(hash, InvoiceStatus::Paid);
        h.wallet.events().notify(LnEvent::Channels);
        assert!(matches!(events.recv().await, LnEvent::Channels));
    }

    #[tokio::test]
    async fn delete_invoice_removes_and_persists() {
        let h = TestHarness::new().await;
        let hash = PaymentHash([4u8; 32]);
        h.wallet.save_invoice_info(InvoiceInfo {
            payment_hash: hash,
            amount_sat: None,
            direction: Direction::Received,
            status: InvoiceStatus::Unpaid,
        });
        h.wallet.delete_invoice(&hash.to_string());
        assert!(h.wallet.get_invoice_info(&hash).is_err());
        assert!(h.wallet.db.load_invoices().is_empty());
    }

    #[tokio::test]
    async fn routing_hints_only_for_live_funded_channels() {
        use crate::channel::ChannelPhase;

        let h = TestHarness::new().await;
        let open =
            h.add_channel(ChannelPhase::Open, 0, 200_000_000);
        let _opening =
            h.add_channel(ChannelPhase::Opening, 0, 500_000_000);
        let _broke = h.add_channel(ChannelPhase::Open, 0, 40_000_000);

        let hints =
            h.wallet.calc_routing_hints_for_invoice(Some(100_000));
        assert_eq!(hints.len(), 1);
        let hop = &hints[0].0[0];
        assert_eq!(hop.node_id, open.node_id());
        assert_eq!(hop.scid, open.short_channel_id().unwrap());
        // No stored policy: deliberately wrong fallback values.
        assert_eq!(hop.fee_base_msat, 0);
        assert_eq!(hop.fee_proportional_millionths, 0);
        assert_eq!(hop.cltv_expiry_delta, 1);
    }

    #[tokio::test]
    async fn add_request_stores_verifying_preimage() {
        let h = TestHarness::new().await;
        let key = h
            .wallet
            .add_request_coroutine(Some(50_000), "coffee", 3600)
            .await
            .unwrap();
        let hash: PaymentHash = key.parse().unwrap();

        let info = h.wallet.get_invoice_info(&hash).unwrap();
        assert_eq!(info.direction, Direction::Received);
        assert_eq!(info.status, InvoiceStatus::Unpaid);
        assert_eq!(info.amount_sat, Some(50_000));

        let preimage = h.wallet.get_preimage(&hash).unwrap();
        assert!(hash.is_hash_of(&preimage));

        let requests = h.host_wallet.payment_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].rhash_hex, key);
        assert_eq!(requests[0].message, "coffee");
    }
}
