//! The payment engine: invoice validation, route construction from private
//! hints and the public graph, and the retry loop that drives attempts
//! through the peer.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tracing::info;

use crate::{
    error::{InvoiceError, PaymentFailure},
    event::{LnEvent, PaymentState},
    invoice::{
        Bolt11Invoice, Direction, InvoiceInfo, InvoiceStatus,
        MAX_MIN_FINAL_CLTV_EXPIRY,
    },
    now_unix,
    route::{
        is_route_sane_to_use, Route, RouteEdge,
        NUM_MAX_EDGES_IN_PAYMENT_PATH,
    },
    scid::ShortChannelId,
    worker::LnWallet,
};

/// In-flight HTLC completions, keyed by `(short_channel_id, htlc_id)`.
///
/// The payer awaits the slot while the peer resolves it when the HTLC
/// settles; the slot is created by whichever side arrives first, so the two
/// can race freely. Each slot resolves exactly once.
pub struct PendingPayments {
    slots: Mutex<HashMap<(ShortChannelId, u64), Slot>>,
}

struct Slot {
    tx: Option<oneshot::Sender<bool>>,
    rx: Option<oneshot::Receiver<bool>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

impl PendingPayments {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Take the receiving end of the slot. Returns `None` if someone is
    /// already waiting on this HTLC.
    pub fn subscribe(
        &self,
        key: (ShortChannelId, u64),
    ) -> Option<oneshot::Receiver<bool>> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(key).or_insert_with(Slot::new);
        let rx = slot.rx.take();
        if slot.tx.is_none() {
            // Already resolved; the value is buffered in `rx`.
            slots.remove(&key);
        }
        rx
    }

    /// Report the HTLC's outcome. A second resolution of the same key is a
    /// no-op.
    pub fn resolve(&self, key: (ShortChannelId, u64), success: bool) {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(key).or_insert_with(Slot::new);
        if let Some(tx) = slot.tx.take() {
            let _ = tx.send(success);
        }
        if slot.rx.is_none() {
            slots.remove(&key);
        }
    }
}

impl Default for PendingPayments {
    fn default() -> Self {
        Self::new()
    }
}

impl LnWallet {
    /// Pay a BOLT-11 invoice. Blocking; callable from foreign threads.
    /// Progress and the final outcome are also reported over the events bus
    /// as `payment_status`.
    pub fn pay(
        self: &Arc<Self>,
        invoice: &str,
        amount_sat: Option<u64>,
        attempts: usize,
        timeout: Duration,
    ) -> anyhow::Result<bool> {
        let key = self
            .codec
            .decode(invoice, self.network)
            .map(|addr| addr.payment_hash.to_string())
            .unwrap_or_default();

        let this = self.clone();
        let invoice = invoice.to_owned();
        let result = self.block_on_with_timeout(
            "pay",
            timeout,
            async move { this.pay_invoice(&invoice, amount_sat, attempts).await },
        );

        let (state, detail) = match &result {
            Ok(true) => (PaymentState::Success, None),
            Ok(false) => (PaymentState::Failure, None),
            Err(e) => (PaymentState::Error, Some(format!("{e:#}"))),
        };
        self.events.notify(LnEvent::PaymentStatus {
            key,
            state,
            detail,
        });
        result
    }

    /// Drive up to `attempts` payment attempts, building a fresh route each
    /// time.
    pub async fn pay_invoice(
        self: &Arc<Self>,
        invoice: &str,
        amount_sat: Option<u64>,
        attempts: usize,
    ) -> anyhow::Result<bool> {
        let decoded = self
            .codec
            .decode(invoice, self.network)
            .map_err(PaymentFailure::Invoice)?;
        let payment_hash = decoded.payment_hash;
        let key = payment_hash.to_string();

        if self.get_invoice_status(&payment_hash) == InvoiceStatus::Paid {
            return Err(PaymentFailure::AlreadyPaid.into());
        }
        self.save_invoice_info(InvoiceInfo {
            payment_hash,
            amount_sat: amount_sat.or_else(|| decoded.amount_sat()),
            direction: Direction::Sent,
            status: InvoiceStatus::Unpaid,
        });
        let decoded = self.check_invoice(decoded, amount_sat)?;
        self.host_wallet.set_label(&key, &decoded.description);

        for attempt in 0..attempts {
            let route = self.create_route_from_invoice(&decoded).await?;
            let first_scid = route[0].short_channel_id;
            if self.get_channel_by_short_id(first_scid).is_none() {
                return Err(
                    PaymentFailure::UnknownFirstHop(first_scid).into()
                );
            }
            self.events.notify(LnEvent::PaymentStatus {
                key: key.clone(),
                state: PaymentState::Progress,
                detail: Some(attempt.to_string()),
            });
            if self.pay_to_route(&route, &decoded).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Hand a built route to the first hop's peer and await the HTLC's
    /// settlement.
    pub async fn pay_to_route(
        self: &Arc<Self>,
        route: &Route,
        decoded: &Bolt11Invoice,
    ) -> anyhow::Result<bool> {
        let first_scid = route[0].short_channel_id;
        let chan = self
            .get_channel_by_short_id(first_scid)
            .ok_or(PaymentFailure::UnknownFirstHop(first_scid))?;
        if chan.is_closed() || chan.is_force_closed() {
            return Err(PaymentFailure::ChannelCannotSend(first_scid).into());
        }
        let amount_msat = decoded
            .amount_msat
            .ok_or(InvoiceError::MissingAmount)
            .map_err(PaymentFailure::Invoice)?;

        self.set_invoice_status(
            decoded.payment_hash,
            InvoiceStatus::Inflight,
        );
        let peer = self
            .peer_manager
            .get_peer(&route[0].node_id)
            .context("First-hop peer is not connected")?;
        let htlc = peer
            .pay(
                route,
                chan,
                amount_msat,
                decoded.payment_hash,
                decoded.min_final_cltv_expiry,
            )
            .await?;
        self.events.notify(LnEvent::HtlcAdded {
            htlc: htlc.clone(),
            payment_hash_hex: decoded.payment_hash.to_string(),
            direction: Direction::Sent,
        });

        let completion = self
            .pending_payments
            .subscribe((first_scid, htlc.htlc_id))
            .context("Someone is already waiting on this HTLC")?;
        let success =
            completion.await.context("HTLC completion dropped")?;
        self.set_invoice_status(
            decoded.payment_hash,
            if success {
                InvoiceStatus::Paid
            } else {
                InvoiceStatus::Unpaid
            },
        );
        Ok(success)
    }

    /// Validate an invoice we are about to pay, substituting a
    /// caller-supplied amount if any.
    pub(crate) fn check_invoice(
        &self,
        mut decoded: Bolt11Invoice,
        amount_sat: Option<u64>,
    ) -> Result<Bolt11Invoice, InvoiceError> {
        if decoded.is_expired(now_unix()) {
            return Err(InvoiceError::Expired);
        }
        if let Some(amount_sat) = amount_sat {
            decoded.amount_msat = Some(amount_sat * 1000);
        }
        if decoded.amount_msat.is_none() {
            return Err(InvoiceError::MissingAmount);
        }
        if decoded.min_final_cltv_expiry > MAX_MIN_FINAL_CLTV_EXPIRY {
            return Err(InvoiceError::CltvTooFarIntoFuture(
                decoded.min_final_cltv_expiry,
            ));
        }
        Ok(decoded)
    }

    /// Build a route for `decoded`: try each private hint (in random order)
    /// by routing to its border node and appending the private hops; fall
    /// back to a direct route to the payee.
    pub async fn create_route_from_invoice(
        &self,
        decoded: &Bolt11Invoice,
    ) -> Result<Route, PaymentFailure> {
        let amount_msat = decoded
            .amount_msat
            .ok_or(PaymentFailure::Invoice(InvoiceError::MissingAmount))?;
        let invoice_pk = decoded.payee;
        let our_pk = self.node_pk();
        let channels = self.channels_snapshot();

        // If there are multiple hints, we use the first one that works,
        // from a random permutation.
        let mut hints = decoded.route_hints.clone();
        hints.shuffle(&mut rand::thread_rng());

        for hint in &hints {
            let hops = &hint.0;
            if hops.is_empty() || hops.len() > NUM_MAX_EDGES_IN_PAYMENT_PATH
            {
                continue;
            }
            let border_node = hops[0].node_id;
            let path = match self.path_finder.find_path_for_payment(
                our_pk,
                border_node,
                amount_msat,
                &channels,
            ) {
                Some(path) => path,
                None => continue,
            };
            let mut route =
                self.path_finder.create_route_from_path(&path, our_pk);

            // Each hint hop names the node *entering* its channel; shift
            // identities by one so every edge carries its destination, the
            // last being the payee.
            let mut prev_node = border_node;
            for (i, hop) in hops.iter().enumerate() {
                let destination = hops
                    .get(i + 1)
                    .map(|next| next.node_id)
                    .unwrap_or(invoice_pk);
                let mut fee_base_msat = hop.fee_base_msat;
                let mut fee_proportional_millionths =
                    hop.fee_proportional_millionths;
                let mut cltv_expiry_delta = hop.cltv_expiry_delta;
                // A stored policy for this edge takes precedence: it likely
                // reflects recent failure feedback.
                if let Some(policy) = self
                    .graph
                    .get_routing_policy_for_channel(&prev_node, hop.scid)
                {
                    fee_base_msat = policy.fee_base_msat;
                    fee_proportional_millionths =
                        policy.fee_proportional_millionths;
                    cltv_expiry_delta = policy.cltv_expiry_delta;
                }
                route.push(RouteEdge {
                    node_id: destination,
                    short_channel_id: hop.scid,
                    fee_base_msat,
                    fee_proportional_millionths,
                    cltv_expiry_delta,
                });
                prev_node = destination;
            }

            if !is_route_sane_to_use(
                &route,
                amount_msat,
                decoded.min_final_cltv_expiry,
            ) {
                info!("rejecting insane route {route:?}");
                continue;
            }
            return Ok(route);
        }

        // No hint worked; try without hints.
        let path = self
            .path_finder
            .find_path_for_payment(our_pk, invoice_pk, amount_msat, &channels)
            .ok_or(PaymentFailure::NoPathFound)?;
        let route = self.path_finder.create_route_from_path(&path, our_pk);
        if !is_route_sane_to_use(
            &route,
            amount_msat,
            decoded.min_final_cltv_expiry,
        ) {
            info!("rejecting insane route {route:?}");
            return Err(PaymentFailure::NoPathFound);
        }
        Ok(route)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        channel::{ChannelPhase, ChannelState},
        error::PaymentFailure,
        invoice::PaymentHash,
        test_support::{TestHarness, TestHarnessBuilder},
    };

    #[tokio::test]
    async fn pending_payments_resolve_then_subscribe() {
        let pending = PendingPayments::new();
        let key = (ShortChannelId::from_components(1, 2, 3), 7);

        // Resolver arrives first; the value is buffered.
        pending.resolve(key, true);
        let rx = pending.subscribe(key).unwrap();
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn pending_payments_subscribe_then_resolve() {
        let pending = PendingPayments::new();
        let key = (ShortChannelId::from_components(1, 2, 3), 7);

        let rx = pending.subscribe(key).unwrap();
        pending.resolve(key, false);
        assert!(!rx.await.unwrap());

        // Each HTLC resolves exactly once; a second subscribe starts a new
        // slot that never resolved.
        assert!(pending.subscribe(key).is_some());
    }

    #[tokio::test]
    async fn check_invoice_rejects_bad_invoices() {
        let h = TestHarness::new().await;

        let expired = h.make_invoice(Some(100_000), now_unix() - 7200, 3600);
        assert!(matches!(
            h.wallet.check_invoice(expired, None),
            Err(InvoiceError::Expired)
        ));

        let no_amount = h.make_invoice(None, now_unix(), 3600);
        assert!(matches!(
            h.wallet.check_invoice(no_amount.clone(), None),
            Err(InvoiceError::MissingAmount)
        ));
        // A caller-supplied amount substitutes.
        let fixed = h.wallet.check_invoice(no_amount, Some(5_000)).unwrap();
        assert_eq!(fixed.amount_msat, Some(5_000_000));

        let mut distant = h.make_invoice(Some(100_000), now_unix(), 3600);
        distant.min_final_cltv_expiry = MAX_MIN_FINAL_CLTV_EXPIRY + 1;
        assert!(matches!(
            h.wallet.check_invoice(distant, None),
            Err(InvoiceError::CltvTooFarIntoFuture(_))
        ));
    }

    #[tokio::test]
    async fn direct_route_when_no_hints() {
        let h = TestHarness::new().await;
        let chan = h.add_channel(ChannelPhase::Open, 500_000_000, 0);

        let invoice = h.invoice_from_peer(
            chan.node_id(),
            Some(100_000),
            Vec::new(),
        );
        let route =
            h.wallet.create_route_from_invoice(&invoice).await.unwrap();
        assert_eq!(route.len(), 1);
        assert_eq!(
            route[0].short_channel_id,
            chan.short_channel_id().unwrap()
        );
    }

    #[tokio::test]
    async fn no_path_is_a_payment_failure() {
        let h = TestHarness::new().await;
        let invoice = h.invoice_from_peer(
            crate::test_support::dummy_node_pk(42),
            Some(100_000),
            Vec::new(),
        );
        assert!(matches!(
            h.wallet.create_route_from_invoice(&invoice).await,
            Err(PaymentFailure::NoPathFound)
        ));
    }

    #[tokio::test]
    async fn hint_hops_are_appended_shifted() {
        use crate::invoice::{RouteHint, RouteHintHop};

        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 500_000_000, 0);

        // One private hop: border node (our channel peer) -> payee.
        let payee = crate::test_support::dummy_node_pk(99);
        let private_scid = ShortChannelId::from_components(700_000, 5, 1);
        let hint = RouteHint(vec![RouteHintHop {
            node_id: chan.node_id(),
            scid: private_scid,
            fee_base_msat: 1_000,
            fee_proportional_millionths: 100,
            cltv_expiry_delta: 9,
        }]);
        let invoice =
            h.invoice_from_peer(payee, Some(100_000), vec![hint]);

        let route =
            h.wallet.create_route_from_invoice(&invoice).await.unwrap();
        assert_eq!(route.len(), 2);
        // The appended edge's destination was shifted to the payee.
        assert_eq!(route[1].node_id, payee);
        assert_eq!(route[1].short_channel_id, private_scid);
        assert_eq!(route[1].fee_base_msat, 1_000);
    }

    #[tokio::test]
    async fn stored_policy_overrides_hint() {
        use crate::invoice::{RouteHint, RouteHintHop};
        use crate::traits::RoutingPolicy;

        let h = TestHarnessBuilder::default().build().await;
        let chan = h.add_channel(ChannelPhase::Open, 500_000_000, 0);

        let payee = crate::test_support::dummy_node_pk(99);
        let private_scid = ShortChannelId::from_components(700_000, 5, 1);
        h.graph.set_routing_policy(
            chan.node_id(),
            private_scid,
            RoutingPolicy {
                fee_base_msat: 2_222,
                fee_proportional_millionths: 333,
                cltv_expiry_delta: 40,
            },
        );
        let hint = RouteHint(vec![RouteHintHop {
            node_id: chan.node_id(),
            scid: private_scid,
            fee_base_msat: 1_000,
            fee_proportional_millionths: 100,
            cltv_expiry_delta: 9,
        }]);
        let invoice =
            h.invoice_from_peer(payee, Some(100_000), vec![hint]);

        let route =
            h.wallet.create_route_from_invoice(&invoice).await.unwrap();
        assert_eq!(route[1].fee_base_msat, 2_222);
        assert_eq!(route[1].cltv_expiry_delta, 40);
    }

    #[tokio::test]
    async fn pay_to_route_rejects_closed_channel() {
        let h = TestHarness::new().await;
        let chan = h.add_channel(ChannelPhase::Open, 500_000_000, 0);
        let invoice = h.invoice_from_peer(
            chan.node_id(),
            Some(100_000),
            Vec::new(),
        );
        let route =
            h.wallet.create_route_from_invoice(&invoice).await.unwrap();

        chan.set_force_closed();
        chan.set_state(ChannelPhase::Closed);
        let err = h
            .wallet
            .pay_to_route(&route, &invoice)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PaymentFailure>(),
            Some(PaymentFailure::ChannelCannotSend(_))
        ));
    }

    #[tokio::test]
    async fn sent_invoice_status_never_leaves_paid() {
        let h = TestHarness::new().await;
        let payment_hash = PaymentHash([5u8; 32]);
        h.wallet.save_invoice_info(InvoiceInfo {
            payment_hash,
            amount_sat: Some(1_000),
            direction: Direction::Sent,
            status: InvoiceStatus::Unpaid,
        });
        h.wallet
            .set_invoice_status(payment_hash, InvoiceStatus::Inflight);
        h.wallet.set_invoice_status(payment_hash, InvoiceStatus::Paid);
        // Paid is terminal; later attempts to regress are dropped.
        h.wallet
            .set_invoice_status(payment_hash, InvoiceStatus::Unpaid);
        assert_eq!(
            h.wallet.get_invoice_status(&payment_hash),
            InvoiceStatus::Paid
        );
    }
}
