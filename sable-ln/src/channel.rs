use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    str::FromStr,
    sync::Arc,
};

use bitcoin::{secp256k1::PublicKey, OutPoint, Transaction};
use rand::RngCore;

use crate::{
    invoice::{Direction, PaymentHash},
    peer_addr::NodePk,
    scid::ShortChannelId,
};

/// A 32-byte channel id.
#[derive(Copy, Clone, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    /// A fresh random id, used as the temporary channel id during channel
    /// establishment.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", hex::encode(self.0))
    }
}

impl FromStr for ChannelId {
    type Err = hex::FromHexError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut buf = [0u8; 32];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(Self(buf))
    }
}

/// Which side of a channel a value belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Side {
    Local,
    Remote,
}

/// The lifecycle state of a channel. Transitions are monotonic
/// (OPENING → OPEN → CLOSED), except that DISCONNECTED may regress to OPEN
/// when the channel is reestablished.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelPhase {
    Opening,
    Open,
    Disconnected,
    Closed,
}

impl ChannelPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opening => "OPENING",
            Self::Open => "OPEN",
            Self::Disconnected => "DISCONNECTED",
            Self::Closed => "CLOSED",
        }
    }
}

impl Display for ChannelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTLC riding on a channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Htlc {
    pub htlc_id: u64,
    pub amount_msat: u64,
    pub payment_hash: PaymentHash,
    /// Absolute block height at which this HTLC expires.
    pub cltv_expiry: u32,
    pub timestamp: u64,
}

/// The remote side's current and next per-commitment points. A channel whose
/// `next` equals `current` is in a corrupt intermediate state and must never
/// be persisted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CommitmentPoints {
    pub current: Option<PublicKey>,
    pub next: Option<PublicKey>,
}

impl CommitmentPoints {
    pub fn next_equals_current(&self) -> bool {
        self.next.is_some() && self.next == self.current
    }
}

/// Negotiated channel constraints the worker cares about.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelConstraints {
    /// Confirmations the funding tx needs before the channel may open.
    pub funding_txn_minimum_depth: u32,
}

/// How to reclaim one output of a closed channel. `gen_tx` builds the sweep
/// transaction at broadcast time (fees are recomputed then); it returns
/// `None` when the output is below dust.
#[derive(Clone)]
pub struct SweepInfo {
    pub name: String,
    pub cltv_expiry: Option<u32>,
    pub csv_delay: Option<u32>,
    pub gen_tx: Arc<dyn Fn() -> Option<Transaction> + Send + Sync>,
}

impl fmt::Debug for SweepInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SweepInfo")
            .field("name", &self.name)
            .field("cltv_expiry", &self.cltv_expiry)
            .field("csv_delay", &self.csv_delay)
            .finish_non_exhaustive()
    }
}

/// The channel state object. The commitment machinery lives outside this
/// crate; the worker consumes channels through this interface and treats the
/// contents as opaque. Implementations synchronize interior mutability
/// themselves.
pub trait ChannelState: Send + Sync {
    fn channel_id(&self) -> ChannelId;
    /// The remote node's id.
    fn node_id(&self) -> NodePk;
    fn funding_outpoint(&self) -> OutPoint;
    fn get_funding_address(&self) -> String;

    fn short_channel_id(&self) -> Option<ShortChannelId>;
    /// Commits the short channel id. Set exactly once, when the funding tx
    /// reaches its minimum depth.
    fn set_short_channel_id(&self, scid: ShortChannelId);

    fn get_state(&self) -> ChannelPhase;
    fn set_state(&self, phase: ChannelPhase);
    fn is_closed(&self) -> bool {
        self.get_state() == ChannelPhase::Closed
    }

    fn is_force_closed(&self) -> bool;
    fn set_force_closed(&self);
    fn set_funding_txo_spent(&self, spent: bool);

    fn constraints(&self) -> ChannelConstraints;
    fn balance_msat(&self, side: Side) -> u64;
    fn remote_dust_limit_sat(&self) -> u64;
    fn remote_commitment_points(&self) -> CommitmentPoints;

    fn get_latest_ctn(&self, side: Side) -> u64;
    fn get_oldest_unrevoked_ctn(&self, side: Side) -> u64;

    /// The HTLCs of `subject`'s commitment number `ctn`, in `direction` as
    /// seen by `subject`.
    fn htlcs_by_direction(
        &self,
        subject: Side,
        direction: Direction,
        ctn: u64,
    ) -> BTreeMap<u64, Htlc>;

    /// Whether the preimage for `htlc_id` (sent by `htlc_sender`) has been
    /// released to the other side.
    fn was_htlc_preimage_released(
        &self,
        htlc_id: u64,
        htlc_sender: Side,
    ) -> bool;

    fn get_latest_feerate(&self, side: Side) -> u32;
    fn should_try_to_reestablish_peer(&self) -> bool;

    /// Our latest commitment tx, for a unilateral close.
    fn force_close_tx(&self) -> Transaction;

    /// Enumerate the outputs of `closing_tx` owed to us, keyed by prevout
    /// (`txid:index`).
    fn sweep_ctx(&self, closing_tx: &Transaction)
        -> BTreeMap<String, SweepInfo>;

    /// If `spender_tx` is an HTLC-success/timeout tx whose output we can
    /// sweep a second time, returns the follow-up sweep.
    fn sweep_htlc(
        &self,
        closing_tx: &Transaction,
        spender_tx: &Transaction,
    ) -> Option<SweepInfo>;

    /// Penalty sweep txs for the revoked state `ctn`, for the watchtower.
    fn create_sweeptxs(&self, ctn: u64) -> Vec<Transaction>;

    fn to_value(&self) -> serde_json::Value;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_id_hex_roundtrip() {
        let id = ChannelId([0xab; 32]);
        assert_eq!(id.to_string(), "ab".repeat(32));
        assert_eq!(ChannelId::from_str(&id.to_string()).unwrap(), id);
        assert!(ChannelId::from_str("abcd").is_err());
    }

    #[test]
    fn random_channel_ids_differ() {
        assert_ne!(ChannelId::random(), ChannelId::random());
    }

    #[test]
    fn commitment_point_coincidence() {
        let none = CommitmentPoints {
            current: None,
            next: None,
        };
        assert!(!none.next_equals_current());

        let pk = crate::test_support::dummy_node_pk(3).0;
        let stale = CommitmentPoints {
            current: Some(pk),
            next: Some(pk),
        };
        assert!(stale.next_equals_current());
    }
}
