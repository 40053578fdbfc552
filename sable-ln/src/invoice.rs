use std::{
    fmt::{self, Display},
    str::FromStr,
};

use bitcoin::hashes::{sha256, Hash};

use crate::{peer_addr::NodePk, scid::ShortChannelId};

/// Value of the `c` tag we put on our own invoices.
pub const MIN_FINAL_CLTV_EXPIRY_FOR_INVOICE: u64 =
    MIN_FINAL_CLTV_EXPIRY_ACCEPTED + 3;
/// The lowest final-hop CLTV delta we accept on incoming HTLCs.
pub const MIN_FINAL_CLTV_EXPIRY_ACCEPTED: u64 = 144;
/// Refuse to pay invoices asking us to lock funds for longer than this.
pub const MAX_MIN_FINAL_CLTV_EXPIRY: u64 = 60 * 144;

/// A 32-byte payment hash.
#[derive(Copy, Clone, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct PaymentHash(pub [u8; 32]);

/// The 32-byte secret whose SHA-256 is the payment hash.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Preimage(pub [u8; 32]);

impl Preimage {
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).into_inner())
    }
}

impl PaymentHash {
    /// Whether `preimage` hashes to this payment hash.
    pub fn is_hash_of(&self, preimage: &Preimage) -> bool {
        preimage.payment_hash() == *self
    }
}

macro_rules! impl_hex_32 {
    ($ty:ty, $name:literal) => {
        impl Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, hex::encode(self.0))
            }
        }

        impl FromStr for $ty {
            type Err = hex::FromHexError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut buf = [0u8; 32];
                hex::decode_to_slice(s, &mut buf)?;
                Ok(Self(buf))
            }
        }
    };
}

impl_hex_32!(PaymentHash, "PaymentHash");
impl_hex_32!(Preimage, "Preimage");

/// Whether a payment was sent by us or received by us. Persisted as the
/// integers `-1` / `1`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn to_int(self) -> i64 {
        match self {
            Self::Sent => -1,
            Self::Received => 1,
        }
    }

    pub fn from_int(int: i64) -> Option<Self> {
        match int {
            -1 => Some(Self::Sent),
            1 => Some(Self::Received),
            _ => None,
        }
    }
}

/// Invoice payment status. Persisted as the host wallet's payment-request
/// status integers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InvoiceStatus {
    Unpaid,
    Expired,
    Unknown,
    Paid,
    Inflight,
}

impl InvoiceStatus {
    pub fn to_int(self) -> i64 {
        match self {
            Self::Unpaid => 0,
            Self::Expired => 1,
            Self::Unknown => 2,
            Self::Paid => 3,
            Self::Inflight => 4,
        }
    }

    pub fn from_int(int: i64) -> Option<Self> {
        match int {
            0 => Some(Self::Unpaid),
            1 => Some(Self::Expired),
            2 => Some(Self::Unknown),
            3 => Some(Self::Paid),
            4 => Some(Self::Inflight),
            _ => None,
        }
    }
}

/// What we remember about an invoice: `(payment_hash, amount, direction,
/// status)`. An immutable record; use [`with_status`] to derive the updated
/// value.
///
/// [`with_status`]: InvoiceInfo::with_status
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InvoiceInfo {
    pub payment_hash: PaymentHash,
    pub amount_sat: Option<u64>,
    pub direction: Direction,
    pub status: InvoiceStatus,
}

impl InvoiceInfo {
    pub fn with_status(self, status: InvoiceStatus) -> Self {
        Self { status, ..self }
    }
}

/// One hop of a private route hint (a BOLT-11 `r` tag entry).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteHintHop {
    /// The node the sender reaches *before* traversing `scid`.
    pub node_id: NodePk,
    pub scid: ShortChannelId,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

/// A private route hint: an ordered list of hops ending at the payee.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RouteHint(pub Vec<RouteHintHop>);

/// A decoded BOLT-11 invoice, as produced by the host's invoice codec.
#[derive(Clone, Debug)]
pub struct Bolt11Invoice {
    pub payment_hash: PaymentHash,
    pub payee: NodePk,
    pub amount_msat: Option<u64>,
    /// Invoice creation time, unix seconds.
    pub timestamp: u64,
    /// Seconds until expiry, from `timestamp`.
    pub expiry: u64,
    pub min_final_cltv_expiry: u64,
    pub description: String,
    pub route_hints: Vec<RouteHint>,
}

impl Bolt11Invoice {
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.timestamp.saturating_add(self.expiry)
    }

    pub fn amount_sat(&self) -> Option<u64> {
        self.amount_msat.map(|msat| msat / 1000)
    }
}

/// Everything needed to encode a fresh BOLT-11 invoice of our own.
#[derive(Clone, Debug)]
pub struct InvoiceParams {
    pub payment_hash: PaymentHash,
    pub amount_msat: Option<u64>,
    pub timestamp: u64,
    pub expiry: u64,
    pub min_final_cltv_expiry: u64,
    pub description: String,
    pub route_hints: Vec<RouteHint>,
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn preimage_hashes_to_payment_hash() {
        let preimage = Preimage([7u8; 32]);
        let hash = preimage.payment_hash();
        assert!(hash.is_hash_of(&preimage));
        assert!(!PaymentHash([0u8; 32]).is_hash_of(&preimage));
    }

    #[test]
    fn with_status_only_changes_status() {
        let info = InvoiceInfo {
            payment_hash: PaymentHash([1u8; 32]),
            amount_sat: Some(100_000),
            direction: Direction::Sent,
            status: InvoiceStatus::Unpaid,
        };
        let paid = info.with_status(InvoiceStatus::Paid);
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.payment_hash, info.payment_hash);
        assert_eq!(paid.amount_sat, info.amount_sat);
        assert_eq!(paid.direction, info.direction);
    }

    #[test]
    fn expiry_is_inclusive_of_last_second() {
        let invoice_ts = 1_000_000;
        let inv = Bolt11Invoice {
            payment_hash: PaymentHash([0u8; 32]),
            payee: crate::test_support::dummy_node_pk(1),
            amount_msat: Some(1_000),
            timestamp: invoice_ts,
            expiry: 3600,
            min_final_cltv_expiry: MIN_FINAL_CLTV_EXPIRY_FOR_INVOICE,
            description: String::new(),
            route_hints: Vec::new(),
        };
        assert!(!inv.is_expired(invoice_ts + 3600));
        assert!(inv.is_expired(invoice_ts + 3601));
    }

    proptest! {
        #[test]
        fn payment_hash_hex_roundtrip(bytes in any::<[u8; 32]>()) {
            let hash = PaymentHash(bytes);
            let parsed: PaymentHash = hash.to_string().parse().unwrap();
            prop_assert_eq!(hash, parsed);
        }

        #[test]
        fn status_int_roundtrip(int in 0i64..5) {
            let status = InvoiceStatus::from_int(int).unwrap();
            prop_assert_eq!(status.to_int(), int);
            prop_assert!(InvoiceStatus::from_int(5).is_none());
        }
    }
}
