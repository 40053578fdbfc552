use sable_tokio::events_bus::EventsBus;

use crate::{
    channel::{ChannelId, Htlc},
    invoice::{Direction, InvoiceStatus, Preimage},
};

/// The progress states reported through [`LnEvent::PaymentStatus`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PaymentState {
    Progress,
    Success,
    Failure,
    Error,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

/// Events the worker publishes to the host (GUI, RPC). One variant per
/// callback name of the host's pub-sub bus; [`LnEvent::name`] yields the
/// wire-compatible name.
#[derive(Clone, Debug)]
pub enum LnEvent {
    LnStatus {
        num_peers: usize,
        num_nodes: usize,
        known_channels: usize,
        unknown_channels: usize,
    },
    Channel {
        channel_id: ChannelId,
    },
    Channels,
    LnPaymentCompleted {
        timestamp: u64,
        direction: Direction,
        htlc: Htlc,
        preimage: Option<Preimage>,
        channel_id: ChannelId,
    },
    HtlcAdded {
        htlc: Htlc,
        payment_hash_hex: String,
        direction: Direction,
    },
    PaymentStatus {
        key: String,
        state: PaymentState,
        detail: Option<String>,
    },
    PaymentReceived {
        payment_hash_hex: String,
        status: InvoiceStatus,
    },
}

impl LnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LnStatus { .. } => "ln_status",
            Self::Channel { .. } => "channel",
            Self::Channels => "channels",
            Self::LnPaymentCompleted { .. } => "ln_payment_completed",
            Self::HtlcAdded { .. } => "htlc_added",
            Self::PaymentStatus { .. } => "payment_status",
            Self::PaymentReceived { .. } => "payment_received",
        }
    }
}

/// Network-state callbacks the host delivers to the lifecycle driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NetworkEvent {
    WalletUpdated,
    NetworkUpdated,
    Verified,
    Fee,
}

pub type LnEventBus = EventsBus<LnEvent>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_names_match_the_host_bus() {
        let event = LnEvent::LnStatus {
            num_peers: 0,
            num_nodes: 0,
            known_channels: 0,
            unknown_channels: 0,
        };
        assert_eq!(event.name(), "ln_status");
        assert_eq!(LnEvent::Channels.name(), "channels");
        assert_eq!(
            LnEvent::PaymentReceived {
                payment_hash_hex: String::new(),
                status: InvoiceStatus::Paid,
            }
            .name(),
            "payment_received"
        );
        assert_eq!(PaymentState::Progress.as_str(), "progress");
    }
}
