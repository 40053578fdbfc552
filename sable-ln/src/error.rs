use thiserror::Error;

use crate::{
    invoice::PaymentHash, peer_addr::NodePk, scid::ShortChannelId,
};

/// Malformed `node@host:port` connect strings, or nodes we cannot dial.
#[derive(Debug, Error)]
pub enum ConnStringError {
    #[error("Invalid node id in connect string")]
    InvalidNodeId,
    #[error("Invalid <host>:<port> in connect string: {0}")]
    InvalidHostPort(String),
    #[error("Don't know any addresses for node: {0}")]
    NoKnownAddresses(NodePk),
    #[error("Hostname does not resolve: {0}")]
    Unresolvable(String),
}

/// Invoices we refuse to pay.
#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("Could not decode invoice: {0}")]
    Malformed(String),
    #[error("This invoice has expired")]
    Expired,
    #[error("Missing amount")]
    MissingAmount,
    #[error(
        "Invoice wants us to risk locking funds for unreasonably long: \
         min_final_cltv_expiry = {0}"
    )]
    CltvTooFarIntoFuture(u64),
}

/// Payment dispatch failures.
#[derive(Debug, Error)]
pub enum PaymentFailure {
    #[error("No path found")]
    NoPathFound,
    #[error("This invoice has been paid already")]
    AlreadyPaid,
    #[error("Got route with unknown first channel: {0}")]
    UnknownFirstHop(ShortChannelId),
    #[error("Channel {0} can no longer send payments")]
    ChannelCannotSend(ShortChannelId),
    #[error(transparent)]
    Invoice(#[from] InvoiceError),
}

/// A payment hash we have no invoice for. Often benign: it means the HTLC
/// was not addressed to us (e.g. we are forwarding).
#[derive(Debug, Error)]
#[error("Unknown payment hash: {0}")]
pub struct UnknownPaymentHash(pub PaymentHash);
