//! Typed access to the worker's slice of the host wallet storage. The full
//! collection is rewritten on every mutation; there is no incremental
//! persistence.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use serde_json::json;
use tracing::warn;

use crate::{
    config::LnNetwork,
    invoice::{Direction, InvoiceInfo, InvoiceStatus, PaymentHash, Preimage},
    keys,
    traits::WalletStore,
};

pub const K_LN_PRIVKEY: &str = "lightning_privkey2";
pub const K_CHANNELS: &str = "channels";
pub const K_INVOICES: &str = "lightning_invoices2";
pub const K_PREIMAGES: &str = "lightning_preimages";
pub const K_CHANNEL_TIMESTAMPS: &str = "lightning_channel_timestamps";
pub const K_CHANNEL_KEY_DER_CTR: &str = "lightning_channel_key_der_ctr";

/// Funding and closing metadata of a channel, persisted as the list
/// `[funding_txid, funding_height, funding_ts, closing_txid, closing_height,
/// closing_ts]` keyed by hex channel id.
pub type ChannelTimestamps = (
    String,
    i32,
    Option<u64>,
    Option<String>,
    Option<i32>,
    Option<u64>,
);

/// Wraps the host's [`WalletStore`] with typed load/save for every key the
/// worker owns.
#[derive(Clone)]
pub struct WalletDb {
    store: Arc<dyn WalletStore>,
}

impl WalletDb {
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self { store }
    }

    /// The LN node xprv, generated and persisted on first use.
    pub fn load_or_create_xprv(&self, network: LnNetwork) -> String {
        match self.store.get(K_LN_PRIVKEY).and_then(|v| {
            v.as_str().map(str::to_owned)
        }) {
            Some(xprv) => xprv,
            None => {
                let xprv = keys::generate_xprv(network);
                self.store.put(K_LN_PRIVKEY, json!(xprv));
                self.store.write();
                xprv
            }
        }
    }

    pub fn load_channel_values(&self) -> Vec<serde_json::Value> {
        self.store
            .get(K_CHANNELS)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    pub fn save_channel_values(&self, values: Vec<serde_json::Value>) {
        self.store.put(K_CHANNELS, serde_json::Value::Array(values));
        self.store.write();
    }

    pub fn load_invoices(&self) -> HashMap<PaymentHash, InvoiceInfo> {
        let raw = match self.store.get(K_INVOICES) {
            Some(serde_json::Value::Object(map)) => map,
            _ => return HashMap::new(),
        };
        let mut invoices = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            match parse_invoice_entry(&key, &value) {
                Some(info) => {
                    invoices.insert(info.payment_hash, info);
                }
                None => warn!("Dropping malformed invoice entry: {key}"),
            }
        }
        invoices
    }

    pub fn save_invoices(
        &self,
        invoices: &HashMap<PaymentHash, InvoiceInfo>,
    ) {
        let map = invoices
            .values()
            .map(|info| {
                (
                    info.payment_hash.to_string(),
                    json!([
                        info.amount_sat,
                        info.direction.to_int(),
                        info.status.to_int(),
                    ]),
                )
            })
            .collect::<serde_json::Map<_, _>>();
        self.store.put(K_INVOICES, serde_json::Value::Object(map));
        self.store.write();
    }

    pub fn load_preimages(&self) -> HashMap<PaymentHash, Preimage> {
        let raw = match self.store.get(K_PREIMAGES) {
            Some(serde_json::Value::Object(map)) => map,
            _ => return HashMap::new(),
        };
        let mut preimages = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            let parsed = PaymentHash::from_str(&key).ok().zip(
                value.as_str().and_then(|s| Preimage::from_str(s).ok()),
            );
            match parsed {
                Some((hash, preimage)) => {
                    preimages.insert(hash, preimage);
                }
                None => warn!("Dropping malformed preimage entry: {key}"),
            }
        }
        preimages
    }

    pub fn save_preimages(&self, preimages: &HashMap<PaymentHash, Preimage>) {
        let map = preimages
            .iter()
            .map(|(hash, preimage)| {
                (hash.to_string(), json!(preimage.to_string()))
            })
            .collect::<serde_json::Map<_, _>>();
        self.store.put(K_PREIMAGES, serde_json::Value::Object(map));
        self.store.write();
    }

    pub fn load_channel_timestamps(
        &self,
    ) -> HashMap<String, ChannelTimestamps> {
        self.store
            .get(K_CHANNEL_TIMESTAMPS)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn save_channel_timestamps(
        &self,
        timestamps: &HashMap<String, ChannelTimestamps>,
    ) {
        let value = serde_json::to_value(timestamps)
            .expect("channel timestamps are plain data");
        self.store.put(K_CHANNEL_TIMESTAMPS, value);
        self.store.write();
    }

    /// Increment and persist the channel key derivation counter, returning
    /// the new value.
    pub fn get_and_inc_counter_for_channel_keys(&self) -> i64 {
        let ctr = self
            .store
            .get(K_CHANNEL_KEY_DER_CTR)
            .and_then(|v| v.as_i64())
            .unwrap_or(-1)
            + 1;
        self.store.put(K_CHANNEL_KEY_DER_CTR, json!(ctr));
        self.store.write();
        ctr
    }
}

fn parse_invoice_entry(
    key: &str,
    value: &serde_json::Value,
) -> Option<InvoiceInfo> {
    let payment_hash = PaymentHash::from_str(key).ok()?;
    let entry = value.as_array()?;
    if entry.len() != 3 {
        return None;
    }
    let amount_sat = match &entry[0] {
        serde_json::Value::Null => None,
        v => Some(v.as_u64()?),
    };
    let direction = Direction::from_int(entry[1].as_i64()?)?;
    let status = InvoiceStatus::from_int(entry[2].as_i64()?)?;
    Some(InvoiceInfo {
        payment_hash,
        amount_sat,
        direction,
        status,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::MemStore;

    #[test]
    fn xprv_is_generated_once() {
        let store = Arc::new(MemStore::new());
        let db = WalletDb::new(store);
        let xprv1 = db.load_or_create_xprv(LnNetwork::Regtest);
        let xprv2 = db.load_or_create_xprv(LnNetwork::Regtest);
        assert_eq!(xprv1, xprv2);
    }

    #[test]
    fn invoices_roundtrip() {
        let db = WalletDb::new(Arc::new(MemStore::new()));
        let info = InvoiceInfo {
            payment_hash: PaymentHash([3u8; 32]),
            amount_sat: Some(100_000),
            direction: Direction::Received,
            status: InvoiceStatus::Unpaid,
        };
        let mut invoices = HashMap::new();
        invoices.insert(info.payment_hash, info);
        db.save_invoices(&invoices);
        assert_eq!(db.load_invoices(), invoices);

        let no_amount = InvoiceInfo {
            amount_sat: None,
            ..info
        };
        invoices.insert(info.payment_hash, no_amount);
        db.save_invoices(&invoices);
        assert_eq!(
            db.load_invoices()[&info.payment_hash].amount_sat,
            None
        );
    }

    #[test]
    fn preimages_roundtrip() {
        let db = WalletDb::new(Arc::new(MemStore::new()));
        let preimage = Preimage([9u8; 32]);
        let mut preimages = HashMap::new();
        preimages.insert(preimage.payment_hash(), preimage);
        db.save_preimages(&preimages);
        assert_eq!(db.load_preimages(), preimages);
    }

    #[test]
    fn channel_timestamps_roundtrip() {
        let db = WalletDb::new(Arc::new(MemStore::new()));
        let mut timestamps = HashMap::new();
        timestamps.insert(
            "aa".repeat(32),
            (
                "ff".repeat(32),
                600_000,
                Some(1_600_000_000),
                None,
                None,
                None,
            ),
        );
        db.save_channel_timestamps(&timestamps);
        assert_eq!(db.load_channel_timestamps(), timestamps);
    }

    #[test]
    fn key_der_counter_is_monotonic() {
        let db = WalletDb::new(Arc::new(MemStore::new()));
        assert_eq!(db.get_and_inc_counter_for_channel_keys(), 0);
        assert_eq!(db.get_and_inc_counter_for_channel_keys(), 1);
        assert_eq!(db.get_and_inc_counter_for_channel_keys(), 2);
    }
}
