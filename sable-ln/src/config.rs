use serde::Deserialize;

/// Which chain flavor this worker speaks. Decides the fallback peer list,
/// the invoice human-readable prefix, and the hardcoded regtest feerate.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LnNetwork {
    Mainnet,
    Testnet,
    Regtest,
}

impl LnNetwork {
    /// The realm byte used in `r<realm>.<seed>` DNS seed queries.
    pub fn realm_byte(&self) -> u8 {
        match self {
            Self::Mainnet => 0,
            Self::Testnet => 1,
            Self::Regtest => 0,
        }
    }

    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            Self::Mainnet =>
                &["nodes.lightning.directory", "lseed.bitcoinstats.com"],
            Self::Testnet => &["test.nodes.lightning.directory"],
            Self::Regtest => &[],
        }
    }
}

/// A seed peer from the host config: `(host, port, node_pubkey_hex)`.
#[derive(Clone, Debug, Deserialize)]
pub struct ConfiguredPeer {
    pub host: String,
    pub port: u16,
    pub pubkey: String,
}

/// Worker options read from the host wallet config.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// `[ipv6]:port` or `ipv4:port` on which to accept inbound BOLT
    /// connections. Off when unset.
    #[serde(default)]
    pub lightning_listen: Option<String>,
    /// Seed list of peers to dial on startup.
    #[serde(default)]
    pub lightning_peers: Vec<ConfiguredPeer>,
    /// HTTP JSON-RPC endpoint of a remote watchtower. Off when unset.
    #[serde(default)]
    pub watchtower_url: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_deserializes_with_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.lightning_listen.is_none());
        assert!(config.lightning_peers.is_empty());
        assert!(config.watchtower_url.is_none());

        let config: Config = serde_json::from_str(
            r#"{
                "lightning_listen": "127.0.0.1:9735",
                "lightning_peers": [
                    {"host": "198.51.100.1", "port": 9735, "pubkey": "02ab"}
                ],
                "watchtower_url": "http://localhost:12345"
            }"#,
        )
        .unwrap();
        assert_eq!(config.lightning_listen.as_deref(), Some("127.0.0.1:9735"));
        assert_eq!(config.lightning_peers.len(), 1);
    }
}
