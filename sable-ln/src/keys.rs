use std::{fmt, str::FromStr};

use anyhow::Context;
use bitcoin::{
    secp256k1::{PublicKey, Secp256k1, SecretKey},
    util::bip32::{ChildNumber, ExtendedPrivKey},
    Network,
};
use rand::RngCore;

use crate::{config::LnNetwork, peer_addr::NodePk};

/// BIP32 key family of the node's long-term identity key.
pub const NODE_KEY_FAMILY: u32 = 0;

/// The worker's long-term secp256k1 identity, deterministically derived from
/// the wallet's stored LN xprv. Immutable for the worker's lifetime.
#[derive(Clone)]
pub struct NodeKeypair {
    pub privkey: SecretKey,
    pub pubkey: PublicKey,
}

impl NodeKeypair {
    /// Derive the node key at family [`NODE_KEY_FAMILY`], index 0.
    pub fn from_xprv(xprv: &str) -> anyhow::Result<Self> {
        let master = ExtendedPrivKey::from_str(xprv)
            .context("Could not parse LN node xprv")?;
        let secp = Secp256k1::new();
        let path = [
            ChildNumber::from_hardened_idx(NODE_KEY_FAMILY)
                .expect("key family is a valid hardened index"),
            ChildNumber::from_normal_idx(0)
                .expect("0 is a valid child index"),
        ];
        let derived = master
            .derive_priv(&secp, &path)
            .context("Could not derive node key")?;
        let privkey = derived.private_key;
        let pubkey = PublicKey::from_secret_key(&secp, &privkey);
        Ok(Self { privkey, pubkey })
    }

    /// A throwaway identity, used by the gossip worker.
    pub fn random(network: LnNetwork) -> Self {
        let xprv = generate_xprv(network);
        Self::from_xprv(&xprv).expect("fresh xprv must derive")
    }

    pub fn node_pk(&self) -> NodePk {
        NodePk(self.pubkey)
    }
}

// The identity privkey must not end up in logs.
impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("pubkey", &self.pubkey)
            .finish_non_exhaustive()
    }
}

/// Generate a fresh base58 master xprv from 32 random bytes. Stored at
/// `lightning_privkey2` on first use.
pub fn generate_xprv(network: LnNetwork) -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let network = match network {
        LnNetwork::Mainnet => Network::Bitcoin,
        LnNetwork::Testnet => Network::Testnet,
        LnNetwork::Regtest => Network::Regtest,
    };
    ExtendedPrivKey::new_master(network, &seed)
        .expect("a 32-byte seed is always valid")
        .to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let xprv = generate_xprv(LnNetwork::Regtest);
        let kp1 = NodeKeypair::from_xprv(&xprv).unwrap();
        let kp2 = NodeKeypair::from_xprv(&xprv).unwrap();
        assert_eq!(kp1.node_pk(), kp2.node_pk());
    }

    #[test]
    fn random_identities_differ() {
        let kp1 = NodeKeypair::random(LnNetwork::Regtest);
        let kp2 = NodeKeypair::random(LnNetwork::Regtest);
        assert_ne!(kp1.node_pk(), kp2.node_pk());
    }

    #[test]
    fn debug_redacts_privkey() {
        let kp = NodeKeypair::random(LnNetwork::Regtest);
        let debug = format!("{kp:?}");
        assert!(debug.contains("pubkey"));
        assert!(!debug.contains(&format!("{}", kp.privkey.display_secret())));
    }
}
