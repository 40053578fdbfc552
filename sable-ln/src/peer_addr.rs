use std::{
    fmt::{self, Display},
    net::IpAddr,
    str::FromStr,
};

use bitcoin::secp256k1::PublicKey;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::ConnStringError;

/// The default BOLT p2p port.
pub const LN_DEFAULT_PORT: u16 = 9735;

/// A Lightning node id: a compressed secp256k1 public key.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
#[derive(Serialize, Deserialize)]
pub struct NodePk(pub PublicKey);

impl Display for NodePk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        PublicKey::fmt(&self.0, f)
    }
}

impl FromStr for NodePk {
    type Err = bitcoin::secp256k1::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublicKey::from_str(s).map(Self)
    }
}

/// A dialable peer: `(host, port, node_pk)`. Equality and hashing include all
/// three fields, since this is the key of the last-tried-time map. IPv6 hosts
/// are stored without brackets.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    pub node_pk: NodePk,
}

impl PeerAddress {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        node_pk: NodePk,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            node_pk,
        }
    }

    /// `host:port`, bracketing IPv6 hosts so the string is dialable.
    pub fn net_addr(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// `<node_pk>@<host>:<port>`
impl Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_pk, self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = ConnStringError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node_pk, rest) = parse_conn_string(s)?;
        let (host, port) = rest.ok_or_else(|| {
            ConnStringError::InvalidHostPort(s.to_owned())
        })?;
        Ok(Self {
            host,
            port,
            node_pk,
        })
    }
}

/// One address the channel graph knows for a node, with the timestamp of the
/// last successful connection. The graph hands these out as three-tuples.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub last_connected: u64,
}

/// Parse a `<node_pk>[@<host>[:<port>]]` connect string. The port defaults to
/// [`LN_DEFAULT_PORT`]; a bare node id yields no host (the caller resolves
/// addresses from the channel graph).
pub fn parse_conn_string(
    s: &str,
) -> Result<(NodePk, Option<(String, u16)>), ConnStringError> {
    let s = s.trim();
    let (pk_str, rest) = match s.split_once('@') {
        Some((pk_str, rest)) => (pk_str, Some(rest)),
        None => (s, None),
    };
    let node_pk =
        NodePk::from_str(pk_str).map_err(|_| ConnStringError::InvalidNodeId)?;
    let host_port = match rest {
        Some(rest) => Some(split_host_port(rest)?),
        None => None,
    };
    Ok((node_pk, host_port))
}

/// Split `host:port`, `[ipv6]:port`, or a bare host (default port). Bare IPv6
/// literals must be bracketed to be distinguishable from `host:port`.
pub fn split_host_port(s: &str) -> Result<(String, u16), ConnStringError> {
    let bad = || ConnStringError::InvalidHostPort(s.to_owned());

    if let Some(rest) = s.strip_prefix('[') {
        // [ipv6] or [ipv6]:port
        let (host, after) = rest.split_once(']').ok_or_else(bad)?;
        let port = match after.strip_prefix(':') {
            Some(port_str) => port_str.parse::<u16>().map_err(|_| bad())?,
            None if after.is_empty() => LN_DEFAULT_PORT,
            None => return Err(bad()),
        };
        return Ok((host.to_owned(), port));
    }

    match s.rsplit_once(':') {
        // Multiple ':' with no brackets means an unbracketed IPv6 literal.
        Some((host, _)) if host.contains(':') =>
            Ok((s.to_owned(), LN_DEFAULT_PORT)),
        Some((host, port_str)) => {
            let port = port_str.parse::<u16>().map_err(|_| bad())?;
            if host.is_empty() {
                return Err(bad());
            }
            Ok((host.to_owned(), port))
        }
        None => Ok((s.to_owned(), LN_DEFAULT_PORT)),
    }
}

/// Pick the address to dial out of a node's address set: the first entry
/// whose host is an IP literal, otherwise one at random.
// TODO: filter out onion addresses when Tor is not available.
pub fn choose_preferred_address(
    addrs: &[NodeAddress],
) -> Option<&NodeAddress> {
    if addrs.is_empty() {
        return None;
    }
    addrs
        .iter()
        .find(|a| a.host.parse::<IpAddr>().is_ok())
        .or_else(|| addrs.choose(&mut rand::thread_rng()))
}

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, prop_assert_eq, proptest};

    use super::*;
    use crate::test_support::dummy_node_pk;

    #[test]
    fn conn_string_roundtrip() {
        let pk = dummy_node_pk(7);
        let addr = PeerAddress::new("203.0.113.5", 9735, pk);
        let parsed = PeerAddress::from_str(&addr.to_string()).unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn bare_node_id_has_no_host() {
        let pk = dummy_node_pk(1);
        let (parsed, rest) = parse_conn_string(&pk.to_string()).unwrap();
        assert_eq!(parsed, pk);
        assert!(rest.is_none());
    }

    #[test]
    fn ipv6_hosts_are_accepted_without_brackets() {
        let (host, port) = split_host_port("[2001:db8::1]:19735").unwrap();
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, 19735);

        // Unbracketed IPv6 falls back to the default port.
        let (host, port) = split_host_port("2001:db8::1").unwrap();
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, LN_DEFAULT_PORT);

        let addr =
            PeerAddress::new("2001:db8::1", 9735, dummy_node_pk(2));
        assert_eq!(addr.net_addr(), "[2001:db8::1]:9735");
    }

    #[test]
    fn default_port_applies() {
        let (host, port) = split_host_port("ecdsa.net").unwrap();
        assert_eq!(host, "ecdsa.net");
        assert_eq!(port, LN_DEFAULT_PORT);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_conn_string("not-a-pubkey@host:1").is_err());
        assert!(split_host_port(":9735").is_err());
        assert!(split_host_port("host:notaport").is_err());
    }

    #[test]
    fn preferred_address_picks_ip_literal_first() {
        let addrs = vec![
            NodeAddress {
                host: "example.onion".into(),
                port: 9735,
                last_connected: 0,
            },
            NodeAddress {
                host: "198.51.100.7".into(),
                port: 9735,
                last_connected: 0,
            },
        ];
        let chosen = choose_preferred_address(&addrs).unwrap();
        assert_eq!(chosen.host, "198.51.100.7");
        assert!(choose_preferred_address(&[]).is_none());
    }

    proptest! {
        #[test]
        fn split_host_port_roundtrips_ipv4(
            a in any::<u8>(), b in any::<u8>(), port in 1u16..,
        ) {
            let s = format!("10.{a}.{b}.1:{port}");
            let (host, parsed_port) = split_host_port(&s).unwrap();
            prop_assert_eq!(host, format!("10.{a}.{b}.1"));
            prop_assert_eq!(parsed_port, port);
        }
    }
}
