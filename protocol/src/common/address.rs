//! # Node Addresses
//!
//! Transport endpoints as they appear in node descriptors, and the
//! `<identity>@<address>` form used for consensus peers.
//!
//! ## Encodings
//!
//! ```text
//! text   : 192.0.2.1:26656        [2001:db8::1]:26656
//!          <hex id>@192.0.2.1:26656
//! wire   : WireAddress { transport: TcpV4 | TcpV6, ip: 4 | 16 bytes, port: u32 }
//! ```
//!
//! The wire form keeps the port as a `u32` and the IP as a byte vector so a
//! decoder sees exactly what a peer sent; both are range-checked on the way
//! in. IPv4-mapped IPv6 addresses are folded to plain IPv4 on construction,
//! so `::ffff:10.0.0.1` and `10.0.0.1` are the same address.
//!
//! ## Routability
//!
//! [`Address::is_routable`] checks the IP against the RFC 6890 special
//! purpose registry (plus a few neighbours). The table is stricter than what
//! most p2p stacks use: documentation, benchmarking and 6to4/Teredo blocks
//! are all treated as unroutable.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::crypto::PublicKey;

/// Errors from the address codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Text or wire input does not describe a valid transport address.
    #[error("invalid transport address: {0}")]
    InvalidAddress(String),

    /// A consensus address is missing its `ID@` part.
    #[error("consensus address doesn't have ID@ part")]
    MissingIdentity,

    /// The `ID@` part of a consensus address is not a valid identity.
    #[error("invalid consensus address identity: {0}")]
    InvalidIdentity(String),
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// A TCP endpoint for the purpose of node descriptors.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(SocketAddr);

impl Address {
    /// Builds an address, folding IPv4-mapped IPv6 to IPv4.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let canonical = match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, port)),
                None => SocketAddr::V6(SocketAddrV6::new(v6, port, 0, 0)),
            },
            IpAddr::V4(v4) => SocketAddr::V4(SocketAddrV4::new(v4, port)),
        };
        Self(canonical)
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Returns `true` iff the address is likely to be globally routable.
    pub fn is_routable(&self) -> bool {
        is_routable_ip(&self.ip())
    }

    /// Converts to the tagged wire form.
    pub fn to_wire(&self) -> WireAddress {
        match self.0 {
            SocketAddr::V4(v4) => WireAddress {
                transport: WireTransport::TcpV4,
                ip: v4.ip().octets().to_vec(),
                port: u32::from(v4.port()),
            },
            SocketAddr::V6(v6) => WireAddress {
                transport: WireTransport::TcpV6,
                ip: v6.ip().octets().to_vec(),
                port: u32::from(v6.port()),
            },
        }
    }

    /// Parses the tagged wire form.
    ///
    /// Fails if the IP length disagrees with the transport tag or the port
    /// does not fit in 16 bits.
    pub fn from_wire(wire: &WireAddress) -> Result<Self, AddressError> {
        let port = u16::try_from(wire.port).map_err(|_| {
            AddressError::InvalidAddress(format!("port {} out of range", wire.port))
        })?;

        let ip = match wire.transport {
            WireTransport::TcpV4 => {
                let octets: [u8; 4] = wire.ip.as_slice().try_into().map_err(|_| {
                    AddressError::InvalidAddress(format!(
                        "tcpv4 address has {} bytes",
                        wire.ip.len()
                    ))
                })?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            WireTransport::TcpV6 => {
                let octets: [u8; 16] = wire.ip.as_slice().try_into().map_err(|_| {
                    AddressError::InvalidAddress(format!(
                        "tcpv6 address has {} bytes",
                        wire.ip.len()
                    ))
                })?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };

        Ok(Self::new(ip, port))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s
            .trim()
            .parse()
            .map_err(|_| AddressError::InvalidAddress(s.to_string()))?;
        Ok(Self::from(addr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// Transport tag of a wire address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireTransport {
    TcpV4,
    TcpV6,
}

/// Tagged binary form of an [`Address`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAddress {
    pub transport: WireTransport,
    pub ip: Vec<u8>,
    pub port: u32,
}

impl WireAddress {
    /// bincode bytes of this wire address.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        bincode::deserialize(bytes).map_err(|e| AddressError::InvalidAddress(e.to_string()))
    }
}

/// Converts a list of addresses to wire form.
pub fn addresses_to_wire(addrs: &[Address]) -> Vec<WireAddress> {
    addrs.iter().map(Address::to_wire).collect()
}

/// Converts a list of wire addresses, failing on the first bad entry.
pub fn addresses_from_wire(wire: &[WireAddress]) -> Result<Vec<Address>, AddressError> {
    wire.iter().map(Address::from_wire).collect()
}

// ---------------------------------------------------------------------------
// ConsensusAddress
// ---------------------------------------------------------------------------

/// A consensus peer address: node identity plus TCP endpoint.
///
/// The identity may differ from the node's own identity. A validator behind a
/// sentry advertises the sentry's identity and address here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConsensusAddress {
    pub id: PublicKey,
    pub address: Address,
}

/// Wire form of a [`ConsensusAddress`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireConsensusAddress {
    pub id: Vec<u8>,
    pub address: WireAddress,
}

impl ConsensusAddress {
    pub fn new(id: PublicKey, address: Address) -> Self {
        Self { id, address }
    }

    pub fn to_wire(&self) -> WireConsensusAddress {
        WireConsensusAddress {
            id: self.id.as_bytes().to_vec(),
            address: self.address.to_wire(),
        }
    }

    pub fn from_wire(wire: &WireConsensusAddress) -> Result<Self, AddressError> {
        let id: [u8; 32] = wire.id.as_slice().try_into().map_err(|_| {
            AddressError::InvalidIdentity(format!("identity has {} bytes", wire.id.len()))
        })?;
        Ok(Self {
            id: PublicKey::from_bytes(id),
            address: Address::from_wire(&wire.address)?,
        })
    }
}

/// Converts a list of consensus addresses to wire form.
pub fn consensus_addresses_to_wire(addrs: &[ConsensusAddress]) -> Vec<WireConsensusAddress> {
    addrs.iter().map(ConsensusAddress::to_wire).collect()
}

/// Converts a list of wire consensus addresses, failing on the first bad
/// entry.
pub fn consensus_addresses_from_wire(
    wire: &[WireConsensusAddress],
) -> Result<Vec<ConsensusAddress>, AddressError> {
    wire.iter().map(ConsensusAddress::from_wire).collect()
}

impl FromStr for ConsensusAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('@').collect();
        let [id, address] = parts.as_slice() else {
            return Err(AddressError::MissingIdentity);
        };
        let id = PublicKey::from_hex(id)
            .map_err(|e| AddressError::InvalidIdentity(e.to_string()))?;
        let address = address.parse()?;
        Ok(Self { id, address })
    }
}

impl fmt::Display for ConsensusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

impl Serialize for ConsensusAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConsensusAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Reserved networks
// ---------------------------------------------------------------------------

/// A CIDR block with its base pre-masked.
#[derive(Clone, Copy, Debug)]
enum IpNetwork {
    V4 { base: u32, mask: u32 },
    V6 { base: u128, mask: u128 },
}

impl IpNetwork {
    fn v4(addr: Ipv4Addr, prefix: u32) -> Self {
        let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
        Self::V4 {
            base: u32::from(addr) & mask,
            mask,
        }
    }

    fn v6(addr: Ipv6Addr, prefix: u32) -> Self {
        let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
        Self::V6 {
            base: u128::from(addr) & mask,
            mask,
        }
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        match (self, ip) {
            (Self::V4 { base, mask }, IpAddr::V4(v4)) => u32::from(*v4) & mask == *base,
            (Self::V6 { base, mask }, IpAddr::V6(v6)) => u128::from(*v6) & mask == *base,
            _ => false,
        }
    }
}

/// RFC 6890 special-purpose blocks, IPv4.
const RESERVED_V4: &[(Ipv4Addr, u32)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),          // RFC 1122
    (Ipv4Addr::new(10, 0, 0, 0), 8),         // RFC 1918: Private-Use
    (Ipv4Addr::new(100, 64, 0, 0), 10),      // RFC 6598: Shared Address Space
    (Ipv4Addr::new(127, 0, 0, 0), 8),        // RFC 1122: Loopback
    (Ipv4Addr::new(169, 254, 0, 0), 16),     // RFC 3927: Link Local
    (Ipv4Addr::new(172, 16, 0, 0), 12),      // RFC 1918: Private-Use
    (Ipv4Addr::new(192, 0, 0, 0), 24),       // RFC 6890
    (Ipv4Addr::new(192, 0, 0, 0), 29),       // RFC 6333: DS-Lite
    (Ipv4Addr::new(192, 0, 2, 0), 24),       // RFC 5737: TEST-NET-1
    (Ipv4Addr::new(192, 168, 0, 0), 16),     // RFC 1918: Private-Use
    (Ipv4Addr::new(198, 18, 0, 0), 15),      // RFC 2544: Benchmarking
    (Ipv4Addr::new(198, 51, 100, 0), 24),    // RFC 5737: TEST-NET-2
    (Ipv4Addr::new(203, 0, 113, 0), 24),     // RFC 5737: TEST-NET-3
    (Ipv4Addr::new(240, 0, 0, 0), 4),        // RFC 1112: Reserved
    (Ipv4Addr::new(255, 255, 255, 255), 32), // RFC 919: Limited Broadcast
];

/// RFC 6890 special-purpose blocks, IPv6.
const RESERVED_V6: &[(Ipv6Addr, u32)] = &[
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1), 128),       // RFC 4291: Loopback
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 128),       // RFC 4291: Unspecified
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 64),    // RFC 6666: Discard-Only
    (Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 32),   // RFC 4380: TEREDO
    (Ipv6Addr::new(0x2001, 2, 0, 0, 0, 0, 0, 0), 48),   // RFC 5180: Benchmarking
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32), // RFC 3849: Documentation
    (Ipv6Addr::new(0x2001, 0x10, 0, 0, 0, 0, 0, 0), 28), // RFC 4843: ORCHID
    (Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0), 16),   // RFC 3056: 6to4
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),    // RFC 4193: Unique-Local
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),   // RFC 4291: Link-Scoped Unicast
];

static UNROUTABLE_NETWORKS: Lazy<Vec<IpNetwork>> = Lazy::new(|| {
    RESERVED_V4
        .iter()
        .map(|(addr, prefix)| IpNetwork::v4(*addr, *prefix))
        .chain(
            RESERVED_V6
                .iter()
                .map(|(addr, prefix)| IpNetwork::v6(*addr, *prefix)),
        )
        .collect()
});

/// Returns `true` unless `ip` falls in a reserved block.
pub fn is_routable_ip(ip: &IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*ip),
        IpAddr::V4(_) => *ip,
    };
    !UNROUTABLE_NETWORKS.iter().any(|net| net.contains(&ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn text_roundtrip() {
        for s in [
            "127.0.0.1:26656",
            "8.8.8.8:53",
            "[2001:db8::1]:9000",
            "[::1]:1",
            "[2a00:1450:4001:81c::200e]:443",
        ] {
            let a = addr(s);
            assert_eq!(a.to_string(), s);
            assert_eq!(addr(&a.to_string()), a);
        }
    }

    #[test]
    fn wire_roundtrip() {
        for s in ["10.1.2.3:80", "1.1.1.1:65535", "[fe80::1]:4000", "[2606:4700::1111]:0"] {
            let a = addr(s);
            let wire = a.to_wire();
            assert_eq!(Address::from_wire(&wire).unwrap(), a);
            let bytes = wire.to_bytes();
            assert_eq!(WireAddress::from_bytes(&bytes).unwrap(), wire);
        }
    }

    #[test]
    fn wire_tags_by_family() {
        assert_eq!(addr("1.2.3.4:5").to_wire().transport, WireTransport::TcpV4);
        assert_eq!(addr("1.2.3.4:5").to_wire().ip.len(), 4);
        assert_eq!(addr("[2001:db8::5]:5").to_wire().transport, WireTransport::TcpV6);
        assert_eq!(addr("[2001:db8::5]:5").to_wire().ip.len(), 16);
    }

    #[test]
    fn ipv4_mapped_is_folded() {
        let mapped = addr("[::ffff:10.0.0.1]:80");
        assert_eq!(mapped, addr("10.0.0.1:80"));
        assert_eq!(mapped.to_wire().transport, WireTransport::TcpV4);
    }

    #[test]
    fn rejects_garbage_text() {
        for s in ["", "localhost:80", "1.2.3.4", "1.2.3.4:70000", "::1:80"] {
            assert!(
                matches!(s.parse::<Address>(), Err(AddressError::InvalidAddress(_))),
                "{s} should not parse"
            );
        }
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut wire = addr("1.2.3.4:5").to_wire();
        wire.transport = WireTransport::TcpV6;
        assert!(matches!(
            Address::from_wire(&wire),
            Err(AddressError::InvalidAddress(_))
        ));

        let mut wire = addr("[2001:db8::1]:5").to_wire();
        wire.transport = WireTransport::TcpV4;
        assert!(Address::from_wire(&wire).is_err());
    }

    #[test]
    fn rejects_oversized_port() {
        let mut wire = addr("1.2.3.4:5").to_wire();
        wire.port = u32::from(u16::MAX) + 1;
        assert!(matches!(
            Address::from_wire(&wire),
            Err(AddressError::InvalidAddress(_))
        ));
    }

    #[test]
    fn list_conversion_fails_on_first_bad_entry() {
        let good = vec![addr("1.2.3.4:5"), addr("[2001:db8::1]:6")];
        let wire = addresses_to_wire(&good);
        assert_eq!(addresses_from_wire(&wire).unwrap(), good);

        let mut bad = wire.clone();
        bad[1].ip.truncate(3);
        assert!(addresses_from_wire(&bad).is_err());
    }

    #[test]
    fn consensus_address_parse() {
        let id = Keypair::from_seed(&[1u8; 32]).public_key();
        let text = format!("{}@127.0.0.1:26656", id.to_hex());
        let ca: ConsensusAddress = text.parse().unwrap();
        assert_eq!(ca.id, id);
        assert_eq!(ca.address, addr("127.0.0.1:26656"));
        assert_eq!(ca.to_string(), text);
    }

    #[test]
    fn consensus_address_missing_identity() {
        assert_eq!(
            "127.0.0.1:26656".parse::<ConsensusAddress>(),
            Err(AddressError::MissingIdentity)
        );
        assert_eq!(
            "a@b@127.0.0.1:26656".parse::<ConsensusAddress>(),
            Err(AddressError::MissingIdentity)
        );
    }

    #[test]
    fn consensus_address_bad_parts() {
        assert!(matches!(
            "deadbeef@127.0.0.1:26656".parse::<ConsensusAddress>(),
            Err(AddressError::InvalidIdentity(_))
        ));
        let id = Keypair::generate().public_key();
        assert!(matches!(
            format!("{}@nope", id).parse::<ConsensusAddress>(),
            Err(AddressError::InvalidAddress(_))
        ));
    }

    #[test]
    fn consensus_address_wire_roundtrip() {
        let ca = ConsensusAddress::new(Keypair::generate().public_key(), addr("[2001:db8::7]:1"));
        assert_eq!(ConsensusAddress::from_wire(&ca.to_wire()).unwrap(), ca);

        let mut wire = ca.to_wire();
        wire.id.pop();
        assert!(matches!(
            ConsensusAddress::from_wire(&wire),
            Err(AddressError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn consensus_list_conversion_fails_on_first_bad_entry() {
        let good = vec![
            ConsensusAddress::new(Keypair::generate().public_key(), addr("1.2.3.4:26656")),
            ConsensusAddress::new(Keypair::generate().public_key(), addr("[2001:db8::2]:26656")),
        ];
        let wire = consensus_addresses_to_wire(&good);
        assert_eq!(wire.len(), 2);
        assert_eq!(consensus_addresses_from_wire(&wire).unwrap(), good);
        assert!(consensus_addresses_from_wire(&[]).unwrap().is_empty());

        let mut bad_identity = wire.clone();
        bad_identity[0].id.truncate(31);
        assert!(matches!(
            consensus_addresses_from_wire(&bad_identity),
            Err(AddressError::InvalidIdentity(_))
        ));

        let mut bad_address = wire;
        bad_address[1].address.ip.truncate(3);
        assert!(consensus_addresses_from_wire(&bad_address).is_err());
    }

    #[test]
    fn serde_uses_text_form() {
        let a = addr("192.0.2.1:80");
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"192.0.2.1:80\"");
        assert_eq!(serde_json::from_str::<Address>(&json).unwrap(), a);
    }

    #[test]
    fn routability() {
        assert!(!addr("10.0.0.5:1").is_routable());
        assert!(!addr("192.168.1.1:1").is_routable());
        assert!(!addr("127.0.0.1:1").is_routable());
        assert!(!addr("172.31.255.255:1").is_routable());
        assert!(!addr("198.19.0.1:1").is_routable());
        assert!(!addr("255.255.255.255:1").is_routable());
        assert!(!addr("[::1]:1").is_routable());
        assert!(!addr("[fd00::1]:1").is_routable());
        assert!(!addr("[fe80::abcd]:1").is_routable());
        assert!(!addr("[2001:db8::1]:1").is_routable());
        assert!(!addr("[::ffff:192.168.0.1]:1").is_routable());

        assert!(addr("8.8.8.8:53").is_routable());
        assert!(addr("172.32.0.1:1").is_routable());
        assert!(addr("[2606:4700::1111]:443").is_routable());
    }

    #[test]
    fn reserved_table_is_complete() {
        assert_eq!(
            UNROUTABLE_NETWORKS.len(),
            RESERVED_V4.len() + RESERVED_V6.len()
        );
    }
}
