//! # Common Types
//!
//! Identity and addressing types shared by every other module.

pub mod address;
pub mod namespace;
pub mod node;

pub use address::{
    addresses_from_wire, addresses_to_wire, consensus_addresses_from_wire,
    consensus_addresses_to_wire, is_routable_ip, Address, AddressError, ConsensusAddress,
    WireAddress, WireConsensusAddress, WireTransport,
};
pub use namespace::Namespace;
pub use node::{Node, RolesMask};
