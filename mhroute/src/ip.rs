//! Utilities for dealing with IPv4 subnets.

use std::{fmt, net::Ipv4Addr};

use serde::{Deserialize, Serialize};

/// A subnet, composed of a base IP address and a netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    pub network_address: Ipv4Addr,
    pub netmask: u8,
}

impl Subnet {
    pub fn new(address: Ipv4Addr, mask: u8) -> Self {
        Self { network_address: address, netmask: mask }
    }

    fn mask_bits(&self) -> u32 {
        match self.netmask {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n.min(32))),
        }
    }

    /// The address `host` positions past the network address, e.g. host 1 of `10.0.0.0/24` is
    /// `10.0.0.1`.
    pub fn host(&self, host: u32) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.network_address.to_bits().saturating_add(host))
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        let mask = self.mask_bits();
        address.to_bits() & mask == self.network_address.to_bits() & mask
    }

    /// Whether the two subnets share at least one address.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.contains(other.network_address) || other.contains(self.network_address)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_address, self.netmask)
    }
}
