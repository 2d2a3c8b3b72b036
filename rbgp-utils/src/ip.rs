//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};

// Extension methods for Ipv4Addr.
pub trait Ipv4AddrExt {
    const LENGTH: usize;

    // Returns true if this address can identify a BGP speaker.
    fn is_valid_identifier(&self) -> bool;
}

// Extension methods for Ipv6Addr.
pub trait Ipv6AddrExt {
    const LENGTH: usize;
}

// Extension methods for IpAddr.
pub trait IpAddrExt {
    // Returns the address as an IPv4 address, unwrapping IPv4-mapped IPv6
    // addresses.
    fn to_ipv4(&self) -> Option<Ipv4Addr>;
}

// Extension methods for Ipv4Network.
pub trait Ipv4NetworkExt {
    const MAX_PREFIXLEN: u8;

    // Apply mask to prefix.
    #[must_use]
    fn apply_mask(&self) -> Ipv4Network;

    // Returns true if this is a routable network.
    fn is_routable(&self) -> bool;
}

// Extension methods for Ipv6Network.
pub trait Ipv6NetworkExt {
    const MAX_PREFIXLEN: u8;

    // Apply mask to prefix.
    #[must_use]
    fn apply_mask(&self) -> Ipv6Network;

    // Returns true if this is a routable network.
    fn is_routable(&self) -> bool;
}

// ===== impl Ipv4Addr =====

impl Ipv4AddrExt for Ipv4Addr {
    const LENGTH: usize = 4;

    fn is_valid_identifier(&self) -> bool {
        !(self.is_unspecified() || self.is_multicast() || self.is_broadcast())
    }
}

// ===== impl Ipv6Addr =====

impl Ipv6AddrExt for Ipv6Addr {
    const LENGTH: usize = 16;
}

// ===== impl IpAddr =====

impl IpAddrExt for IpAddr {
    fn to_ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            IpAddr::V4(addr) => Some(*addr),
            IpAddr::V6(addr) => addr.to_ipv4_mapped(),
        }
    }
}

// ===== impl Ipv4Network =====

impl Ipv4NetworkExt for Ipv4Network {
    const MAX_PREFIXLEN: u8 = 32;

    fn apply_mask(&self) -> Ipv4Network {
        Ipv4Network::new(self.network(), self.prefix()).unwrap_or(*self)
    }

    fn is_routable(&self) -> bool {
        !self.ip().is_broadcast()
            && !self.ip().is_loopback()
            && !self.ip().is_multicast()
            // Addresses in 240.0.0.0/4 are reserved for future use.
            && self.ip().octets()[0] < 240
    }
}

// ===== impl Ipv6Network =====

impl Ipv6NetworkExt for Ipv6Network {
    const MAX_PREFIXLEN: u8 = 128;

    fn apply_mask(&self) -> Ipv6Network {
        Ipv6Network::new(self.network(), self.prefix()).unwrap_or(*self)
    }

    fn is_routable(&self) -> bool {
        !self.ip().is_loopback()
            && !self.ip().is_multicast()
            && !self.ip().is_unicast_link_local()
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_mask_clears_host_bits() {
        let prefix = Ipv4Network::new(Ipv4Addr::new(10, 1, 2, 3), 16).unwrap();
        assert_eq!(
            prefix.apply_mask(),
            Ipv4Network::new(Ipv4Addr::new(10, 1, 0, 0), 16).unwrap()
        );
    }

    #[test]
    fn reserved_block_is_not_routable() {
        let prefix = Ipv4Network::new(Ipv4Addr::new(240, 0, 0, 0), 4).unwrap();
        assert!(!prefix.is_routable());
        let prefix = Ipv4Network::new(Ipv4Addr::new(1, 1, 1, 1), 32).unwrap();
        assert!(prefix.is_routable());
    }
}
