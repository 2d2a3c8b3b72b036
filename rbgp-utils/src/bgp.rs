//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! BGP definitions shared between the speaker core and its tooling.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

// Supported (AFI,SAFI) tuples. Each one identifies a routing table.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum AfiSafi {
    Ipv4Unicast,
    Ipv6Unicast,
}

// Whether a route was learned from an internal or an external peer.
//
// The variant order matters: external routes sort after internal ones, and
// the decision process prefers the greater value.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum RouteType {
    Internal,
    External,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

// Standard community (RFC 1997).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Comm(pub u32);

// BGP Well-known Communities.
//
// IANA registry:
// https://www.iana.org/assignments/bgp-well-known-communities/bgp-well-known-communities.xhtml
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
#[repr(u32)]
pub enum WellKnownCommunities {
    LlgrStale = 0xFFFF0006,
    NoExport = 0xFFFFFF01,
    NoAdvertise = 0xFFFFFF02,
    NoExportSubconfed = 0xFFFFFF03,
}

// ===== impl AfiSafi =====

impl std::fmt::Display for AfiSafi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AfiSafi::Ipv4Unicast => write!(f, "ipv4-unicast"),
            AfiSafi::Ipv6Unicast => write!(f, "ipv6-unicast"),
        }
    }
}

// ===== impl Origin =====

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Igp => write!(f, "igp"),
            Origin::Egp => write!(f, "egp"),
            Origin::Incomplete => write!(f, "incomplete"),
        }
    }
}

// ===== impl Comm =====

impl Comm {
    pub fn is(&self, community: WellKnownCommunities) -> bool {
        self.0 == community as u32
    }
}

impl From<WellKnownCommunities> for Comm {
    fn from(community: WellKnownCommunities) -> Comm {
        Comm(community as u32)
    }
}

impl std::fmt::Display for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match WellKnownCommunities::from_u32(self.0) {
            Some(WellKnownCommunities::LlgrStale) => write!(f, "llgr-stale"),
            Some(WellKnownCommunities::NoExport) => write!(f, "no-export"),
            Some(WellKnownCommunities::NoAdvertise) => {
                write!(f, "no-advertise")
            }
            Some(WellKnownCommunities::NoExportSubconfed) => {
                write!(f, "no-export-subconfed")
            }
            None => write!(f, "{}:{}", self.0 >> 16, self.0 & 0xFFFF),
        }
    }
}

// ===== unit tests =====
