//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use rbgp_utils::bgp::AfiSafi;
use serde::{Deserialize, Serialize};

use crate::packet::consts::AddPathMode;

// Default values.
pub const DFLT_HOLDTIME: u16 = 90;
pub const DFLT_CONNECT_RETRY: u16 = 120;
pub const DFLT_RESTART_TIME: u16 = 120;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct InstanceCfg {
    pub asn: u32,
    pub identifier: Ipv4Addr,
    // Route reflector cluster ID. Defaults to the BGP identifier.
    pub cluster_id: Option<Ipv4Addr>,
    // Compare MED values between paths from different neighbor ASes.
    pub always_compare_med: bool,
    pub tables: BTreeMap<AfiSafi, TableCfg>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TableCfg {
    pub enabled: bool,
    pub path_selection: PathSelectionMode,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathSelectionMode {
    // Single best path.
    #[default]
    Best,
    // Every path sharing the best path's LOCAL_PREF.
    AllPaths,
    // The N most preferred paths.
    BestN(u32),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NeighborCfg {
    pub peer_as: u32,
    pub role: PeerRole,
    pub holdtime: u16,
    // Defaults to one third of the hold time.
    pub keepalive: Option<u16>,
    pub connect_retry: u16,
    // Only accept connections, never initiate them.
    pub passive: bool,
    pub four_byte_asn: bool,
    pub route_refresh: bool,
    pub afi_safi: BTreeMap<AfiSafi, NeighborAfiSafiCfg>,
    pub graceful_restart: GracefulRestartCfg,
}

#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerRole {
    Ebgp,
    #[default]
    Ibgp,
    RrClient,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NeighborAfiSafiCfg {
    pub add_path: Option<AddPathMode>,
    pub graceful_restart: bool,
    pub forwarding_preserved: bool,
    pub policy: SimpleRoutingPolicy,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimpleRoutingPolicy {
    #[default]
    Default,
    // Nothing is advertised to the peer.
    AnnounceNone,
    // Nothing learned from the peer is installed.
    LearnNone,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GracefulRestartCfg {
    pub restart_time: u16,
}

// ===== impl InstanceCfg =====

impl InstanceCfg {
    pub fn cluster_id(&self) -> Ipv4Addr {
        self.cluster_id.unwrap_or(self.identifier)
    }
}

impl Default for InstanceCfg {
    fn default() -> InstanceCfg {
        InstanceCfg {
            asn: 0,
            identifier: Ipv4Addr::UNSPECIFIED,
            cluster_id: None,
            always_compare_med: false,
            tables: [AfiSafi::Ipv4Unicast, AfiSafi::Ipv6Unicast]
                .into_iter()
                .map(|afi_safi| (afi_safi, TableCfg::default()))
                .collect(),
        }
    }
}

// ===== impl TableCfg =====

impl Default for TableCfg {
    fn default() -> TableCfg {
        TableCfg {
            enabled: true,
            path_selection: PathSelectionMode::Best,
        }
    }
}

// ===== impl NeighborCfg =====

impl NeighborCfg {
    pub fn keepalive(&self) -> u16 {
        self.keepalive.unwrap_or(self.holdtime / 3)
    }

    pub(crate) fn afi_safi(&self, afi_safi: AfiSafi) -> NeighborAfiSafiCfg {
        self.afi_safi.get(&afi_safi).copied().unwrap_or_default()
    }
}

impl Default for NeighborCfg {
    fn default() -> NeighborCfg {
        NeighborCfg {
            peer_as: 0,
            role: PeerRole::default(),
            holdtime: DFLT_HOLDTIME,
            keepalive: None,
            connect_retry: DFLT_CONNECT_RETRY,
            passive: false,
            four_byte_asn: true,
            route_refresh: true,
            afi_safi: [(AfiSafi::Ipv4Unicast, NeighborAfiSafiCfg::default())]
                .into(),
            graceful_restart: GracefulRestartCfg::default(),
        }
    }
}

// ===== impl GracefulRestartCfg =====

impl Default for GracefulRestartCfg {
    fn default() -> GracefulRestartCfg {
        GracefulRestartCfg {
            restart_time: DFLT_RESTART_TIME,
        }
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_defaults() {
        let cfg: NeighborCfg =
            serde_json::from_str(r#"{"peer_as": 65001}"#).unwrap();
        assert_eq!(cfg.holdtime, 90);
        assert_eq!(cfg.keepalive(), 30);
        assert_eq!(cfg.connect_retry, 120);
        assert_eq!(cfg.graceful_restart.restart_time, 120);
        assert!(cfg.four_byte_asn);
        assert_eq!(cfg.role, PeerRole::Ibgp);
        assert_eq!(
            cfg.afi_safi(AfiSafi::Ipv6Unicast).policy,
            SimpleRoutingPolicy::Default
        );
    }

    #[test]
    fn cluster_id_defaults_to_identifier() {
        let cfg: InstanceCfg = serde_json::from_str(
            r#"{"asn": 65000, "identifier": "1.1.1.1",
                "tables": {"Ipv4Unicast": {"path_selection": {"best-n": 2}}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.cluster_id(), Ipv4Addr::new(1, 1, 1, 1));
        let table = cfg.tables[&AfiSafi::Ipv4Unicast];
        assert!(table.enabled);
        assert_eq!(table.path_selection, PathSelectionMode::BestN(2));
        assert!(!cfg.tables.contains_key(&AfiSafi::Ipv6Unicast));
    }
}
