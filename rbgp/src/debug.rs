//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use rbgp_utils::bgp::AfiSafi;
use tracing::{debug, debug_span};

use crate::neighbor::fsm;
use crate::packet::consts::AttrType;
use crate::packet::error::AttrError;
use crate::packet::message::Message;
use crate::registry::RegistryError;
use crate::rib::BestPath;

// BGP debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    InstanceStart,
    InstanceStop,
    TableEnable(AfiSafi),
    TableDisable(AfiSafi),
    NbrCreate(&'a IpAddr),
    NbrDelete(&'a IpAddr),
    NbrFsmEvent(&'a IpAddr, &'a fsm::Event),
    NbrFsmTransition(&'a IpAddr, &'a fsm::State, &'a fsm::State),
    NbrMsgRx(&'a IpAddr, &'a Message),
    NbrMsgTx(&'a IpAddr, &'a Message),
    NbrAttrError(AttrType, AttrError),
    NbrConnRejected(&'a IpAddr, &'a RegistryError),
    NbrConnReplaced(&'a IpAddr),
    NbrTableSynced(&'a IpAddr, AfiSafi),
    NbrGrRetain(&'a IpAddr, AfiSafi, u16),
    NbrGrExpired(&'a IpAddr),
    TableStart(AfiSafi),
    TableStop(AfiSafi),
    TablePeerUp(AfiSafi, &'a IpAddr),
    TablePeerDown(AfiSafi, &'a IpAddr, bool),
    TableStalePurge(AfiSafi, &'a IpAddr, usize),
    BestPathFound(IpNetwork, &'a BestPath),
    BestPathNotFound(IpNetwork),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InstanceStart | Debug::InstanceStop => {
                // Parent span(s): bgp-instance
                debug!("{}", self);
            }
            Debug::TableEnable(afi_safi) | Debug::TableDisable(afi_safi) => {
                // Parent span(s): bgp-instance
                debug!(%afi_safi, "{}", self);
            }
            Debug::NbrCreate(addr)
            | Debug::NbrDelete(addr)
            | Debug::NbrConnReplaced(addr)
            | Debug::NbrGrExpired(addr) => {
                // Parent span(s): bgp-instance
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::NbrFsmEvent(addr, event) => {
                // Parent span(s): bgp-instance
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("fsm").in_scope(|| {
                        debug!(?event, "{}", self);
                    })
                });
            }
            Debug::NbrFsmTransition(addr, old_state, new_state) => {
                // Parent span(s): bgp-instance
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("fsm").in_scope(|| {
                        debug!(?old_state, ?new_state, "{}", self);
                    })
                });
            }
            Debug::NbrMsgRx(addr, msg) => {
                // Parent span(s): bgp-instance
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("input").in_scope(|| {
                        let data = serde_json::to_string(&msg).unwrap_or_default();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::NbrMsgTx(addr, msg) => {
                // Parent span(s): bgp-instance
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug_span!("output").in_scope(|| {
                        let data = serde_json::to_string(&msg).unwrap_or_default();
                        debug!(%data, "{}", self);
                    })
                });
            }
            Debug::NbrAttrError(attr_type, action) => {
                // Parent span(s): bgp-instance:neighbor:input
                debug!(?attr_type, ?action, "{}", self);
            }
            Debug::NbrConnRejected(addr, reason) => {
                // Parent span(s): bgp-instance
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!(%reason, "{}", self);
                });
            }
            Debug::NbrTableSynced(addr, afi_safi) => {
                // Parent span(s): bgp-instance
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!(%afi_safi, "{}", self);
                });
            }
            Debug::NbrGrRetain(addr, afi_safi, restart_time) => {
                // Parent span(s): bgp-instance
                debug_span!("neighbor", %addr).in_scope(|| {
                    debug!(%afi_safi, %restart_time, "{}", self);
                });
            }
            Debug::TableStart(..) | Debug::TableStop(..) => {
                // Parent span(s): table
                debug!("{}", self);
            }
            Debug::TablePeerUp(_, addr) => {
                // Parent span(s): table
                debug!(%addr, "{}", self);
            }
            Debug::TablePeerDown(_, addr, retain_stale) => {
                // Parent span(s): table
                debug!(%addr, %retain_stale, "{}", self);
            }
            Debug::TableStalePurge(_, addr, count) => {
                // Parent span(s): table
                debug!(%addr, %count, "{}", self);
            }
            Debug::BestPathFound(prefix, path) => {
                // Parent span(s): table
                debug!(%prefix, origin = ?path.origin, path_id = %path.path_id, "{}", self);
            }
            Debug::BestPathNotFound(prefix) => {
                // Parent span(s): table
                debug!(%prefix, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceStart => {
                write!(f, "starting instance")
            }
            Debug::InstanceStop => {
                write!(f, "stopping instance")
            }
            Debug::TableEnable(..) => {
                write!(f, "table enabled")
            }
            Debug::TableDisable(..) => {
                write!(f, "table disabled")
            }
            Debug::NbrCreate(..) => {
                write!(f, "neighbor created")
            }
            Debug::NbrDelete(..) => {
                write!(f, "neighbor deleted")
            }
            Debug::NbrFsmEvent(..) => {
                write!(f, "event")
            }
            Debug::NbrFsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::NbrMsgRx(..) | Debug::NbrMsgTx(..) => {
                write!(f, "message")
            }
            Debug::NbrAttrError(..) => {
                write!(f, "malformed attribute")
            }
            Debug::NbrConnRejected(..) => {
                write!(f, "connection rejected")
            }
            Debug::NbrConnReplaced(..) => {
                write!(f, "connection collision, replacing existing session")
            }
            Debug::NbrTableSynced(..) => {
                write!(f, "initial routing update complete")
            }
            Debug::NbrGrRetain(..) => {
                write!(f, "retaining stale routes")
            }
            Debug::NbrGrExpired(..) => {
                write!(f, "restart timer expired")
            }
            Debug::TableStart(afi_safi) => {
                write!(f, "{afi_safi} table started")
            }
            Debug::TableStop(afi_safi) => {
                write!(f, "{afi_safi} table stopped")
            }
            Debug::TablePeerUp(..) => {
                write!(f, "peer up")
            }
            Debug::TablePeerDown(..) => {
                write!(f, "peer down")
            }
            Debug::TableStalePurge(..) => {
                write!(f, "stale routes purged")
            }
            Debug::BestPathFound(..) => {
                write!(f, "best path found")
            }
            Debug::BestPathNotFound(..) => {
                write!(f, "best path not found")
            }
        }
    }
}
