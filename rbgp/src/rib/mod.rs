//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod export;
pub mod offset;
pub mod selection;
pub mod sync;
pub mod table;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use rbgp_utils::bgp::RouteType;
use serde::{Deserialize, Serialize};

use crate::config::PeerRole;
use crate::packet::attribute::Attrs;
use crate::rib::offset::{OffsetTable, OffsetTables};
use crate::rib::selection::RouteIneligibleReason;

// Default values.
pub const DFLT_LOCAL_PREF: u32 = 100;

// Router a route was learned from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RouteOrigin {
    pub identifier: Ipv4Addr,
    pub remote_addr: IpAddr,
}

// Adj-RIB-In key within a destination: the advertising peer plus the path
// identifier it assigned, when ADD-PATH is in use.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct RouteSource {
    pub remote_addr: IpAddr,
    pub remote_path_id: Option<u32>,
}

// Adj-RIB-In route.
#[derive(Clone, Debug)]
pub struct Route {
    pub origin: RouteOrigin,
    pub attrs: Arc<AttrSet<Attrs>>,
    pub route_type: RouteType,
    pub role: PeerRole,
    pub remote_path_id: Option<u32>,
    // Path identifier used when advertising this route with ADD-PATH.
    pub local_path_id: u32,
    // Retained across a graceful restart, pending refresh by the peer.
    pub stale: bool,
    pub ineligible_reason: Option<RouteIneligibleReason>,
}

// Loc-RIB entry for one selected path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BestPath {
    pub origin: RouteOrigin,
    pub attrs: Arc<AttrSet<Attrs>>,
    pub route_type: RouteType,
    pub role: PeerRole,
    pub path_id: u32,
    pub stale: bool,
}

// All paths known for a single prefix.
//
// Routes live in a vector whose layout is described by the offset table, so
// a destination costs two shared slices plus one vector no matter how many
// routers contribute to it.
#[derive(Debug, Default)]
pub struct Destination {
    pub sources: OffsetTable<RouteSource>,
    pub routes: Vec<Route>,
    pub best: Vec<BestPath>,
    next_path_id: u32,
}

#[derive(Debug, Eq, PartialEq)]
pub struct AttrSets<T> {
    pub tree: BTreeMap<T, Arc<AttrSet<T>>>,
    next_index: u64,
}

#[derive(Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AttrSet<T> {
    pub index: u64,
    pub value: T,
}

// ===== impl Route =====

impl Route {
    pub(crate) fn new(
        origin: RouteOrigin,
        attrs: Arc<AttrSet<Attrs>>,
        route_type: RouteType,
        role: PeerRole,
        remote_path_id: Option<u32>,
    ) -> Route {
        Route {
            origin,
            attrs,
            route_type,
            role,
            remote_path_id,
            local_path_id: 0,
            stale: false,
            ineligible_reason: None,
        }
    }

    pub(crate) fn is_eligible(&self) -> bool {
        self.ineligible_reason.is_none()
    }

    // BGP identifier used for tie-breaking. Reflected routes are identified
    // by their ORIGINATOR_ID.
    pub(crate) fn router_id(&self) -> Ipv4Addr {
        self.attrs
            .value
            .base
            .originator_id
            .unwrap_or(self.origin.identifier)
    }

    pub(crate) fn source(&self) -> RouteSource {
        RouteSource {
            remote_addr: self.origin.remote_addr,
            remote_path_id: self.remote_path_id,
        }
    }
}

// ===== impl BestPath =====

impl From<&Route> for BestPath {
    fn from(route: &Route) -> BestPath {
        BestPath {
            origin: route.origin,
            attrs: Arc::clone(&route.attrs),
            route_type: route.route_type,
            role: route.role,
            path_id: route.local_path_id,
            stale: route.stale,
        }
    }
}

// ===== impl Destination =====

impl Destination {
    // Inserts or replaces the route learned from the given source, returning
    // the replaced route.
    //
    // A replaced route keeps its local path identifier so that ADD-PATH
    // receivers see an implicit update rather than a new path.
    pub(crate) fn insert(
        &mut self,
        offsets: &mut OffsetTables<RouteSource>,
        mut route: Route,
    ) -> Option<Route> {
        let source = route.source();
        if let Some(offset) = self.sources.offset_of(&source) {
            route.local_path_id = self.routes[offset].local_path_id;
            return Some(std::mem::replace(&mut self.routes[offset], route));
        }

        self.next_path_id += 1;
        route.local_path_id = self.next_path_id;
        let (sources, _) = offsets.with(&self.sources, source);
        let routes = std::mem::take(&mut self.routes);
        self.routes = sources.expand(routes, [route]);
        self.sources = sources;
        None
    }

    // Removes the route learned from the given source. Removing an unknown
    // route is a no-op.
    pub(crate) fn remove(
        &mut self,
        offsets: &mut OffsetTables<RouteSource>,
        source: &RouteSource,
    ) -> Option<Route> {
        let (sources, offset) = offsets.without(&self.sources, source)?;
        self.sources = sources;
        Some(self.routes.remove(offset))
    }

    // Removes all routes matching the given predicate.
    pub(crate) fn remove_matching(
        &mut self,
        offsets: &mut OffsetTables<RouteSource>,
        f: impl Fn(&Route) -> bool,
    ) -> usize {
        let sources = self
            .routes
            .iter()
            .filter(|route| f(route))
            .map(|route| route.source())
            .collect::<Vec<_>>();
        for source in &sources {
            self.remove(offsets, source);
        }
        sources.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ===== impl AttrSets =====

impl<T> AttrSets<T>
where
    T: Clone + Eq + Ord + PartialEq + PartialOrd,
{
    pub(crate) fn get(&mut self, attr: &T) -> Arc<AttrSet<T>> {
        if let Some(attr_set) = self.tree.get(attr) {
            Arc::clone(attr_set)
        } else {
            self.next_index += 1;
            let attr_set = Arc::new(AttrSet {
                index: self.next_index,
                value: attr.clone(),
            });
            self.tree.insert(attr.clone(), Arc::clone(&attr_set));
            attr_set
        }
    }

    // Drops attribute sets no longer referenced by any route.
    pub(crate) fn gc(&mut self) {
        self.tree.retain(|_, attr_set| Arc::strong_count(attr_set) > 1);
    }
}

impl<T> Default for AttrSets<T> {
    fn default() -> AttrSets<T> {
        AttrSets {
            tree: Default::default(),
            next_index: 0,
        }
    }
}
