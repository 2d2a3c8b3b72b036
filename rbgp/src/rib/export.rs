//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::Ipv4Addr;

use crate::af::{AddressFamily, Nlri};
use crate::config::{PeerRole, SimpleRoutingPolicy};
use crate::packet::attribute::{Attrs, ClusterList};
use crate::packet::consts::{AttrFlags, WellKnownCommunities};
use crate::rib::table::PeerInfo;
use crate::rib::{BestPath, DFLT_LOCAL_PREF};

// Local identity used when rewriting attributes for transmission.
#[derive(Clone, Copy, Debug)]
pub struct ExportCxt {
    pub asn: u32,
    pub identifier: Ipv4Addr,
    pub cluster_id: Ipv4Addr,
}

// Pending changes toward one peer, grouped by attribute set so that every
// group fits in as few UPDATE messages as possible.
#[derive(Debug)]
pub struct UpdateQueue<A: AddressFamily> {
    pub reach: BTreeMap<Attrs, BTreeSet<Nlri<A::Prefix>>>,
    pub unreach: BTreeSet<Nlri<A::Prefix>>,
}

// ===== impl UpdateQueue =====

impl<A> UpdateQueue<A>
where
    A: AddressFamily,
{
    // Queues an advertisement, superseding any earlier change queued for
    // the same NLRI.
    pub fn reach(&mut self, nlri: Nlri<A::Prefix>, attrs: Attrs) {
        self.unreach.remove(&nlri);
        self.forget_reach(&nlri);
        self.reach.entry(attrs).or_default().insert(nlri);
    }

    // Queues a withdrawal, superseding any earlier change queued for the
    // same NLRI.
    pub fn unreach(&mut self, nlri: Nlri<A::Prefix>) {
        self.forget_reach(&nlri);
        self.unreach.insert(nlri);
    }

    pub fn is_empty(&self) -> bool {
        self.reach.is_empty() && self.unreach.is_empty()
    }

    fn forget_reach(&mut self, nlri: &Nlri<A::Prefix>) {
        self.reach.retain(|_, nlris| {
            nlris.remove(nlri);
            !nlris.is_empty()
        });
    }
}

impl<A> Default for UpdateQueue<A>
where
    A: AddressFamily,
{
    fn default() -> UpdateQueue<A> {
        UpdateQueue {
            reach: Default::default(),
            unreach: Default::default(),
        }
    }
}

// ===== global functions =====

// Computes the attributes a selected path is advertised with toward the
// given peer. Returns `None` when the path must not be sent to that peer.
pub(crate) fn export_attrs<A>(
    path: &BestPath,
    peer: &PeerInfo,
    cxt: &ExportCxt,
) -> Option<Attrs>
where
    A: AddressFamily,
{
    if peer.policy == SimpleRoutingPolicy::AnnounceNone {
        return None;
    }

    // Never send a path back to where it came from.
    if path.origin.remote_addr == peer.addr {
        return None;
    }

    // Well-known communities.
    let attrs = &path.attrs.value;
    if attrs.has_community(WellKnownCommunities::NoAdvertise) {
        return None;
    }
    if peer.role == PeerRole::Ebgp
        && (attrs.has_community(WellKnownCommunities::NoExport)
            || attrs.has_community(WellKnownCommunities::NoExportSubconfed))
    {
        return None;
    }

    let mut attrs = match peer.role {
        PeerRole::Ebgp => to_external(attrs, peer, cxt)?,
        PeerRole::Ibgp | PeerRole::RrClient => match path.role {
            PeerRole::Ebgp => to_internal(attrs),
            // Split horizon: only routes from clients are reflected to
            // non-client peers.
            PeerRole::Ibgp if peer.role == PeerRole::Ibgp => return None,
            PeerRole::Ibgp | PeerRole::RrClient => {
                reflected_attrs(attrs, cxt)?
            }
        },
    };

    // Optional non-transitive attributes are never propagated. Transitive
    // ones pass through marked as partial.
    attrs.unknown.retain(|attr| attr.flags.contains(AttrFlags::TRANSITIVE));
    for attr in attrs.unknown.iter_mut() {
        attr.flags.insert(AttrFlags::PARTIAL);
    }

    A::nexthop_tx_change(peer.local_addr, peer.peer_type(), &mut attrs.base);
    Some(attrs)
}

// Attribute transform toward an eBGP peer.
fn to_external(
    attrs: &Attrs,
    peer: &PeerInfo,
    cxt: &ExportCxt,
) -> Option<Attrs> {
    // The peer would discard the path as an AS loop.
    if attrs.base.as_path.contains(peer.peer_as) {
        return None;
    }

    let mut attrs = attrs.clone();
    attrs.base.as_path.prepend(cxt.asn);
    attrs.base.originator_id = None;
    attrs.base.cluster_list = None;
    attrs.base.local_pref = None;
    attrs.base.med = None;
    Some(attrs)
}

// Attribute transform for an eBGP-learned path sent to an iBGP peer.
fn to_internal(attrs: &Attrs) -> Attrs {
    let mut attrs = attrs.clone();
    attrs.base.originator_id = None;
    attrs.base.cluster_list = None;
    attrs.base.local_pref =
        Some(attrs.base.local_pref.unwrap_or(DFLT_LOCAL_PREF));
    attrs
}

// Attribute transform for an iBGP-learned path being reflected.
fn reflected_attrs(attrs: &Attrs, cxt: &ExportCxt) -> Option<Attrs> {
    // Reflection loop.
    if attrs
        .base
        .cluster_list
        .as_ref()
        .is_some_and(|list| list.contains(cxt.cluster_id))
    {
        return None;
    }

    // First reflection stamps the local router id.
    let mut attrs = attrs.clone();
    attrs.base.originator_id.get_or_insert(cxt.identifier);
    attrs
        .base
        .cluster_list
        .get_or_insert_with(|| ClusterList(VecDeque::new()))
        .prepend(cxt.cluster_id);
    attrs.base.local_pref =
        Some(attrs.base.local_pref.unwrap_or(DFLT_LOCAL_PREF));
    Some(attrs)
}

// ===== unit tests =====
