//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::Ordering;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::config::PathSelectionMode;
use crate::packet::consts::WellKnownCommunities;
use crate::rib::{BestPath, DFLT_LOCAL_PREF, Destination, Route};

// Instance-wide inputs of the decision process.
#[derive(Clone, Copy, Debug)]
pub struct SelectionCxt {
    pub asn: u32,
    pub identifier: Ipv4Addr,
    pub cluster_id: Ipv4Addr,
    pub always_compare_med: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RouteIneligibleReason {
    ClusterLoop,
    AsLoop,
    Originator,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RouteRejectReason {
    LlgrStale,
    LocalPrefLower,
    AsPathLonger,
    OriginTypeHigher,
    MedHigher,
    PreferExternal,
    HigherRouterId,
    HigherPeerAddress,
    HigherPathId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteCompare {
    Preferred(RouteRejectReason),
    LessPreferred(RouteRejectReason),
    // Only a route compared against itself.
    Equal,
}

// Folds candidate paths into the most preferred one.
#[derive(Debug)]
pub struct BestPathSelector<'a> {
    cxt: &'a SelectionCxt,
    best: Option<&'a Route>,
}

// ===== impl RouteCompare =====

impl RouteCompare {
    // Ordering where the preferred route sorts first.
    pub fn ordering(&self) -> Ordering {
        match self {
            RouteCompare::Preferred(_) => Ordering::Less,
            RouteCompare::LessPreferred(_) => Ordering::Greater,
            RouteCompare::Equal => Ordering::Equal,
        }
    }
}

// ===== impl BestPathSelector =====

impl<'a> BestPathSelector<'a> {
    pub fn new(cxt: &'a SelectionCxt) -> BestPathSelector<'a> {
        BestPathSelector { cxt, best: None }
    }

    // Considers one more candidate. Ineligible routes are ignored.
    pub fn process_path(&mut self, route: &'a Route) {
        if !route.is_eligible() {
            return;
        }
        match self.best {
            None => self.best = Some(route),
            Some(best) => {
                if let RouteCompare::Preferred(_) =
                    compare(route, best, self.cxt)
                {
                    self.best = Some(route);
                }
            }
        }
    }

    pub fn result(&self) -> Option<&'a Route> {
        self.best
    }
}

// ===== global functions =====

// Checks whether a route can take part in the decision process at all.
pub(crate) fn eligibility(
    route: &Route,
    cxt: &SelectionCxt,
) -> Option<RouteIneligibleReason> {
    let attrs = &route.attrs.value.base;
    if attrs.as_path.contains(cxt.asn) {
        return Some(RouteIneligibleReason::AsLoop);
    }
    if attrs
        .cluster_list
        .as_ref()
        .is_some_and(|list| list.contains(cxt.cluster_id))
    {
        return Some(RouteIneligibleReason::ClusterLoop);
    }
    if attrs.originator_id == Some(cxt.identifier) {
        return Some(RouteIneligibleReason::Originator);
    }
    None
}

// Compares two routes for the same prefix following the BGP decision
// process.
//
// Every step short-circuits on a definite winner. The final steps compare
// the advertising peer address and path identifier, which makes the order
// total across distinct Adj-RIB-In entries.
pub fn compare(a: &Route, b: &Route, cxt: &SelectionCxt) -> RouteCompare {
    let a_attrs = &a.attrs.value;
    let b_attrs = &b.attrs.value;

    // Depreference LLGR_STALE paths.
    let x = a_attrs.has_community(WellKnownCommunities::LlgrStale);
    let y = b_attrs.has_community(WellKnownCommunities::LlgrStale);
    let reason = RouteRejectReason::LlgrStale;
    match x.cmp(&y) {
        Ordering::Less => {
            return RouteCompare::Preferred(reason);
        }
        Ordering::Greater => {
            return RouteCompare::LessPreferred(reason);
        }
        Ordering::Equal => {
            // Move to next tie-breaker.
        }
    }

    // Compare LOCAL_PREFERENCE attributes.
    let x = a_attrs.base.local_pref.unwrap_or(DFLT_LOCAL_PREF);
    let y = b_attrs.base.local_pref.unwrap_or(DFLT_LOCAL_PREF);
    let reason = RouteRejectReason::LocalPrefLower;
    match x.cmp(&y) {
        Ordering::Less => {
            return RouteCompare::LessPreferred(reason);
        }
        Ordering::Greater => {
            return RouteCompare::Preferred(reason);
        }
        Ordering::Equal => {
            // Move to next tie-breaker.
        }
    }

    // Compare AS_PATH lengths.
    let x = a_attrs.base.as_path.path_length();
    let y = b_attrs.base.as_path.path_length();
    let reason = RouteRejectReason::AsPathLonger;
    match x.cmp(&y) {
        Ordering::Less => {
            return RouteCompare::Preferred(reason);
        }
        Ordering::Greater => {
            return RouteCompare::LessPreferred(reason);
        }
        Ordering::Equal => {
            // Move to next tie-breaker.
        }
    }

    // Compare ORIGIN attributes.
    let x = a_attrs.base.origin;
    let y = b_attrs.base.origin;
    let reason = RouteRejectReason::OriginTypeHigher;
    match x.cmp(&y) {
        Ordering::Less => {
            return RouteCompare::Preferred(reason);
        }
        Ordering::Greater => {
            return RouteCompare::LessPreferred(reason);
        }
        Ordering::Equal => {
            // Move to next tie-breaker.
        }
    }

    // Compare MULTI_EXIT_DISC attributes.
    let a_nbr_as = a_attrs.base.as_path.first();
    let b_nbr_as = b_attrs.base.as_path.first();
    if cxt.always_compare_med || a_nbr_as == b_nbr_as {
        let x = a_attrs.base.med.unwrap_or(0);
        let y = b_attrs.base.med.unwrap_or(0);
        let reason = RouteRejectReason::MedHigher;
        match x.cmp(&y) {
            Ordering::Less => {
                return RouteCompare::Preferred(reason);
            }
            Ordering::Greater => {
                return RouteCompare::LessPreferred(reason);
            }
            Ordering::Equal => {
                // Move to next tie-breaker.
            }
        }
    }

    // Prefer eBGP routes.
    let x = a.route_type;
    let y = b.route_type;
    let reason = RouteRejectReason::PreferExternal;
    match x.cmp(&y) {
        Ordering::Less => {
            return RouteCompare::LessPreferred(reason);
        }
        Ordering::Greater => {
            return RouteCompare::Preferred(reason);
        }
        Ordering::Equal => {
            // Move to next tie-breaker.
        }
    }

    // Compare BGP identifiers.
    let x = a.router_id();
    let y = b.router_id();
    let reason = RouteRejectReason::HigherRouterId;
    match x.cmp(&y) {
        Ordering::Less => {
            return RouteCompare::Preferred(reason);
        }
        Ordering::Greater => {
            return RouteCompare::LessPreferred(reason);
        }
        Ordering::Equal => {
            // Move to next tie-breaker.
        }
    }

    // Compare peer IP addresses.
    let x = a.origin.remote_addr;
    let y = b.origin.remote_addr;
    let reason = RouteRejectReason::HigherPeerAddress;
    match x.cmp(&y) {
        Ordering::Less => {
            return RouteCompare::Preferred(reason);
        }
        Ordering::Greater => {
            return RouteCompare::LessPreferred(reason);
        }
        Ordering::Equal => {
            // Move to next tie-breaker.
        }
    }

    // Compare the path identifiers assigned by the peer.
    let x = a.remote_path_id;
    let y = b.remote_path_id;
    let reason = RouteRejectReason::HigherPathId;
    match x.cmp(&y) {
        Ordering::Less => RouteCompare::Preferred(reason),
        Ordering::Greater => RouteCompare::LessPreferred(reason),
        Ordering::Equal => RouteCompare::Equal,
    }
}

// Runs the decision process for one destination, returning the selected
// path(s) in order of preference.
pub(crate) fn select(
    dest: &mut Destination,
    cxt: &SelectionCxt,
    mode: PathSelectionMode,
) -> Vec<BestPath> {
    for route in dest.routes.iter_mut() {
        route.ineligible_reason = eligibility(route, cxt);
    }

    match mode {
        PathSelectionMode::Best => {
            let mut selector = BestPathSelector::new(cxt);
            for route in &dest.routes {
                selector.process_path(route);
            }
            selector.result().map(BestPath::from).into_iter().collect()
        }
        PathSelectionMode::AllPaths => {
            let mut selector = BestPathSelector::new(cxt);
            for route in &dest.routes {
                selector.process_path(route);
            }
            let Some(best) = selector.result() else {
                return vec![];
            };
            let local_pref = best.attrs.value.base.local_pref;
            let mut paths = dest
                .routes
                .iter()
                .filter(|route| route.is_eligible())
                .filter(|route| {
                    route.attrs.value.base.local_pref.unwrap_or(DFLT_LOCAL_PREF)
                        == local_pref.unwrap_or(DFLT_LOCAL_PREF)
                })
                .collect::<Vec<_>>();
            paths.sort_by(|a, b| compare(a, b, cxt).ordering());
            paths.into_iter().map(BestPath::from).collect()
        }
        PathSelectionMode::BestN(n) => {
            let mut paths = dest
                .routes
                .iter()
                .filter(|route| route.is_eligible())
                .collect::<Vec<_>>();
            paths.sort_by(|a, b| compare(a, b, cxt).ordering());
            paths
                .into_iter()
                .take(n.max(1) as usize)
                .map(BestPath::from)
                .collect()
        }
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::net::IpAddr;

    use const_addrs::{ip, ip4};
    use itertools::Itertools;
    use maplit::btreeset;
    use rbgp_utils::bgp::{Comm, RouteType};

    use super::*;
    use crate::config::PeerRole;
    use crate::packet::attribute::{
        AsPath, AsPathSegment, Attrs, BaseAttrs, ClusterList, CommList,
    };
    use crate::packet::consts::{AsPathSegmentType, Origin};
    use crate::rib::offset::OffsetTables;
    use crate::rib::{AttrSets, RouteOrigin};

    const CXT: SelectionCxt = SelectionCxt {
        asn: 65000,
        identifier: ip4!("10.0.0.1"),
        cluster_id: ip4!("10.0.0.1"),
        always_compare_med: false,
    };

    fn attrs(local_pref: u32, as_path: &[u32]) -> Attrs {
        let mut path = AsPath::default();
        if !as_path.is_empty() {
            path.segments.push_back(AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: as_path.iter().copied().collect(),
            });
        }
        Attrs {
            base: BaseAttrs {
                origin: Origin::Igp,
                as_path: path,
                as4_path: None,
                nexthop: Some(ip!("192.0.2.1")),
                ll_nexthop: None,
                med: None,
                local_pref: Some(local_pref),
                aggregator: None,
                as4_aggregator: None,
                atomic_aggregate: false,
                originator_id: None,
                cluster_list: None,
            },
            comm: None,
            unknown: vec![],
        }
    }

    fn route(
        attr_sets: &mut AttrSets<Attrs>,
        peer: IpAddr,
        identifier: Ipv4Addr,
        route_type: RouteType,
        attrs: Attrs,
    ) -> Route {
        Route::new(
            RouteOrigin {
                identifier,
                remote_addr: peer,
            },
            attr_sets.get(&attrs),
            route_type,
            match route_type {
                RouteType::Internal => PeerRole::Ibgp,
                RouteType::External => PeerRole::Ebgp,
            },
            None,
        )
    }

    fn winner(routes: &[Route]) -> IpAddr {
        let mut selector = BestPathSelector::new(&CXT);
        for route in routes {
            selector.process_path(route);
        }
        selector.result().unwrap().origin.remote_addr
    }

    #[test]
    fn higher_local_pref_wins() {
        let mut sets = AttrSets::default();
        let a = route(
            &mut sets,
            ip!("10.0.0.2"),
            ip4!("2.2.2.2"),
            RouteType::Internal,
            attrs(100, &[]),
        );
        let b = route(
            &mut sets,
            ip!("10.0.0.3"),
            ip4!("3.3.3.3"),
            RouteType::Internal,
            attrs(200, &[65001, 65002]),
        );
        assert_eq!(
            compare(&b, &a, &CXT),
            RouteCompare::Preferred(RouteRejectReason::LocalPrefLower)
        );
        assert_eq!(winner(&[a, b]), ip!("10.0.0.3"));
    }

    #[test]
    fn as_set_counts_once() {
        let mut sets = AttrSets::default();
        let mut with_set = attrs(100, &[65001]);
        with_set.base.as_path.segments.push_back(AsPathSegment {
            seg_type: AsPathSegmentType::Set,
            members: VecDeque::from([65010, 65011, 65012]),
        });
        let a = route(
            &mut sets,
            ip!("10.0.0.2"),
            ip4!("2.2.2.2"),
            RouteType::External,
            with_set,
        );
        let b = route(
            &mut sets,
            ip!("10.0.0.3"),
            ip4!("3.3.3.3"),
            RouteType::External,
            attrs(100, &[65003, 65004, 65005]),
        );
        assert_eq!(
            compare(&a, &b, &CXT),
            RouteCompare::Preferred(RouteRejectReason::AsPathLonger)
        );
    }

    #[test]
    fn med_requires_same_neighbor_as() {
        let mut sets = AttrSets::default();
        let mut x = attrs(100, &[65001]);
        x.base.med = Some(50);
        let mut y = attrs(100, &[65002]);
        y.base.med = Some(10);
        let a = route(
            &mut sets,
            ip!("10.0.0.2"),
            ip4!("2.2.2.2"),
            RouteType::External,
            x.clone(),
        );
        let b = route(
            &mut sets,
            ip!("10.0.0.3"),
            ip4!("3.3.3.3"),
            RouteType::External,
            y,
        );

        // Different neighbor AS: MED is skipped, router-id decides.
        assert_eq!(
            compare(&a, &b, &CXT),
            RouteCompare::Preferred(RouteRejectReason::HigherRouterId)
        );

        // Unless MED is always compared.
        let cxt = SelectionCxt {
            always_compare_med: true,
            ..CXT
        };
        assert_eq!(
            compare(&a, &b, &cxt),
            RouteCompare::LessPreferred(RouteRejectReason::MedHigher)
        );

        // Same neighbor AS: MED decides.
        let mut z = attrs(100, &[65001]);
        z.base.med = Some(10);
        let c = route(
            &mut sets,
            ip!("10.0.0.4"),
            ip4!("4.4.4.4"),
            RouteType::External,
            z,
        );
        assert_eq!(
            compare(&a, &c, &CXT),
            RouteCompare::LessPreferred(RouteRejectReason::MedHigher)
        );
    }

    #[test]
    fn ebgp_preferred_over_ibgp() {
        let mut sets = AttrSets::default();
        let a = route(
            &mut sets,
            ip!("10.0.0.2"),
            ip4!("2.2.2.2"),
            RouteType::Internal,
            attrs(100, &[65001]),
        );
        let b = route(
            &mut sets,
            ip!("10.0.0.3"),
            ip4!("3.3.3.3"),
            RouteType::External,
            attrs(100, &[65001]),
        );
        assert_eq!(
            compare(&a, &b, &CXT),
            RouteCompare::LessPreferred(RouteRejectReason::PreferExternal)
        );
    }

    #[test]
    fn llgr_stale_is_depreferenced() {
        let mut sets = AttrSets::default();
        let mut stale = attrs(300, &[]);
        stale.comm = Some(CommList(btreeset![Comm(0xFFFF0006)]));
        let a = route(
            &mut sets,
            ip!("10.0.0.2"),
            ip4!("2.2.2.2"),
            RouteType::Internal,
            stale,
        );
        let b = route(
            &mut sets,
            ip!("10.0.0.3"),
            ip4!("3.3.3.3"),
            RouteType::Internal,
            attrs(50, &[]),
        );
        assert_eq!(winner(&[a, b]), ip!("10.0.0.3"));
    }

    #[test]
    fn loops_are_ineligible() {
        let mut sets = AttrSets::default();
        let a = route(
            &mut sets,
            ip!("10.0.0.2"),
            ip4!("2.2.2.2"),
            RouteType::External,
            attrs(100, &[65001, 65000]),
        );
        assert_eq!(eligibility(&a, &CXT), Some(RouteIneligibleReason::AsLoop));

        let mut reflected = attrs(100, &[]);
        reflected.base.cluster_list =
            Some(ClusterList(VecDeque::from([ip4!("10.0.0.1")])));
        let b = route(
            &mut sets,
            ip!("10.0.0.3"),
            ip4!("3.3.3.3"),
            RouteType::Internal,
            reflected,
        );
        assert_eq!(
            eligibility(&b, &CXT),
            Some(RouteIneligibleReason::ClusterLoop)
        );

        let mut own = attrs(100, &[]);
        own.base.originator_id = Some(ip4!("10.0.0.1"));
        let c = route(
            &mut sets,
            ip!("10.0.0.4"),
            ip4!("4.4.4.4"),
            RouteType::Internal,
            own,
        );
        assert_eq!(
            eligibility(&c, &CXT),
            Some(RouteIneligibleReason::Originator)
        );
    }

    #[test]
    fn selection_ignores_processing_order() {
        let mut sets = AttrSets::default();
        let mut routes = vec![];
        for (i, (local_pref, path, med)) in [
            (100, vec![65001], Some(5)),
            (100, vec![65001], Some(3)),
            (100, vec![65002], None),
            (100, vec![65002, 65003], None),
            (90, vec![], None),
        ]
        .into_iter()
        .enumerate()
        {
            let mut attrs = attrs(local_pref, &path);
            attrs.base.med = med;
            let octet = 2 + i as u8;
            routes.push(route(
                &mut sets,
                IpAddr::from([10, 0, 0, octet]),
                Ipv4Addr::from([octet; 4]),
                RouteType::External,
                attrs,
            ));
        }

        let expected = winner(&routes);
        for permutation in routes.iter().cloned().permutations(routes.len()) {
            assert_eq!(winner(&permutation), expected);
        }
    }

    #[test]
    fn multipath_modes() {
        let mut sets = AttrSets::default();
        let mut offsets = OffsetTables::default();
        let mut dest = Destination::default();
        for (octet, local_pref) in [(2, 100), (3, 200), (4, 200), (5, 50)] {
            dest.insert(
                &mut offsets,
                route(
                    &mut sets,
                    IpAddr::from([10, 0, 0, octet]),
                    Ipv4Addr::from([octet; 4]),
                    RouteType::Internal,
                    attrs(local_pref, &[]),
                ),
            );
        }
        let peers = |paths: Vec<BestPath>| {
            paths
                .into_iter()
                .map(|path| path.origin.remote_addr)
                .collect::<Vec<_>>()
        };

        let best = select(&mut dest, &CXT, PathSelectionMode::Best);
        assert_eq!(peers(best), vec![ip!("10.0.0.3")]);

        let all = select(&mut dest, &CXT, PathSelectionMode::AllPaths);
        assert_eq!(peers(all), vec![ip!("10.0.0.3"), ip!("10.0.0.4")]);

        let top = select(&mut dest, &CXT, PathSelectionMode::BestN(3));
        assert_eq!(
            peers(top),
            vec![ip!("10.0.0.3"), ip!("10.0.0.4"), ip!("10.0.0.2")]
        );
    }
}
