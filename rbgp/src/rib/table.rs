//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use rbgp_utils::bgp::{AfiSafi, RouteType};
use rbgp_utils::task::Task;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{Instrument, debug_span};

use crate::af::{AddressFamily, Nlri};
use crate::config::{PathSelectionMode, PeerRole, SimpleRoutingPolicy};
use crate::debug::Debug;
use crate::error::Error;
use crate::neighbor::PeerType;
use crate::packet::attribute::Attrs;
use crate::packet::message::Message;
use crate::rib::export::{self, ExportCxt, UpdateQueue};
use crate::rib::offset::OffsetTables;
use crate::rib::selection::{self, SelectionCxt};
use crate::rib::{
    AttrSets, BestPath, DFLT_LOCAL_PREF, Destination, Route, RouteOrigin,
    RouteSource,
};
use crate::tasks::messages::output::NbrTxMsg;

// Handle to the task owning one routing table.
//
// All Adj-RIB-In mutations and decision process runs for the table are
// serialized through this handle. The task stops once every clone of the
// handle is dropped.
#[derive(Debug)]
pub struct TableHandle<A: AddressFamily> {
    tx: UnboundedSender<TableMsg<A>>,
    _task: Arc<Task<()>>,
}

#[derive(Debug)]
pub enum TableMsg<A: AddressFamily> {
    // Session established with a peer that negotiated this table.
    PeerUp {
        info: PeerInfo,
        tx: UnboundedSender<NbrTxMsg>,
    },
    // Session lost. With `retain_stale`, the peer's routes are kept as stale.
    PeerDown {
        addr: IpAddr,
        retain_stale: bool,
    },
    // Routes received from a peer, in receipt order.
    Update {
        addr: IpAddr,
        reach: Option<(Attrs, Vec<Nlri<A::Prefix>>)>,
        unreach: Vec<Nlri<A::Prefix>>,
    },
    // Removes the peer's routes still marked as stale.
    PurgeStale {
        addr: IpAddr,
    },
    // Re-sends the full Adj-RIB-Out toward the peer.
    RouteRefresh {
        addr: IpAddr,
    },
    Query {
        tx: oneshot::Sender<TableSnapshot<A::Prefix>>,
    },
}

// Table-facing view of an established peer.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub addr: IpAddr,
    pub identifier: Ipv4Addr,
    pub local_addr: IpAddr,
    pub peer_as: u32,
    pub role: PeerRole,
    pub policy: SimpleRoutingPolicy,
    // ADD-PATH send negotiated for this table.
    pub add_path_tx: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct TableCxt {
    pub asn: u32,
    pub identifier: Ipv4Addr,
    pub cluster_id: Ipv4Addr,
    pub always_compare_med: bool,
    pub mode: PathSelectionMode,
}

// Point-in-time copy of a table's Loc-RIB.
#[derive(Clone, Debug, Serialize)]
pub struct TableSnapshot<P> {
    pub afi_safi: AfiSafi,
    pub loc_rib: BTreeMap<P, Vec<PathInfo>>,
    pub adj_rib_in: BTreeMap<IpAddr, usize>,
    pub adj_rib_out: BTreeMap<IpAddr, usize>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PathInfo {
    pub peer_addr: IpAddr,
    pub router_id: Ipv4Addr,
    pub path_id: u32,
    pub local_pref: u32,
    pub stale: bool,
    pub attrs: Attrs,
}

#[derive(Debug)]
pub struct Table<A: AddressFamily> {
    cxt: TableCxt,
    attr_sets: AttrSets<Attrs>,
    offsets: OffsetTables<RouteSource>,
    prefixes: BTreeMap<A::Prefix, Destination>,
    peers: BTreeMap<IpAddr, TablePeer<A>>,
}

#[derive(Debug)]
struct TablePeer<A: AddressFamily> {
    info: PeerInfo,
    tx: UnboundedSender<NbrTxMsg>,
    // What was last advertised to the peer, per prefix and path identifier.
    adj_rib_out: BTreeMap<A::Prefix, BTreeMap<Option<u32>, Attrs>>,
}

// ===== impl TableHandle =====

impl<A> TableHandle<A>
where
    A: AddressFamily,
{
    pub(crate) fn spawn(cxt: TableCxt) -> TableHandle<A> {
        let (tx, rx) = mpsc::unbounded_channel();
        let span = debug_span!("table", afi_safi = %A::AFI_SAFI);
        let task = Task::spawn(
            async move {
                Table::<A>::new(cxt).run(rx).await;
            }
            .instrument(span),
        );
        TableHandle {
            tx,
            _task: Arc::new(task),
        }
    }

    pub(crate) fn send(&self, msg: TableMsg<A>) -> Result<(), Error> {
        self.tx
            .send(msg)
            .map_err(|_| Error::TableClosed(A::AFI_SAFI))
    }

    // Returns a copy of the table contents.
    pub async fn query(&self) -> Option<TableSnapshot<A::Prefix>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(TableMsg::Query { tx }).ok()?;
        rx.await.ok()
    }
}

impl<A> Clone for TableHandle<A>
where
    A: AddressFamily,
{
    fn clone(&self) -> TableHandle<A> {
        TableHandle {
            tx: self.tx.clone(),
            _task: Arc::clone(&self._task),
        }
    }
}

// ===== impl PeerInfo =====

impl PeerInfo {
    pub(crate) fn peer_type(&self) -> PeerType {
        match self.role {
            PeerRole::Ebgp => PeerType::External,
            PeerRole::Ibgp | PeerRole::RrClient => PeerType::Internal,
        }
    }

    fn route_type(&self) -> RouteType {
        match self.peer_type() {
            PeerType::Internal => RouteType::Internal,
            PeerType::External => RouteType::External,
        }
    }
}

// ===== impl TableCxt =====

impl TableCxt {
    fn selection(&self) -> SelectionCxt {
        SelectionCxt {
            asn: self.asn,
            identifier: self.identifier,
            cluster_id: self.cluster_id,
            always_compare_med: self.always_compare_med,
        }
    }

    fn export(&self) -> ExportCxt {
        ExportCxt {
            asn: self.asn,
            identifier: self.identifier,
            cluster_id: self.cluster_id,
        }
    }
}

// ===== impl Table =====

impl<A> Table<A>
where
    A: AddressFamily,
{
    pub(crate) fn new(cxt: TableCxt) -> Table<A> {
        Table {
            cxt,
            attr_sets: Default::default(),
            offsets: Default::default(),
            prefixes: Default::default(),
            peers: Default::default(),
        }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<TableMsg<A>>) {
        Debug::TableStart(A::AFI_SAFI).log();
        while let Some(msg) = rx.recv().await {
            self.process(msg);
        }
        Debug::TableStop(A::AFI_SAFI).log();
    }

    pub(crate) fn process(&mut self, msg: TableMsg<A>) {
        match msg {
            TableMsg::PeerUp { info, tx } => self.peer_up(info, tx),
            TableMsg::PeerDown { addr, retain_stale } => {
                self.peer_down(addr, retain_stale)
            }
            TableMsg::Update {
                addr,
                reach,
                unreach,
            } => self.update(addr, reach, unreach),
            TableMsg::PurgeStale { addr } => self.purge_stale(addr),
            TableMsg::RouteRefresh { addr } => self.route_refresh(addr),
            TableMsg::Query { tx } => {
                let _ = tx.send(self.snapshot());
            }
        }
    }

    fn peer_up(&mut self, info: PeerInfo, tx: UnboundedSender<NbrTxMsg>) {
        Debug::TablePeerUp(A::AFI_SAFI, &info.addr).log();

        let addr = info.addr;
        let mut peer = TablePeer {
            info,
            tx,
            adj_rib_out: Default::default(),
        };

        // Initial table dump, followed by End-of-RIB.
        let export_cxt = self.cxt.export();
        let mut queue = UpdateQueue::default();
        for (prefix, dest) in &self.prefixes {
            export_prefix(&mut peer, *prefix, &dest.best, &export_cxt, &mut queue);
        }
        let mut msg_list = A::build_updates(&mut queue);
        msg_list.push(A::end_of_rib());
        peer.send(msg_list);

        self.peers.insert(addr, peer);
    }

    fn peer_down(&mut self, addr: IpAddr, retain_stale: bool) {
        Debug::TablePeerDown(A::AFI_SAFI, &addr, retain_stale).log();

        self.peers.remove(&addr);

        let mut changed = BTreeSet::new();
        for (prefix, dest) in self.prefixes.iter_mut() {
            if retain_stale {
                for route in dest
                    .routes
                    .iter_mut()
                    .filter(|route| route.origin.remote_addr == addr)
                {
                    route.stale = true;
                    changed.insert(*prefix);
                }
            } else if dest.remove_matching(&mut self.offsets, |route| {
                route.origin.remote_addr == addr
            }) > 0
            {
                changed.insert(*prefix);
            }
        }
        self.decision(changed);
        self.gc();
    }

    fn update(
        &mut self,
        addr: IpAddr,
        reach: Option<(Attrs, Vec<Nlri<A::Prefix>>)>,
        unreach: Vec<Nlri<A::Prefix>>,
    ) {
        let Some(peer) = self.peers.get(&addr) else {
            return;
        };
        if peer.info.policy == SimpleRoutingPolicy::LearnNone {
            return;
        }
        let origin = RouteOrigin {
            identifier: peer.info.identifier,
            remote_addr: addr,
        };
        let route_type = peer.info.route_type();
        let role = peer.info.role;

        let mut changed = BTreeSet::new();
        let mut released = false;

        // Withdrawing an unknown route is a no-op.
        for nlri in unreach {
            let source = RouteSource {
                remote_addr: addr,
                remote_path_id: nlri.path_id,
            };
            if let Some(dest) = self.prefixes.get_mut(&nlri.prefix)
                && dest.remove(&mut self.offsets, &source).is_some()
            {
                changed.insert(nlri.prefix);
                released = true;
            }
        }

        if let Some((attrs, nlris)) = reach {
            let attrs = self.attr_sets.get(&attrs);
            for nlri in nlris {
                let route = Route::new(
                    origin,
                    Arc::clone(&attrs),
                    route_type,
                    role,
                    nlri.path_id,
                );
                released |= self
                    .prefixes
                    .entry(nlri.prefix)
                    .or_default()
                    .insert(&mut self.offsets, route)
                    .is_some();
                changed.insert(nlri.prefix);
            }
        }

        self.decision(changed);

        // Withdrawn and replaced routes may have been the last users of
        // their attribute set or layout.
        if released {
            self.gc();
        }
    }

    fn purge_stale(&mut self, addr: IpAddr) {
        let mut changed = BTreeSet::new();
        for (prefix, dest) in self.prefixes.iter_mut() {
            if dest.remove_matching(&mut self.offsets, |route| {
                route.stale && route.origin.remote_addr == addr
            }) > 0
            {
                changed.insert(*prefix);
            }
        }
        Debug::TableStalePurge(A::AFI_SAFI, &addr, changed.len()).log();
        self.decision(changed);
        self.gc();
    }

    fn route_refresh(&mut self, addr: IpAddr) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };
        peer.adj_rib_out.clear();

        let export_cxt = self.cxt.export();
        let mut queue = UpdateQueue::default();
        for (prefix, dest) in &self.prefixes {
            export_prefix(peer, *prefix, &dest.best, &export_cxt, &mut queue);
        }
        let mut msg_list = A::build_updates(&mut queue);
        msg_list.push(A::end_of_rib());
        peer.send(msg_list);
    }

    // Runs the decision process for the given prefixes and propagates the
    // resulting Loc-RIB changes to every peer.
    fn decision(&mut self, prefixes: BTreeSet<A::Prefix>) {
        let selection_cxt = self.cxt.selection();
        let export_cxt = self.cxt.export();
        let mut queues = BTreeMap::<IpAddr, UpdateQueue<A>>::new();

        for prefix in prefixes {
            let Some(dest) = self.prefixes.get_mut(&prefix) else {
                continue;
            };
            let best = selection::select(dest, &selection_cxt, self.cxt.mode);
            let changed = best != dest.best;
            dest.best = best;
            if dest.is_empty() {
                self.prefixes.remove(&prefix);
            }
            if !changed {
                continue;
            }

            let best = self
                .prefixes
                .get(&prefix)
                .map(|dest| dest.best.as_slice())
                .unwrap_or_default();
            match best.first() {
                Some(path) => {
                    Debug::BestPathFound(prefix.into(), path).log();
                }
                None => Debug::BestPathNotFound(prefix.into()).log(),
            }

            for peer in self.peers.values_mut() {
                let queue = queues.entry(peer.info.addr).or_default();
                export_prefix(peer, prefix, best, &export_cxt, queue);
            }
        }

        // Flush pending updates.
        for (addr, mut queue) in queues {
            if queue.is_empty() {
                continue;
            }
            if let Some(peer) = self.peers.get(&addr) {
                peer.send(A::build_updates(&mut queue));
            }
        }
    }

    fn gc(&mut self) {
        self.attr_sets.gc();
        self.offsets.gc();
    }

    pub(crate) fn snapshot(&self) -> TableSnapshot<A::Prefix> {
        let loc_rib = self
            .prefixes
            .iter()
            .filter(|(_, dest)| !dest.best.is_empty())
            .map(|(prefix, dest)| {
                let paths = dest
                    .best
                    .iter()
                    .map(|path| PathInfo {
                        peer_addr: path.origin.remote_addr,
                        router_id: path
                            .attrs
                            .value
                            .base
                            .originator_id
                            .unwrap_or(path.origin.identifier),
                        path_id: path.path_id,
                        local_pref: path
                            .attrs
                            .value
                            .base
                            .local_pref
                            .unwrap_or(DFLT_LOCAL_PREF),
                        stale: path.stale,
                        attrs: path.attrs.value.clone(),
                    })
                    .collect();
                (*prefix, paths)
            })
            .collect();

        let mut adj_rib_in = BTreeMap::<IpAddr, usize>::new();
        for route in self.prefixes.values().flat_map(|dest| dest.routes.iter()) {
            *adj_rib_in.entry(route.origin.remote_addr).or_default() += 1;
        }
        let adj_rib_out = self
            .peers
            .iter()
            .map(|(addr, peer)| {
                (*addr, peer.adj_rib_out.values().map(BTreeMap::len).sum::<usize>())
            })
            .collect();

        TableSnapshot {
            afi_safi: A::AFI_SAFI,
            loc_rib,
            adj_rib_in,
            adj_rib_out,
        }
    }
}

// ===== impl TablePeer =====

impl<A> TablePeer<A>
where
    A: AddressFamily,
{
    fn send(&self, msg_list: Vec<Message>) {
        if msg_list.is_empty() {
            return;
        }
        let msg = NbrTxMsg::SendMessageList {
            nbr_addr: self.info.addr,
            msg_list,
        };
        let _ = self.tx.send(msg);
    }
}

// ===== helper functions =====

// Computes the delta between the selected paths and what was last sent to
// the peer for one prefix, queueing the resulting changes.
fn export_prefix<A>(
    peer: &mut TablePeer<A>,
    prefix: A::Prefix,
    best: &[BestPath],
    cxt: &ExportCxt,
    queue: &mut UpdateQueue<A>,
) where
    A: AddressFamily,
{
    let paths: BTreeMap<Option<u32>, Attrs> = if peer.info.add_path_tx {
        best.iter()
            .filter_map(|path| {
                export::export_attrs::<A>(path, &peer.info, cxt)
                    .map(|attrs| (Some(path.path_id), attrs))
            })
            .collect()
    } else {
        best.first()
            .and_then(|path| export::export_attrs::<A>(path, &peer.info, cxt))
            .map(|attrs| (None, attrs))
            .into_iter()
            .collect()
    };

    let old = peer.adj_rib_out.remove(&prefix).unwrap_or_default();
    for (path_id, attrs) in &paths {
        if old.get(path_id) != Some(attrs) {
            let nlri = Nlri {
                prefix,
                path_id: *path_id,
            };
            queue.reach(nlri, attrs.clone());
        }
    }
    for path_id in old.keys().filter(|path_id| !paths.contains_key(path_id)) {
        let nlri = Nlri {
            prefix,
            path_id: *path_id,
        };
        queue.unreach(nlri);
    }
    if !paths.is_empty() {
        peer.adj_rib_out.insert(prefix, paths);
    }
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use const_addrs::{ip, ip4};
    use ipnetwork::Ipv4Network;

    use super::*;
    use crate::af::Ipv4Unicast;
    use crate::packet::attribute::{AsPath, BaseAttrs};
    use crate::packet::consts::Origin;

    const LOCAL_AS: u32 = 65000;

    fn cxt(mode: PathSelectionMode) -> TableCxt {
        TableCxt {
            asn: LOCAL_AS,
            identifier: ip4!("1.1.1.100"),
            cluster_id: ip4!("1.1.1.100"),
            always_compare_med: false,
            mode,
        }
    }

    fn prefix() -> Ipv4Network {
        "1.1.1.1/32".parse().unwrap()
    }

    fn attrs(local_pref: u32, nexthop: IpAddr) -> Attrs {
        Attrs {
            base: BaseAttrs {
                origin: Origin::Igp,
                as_path: AsPath::default(),
                as4_path: None,
                nexthop: Some(nexthop),
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

    fn peer_up(
        table: &mut Table<Ipv4Unicast>,
        addr: IpAddr,
        identifier: Ipv4Addr,
        role: PeerRole,
        add_path_tx: bool,
    ) -> UnboundedReceiver<NbrTxMsg> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let info = PeerInfo {
            addr,
            identifier,
            local_addr: ip!("10.0.0.100"),
            peer_as: LOCAL_AS,
            role,
            policy: SimpleRoutingPolicy::Default,
            add_path_tx,
        };
        table.process(TableMsg::PeerUp { info, tx });

        // Discard the initial End-of-RIB.
        assert!(!updates(&mut rx).is_empty());
        rx
    }

    fn announce(
        table: &mut Table<Ipv4Unicast>,
        addr: IpAddr,
        local_pref: u32,
    ) {
        table.process(TableMsg::Update {
            addr,
            reach: Some((
                attrs(local_pref, addr),
                vec![Nlri {
                    prefix: prefix(),
                    path_id: None,
                }],
            )),
            unreach: vec![],
        });
    }

    fn withdraw(table: &mut Table<Ipv4Unicast>, addr: IpAddr) {
        table.process(TableMsg::Update {
            addr,
            reach: None,
            unreach: vec![Nlri {
                prefix: prefix(),
                path_id: None,
            }],
        });
    }

    fn updates(rx: &mut UnboundedReceiver<NbrTxMsg>) -> Vec<Message> {
        let mut msgs = vec![];
        while let Ok(msg) = rx.try_recv() {
            if let NbrTxMsg::SendMessageList { msg_list, .. } = msg {
                msgs.extend(msg_list);
            }
        }
        msgs
    }

    fn winner(table: &Table<Ipv4Unicast>) -> Option<(IpAddr, u32)> {
        table
            .snapshot()
            .loc_rib
            .get(&prefix())
            .and_then(|paths| paths.first())
            .map(|path| (path.peer_addr, path.local_pref))
    }

    #[test]
    fn local_pref_tie_break() {
        let mut table = Table::<Ipv4Unicast>::new(cxt(PathSelectionMode::Best));
        let p2 = ip!("10.0.0.2");
        let p3 = ip!("10.0.0.3");
        let p4 = ip!("10.0.0.4");
        for (addr, id) in [
            (p2, ip4!("2.2.2.2")),
            (p3, ip4!("3.3.3.3")),
            (p4, ip4!("4.4.4.4")),
        ] {
            peer_up(&mut table, addr, id, PeerRole::Ibgp, false);
        }

        announce(&mut table, p2, 100);
        announce(&mut table, p3, 200);
        announce(&mut table, p4, 50);
        assert_eq!(winner(&table), Some((p3, 200)));

        withdraw(&mut table, p3);
        assert_eq!(winner(&table), Some((p2, 100)));

        // Withdrawing twice is harmless.
        withdraw(&mut table, p3);
        assert_eq!(winner(&table), Some((p2, 100)));
        assert_eq!(table.snapshot().adj_rib_in.get(&p3), None);
    }

    #[test]
    fn route_reflector_fan_out() {
        let mut table =
            Table::<Ipv4Unicast>::new(cxt(PathSelectionMode::AllPaths));
        let p2 = ip!("10.0.0.2");
        let p3 = ip!("10.0.0.3");
        let c1 = ip!("10.0.1.1");
        let c2 = ip!("10.0.1.2");
        peer_up(&mut table, p2, ip4!("2.2.2.2"), PeerRole::Ibgp, false);
        peer_up(&mut table, p3, ip4!("3.3.3.3"), PeerRole::Ibgp, false);
        let mut c1_rx =
            peer_up(&mut table, c1, ip4!("5.5.5.5"), PeerRole::RrClient, false);
        let mut c2_rx =
            peer_up(&mut table, c2, ip4!("6.6.6.6"), PeerRole::RrClient, true);

        announce(&mut table, p2, 100);
        announce(&mut table, p3, 100);

        // Both paths are selected.
        let snapshot = table.snapshot();
        assert_eq!(snapshot.loc_rib[&prefix()].len(), 2);

        // Single best path toward the client without ADD-PATH.
        let msgs = updates(&mut c1_rx);
        assert_eq!(msgs.len(), 1);
        let update = msgs[0].as_update().unwrap();
        let reach = update.reach.as_ref().unwrap();
        assert_eq!(reach.prefixes[0].path_id, None);
        let attrs = update.attrs.as_ref().unwrap();
        assert_eq!(attrs.base.originator_id, Some(ip4!("1.1.1.100")));

        // One update per path toward the ADD-PATH client.
        let msgs = updates(&mut c2_rx);
        assert_eq!(msgs.len(), 2);
        let path_ids = msgs
            .iter()
            .filter_map(|msg| msg.as_update())
            .flat_map(|update| update.reach.as_ref().unwrap().prefixes.iter())
            .map(|nlri| nlri.path_id)
            .collect::<BTreeSet<_>>();
        assert_eq!(path_ids.len(), 2);
        assert!(!path_ids.contains(&None));
    }

    #[test]
    fn stale_routes_survive_until_purged() {
        let mut table = Table::<Ipv4Unicast>::new(cxt(PathSelectionMode::Best));
        let p2 = ip!("10.0.0.2");
        let c1 = ip!("10.0.1.1");
        peer_up(&mut table, p2, ip4!("2.2.2.2"), PeerRole::RrClient, false);
        let mut c1_rx =
            peer_up(&mut table, c1, ip4!("5.5.5.5"), PeerRole::RrClient, false);
        announce(&mut table, p2, 100);
        assert_eq!(updates(&mut c1_rx).len(), 1);

        table.process(TableMsg::PeerDown {
            addr: p2,
            retain_stale: true,
        });
        let snapshot = table.snapshot();
        assert!(snapshot.loc_rib[&prefix()][0].stale);
        // Nothing is withdrawn while the peer restarts.
        assert!(updates(&mut c1_rx).is_empty());

        table.process(TableMsg::PurgeStale { addr: p2 });
        assert_eq!(winner(&table), None);
        let msgs = updates(&mut c1_rx);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].as_update().unwrap().unreach.is_some());
    }

    #[test]
    fn refreshed_route_is_no_longer_stale() {
        let mut table = Table::<Ipv4Unicast>::new(cxt(PathSelectionMode::Best));
        let p2 = ip!("10.0.0.2");
        peer_up(&mut table, p2, ip4!("2.2.2.2"), PeerRole::Ibgp, false);
        announce(&mut table, p2, 100);
        table.process(TableMsg::PeerDown {
            addr: p2,
            retain_stale: true,
        });

        peer_up(&mut table, p2, ip4!("2.2.2.2"), PeerRole::Ibgp, false);
        announce(&mut table, p2, 100);
        table.process(TableMsg::PurgeStale { addr: p2 });
        assert_eq!(winner(&table), Some((p2, 100)));
    }

    #[test]
    fn learn_none_ignores_routes() {
        let mut table = Table::<Ipv4Unicast>::new(cxt(PathSelectionMode::Best));
        let p2 = ip!("10.0.0.2");
        let (tx, _rx) = mpsc::unbounded_channel();
        let info = PeerInfo {
            addr: p2,
            identifier: ip4!("2.2.2.2"),
            local_addr: ip!("10.0.0.100"),
            peer_as: LOCAL_AS,
            role: PeerRole::Ibgp,
            policy: SimpleRoutingPolicy::LearnNone,
            add_path_tx: false,
        };
        table.process(TableMsg::PeerUp { info, tx });
        announce(&mut table, p2, 100);
        assert_eq!(winner(&table), None);
    }

    #[test]
    fn route_refresh_resends_adj_rib_out() {
        let mut table = Table::<Ipv4Unicast>::new(cxt(PathSelectionMode::Best));
        let p2 = ip!("10.0.0.2");
        let e1 = ip!("10.0.9.1");
        peer_up(&mut table, p2, ip4!("2.2.2.2"), PeerRole::Ibgp, false);
        let (tx, mut e1_rx) = mpsc::unbounded_channel();
        let info = PeerInfo {
            addr: e1,
            identifier: ip4!("9.9.9.9"),
            local_addr: ip!("10.0.9.100"),
            peer_as: 65009,
            role: PeerRole::Ebgp,
            policy: SimpleRoutingPolicy::Default,
            add_path_tx: false,
        };
        table.process(TableMsg::PeerUp { info, tx });
        updates(&mut e1_rx);

        announce(&mut table, p2, 100);
        let first = updates(&mut e1_rx);
        assert_eq!(first.len(), 1);
        let attrs = first[0].as_update().unwrap().attrs.clone().unwrap();
        assert_eq!(
            attrs.base.as_path.segments[0].members,
            VecDeque::from([LOCAL_AS])
        );
        assert_eq!(attrs.base.nexthop, Some(ip!("10.0.9.100")));

        // The re-sent routes are followed by End-of-RIB.
        table.process(TableMsg::RouteRefresh { addr: e1 });
        let refreshed = updates(&mut e1_rx);
        assert_eq!(refreshed.len(), 2);
        assert_eq!(refreshed[0], first[0]);
        assert_eq!(
            refreshed[1].as_update().and_then(|msg| msg.is_end_of_rib()),
            Some(AfiSafi::Ipv4Unicast)
        );
    }

    #[test]
    fn route_refresh_of_empty_table_sends_end_of_rib() {
        let mut table = Table::<Ipv4Unicast>::new(cxt(PathSelectionMode::Best));
        let p2 = ip!("10.0.0.2");
        let mut rx =
            peer_up(&mut table, p2, ip4!("2.2.2.2"), PeerRole::Ibgp, false);

        table.process(TableMsg::RouteRefresh { addr: p2 });
        let msgs = updates(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(
            msgs[0].as_update().and_then(|msg| msg.is_end_of_rib()),
            Some(AfiSafi::Ipv4Unicast)
        );
    }

    #[test]
    fn churn_releases_interned_state() {
        let mut table = Table::<Ipv4Unicast>::new(cxt(PathSelectionMode::Best));
        let p2 = ip!("10.0.0.2");
        let p3 = ip!("10.0.0.3");
        peer_up(&mut table, p2, ip4!("2.2.2.2"), PeerRole::Ibgp, false);
        peer_up(&mut table, p3, ip4!("3.3.3.3"), PeerRole::Ibgp, false);

        for local_pref in 0..1000 {
            announce(&mut table, p2, local_pref);
            withdraw(&mut table, p2);
        }
        assert!(table.attr_sets.tree.is_empty());
        assert_eq!(table.offsets.len(), 0);
        assert!(table.prefixes.is_empty());

        // Implicit replacement keeps only the attributes in use.
        for local_pref in 0..1000 {
            announce(&mut table, p2, local_pref);
            announce(&mut table, p3, local_pref);
        }
        assert_eq!(table.attr_sets.tree.len(), 2);
        assert_eq!(table.offsets.len(), 1);
        assert_eq!(winner(&table).map(|(_, local_pref)| local_pref), Some(999));
    }
}
