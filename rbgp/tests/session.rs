//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bytes::BytesMut;
use const_addrs::{ip, ip4, ip6};
use ipnetwork::{Ipv4Network, Ipv6Network};
use maplit::btreemap;
use rbgp::af::Nlri;
use rbgp::config::{InstanceCfg, NeighborAfiSafiCfg, NeighborCfg, PeerRole};
use rbgp::instance::InstanceHandle;
use rbgp::neighbor::{NeighborState, PeerType, fsm};
use rbgp::network::{ConnInfo, Connection};
use rbgp::packet::attribute::{AsPath, AsPathSegment, Attrs, BaseAttrs};
use rbgp::packet::consts::{
    AfiSafiExt, AsPathSegmentType, BGP_VERSION, ErrorCode, GrAfiFlags,
    GrRestartFlags,
};
use rbgp::packet::message::{
    Capability, DecodeCxt, EncodeCxt, GrTuple, KeepaliveMsg, Message,
    MpReachNlri, NegotiatedCapability, OpenMsg, ReachNlri, UpdateMsg,
};
use rbgp_utils::bgp::{AfiSafi, Origin};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const LOCAL_AS: u32 = 65000;
const PEER_AS: u32 = 65001;
const PEER_ADDR: IpAddr = ip!("10.0.0.2");

// Remote end of an in-memory BGP connection.
struct Peer {
    stream: DuplexStream,
    buf: BytesMut,
}

impl Peer {
    async fn send(&mut self, msg: Message) {
        let cxt = EncodeCxt {
            capabilities: [NegotiatedCapability::FourOctetAsNumber].into(),
        };
        self.stream.write_all(&msg.encode(&cxt)).await.unwrap();
    }

    // Returns the next message sent by the speaker, or `None` once the
    // speaker closes the connection.
    async fn recv(&mut self) -> Option<Message> {
        let cxt = DecodeCxt {
            peer_type: PeerType::External,
            peer_as: LOCAL_AS,
            capabilities: [NegotiatedCapability::FourOctetAsNumber].into(),
        };
        loop {
            if let Some(len) = Message::get_message_len(&self.buf) {
                let data = self.buf.split_to(len);
                return Some(Message::decode(&data, &cxt).unwrap());
            }
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return None;
            }
        }
    }

    // Completes the OPEN exchange and waits for the session to come up.
    async fn establish(
        &mut self,
        handle: &InstanceHandle,
        holdtime: u16,
        capabilities: Vec<Capability>,
    ) {
        assert!(matches!(self.recv().await, Some(Message::Open(_))));
        self.send(open(holdtime, capabilities)).await;
        self.send(Message::Keepalive(KeepaliveMsg {})).await;
        assert!(matches!(self.recv().await, Some(Message::Keepalive(_))));
        wait_for(|| async move {
            nbr_state(handle).await.state == fsm::State::Established
        })
        .await;
    }
}

//
// Helper functions.
//

// Initializes tracing subscriber, once per test binary.
fn init_tracing() {
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_target(false)
        .with_ansi(false)
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn instance_cfg() -> InstanceCfg {
    InstanceCfg {
        asn: LOCAL_AS,
        identifier: ip4!("1.1.1.1"),
        ..Default::default()
    }
}

fn open(holdtime: u16, capabilities: Vec<Capability>) -> Message {
    Message::Open(OpenMsg {
        version: BGP_VERSION,
        my_as: PEER_AS as u16,
        holdtime,
        identifier: ip4!("2.2.2.2"),
        capabilities: capabilities.into_iter().collect(),
    })
}

fn attrs() -> Attrs {
    Attrs {
        base: BaseAttrs {
            origin: Origin::Igp,
            as_path: AsPath {
                segments: [AsPathSegment {
                    seg_type: AsPathSegmentType::Sequence,
                    members: [PEER_AS].into(),
                }]
                .into(),
            },
            as4_path: None,
            nexthop: None,
            ll_nexthop: None,
            med: None,
            local_pref: None,
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

fn nlri<P: std::str::FromStr>(prefix: &str) -> Nlri<P>
where
    P::Err: std::fmt::Debug,
{
    Nlri {
        prefix: prefix.parse().unwrap(),
        path_id: None,
    }
}

// Spawns an instance with a single passive eBGP neighbor and hands it one
// end of an in-memory connection.
async fn setup(nbr_cfg: NeighborCfg) -> (InstanceHandle, Peer) {
    init_tracing();
    let handle = InstanceHandle::spawn(instance_cfg());
    handle.peer_add(PEER_ADDR, nbr_cfg).await.unwrap();
    // Round trip through the instance so the neighbor exists before the
    // connection arrives.
    assert!(handle.neighbor_state(PEER_ADDR).await.unwrap().is_some());

    let peer = connect(&handle).await;
    (handle, peer)
}

// Hands the instance one end of a new in-memory connection from the peer.
async fn connect(handle: &InstanceHandle) -> Peer {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let conn_info = ConnInfo {
        local_addr: ip!("10.0.0.1"),
        local_port: 179,
        remote_addr: PEER_ADDR,
        remote_port: 40000,
    };
    handle
        .accept(Connection::new(local, conn_info))
        .await
        .unwrap();

    Peer {
        stream: remote,
        buf: BytesMut::new(),
    }
}

// Waits for the neighbor to accept connections again, then connects.
async fn reconnect(handle: &InstanceHandle) -> Peer {
    wait_for(|| async move {
        nbr_state(handle).await.state == fsm::State::Active
    })
    .await;
    connect(handle).await
}

async fn nbr_state(handle: &InstanceHandle) -> NeighborState {
    handle.neighbor_state(PEER_ADDR).await.unwrap().unwrap()
}

// Stale flag of every IPv4 path in the Loc-RIB.
async fn ipv4_stale(handle: &InstanceHandle) -> Vec<bool> {
    let ipv4 = handle.ipv4_unicast().await.unwrap().unwrap();
    ipv4.loc_rib
        .values()
        .flatten()
        .map(|path| path.stale)
        .collect()
}

fn gr_nbr_cfg() -> NeighborCfg {
    NeighborCfg {
        peer_as: PEER_AS,
        role: PeerRole::Ebgp,
        holdtime: 90,
        passive: true,
        afi_safi: btreemap! {
            AfiSafi::Ipv4Unicast => NeighborAfiSafiCfg {
                graceful_restart: true,
                ..Default::default()
            },
        },
        ..Default::default()
    }
}

fn ipv4_caps() -> Vec<Capability> {
    vec![
        Capability::MultiProtocol {
            afi: AfiSafi::Ipv4Unicast.afi(),
            safi: AfiSafi::Ipv4Unicast.safi(),
        },
        Capability::FourOctetAsNumber { asn: PEER_AS },
    ]
}

fn ipv4_gr_caps(restart_time: u16) -> Vec<Capability> {
    let mut caps = ipv4_caps();
    caps.push(Capability::GracefulRestart {
        flags: GrRestartFlags::empty(),
        restart_time,
        tuples: [GrTuple {
            afi: AfiSafi::Ipv4Unicast.afi(),
            safi: AfiSafi::Ipv4Unicast.safi(),
            flags: GrAfiFlags::FORWARDING_STATE,
        }]
        .into(),
    });
    caps
}

fn ipv4_update(prefixes: &[&str]) -> Message {
    Message::Update(UpdateMsg {
        reach: Some(ReachNlri {
            prefixes: prefixes.iter().map(|prefix| nlri(prefix)).collect(),
            nexthop: Ipv4Addr::new(10, 0, 0, 2),
        }),
        unreach: None,
        mp_reach: None,
        mp_unreach: None,
        attrs: Some(attrs()),
    })
}

fn ipv4_end_of_rib() -> Message {
    Message::Update(UpdateMsg::end_of_rib(AfiSafi::Ipv4Unicast))
}

// Brings up a graceful-restart capable session, learns two IPv4 prefixes
// over it and drops the connection, leaving both routes stale.
async fn gr_session_lost(restart_time: u16) -> InstanceHandle {
    let (handle, mut peer) = setup(gr_nbr_cfg()).await;
    peer.establish(&handle, 90, ipv4_gr_caps(restart_time)).await;
    peer.send(ipv4_update(&["10.1.0.0/16", "10.2.0.0/24"])).await;

    let handle_ref = &handle;
    wait_for(|| async move { ipv4_stale(handle_ref).await == [false, false] })
        .await;

    drop(peer);
    wait_for(|| async move { ipv4_stale(handle_ref).await == [true, true] })
        .await;
    assert!(
        nbr_state(&handle)
            .await
            .stale_tables
            .contains(&AfiSafi::Ipv4Unicast)
    );
    handle
}

async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}

//
// Tests.
//

#[tokio::test(start_paused = true)]
async fn hold_timer_expiry() {
    let nbr_cfg = NeighborCfg {
        peer_as: PEER_AS,
        role: PeerRole::Ebgp,
        holdtime: 3,
        passive: true,
        ..Default::default()
    };
    let (handle, mut peer) = setup(nbr_cfg).await;

    peer.establish(
        &handle,
        3,
        vec![
            Capability::MultiProtocol {
                afi: AfiSafi::Ipv4Unicast.afi(),
                safi: AfiSafi::Ipv4Unicast.safi(),
            },
            Capability::FourOctetAsNumber { asn: PEER_AS },
        ],
    )
    .await;

    // Stay silent and drain the connection until the speaker closes it.
    let mut notifications = vec![];
    while let Some(msg) = peer.recv().await {
        if let Message::Notification(msg) = msg {
            notifications.push(msg);
        }
    }
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].error_code, ErrorCode::HoldTimerExpired as u8);
    assert_eq!(notifications[0].error_subcode, 0);

    let state = nbr_state(&handle).await;
    assert_ne!(state.state, fsm::State::Established);
    let (_, msg) = state.notification_sent.unwrap();
    assert_eq!(msg.error_code, ErrorCode::HoldTimerExpired as u8);
    assert!(state.session_tables.is_empty());
}

#[tokio::test(start_paused = true)]
async fn graceful_restart_retains_routes() {
    let nbr_cfg = NeighborCfg {
        peer_as: PEER_AS,
        role: PeerRole::Ebgp,
        holdtime: 90,
        passive: true,
        afi_safi: btreemap! {
            AfiSafi::Ipv4Unicast => NeighborAfiSafiCfg {
                graceful_restart: true,
                ..Default::default()
            },
            AfiSafi::Ipv6Unicast => NeighborAfiSafiCfg::default(),
        },
        ..Default::default()
    };
    let (handle, mut peer) = setup(nbr_cfg).await;

    peer.establish(
        &handle,
        90,
        vec![
            Capability::MultiProtocol {
                afi: AfiSafi::Ipv4Unicast.afi(),
                safi: AfiSafi::Ipv4Unicast.safi(),
            },
            Capability::MultiProtocol {
                afi: AfiSafi::Ipv6Unicast.afi(),
                safi: AfiSafi::Ipv6Unicast.safi(),
            },
            Capability::FourOctetAsNumber { asn: PEER_AS },
            Capability::GracefulRestart {
                flags: GrRestartFlags::empty(),
                restart_time: 120,
                tuples: [GrTuple {
                    afi: AfiSafi::Ipv4Unicast.afi(),
                    safi: AfiSafi::Ipv4Unicast.safi(),
                    flags: GrAfiFlags::FORWARDING_STATE,
                }]
                .into(),
            },
        ],
    )
    .await;
    let state = nbr_state(&handle).await;
    assert!(state.session_tables.contains(&AfiSafi::Ipv4Unicast));
    assert!(state.session_tables.contains(&AfiSafi::Ipv6Unicast));

    // Advertise two IPv4 prefixes and one IPv6 prefix.
    peer.send(Message::Update(UpdateMsg {
        reach: Some(ReachNlri {
            prefixes: vec![nlri("10.1.0.0/16"), nlri("10.2.0.0/24")],
            nexthop: Ipv4Addr::new(10, 0, 0, 2),
        }),
        unreach: None,
        mp_reach: None,
        mp_unreach: None,
        attrs: Some(attrs()),
    }))
    .await;
    peer.send(Message::Update(UpdateMsg {
        reach: None,
        unreach: None,
        mp_reach: Some(MpReachNlri::Ipv6Unicast {
            prefixes: vec![nlri("2001:db8:1::/48")],
            nexthop: ip6!("2001:db8::2"),
            ll_nexthop: None,
        }),
        mp_unreach: None,
        attrs: Some(attrs()),
    }))
    .await;

    let handle = &handle;
    wait_for(|| async move {
        let ipv4 = handle.ipv4_unicast().await.unwrap().unwrap();
        let ipv6 = handle.ipv6_unicast().await.unwrap().unwrap();
        ipv4.loc_rib.len() == 2 && ipv6.loc_rib.len() == 1
    })
    .await;

    // Transport failure without a NOTIFICATION.
    drop(peer);
    wait_for(|| async move {
        let ipv6 = handle.ipv6_unicast().await.unwrap().unwrap();
        ipv6.loc_rib.is_empty()
    })
    .await;

    // IPv4 routes survive as stale, IPv6 ones are gone.
    let ipv4 = handle.ipv4_unicast().await.unwrap().unwrap();
    assert_eq!(ipv4.loc_rib.len(), 2);
    let prefix: Ipv4Network = "10.1.0.0/16".parse().unwrap();
    let paths = &ipv4.loc_rib[&prefix];
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].peer_addr, PEER_ADDR);
    assert!(ipv4.loc_rib.values().flatten().all(|path| path.stale));

    let ipv6 = handle.ipv6_unicast().await.unwrap().unwrap();
    let prefix: Ipv6Network = "2001:db8:1::/48".parse().unwrap();
    assert!(!ipv6.loc_rib.contains_key(&prefix));

    let state = nbr_state(&handle).await;
    assert_ne!(state.state, fsm::State::Established);
    assert!(state.stale_tables.contains(&AfiSafi::Ipv4Unicast));
    assert!(!state.stale_tables.contains(&AfiSafi::Ipv6Unicast));
    assert!(state.notification_sent.is_none());
}

#[tokio::test(start_paused = true)]
async fn unknown_peer_rejected() {
    init_tracing();
    let handle = InstanceHandle::spawn(instance_cfg());
    let (local, mut remote) = tokio::io::duplex(1024);
    let conn_info = ConnInfo {
        local_addr: ip!("10.0.0.1"),
        local_port: 179,
        remote_addr: ip!("10.0.0.9"),
        remote_port: 40000,
    };
    handle
        .accept(Connection::new(local, conn_info))
        .await
        .unwrap();

    // The connection is dropped without any message.
    let mut buf = vec![];
    assert_eq!(remote.read_to_end(&mut buf).await.unwrap(), 0);
    assert!(
        handle
            .neighbor_state(ip!("10.0.0.9"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(start_paused = true)]
async fn peer_add_is_idempotent() {
    init_tracing();
    let handle = InstanceHandle::spawn(instance_cfg());
    let nbr_cfg = NeighborCfg {
        peer_as: PEER_AS,
        passive: true,
        ..Default::default()
    };
    handle.peer_add(PEER_ADDR, nbr_cfg.clone()).await.unwrap();
    handle.peer_add(PEER_ADDR, nbr_cfg).await.unwrap();
    let state = nbr_state(&handle).await;
    assert_eq!(state.state, fsm::State::Active);

    handle.peer_remove(PEER_ADDR).await.unwrap();
    handle.peer_remove(PEER_ADDR).await.unwrap();
    assert!(handle.neighbor_state(PEER_ADDR).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn end_of_rib_sweeps_stale_routes() {
    let handle = gr_session_lost(120).await;

    // The peer comes back and only re-advertises one of its prefixes.
    let mut peer = reconnect(&handle).await;
    peer.establish(&handle, 90, ipv4_gr_caps(120)).await;
    peer.send(ipv4_update(&["10.1.0.0/16"])).await;
    let handle = &handle;
    wait_for(|| async move { ipv4_stale(handle).await == [false, true] })
        .await;

    peer.send(ipv4_end_of_rib()).await;
    wait_for(|| async move { ipv4_stale(handle).await == [false] }).await;
    let ipv4 = handle.ipv4_unicast().await.unwrap().unwrap();
    let prefix: Ipv4Network = "10.1.0.0/16".parse().unwrap();
    assert!(ipv4.loc_rib.contains_key(&prefix));
    assert!(nbr_state(handle).await.stale_tables.is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_timer_sweeps_stale_routes() {
    let handle = gr_session_lost(10).await;

    // Still within the restart time.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ipv4_stale(&handle).await, [true, true]);

    // The peer never comes back.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(ipv4_stale(&handle).await.is_empty());
    let state = nbr_state(&handle).await;
    assert!(state.stale_tables.is_empty());
    assert_eq!(state.state, fsm::State::Active);
}

#[tokio::test(start_paused = true)]
async fn restart_timer_stops_once_reestablished() {
    let handle = gr_session_lost(10).await;

    // Re-establish without keepalives and hold off End-of-RIB past the
    // restart time.
    let mut peer = reconnect(&handle).await;
    peer.establish(&handle, 0, ipv4_gr_caps(10)).await;
    tokio::time::sleep(Duration::from_secs(15)).await;

    let state = nbr_state(&handle).await;
    assert_eq!(state.state, fsm::State::Established);
    assert!(state.stale_tables.contains(&AfiSafi::Ipv4Unicast));
    assert_eq!(ipv4_stale(&handle).await, [true, true]);

    peer.send(ipv4_end_of_rib()).await;
    let handle = &handle;
    wait_for(|| async move { ipv4_stale(handle).await.is_empty() }).await;
    assert!(nbr_state(handle).await.stale_tables.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reestablish_without_graceful_restart_sweeps_stale_routes() {
    let handle = gr_session_lost(120).await;

    let mut peer = reconnect(&handle).await;
    peer.establish(&handle, 90, ipv4_caps()).await;

    let handle = &handle;
    wait_for(|| async move { ipv4_stale(handle).await.is_empty() }).await;
    let state = nbr_state(handle).await;
    assert_eq!(state.state, fsm::State::Established);
    assert!(state.stale_tables.is_empty());
}

#[tokio::test(start_paused = true)]
async fn keepalives_leave_stale_routes_until_end_of_rib() {
    let handle = gr_session_lost(120).await;

    let mut peer = reconnect(&handle).await;
    peer.establish(&handle, 90, ipv4_gr_caps(120)).await;

    // Quiet keepalive intervals without any UPDATE or End-of-RIB.
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        peer.send(Message::Keepalive(KeepaliveMsg {})).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let state = nbr_state(&handle).await;
    assert_eq!(state.state, fsm::State::Established);
    assert!(state.stale_tables.contains(&AfiSafi::Ipv4Unicast));
    assert_eq!(ipv4_stale(&handle).await, [true, true]);

    // End-of-RIB still sweeps a table already synced by keepalives.
    peer.send(ipv4_end_of_rib()).await;
    let handle = &handle;
    wait_for(|| async move { ipv4_stale(handle).await.is_empty() }).await;
    assert!(nbr_state(handle).await.stale_tables.is_empty());
}
