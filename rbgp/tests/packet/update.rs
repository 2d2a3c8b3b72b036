//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::sync::LazyLock as Lazy;

use ipnetwork::Ipv4Network;
use rbgp::af::Nlri;
use rbgp::packet::attribute::{
    AsPath, AsPathSegment, Attrs, BaseAttrs, CommList,
};
use rbgp::packet::consts::AsPathSegmentType;
use rbgp::packet::message::{
    Message, MpUnreachNlri, ReachNlri, UnreachNlri, UpdateMsg,
};
use rbgp_utils::bgp::{AfiSafi, Comm, Origin, WellKnownCommunities};

use super::{test_decode_msg, test_encode_msg};

fn nlri(prefix: &str) -> Nlri<Ipv4Network> {
    Nlri {
        prefix: prefix.parse().unwrap(),
        path_id: None,
    }
}

static UPDATE1: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x49, 0x02, 0x00, 0x00, 0x00,
            0x2b, 0x40, 0x01, 0x01, 0x00, 0x50, 0x02, 0x00, 0x06, 0x02, 0x01,
            0x00, 0x00, 0xfd, 0xe9, 0x40, 0x03, 0x04, 0x0a, 0x00, 0x00, 0x01,
            0x80, 0x04, 0x04, 0x00, 0x00, 0x00, 0x64, 0x40, 0x05, 0x04, 0x00,
            0x00, 0x00, 0x64, 0xd0, 0x08, 0x00, 0x04, 0xff, 0xff, 0xff, 0x01,
            0x10, 0x0a, 0x01, 0x18, 0x0a, 0x02, 0x00,
        ],
        Message::Update(UpdateMsg {
            reach: Some(ReachNlri {
                prefixes: vec![nlri("10.1.0.0/16"), nlri("10.2.0.0/24")],
                nexthop: Ipv4Addr::new(10, 0, 0, 1),
            }),
            unreach: None,
            mp_reach: None,
            mp_unreach: None,
            attrs: Some(Attrs {
                base: BaseAttrs {
                    origin: Origin::Igp,
                    as_path: AsPath {
                        segments: [AsPathSegment {
                            seg_type: AsPathSegmentType::Sequence,
                            members: [65001].into(),
                        }]
                        .into(),
                    },
                    as4_path: None,
                    nexthop: None,
                    ll_nexthop: None,
                    med: Some(100),
                    local_pref: Some(100),
                    aggregator: None,
                    as4_aggregator: None,
                    atomic_aggregate: false,
                    originator_id: None,
                    cluster_list: None,
                },
                comm: Some(CommList(
                    [Comm(WellKnownCommunities::NoExport as u32)].into(),
                )),
                unknown: vec![],
            }),
        }),
    )
});

static UPDATE2: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x1a, 0x02, 0x00, 0x03, 0x10,
            0x0a, 0x01, 0x00, 0x00,
        ],
        Message::Update(UpdateMsg {
            reach: None,
            unreach: Some(UnreachNlri {
                prefixes: vec![nlri("10.1.0.0/16")],
            }),
            mp_reach: None,
            mp_unreach: None,
            attrs: None,
        }),
    )
});

static UPDATE3: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x1e, 0x02, 0x00, 0x00, 0x00,
            0x07, 0x90, 0x0f, 0x00, 0x03, 0x00, 0x02, 0x01,
        ],
        Message::Update(UpdateMsg {
            reach: None,
            unreach: None,
            mp_reach: None,
            mp_unreach: Some(MpUnreachNlri::Ipv6Unicast { prefixes: vec![] }),
            attrs: None,
        }),
    )
});

static UPDATE4: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x17, 0x02, 0x00, 0x00, 0x00,
            0x00,
        ],
        Message::Update(UpdateMsg::end_of_rib(AfiSafi::Ipv4Unicast)),
    )
});

#[test]
fn test_encode_update1() {
    let (ref bytes, ref msg) = *UPDATE1;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_update1() {
    let (ref bytes, ref msg) = *UPDATE1;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_update2() {
    let (ref bytes, ref msg) = *UPDATE2;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_update2() {
    let (ref bytes, ref msg) = *UPDATE2;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_update3() {
    let (ref bytes, ref msg) = *UPDATE3;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_update3() {
    let (ref bytes, ref msg) = *UPDATE3;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_update4() {
    let (ref bytes, ref msg) = *UPDATE4;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_update4() {
    let (ref bytes, ref msg) = *UPDATE4;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_end_of_rib_markers() {
    let eor = |msg: &Message| msg.as_update().unwrap().is_end_of_rib();
    assert_eq!(eor(&UPDATE1.1), None);
    assert_eq!(eor(&UPDATE2.1), None);
    assert_eq!(eor(&UPDATE3.1), Some(AfiSafi::Ipv6Unicast));
    assert_eq!(eor(&UPDATE4.1), Some(AfiSafi::Ipv4Unicast));
}

// A route missing LOCAL_PREF from an internal peer is treated as withdrawn:
// the prefixes are kept but the attributes are dropped.
#[test]
fn test_decode_update_missing_local_pref() {
    let bytes = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x2f, 0x02, 0x00, 0x00, 0x00,
        0x15, 0x40, 0x01, 0x01, 0x00, 0x50, 0x02, 0x00, 0x06, 0x02, 0x01,
        0x00, 0x00, 0xfd, 0xe9, 0x40, 0x03, 0x04, 0x0a, 0x00, 0x00, 0x01,
        0x10, 0x0a, 0x01,
    ];
    let msg = super::decode_msg(&bytes).unwrap();
    let msg = msg.as_update().unwrap();
    assert!(msg.attrs.is_none());
    let reach = msg.reach.as_ref().unwrap();
    assert_eq!(reach.prefixes, vec![nlri("10.1.0.0/16")]);
}
