//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::sync::LazyLock as Lazy;

use rbgp::packet::consts::{
    AS_TRANS, AddPathMode, Afi, BGP_VERSION, ErrorCode, GrAfiFlags,
    GrRestartFlags, OpenMessageErrorSubcode, Safi,
};
use rbgp::packet::message::{
    AddPathTuple, Capability, GrTuple, Message, NotificationMsg, OpenMsg,
};

use super::{decode_msg, test_decode_msg, test_encode_msg};

static OPEN1: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04, 0xfd, 0xe8,
            0x00, 0x5a, 0x01, 0x01, 0x01, 0x01, 0x00,
        ],
        Message::Open(OpenMsg {
            version: BGP_VERSION,
            my_as: 65000,
            holdtime: 90,
            identifier: Ipv4Addr::new(1, 1, 1, 1),
            capabilities: [].into(),
        }),
    )
});

static OPEN2: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x3b, 0x01, 0x04, 0xfd, 0xe8,
            0x00, 0x5a, 0x01, 0x01, 0x01, 0x01, 0x1e, 0x02, 0x06, 0x01, 0x04,
            0x00, 0x01, 0x00, 0x01, 0x02, 0x06, 0x41, 0x04, 0x00, 0x00, 0xfd,
            0xe8, 0x02, 0x02, 0x02, 0x00, 0x02, 0x08, 0x40, 0x06, 0x00, 0x78,
            0x00, 0x01, 0x01, 0x80,
        ],
        Message::Open(OpenMsg {
            version: BGP_VERSION,
            my_as: 65000,
            holdtime: 90,
            identifier: Ipv4Addr::new(1, 1, 1, 1),
            capabilities: [
                Capability::MultiProtocol {
                    afi: Afi::Ipv4,
                    safi: Safi::Unicast,
                },
                Capability::FourOctetAsNumber { asn: 65000 },
                Capability::RouteRefresh,
                Capability::GracefulRestart {
                    flags: GrRestartFlags::empty(),
                    restart_time: 120,
                    tuples: [GrTuple {
                        afi: Afi::Ipv4,
                        safi: Safi::Unicast,
                        flags: GrAfiFlags::FORWARDING_STATE,
                    }]
                    .into(),
                },
            ]
            .into(),
        }),
    )
});

static OPEN3: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x2d, 0x01, 0x04, 0x5b, 0xa0,
            0x00, 0xb4, 0x02, 0x02, 0x02, 0x02, 0x10, 0x02, 0x06, 0x41, 0x04,
            0x00, 0x06, 0x1a, 0x80, 0x02, 0x06, 0x45, 0x04, 0x00, 0x01, 0x01,
            0x03,
        ],
        Message::Open(OpenMsg {
            version: BGP_VERSION,
            my_as: AS_TRANS,
            holdtime: 180,
            identifier: Ipv4Addr::new(2, 2, 2, 2),
            capabilities: [
                Capability::FourOctetAsNumber { asn: 400000 },
                Capability::AddPath(
                    [AddPathTuple {
                        afi: Afi::Ipv4,
                        safi: Safi::Unicast,
                        mode: AddPathMode::ReceiveSend,
                    }]
                    .into(),
                ),
            ]
            .into(),
        }),
    )
});

#[test]
fn test_encode_open1() {
    let (ref bytes, ref msg) = *OPEN1;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_open1() {
    let (ref bytes, ref msg) = *OPEN1;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_open2() {
    let (ref bytes, ref msg) = *OPEN2;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_open2() {
    let (ref bytes, ref msg) = *OPEN2;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_open3() {
    let (ref bytes, ref msg) = *OPEN3;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_open3() {
    let (ref bytes, ref msg) = *OPEN3;
    test_decode_msg(bytes, msg);
}

// The 4-octet AS capability overrides the AS_TRANS placeholder.
#[test]
fn test_open3_real_as() {
    let (_, ref msg) = *OPEN3;
    assert_eq!(msg.as_open().unwrap().real_as(), 400000);

    let (_, ref msg) = *OPEN1;
    assert_eq!(msg.as_open().unwrap().real_as(), 65000);
}

#[test]
fn test_open2_graceful_restart() {
    let (_, ref msg) = *OPEN2;
    let (restart_time, tuples) =
        msg.as_open().unwrap().graceful_restart().unwrap();
    assert_eq!(restart_time, 120);
    assert_eq!(tuples.len(), 1);
}

// BGP version 3 is rejected, and mapped to the matching NOTIFICATION.
#[test]
fn test_decode_open_bad_version() {
    let bytes = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x03, 0xfd, 0xe8,
        0x00, 0x5a, 0x01, 0x01, 0x01, 0x01, 0x00,
    ];
    let error = decode_msg(&bytes).unwrap_err();
    let msg = NotificationMsg::from(error);
    assert_eq!(msg.error_code, ErrorCode::OpenMessageError as u8);
    assert_eq!(
        msg.error_subcode,
        OpenMessageErrorSubcode::UnsupportedVersionNumber as u8
    );
}

// Hold times of one and two seconds are never acceptable.
#[test]
fn test_decode_open_bad_holdtime() {
    let bytes = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04, 0xfd, 0xe8,
        0x00, 0x02, 0x01, 0x01, 0x01, 0x01, 0x00,
    ];
    let error = decode_msg(&bytes).unwrap_err();
    let msg = NotificationMsg::from(error);
    assert_eq!(
        msg.error_subcode,
        OpenMessageErrorSubcode::UnacceptableHoldTime as u8
    );
}
