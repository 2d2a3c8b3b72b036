//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use enum_as_inner::EnumAsInner;
use ipnetwork::{Ipv4Network, Ipv6Network};
use num_traits::{FromPrimitive, ToPrimitive};
use rbgp_utils::bgp::AfiSafi;
use rbgp_utils::bytes::{BytesExt, BytesMutExt, TLS_BUF};
use rbgp_utils::ip::{Ipv4AddrExt, Ipv6AddrExt};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::af::{Ipv4Unicast, Ipv6Unicast, Nlri, NlriCodec};
use crate::neighbor::PeerType;
use crate::packet::attribute::Attrs;
use crate::packet::consts::{
    AddPathMode, Afi, AfiSafiExt, AttrFlags, AttrType, BGP_VERSION,
    CapabilityCode, ErrorCode, GrAfiFlags, GrRestartFlags,
    MessageHeaderErrorSubcode, MessageType, OpenMessageErrorSubcode,
    OpenParamType, RouteRefreshErrorSubcode, Safi, UpdateMessageErrorSubcode,
};
use crate::packet::error::{
    AttrError, DecodeError, DecodeResult, MessageHeaderError,
    OpenMessageError, RouteRefreshMessageError, UpdateMessageError,
};

//
// BGP message.
//
// Encoding format (message header):
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                                                               |
// +                                                               +
// |                                                               |
// +                                                               +
// |                           Marker                              |
// +                                                               +
// |                                                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |          Length               |      Type     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum Message {
    Open(OpenMsg),
    Update(UpdateMsg),
    Notification(NotificationMsg),
    Keepalive(KeepaliveMsg),
    RouteRefresh(RouteRefreshMsg),
}

//
// OPEN Message.
//
// Encoding format (message body):
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+
// |    Version    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |     My Autonomous System      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           Hold Time           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         BGP Identifier                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Opt Parm Len  |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                                                               |
// |             Optional Parameters (variable)                    |
// |                                                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct OpenMsg {
    pub version: u8,
    pub my_as: u16,
    pub holdtime: u16,
    pub identifier: Ipv4Addr,
    pub capabilities: BTreeSet<Capability>,
}

//
// Capabilities Optional Parameter.
//
// Encoding format:
//
// +------------------------------+
// | Capability Code (1 octet)    |
// +------------------------------+
// | Capability Length (1 octet)  |
// +------------------------------+
// | Capability Value (variable)  |
// ~                              ~
// +------------------------------+
//
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum Capability {
    MultiProtocol {
        afi: Afi,
        safi: Safi,
    },
    FourOctetAsNumber {
        asn: u32,
    },
    AddPath(BTreeSet<AddPathTuple>),
    RouteRefresh,
    EnhancedRouteRefresh,
    GracefulRestart {
        flags: GrRestartFlags,
        restart_time: u16,
        tuples: BTreeSet<GrTuple>,
    },
}

// This is a stripped down version of `Capability`, containing only the result
// of negotiating both sides' capabilities. ADD-PATH modes are expressed from
// the local point of view.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum NegotiatedCapability {
    MultiProtocol {
        afi: Afi,
        safi: Safi,
    },
    FourOctetAsNumber,
    AddPath {
        afi: Afi,
        safi: Safi,
        mode: AddPathMode,
    },
    RouteRefresh,
    EnhancedRouteRefresh,
    GracefulRestart {
        afi: Afi,
        safi: Safi,
    },
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct AddPathTuple {
    pub afi: Afi,
    pub safi: Safi,
    pub mode: AddPathMode,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct GrTuple {
    pub afi: Afi,
    pub safi: Safi,
    pub flags: GrAfiFlags,
}

//
// UPDATE Message.
//
// Encoding format (message body):
//
// +-----------------------------------------------------+
// |   Withdrawn Routes Length (2 octets)                |
// +-----------------------------------------------------+
// |   Withdrawn Routes (variable)                       |
// +-----------------------------------------------------+
// |   Total Path Attribute Length (2 octets)            |
// +-----------------------------------------------------+
// |   Path Attributes (variable)                        |
// +-----------------------------------------------------+
// |   Network Layer Reachability Information (variable) |
// +-----------------------------------------------------+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[skip_serializing_none]
#[derive(Deserialize, Serialize)]
pub struct UpdateMsg {
    pub reach: Option<ReachNlri>,
    pub unreach: Option<UnreachNlri>,
    pub mp_reach: Option<MpReachNlri>,
    pub mp_unreach: Option<MpUnreachNlri>,
    pub attrs: Option<Attrs>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ReachNlri {
    pub prefixes: Vec<Nlri<Ipv4Network>>,
    pub nexthop: Ipv4Addr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct UnreachNlri {
    pub prefixes: Vec<Nlri<Ipv4Network>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MpReachNlri {
    Ipv4Unicast {
        prefixes: Vec<Nlri<Ipv4Network>>,
        nexthop: Ipv4Addr,
    },
    Ipv6Unicast {
        prefixes: Vec<Nlri<Ipv6Network>>,
        nexthop: Ipv6Addr,
        ll_nexthop: Option<Ipv6Addr>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MpUnreachNlri {
    Ipv4Unicast { prefixes: Vec<Nlri<Ipv4Network>> },
    Ipv6Unicast { prefixes: Vec<Nlri<Ipv6Network>> },
}

//
// NOTIFICATION Message.
//
// Encoding format (message body):
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Error code    | Error subcode |   Data (variable)             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct NotificationMsg {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

//
// KEEPALIVE Message.
//
// A KEEPALIVE message consists of only the message header and has a length of
// 19 octets.
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct KeepaliveMsg {}

//
// Route-REFRESH Message.
//
// Encoding format (message body):
//
// 0       7      15      23      31
// +-------+-------+-------+-------+
// |      AFI      | Res.  | SAFI  |
// +-------+-------+-------+-------+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RouteRefreshMsg {
    pub afi: u16,
    pub safi: u8,
}

// BGP message encoding context.
#[derive(Debug, Default)]
pub struct EncodeCxt {
    pub capabilities: BTreeSet<NegotiatedCapability>,
}

// BGP message decoding context.
#[derive(Debug)]
pub struct DecodeCxt {
    pub peer_type: PeerType,
    pub peer_as: u32,
    pub capabilities: BTreeSet<NegotiatedCapability>,
}

// ===== impl Message =====

impl Message {
    pub const MIN_LEN: u16 = 19;
    pub const MAX_LEN: u16 = 4096;
    const MSG_LEN_POS: std::ops::Range<usize> = 16..18;

    // Encodes BGP message into a bytes buffer.
    pub fn encode(&self, cxt: &EncodeCxt) -> Bytes {
        TLS_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();

            // Marker field.
            buf.put_u128(u128::MAX);
            // The length field will be initialized later.
            buf.put_u16(0);

            // Message type and body.
            match self {
                Message::Open(msg) => msg.encode(&mut buf),
                Message::Update(msg) => msg.encode(&mut buf, cxt),
                Message::Notification(msg) => msg.encode(&mut buf),
                Message::Keepalive(msg) => msg.encode(&mut buf),
                Message::RouteRefresh(msg) => msg.encode(&mut buf),
            }

            // Rewrite message length.
            let msg_len = buf.len() as u16;
            buf[Self::MSG_LEN_POS].copy_from_slice(&msg_len.to_be_bytes());

            buf.clone().freeze()
        })
    }

    // Decode buffer into a BGP message.
    //
    // The buffer is expected to hold exactly one message, as delimited by
    // `get_message_len`.
    pub fn decode(data: &[u8], cxt: &DecodeCxt) -> DecodeResult<Self> {
        let mut buf = Bytes::copy_from_slice(data);

        // Parse and validate marker.
        let marker = buf.try_get_u128()?;
        if marker != u128::MAX {
            return Err(MessageHeaderError::ConnectionNotSynchronized.into());
        }

        // Parse and validate message length.
        let msg_len = buf.try_get_u16()?;
        if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&msg_len)
            || msg_len as usize != data.len()
        {
            return Err(MessageHeaderError::BadMessageLength(msg_len).into());
        }

        // Parse message type.
        let msg_type = buf.try_get_u8()?;
        let Some(msg_etype) = MessageType::from_u8(msg_type) else {
            return Err(MessageHeaderError::BadMessageType(msg_type).into());
        };

        // Validate message length against the message type.
        match msg_etype {
            MessageType::Open if msg_len < OpenMsg::MIN_LEN => {
                return Err(
                    MessageHeaderError::BadMessageLength(msg_len).into()
                );
            }
            MessageType::Update if msg_len < UpdateMsg::MIN_LEN => {
                return Err(
                    MessageHeaderError::BadMessageLength(msg_len).into()
                );
            }
            MessageType::Notification if msg_len < NotificationMsg::MIN_LEN => {
                return Err(
                    MessageHeaderError::BadMessageLength(msg_len).into()
                );
            }
            MessageType::Keepalive if msg_len != KeepaliveMsg::LEN => {
                return Err(
                    MessageHeaderError::BadMessageLength(msg_len).into()
                );
            }
            MessageType::RouteRefresh if msg_len != RouteRefreshMsg::LEN => {
                return Err(RouteRefreshMessageError::InvalidMessageLength(
                    msg_len,
                )
                .into());
            }
            _ => (),
        }

        // Parse message body.
        match msg_etype {
            MessageType::Open => {
                let msg = OpenMsg::decode(&mut buf)?;
                Ok(Message::Open(msg))
            }
            MessageType::Update => {
                let msg = UpdateMsg::decode(&mut buf, cxt)?;
                Ok(Message::Update(msg))
            }
            MessageType::Notification => {
                let msg = NotificationMsg::decode(&mut buf)?;
                Ok(Message::Notification(msg))
            }
            MessageType::Keepalive => {
                let msg = KeepaliveMsg::decode(&mut buf)?;
                Ok(Message::Keepalive(msg))
            }
            MessageType::RouteRefresh => {
                let msg = RouteRefreshMsg::decode(&mut buf)?;
                Ok(Message::RouteRefresh(msg))
            }
        }
    }

    // Parses the given buffer to determine if it contains a complete BGP
    // message, and returns the length of the message if successful.
    //
    // A length field outside the valid range is returned as-is so that the
    // decoder can reject it.
    pub fn get_message_len(data: &[u8]) -> Option<usize> {
        // Validate that the buffer contains sufficient space for at least the
        // message header.
        if data.len() < Self::MIN_LEN as usize {
            return None;
        }

        let msg_len = u16::from_be_bytes([
            data[Self::MSG_LEN_POS.start],
            data[Self::MSG_LEN_POS.start + 1],
        ]) as usize;
        if msg_len < Self::MIN_LEN as usize || msg_len > Self::MAX_LEN as usize
        {
            return Some(Self::MIN_LEN as usize);
        }

        // Ensure the buffer is big enough to hold the entire message.
        (msg_len <= data.len()).then_some(msg_len)
    }
}

// ===== impl OpenMsg =====

impl OpenMsg {
    const MIN_LEN: u16 = 29;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::Open as u8);
        buf.put_u8(self.version);
        buf.put_u16(self.my_as);
        buf.put_u16(self.holdtime);
        buf.put_ipv4(&self.identifier);

        // Capabilities.
        let opt_param_len_pos = buf.len();
        buf.put_u8(0);
        for capability in &self.capabilities {
            buf.put_u8(OpenParamType::Capabilities as u8);

            // The "Parm. Length" field will be initialized later.
            let param_len_pos = buf.len();
            buf.put_u8(0);

            // Encode individual capability.
            capability.encode(buf);

            // Rewrite the "Parm. Length" field.
            let param_len = buf.len() - param_len_pos - 1;
            buf[param_len_pos] = param_len as u8;
        }

        // Rewrite the "Opt Parm Len" field.
        let opt_param_len = buf.len() - opt_param_len_pos - 1;
        buf[opt_param_len_pos] = opt_param_len as u8;
    }

    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        // Parse and validate BGP version.
        let version = buf.try_get_u8()?;
        if version != BGP_VERSION {
            return Err(
                OpenMessageError::UnsupportedVersion(BGP_VERSION).into()
            );
        }

        // Parse and validate ASN.
        let my_as = buf.try_get_u16()?;
        if my_as == 0 {
            return Err(OpenMessageError::BadPeerAs.into());
        }

        // Parse and validate hold time.
        let holdtime = buf.try_get_u16()?;
        if holdtime == 1 || holdtime == 2 {
            return Err(OpenMessageError::UnacceptableHoldTime.into());
        }

        // Parse and validate BGP identifier.
        let identifier = buf.try_get_ipv4()?;
        if !identifier.is_valid_identifier() {
            return Err(OpenMessageError::BadBgpIdentifier.into());
        }

        // Parse and validate optional parameters.
        let mut capabilities = BTreeSet::new();
        let opt_param_len = buf.try_get_u8()?;
        let mut buf_opts = buf
            .try_split_to(opt_param_len as usize)
            .map_err(|_| OpenMessageError::MalformedOptParam)?;
        while buf_opts.remaining() > 0 {
            let param_type = buf_opts.try_get_u8().map_err(OpenMessageError::from)?;
            let param_len = buf_opts.try_get_u8().map_err(OpenMessageError::from)?;
            let mut buf_param_value = buf_opts
                .try_split_to(param_len as usize)
                .map_err(OpenMessageError::from)?;

            // Parse and validate capabilities.
            match OpenParamType::from_u8(param_type) {
                Some(OpenParamType::Capabilities) => {
                    while buf_param_value.remaining() > 0 {
                        if let Some(cap) =
                            Capability::decode(&mut buf_param_value)?
                        {
                            capabilities.insert(cap);
                        }
                    }
                }
                None => {
                    return Err(OpenMessageError::UnsupportedOptParam.into());
                }
            }
        }

        Ok(OpenMsg {
            version,
            my_as,
            holdtime,
            identifier,
            capabilities,
        })
    }

    // AS number of the sender, taking the 4-octet AS capability into account.
    pub fn real_as(&self) -> u32 {
        self.capabilities
            .iter()
            .find_map(|cap| match cap {
                Capability::FourOctetAsNumber { asn } => Some(*asn),
                _ => None,
            })
            .unwrap_or(self.my_as as u32)
    }

    // Restart time and per-family tuples advertised in the graceful restart
    // capability, if present.
    pub fn graceful_restart(&self) -> Option<(u16, &BTreeSet<GrTuple>)> {
        self.capabilities.iter().find_map(|cap| match cap {
            Capability::GracefulRestart {
                restart_time,
                tuples,
                ..
            } => Some((*restart_time, tuples)),
            _ => None,
        })
    }
}

// ===== impl Capability =====

impl Capability {
    fn encode(&self, buf: &mut BytesMut) {
        let start_pos = buf.len();

        match self {
            Capability::MultiProtocol { afi, safi } => {
                buf.put_u8(CapabilityCode::MultiProtocol as u8);
                buf.put_u8(0);
                buf.put_u16(*afi as u16);
                buf.put_u8(0);
                buf.put_u8(*safi as u8);
            }
            Capability::FourOctetAsNumber { asn } => {
                buf.put_u8(CapabilityCode::FourOctetAsNumber as u8);
                buf.put_u8(0);
                buf.put_u32(*asn);
            }
            Capability::AddPath(tuples) => {
                buf.put_u8(CapabilityCode::AddPath as u8);
                buf.put_u8(0);
                for tuple in tuples {
                    buf.put_u16(tuple.afi as u16);
                    buf.put_u8(tuple.safi as u8);
                    buf.put_u8(tuple.mode as u8);
                }
            }
            Capability::RouteRefresh => {
                buf.put_u8(CapabilityCode::RouteRefresh as u8);
                buf.put_u8(0);
            }
            Capability::EnhancedRouteRefresh => {
                buf.put_u8(CapabilityCode::EnhancedRouteRefresh as u8);
                buf.put_u8(0);
            }
            Capability::GracefulRestart {
                flags,
                restart_time,
                tuples,
            } => {
                buf.put_u8(CapabilityCode::GracefulRestart as u8);
                buf.put_u8(0);
                buf.put_u16(
                    ((flags.bits() as u16) << 12) | (restart_time & 0x0fff),
                );
                for tuple in tuples {
                    buf.put_u16(tuple.afi as u16);
                    buf.put_u8(tuple.safi as u8);
                    buf.put_u8(tuple.flags.bits());
                }
            }
        }

        // Rewrite the "Capability Length" field.
        let cap_len = buf.len() - start_pos - 2;
        buf[start_pos + 1] = cap_len as u8;
    }

    pub fn decode(buf: &mut Bytes) -> DecodeResult<Option<Self>> {
        let cap_type = buf.try_get_u8().map_err(OpenMessageError::from)?;
        let cap_len = buf.try_get_u8().map_err(OpenMessageError::from)?;
        let mut buf_cap = buf
            .try_split_to(cap_len as usize)
            .map_err(OpenMessageError::from)?;

        let cap = match CapabilityCode::from_u8(cap_type) {
            Some(CapabilityCode::MultiProtocol) => {
                if cap_len != 4 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                let afi = buf_cap.try_get_u16().map_err(OpenMessageError::from)?;
                let _reserved =
                    buf_cap.try_get_u8().map_err(OpenMessageError::from)?;
                let safi = buf_cap.try_get_u8().map_err(OpenMessageError::from)?;
                let (Some(afi), Some(safi)) =
                    (Afi::from_u16(afi), Safi::from_u8(safi))
                else {
                    // Ignore unknown AFI/SAFI.
                    return Ok(None);
                };

                Capability::MultiProtocol { afi, safi }
            }
            Some(CapabilityCode::FourOctetAsNumber) => {
                if cap_len != 4 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                let asn = buf_cap.try_get_u32().map_err(OpenMessageError::from)?;
                Capability::FourOctetAsNumber { asn }
            }
            Some(CapabilityCode::AddPath) => {
                if cap_len % 4 != 0 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                let mut tuples = BTreeSet::new();
                while buf_cap.remaining() > 0 {
                    let afi =
                        buf_cap.try_get_u16().map_err(OpenMessageError::from)?;
                    let safi =
                        buf_cap.try_get_u8().map_err(OpenMessageError::from)?;
                    let mode =
                        buf_cap.try_get_u8().map_err(OpenMessageError::from)?;
                    // Ignore tuples with unknown values.
                    if let (Some(afi), Some(safi), Some(mode)) = (
                        Afi::from_u16(afi),
                        Safi::from_u8(safi),
                        AddPathMode::from_u8(mode),
                    ) {
                        tuples.insert(AddPathTuple { afi, safi, mode });
                    }
                }
                Capability::AddPath(tuples)
            }
            Some(CapabilityCode::RouteRefresh) => {
                if cap_len != 0 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                Capability::RouteRefresh
            }
            Some(CapabilityCode::EnhancedRouteRefresh) => {
                if cap_len != 0 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                Capability::EnhancedRouteRefresh
            }
            Some(CapabilityCode::GracefulRestart) => {
                if cap_len < 2 || (cap_len - 2) % 4 != 0 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                let value =
                    buf_cap.try_get_u16().map_err(OpenMessageError::from)?;
                let flags = GrRestartFlags::from_bits_truncate((value >> 12) as u8);
                let restart_time = value & 0x0fff;

                let mut tuples = BTreeSet::new();
                while buf_cap.remaining() > 0 {
                    let afi =
                        buf_cap.try_get_u16().map_err(OpenMessageError::from)?;
                    let safi =
                        buf_cap.try_get_u8().map_err(OpenMessageError::from)?;
                    let afi_flags =
                        buf_cap.try_get_u8().map_err(OpenMessageError::from)?;
                    // Ignore tuples with unknown values.
                    if let (Some(afi), Some(safi)) =
                        (Afi::from_u16(afi), Safi::from_u8(safi))
                    {
                        let flags = GrAfiFlags::from_bits_truncate(afi_flags);
                        tuples.insert(GrTuple { afi, safi, flags });
                    }
                }
                Capability::GracefulRestart {
                    flags,
                    restart_time,
                    tuples,
                }
            }
            None => {
                // Ignore unknown capability.
                return Ok(None);
            }
        };

        Ok(Some(cap))
    }

    pub fn code(&self) -> CapabilityCode {
        match self {
            Capability::MultiProtocol { .. } => CapabilityCode::MultiProtocol,
            Capability::FourOctetAsNumber { .. } => {
                CapabilityCode::FourOctetAsNumber
            }
            Capability::AddPath { .. } => CapabilityCode::AddPath,
            Capability::RouteRefresh => CapabilityCode::RouteRefresh,
            Capability::EnhancedRouteRefresh => {
                CapabilityCode::EnhancedRouteRefresh
            }
            Capability::GracefulRestart { .. } => {
                CapabilityCode::GracefulRestart
            }
        }
    }
}

// ===== impl NegotiatedCapability =====

impl NegotiatedCapability {
    pub fn code(&self) -> CapabilityCode {
        match self {
            NegotiatedCapability::MultiProtocol { .. } => {
                CapabilityCode::MultiProtocol
            }
            NegotiatedCapability::FourOctetAsNumber => {
                CapabilityCode::FourOctetAsNumber
            }
            NegotiatedCapability::AddPath { .. } => CapabilityCode::AddPath,
            NegotiatedCapability::RouteRefresh => CapabilityCode::RouteRefresh,
            NegotiatedCapability::EnhancedRouteRefresh => {
                CapabilityCode::EnhancedRouteRefresh
            }
            NegotiatedCapability::GracefulRestart { .. } => {
                CapabilityCode::GracefulRestart
            }
        }
    }
}

// Computes the set of capabilities in effect for a session.
//
// Most capabilities are in effect only when both sides advertise them.
// ADD-PATH is directional: we receive path identifiers if we advertised
// Receive and the peer advertised Send, and the other way around.
pub fn negotiate(
    local: &BTreeSet<Capability>,
    remote: &BTreeSet<Capability>,
) -> BTreeSet<NegotiatedCapability> {
    let mut negotiated = BTreeSet::new();

    for cap in local {
        match cap {
            Capability::MultiProtocol { afi, safi } => {
                if remote.contains(cap) {
                    negotiated.insert(NegotiatedCapability::MultiProtocol {
                        afi: *afi,
                        safi: *safi,
                    });
                }
            }
            Capability::FourOctetAsNumber { .. } => {
                if remote.iter().any(|cap| cap.is_four_octet_as_number()) {
                    negotiated.insert(NegotiatedCapability::FourOctetAsNumber);
                }
            }
            Capability::RouteRefresh => {
                if remote.contains(cap) {
                    negotiated.insert(NegotiatedCapability::RouteRefresh);
                }
            }
            Capability::EnhancedRouteRefresh => {
                if remote.contains(cap) {
                    negotiated
                        .insert(NegotiatedCapability::EnhancedRouteRefresh);
                }
            }
            Capability::AddPath(local_tuples) => {
                let Some(remote_tuples) =
                    remote.iter().find_map(|cap| cap.as_add_path())
                else {
                    continue;
                };
                for local_tuple in local_tuples {
                    let Some(remote_tuple) = remote_tuples.iter().find(|t| {
                        t.afi == local_tuple.afi && t.safi == local_tuple.safi
                    }) else {
                        continue;
                    };
                    let rx = receives(local_tuple.mode)
                        && sends(remote_tuple.mode);
                    let tx = sends(local_tuple.mode)
                        && receives(remote_tuple.mode);
                    let mode = match (rx, tx) {
                        (true, true) => AddPathMode::ReceiveSend,
                        (true, false) => AddPathMode::Receive,
                        (false, true) => AddPathMode::Send,
                        (false, false) => continue,
                    };
                    negotiated.insert(NegotiatedCapability::AddPath {
                        afi: local_tuple.afi,
                        safi: local_tuple.safi,
                        mode,
                    });
                }
            }
            Capability::GracefulRestart { tuples, .. } => {
                let Some(remote_tuples) =
                    remote.iter().find_map(|cap| match cap {
                        Capability::GracefulRestart { tuples, .. } => {
                            Some(tuples)
                        }
                        _ => None,
                    })
                else {
                    continue;
                };
                for tuple in tuples {
                    if remote_tuples
                        .iter()
                        .any(|t| t.afi == tuple.afi && t.safi == tuple.safi)
                    {
                        negotiated.insert(
                            NegotiatedCapability::GracefulRestart {
                                afi: tuple.afi,
                                safi: tuple.safi,
                            },
                        );
                    }
                }
            }
        }
    }

    negotiated
}

// Returns whether the given table is usable on a session with the given
// negotiated capabilities.
//
// In the absence of any multiprotocol capability, IPv4 unicast is implied.
pub fn afi_safi_enabled(
    capabilities: &BTreeSet<NegotiatedCapability>,
    afi_safi: AfiSafi,
) -> bool {
    if !capabilities
        .iter()
        .any(|cap| matches!(cap, NegotiatedCapability::MultiProtocol { .. }))
    {
        return afi_safi == AfiSafi::Ipv4Unicast;
    }

    capabilities.contains(&NegotiatedCapability::MultiProtocol {
        afi: afi_safi.afi(),
        safi: afi_safi.safi(),
    })
}

// Returns the effective ADD-PATH mode for the given table, if any.
pub fn add_path_mode(
    capabilities: &BTreeSet<NegotiatedCapability>,
    afi_safi: AfiSafi,
) -> Option<AddPathMode> {
    capabilities.iter().find_map(|cap| match cap {
        NegotiatedCapability::AddPath { afi, safi, mode }
            if *afi == afi_safi.afi() && *safi == afi_safi.safi() =>
        {
            Some(*mode)
        }
        _ => None,
    })
}

// Returns whether graceful restart is in effect for the given table.
pub fn graceful_restart_enabled(
    capabilities: &BTreeSet<NegotiatedCapability>,
    afi_safi: AfiSafi,
) -> bool {
    capabilities.contains(&NegotiatedCapability::GracefulRestart {
        afi: afi_safi.afi(),
        safi: afi_safi.safi(),
    })
}

// ===== impl UpdateMsg =====

impl UpdateMsg {
    pub const MIN_LEN: u16 = 23;

    // Builds an End-of-RIB marker for the given table.
    pub fn end_of_rib(afi_safi: AfiSafi) -> Self {
        let mut msg = UpdateMsg {
            reach: None,
            unreach: None,
            mp_reach: None,
            mp_unreach: None,
            attrs: None,
        };
        match afi_safi {
            AfiSafi::Ipv4Unicast => {}
            AfiSafi::Ipv6Unicast => {
                msg.mp_unreach = Some(MpUnreachNlri::Ipv6Unicast {
                    prefixes: vec![],
                });
            }
        }
        msg
    }

    // Returns the table this message is an End-of-RIB marker for, if any.
    pub fn is_end_of_rib(&self) -> Option<AfiSafi> {
        if self.reach.is_some()
            || self.unreach.is_some()
            || self.mp_reach.is_some()
            || self.attrs.is_some()
        {
            return None;
        }

        match &self.mp_unreach {
            None => Some(AfiSafi::Ipv4Unicast),
            Some(MpUnreachNlri::Ipv4Unicast { prefixes })
                if prefixes.is_empty() =>
            {
                Some(AfiSafi::Ipv4Unicast)
            }
            Some(MpUnreachNlri::Ipv6Unicast { prefixes })
                if prefixes.is_empty() =>
            {
                Some(AfiSafi::Ipv6Unicast)
            }
            _ => None,
        }
    }

    fn encode(&self, buf: &mut BytesMut, cxt: &EncodeCxt) {
        buf.put_u8(MessageType::Update as u8);

        // Withdrawn Routes.
        let start_pos = buf.len();
        buf.put_u16(0);
        if let Some(unreach) = &self.unreach {
            Ipv4Unicast::serialize(&unreach.prefixes, buf);

            // Rewrite the "Withdrawn Routes Length" field.
            let len = (buf.len() - start_pos - 2) as u16;
            buf[start_pos..start_pos + 2].copy_from_slice(&len.to_be_bytes());
        }

        // Path Attributes.
        let start_pos = buf.len();
        buf.put_u16(0);

        // RFC 7606 - Section 5.1:
        // "The MP_REACH_NLRI or MP_UNREACH_NLRI attribute (if present) SHALL
        // be encoded as the very first path attribute in an UPDATE message".
        if let Some(mp_reach) = &self.mp_reach {
            mp_reach.encode(buf);
        }
        if let Some(mp_unreach) = &self.mp_unreach {
            mp_unreach.encode(buf);
        }
        if let Some(attrs) = &self.attrs {
            attrs.encode(buf, &self.reach, cxt);
        }

        // Rewrite the "Total Path Attribute Length" field.
        let len = (buf.len() - start_pos - 2) as u16;
        buf[start_pos..start_pos + 2].copy_from_slice(&len.to_be_bytes());

        // Network Layer Reachability Information.
        if let Some(reach) = &self.reach {
            Ipv4Unicast::serialize(&reach.prefixes, buf);
        }
    }

    pub fn decode(buf: &mut Bytes, cxt: &DecodeCxt) -> DecodeResult<Self> {
        let mut reach = None;
        let mut unreach = None;
        let mut mp_reach = None;
        let mut mp_unreach = None;
        let mut attrs = None;
        let mut nexthop = None;
        let add_path = cxt.add_path_rx(AfiSafi::Ipv4Unicast);

        // Withdrawn Routes Length.
        let wdraw_len = buf.try_get_u16().map_err(UpdateMessageError::from)?;

        // Withdrawn Routes.
        let mut buf_wdraw = buf
            .try_split_to(wdraw_len as usize)
            .map_err(UpdateMessageError::from)?;
        let prefixes = Ipv4Unicast::parse(&mut buf_wdraw, add_path)?;
        if !prefixes.is_empty() {
            unreach = Some(UnreachNlri { prefixes });
        }

        // Total Path Attribute Length.
        let attr_len = buf.try_get_u16().map_err(UpdateMessageError::from)?;
        let mut buf_attr = buf
            .try_split_to(attr_len as usize)
            .map_err(UpdateMessageError::from)?;

        // Path Attributes.
        if attr_len != 0 {
            let nlri_present = buf.remaining() > 0;
            attrs = Attrs::decode(
                &mut buf_attr,
                cxt,
                &mut nexthop,
                nlri_present,
                &mut mp_unreach,
                &mut mp_reach,
            )?;
        }

        // Network Layer Reachability Information.
        //
        // All prefixes are ignored if the NEXT_HOP attribute is missing.
        let prefixes = Ipv4Unicast::parse(buf, add_path)?;
        if !prefixes.is_empty()
            && let Some(nexthop) = nexthop
        {
            reach = Some(ReachNlri { prefixes, nexthop });
        }

        Ok(UpdateMsg {
            reach,
            unreach,
            mp_reach,
            mp_unreach,
            attrs,
        })
    }
}

// ===== impl MpReachNlri =====

impl MpReachNlri {
    pub const MIN_LEN: u16 = 5;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((AttrFlags::OPTIONAL | AttrFlags::EXTENDED).bits());
        buf.put_u8(AttrType::MpReachNlri as u8);

        // The length field will be initialized later.
        let start_pos = buf.len();
        buf.put_u16(0);

        // Encode attribute data.
        match self {
            MpReachNlri::Ipv4Unicast { prefixes, nexthop } => {
                buf.put_u16(Afi::Ipv4 as u16);
                buf.put_u8(Safi::Unicast as u8);
                buf.put_u8(Ipv4Addr::LENGTH as u8);
                buf.put_ipv4(nexthop);
                buf.put_u8(0);
                Ipv4Unicast::serialize(prefixes, buf);
            }
            MpReachNlri::Ipv6Unicast {
                prefixes,
                nexthop,
                ll_nexthop,
            } => {
                buf.put_u16(Afi::Ipv6 as u16);
                buf.put_u8(Safi::Unicast as u8);
                if let Some(ll_nexthop) = ll_nexthop {
                    buf.put_u8((Ipv6Addr::LENGTH * 2) as u8);
                    buf.put_ipv6(nexthop);
                    buf.put_ipv6(ll_nexthop);
                } else {
                    buf.put_u8(Ipv6Addr::LENGTH as u8);
                    buf.put_ipv6(nexthop);
                }
                buf.put_u8(0);
                Ipv6Unicast::serialize(prefixes, buf);
            }
        }

        // Rewrite attribute length.
        let attr_len = (buf.len() - start_pos - 2) as u16;
        buf[start_pos..start_pos + 2].copy_from_slice(&attr_len.to_be_bytes());
    }

    pub(crate) fn decode(
        buf: &mut Bytes,
        cxt: &DecodeCxt,
        mp_reach: &mut Option<Self>,
    ) -> Result<(), AttrError> {
        if buf.remaining() < Self::MIN_LEN as usize {
            return Err(AttrError::Reset);
        }

        // Parse AFI.
        let afi = buf.try_get_u16().map_err(|_| AttrError::Reset)?;
        let Some(afi) = Afi::from_u16(afi) else {
            // Ignore unknown AFI.
            return Err(AttrError::Discard);
        };

        // Parse SAFI.
        let safi = buf.try_get_u8().map_err(|_| AttrError::Reset)?;
        if Safi::from_u8(safi) != Some(Safi::Unicast) {
            // Ignore unsupported SAFI.
            return Err(AttrError::Discard);
        };

        match afi {
            Afi::Ipv4 => {
                // Parse nexthop.
                let nexthop_len =
                    buf.try_get_u8().map_err(|_| AttrError::Reset)?;
                if nexthop_len as usize != Ipv4Addr::LENGTH {
                    return Err(AttrError::Reset);
                }
                let nexthop =
                    buf.try_get_ipv4().map_err(|_| AttrError::Reset)?;

                // Parse prefixes.
                let _reserved =
                    buf.try_get_u8().map_err(|_| AttrError::Reset)?;
                let add_path = cxt.add_path_rx(AfiSafi::Ipv4Unicast);
                let prefixes = Ipv4Unicast::parse(buf, add_path)
                    .map_err(|_| AttrError::Reset)?;

                *mp_reach =
                    Some(MpReachNlri::Ipv4Unicast { prefixes, nexthop });
            }
            Afi::Ipv6 => {
                let mut ll_nexthop = None;

                // Parse nexthops(s).
                let nexthop_len =
                    buf.try_get_u8().map_err(|_| AttrError::Reset)? as usize;
                if nexthop_len != Ipv6Addr::LENGTH
                    && nexthop_len != Ipv6Addr::LENGTH * 2
                {
                    return Err(AttrError::Reset);
                }
                let nexthop =
                    buf.try_get_ipv6().map_err(|_| AttrError::Reset)?;
                if nexthop_len == Ipv6Addr::LENGTH * 2 {
                    ll_nexthop =
                        Some(buf.try_get_ipv6().map_err(|_| AttrError::Reset)?);
                }

                // Parse prefixes.
                let _reserved =
                    buf.try_get_u8().map_err(|_| AttrError::Reset)?;
                let add_path = cxt.add_path_rx(AfiSafi::Ipv6Unicast);
                let prefixes = Ipv6Unicast::parse(buf, add_path)
                    .map_err(|_| AttrError::Reset)?;

                *mp_reach = Some(MpReachNlri::Ipv6Unicast {
                    prefixes,
                    nexthop,
                    ll_nexthop,
                });
            }
        }

        Ok(())
    }
}

// ===== impl MpUnreachNlri =====

impl MpUnreachNlri {
    pub const MIN_LEN: u16 = 3;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((AttrFlags::OPTIONAL | AttrFlags::EXTENDED).bits());
        buf.put_u8(AttrType::MpUnreachNlri as u8);

        // The length field will be initialized later.
        let start_pos = buf.len();
        buf.put_u16(0);

        // Encode attribute data.
        match self {
            MpUnreachNlri::Ipv4Unicast { prefixes } => {
                buf.put_u16(Afi::Ipv4 as u16);
                buf.put_u8(Safi::Unicast as u8);
                Ipv4Unicast::serialize(prefixes, buf);
            }
            MpUnreachNlri::Ipv6Unicast { prefixes } => {
                buf.put_u16(Afi::Ipv6 as u16);
                buf.put_u8(Safi::Unicast as u8);
                Ipv6Unicast::serialize(prefixes, buf);
            }
        }

        // Rewrite attribute length.
        let attr_len = (buf.len() - start_pos - 2) as u16;
        buf[start_pos..start_pos + 2].copy_from_slice(&attr_len.to_be_bytes());
    }

    pub(crate) fn decode(
        buf: &mut Bytes,
        cxt: &DecodeCxt,
        mp_unreach: &mut Option<Self>,
    ) -> Result<(), AttrError> {
        if buf.remaining() < Self::MIN_LEN as usize {
            return Err(AttrError::Reset);
        }

        // Parse AFI.
        let afi = buf.try_get_u16().map_err(|_| AttrError::Reset)?;
        let Some(afi) = Afi::from_u16(afi) else {
            // Ignore unknown AFI.
            return Err(AttrError::Discard);
        };

        // Parse SAFI.
        let safi = buf.try_get_u8().map_err(|_| AttrError::Reset)?;
        if Safi::from_u8(safi) != Some(Safi::Unicast) {
            // Ignore unsupported SAFI.
            return Err(AttrError::Discard);
        };

        // Parse prefixes.
        match afi {
            Afi::Ipv4 => {
                let add_path = cxt.add_path_rx(AfiSafi::Ipv4Unicast);
                let prefixes = Ipv4Unicast::parse(buf, add_path)
                    .map_err(|_| AttrError::Reset)?;
                *mp_unreach = Some(MpUnreachNlri::Ipv4Unicast { prefixes });
            }
            Afi::Ipv6 => {
                let add_path = cxt.add_path_rx(AfiSafi::Ipv6Unicast);
                let prefixes = Ipv6Unicast::parse(buf, add_path)
                    .map_err(|_| AttrError::Reset)?;
                *mp_unreach = Some(MpUnreachNlri::Ipv6Unicast { prefixes });
            }
        }

        Ok(())
    }
}

// ===== impl NotificationMsg =====

impl NotificationMsg {
    const MIN_LEN: u16 = 21;

    pub(crate) fn new(
        error_code: impl ToPrimitive,
        error_subcode: impl ToPrimitive,
    ) -> Self {
        NotificationMsg {
            error_code: error_code.to_u8().unwrap_or(0),
            error_subcode: error_subcode.to_u8().unwrap_or(0),
            data: Default::default(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::Notification as u8);
        buf.put_u8(self.error_code);
        buf.put_u8(self.error_subcode);
        buf.put_slice(&self.data);
    }

    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let error_code = buf.try_get_u8()?;
        let error_subcode = buf.try_get_u8()?;

        Ok(NotificationMsg {
            error_code,
            error_subcode,
            data: buf.to_vec(),
        })
    }
}

impl std::fmt::Display for NotificationMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match ErrorCode::from_u8(self.error_code) {
            Some(code) => write!(f, "{:?}/{}", code, self.error_subcode),
            None => write!(f, "{}/{}", self.error_code, self.error_subcode),
        }
    }
}

impl From<DecodeError> for NotificationMsg {
    fn from(error: DecodeError) -> NotificationMsg {
        let error_code;
        let error_subcode;
        let mut data = vec![];

        match error {
            DecodeError::MessageHeader(error) => {
                error_code = ErrorCode::MessageHeaderError as u8;
                error_subcode = match error {
                    MessageHeaderError::ConnectionNotSynchronized => {
                        MessageHeaderErrorSubcode::ConnectionNotSynchronized
                    }
                    MessageHeaderError::BadMessageLength(len) => {
                        // RFC 4271 - Section 6.1:
                        // "The Data field MUST contain the erroneous Length
                        // field".
                        data.extend_from_slice(&len.to_be_bytes());
                        MessageHeaderErrorSubcode::BadMessageLength
                    }
                    MessageHeaderError::BadMessageType(msg_type) => {
                        data.push(msg_type);
                        MessageHeaderErrorSubcode::BadMessageType
                    }
                } as u8;
            }
            DecodeError::OpenMessage(error) => {
                error_code = ErrorCode::OpenMessageError as u8;
                error_subcode = match error {
                    OpenMessageError::UnsupportedVersion(version) => {
                        data.extend_from_slice(&(version as u16).to_be_bytes());
                        OpenMessageErrorSubcode::UnsupportedVersionNumber
                    }
                    OpenMessageError::BadPeerAs => {
                        OpenMessageErrorSubcode::BadPeerAs
                    }
                    OpenMessageError::BadBgpIdentifier => {
                        OpenMessageErrorSubcode::BadBgpIdentifier
                    }
                    OpenMessageError::UnsupportedOptParam => {
                        OpenMessageErrorSubcode::UnsupportedOptParam
                    }
                    OpenMessageError::UnacceptableHoldTime => {
                        OpenMessageErrorSubcode::UnacceptableHoldTime
                    }
                    OpenMessageError::UnsupportedCapability => {
                        OpenMessageErrorSubcode::UnsupportedCapability
                    }
                    OpenMessageError::MalformedOptParam => {
                        OpenMessageErrorSubcode::Unspecific
                    }
                } as u8;
            }
            DecodeError::UpdateMessage(error) => {
                error_code = ErrorCode::UpdateMessageError as u8;
                error_subcode = match error {
                    UpdateMessageError::MalformedAttributeList => {
                        UpdateMessageErrorSubcode::MalformedAttributeList
                    }
                    UpdateMessageError::UnrecognizedWellKnownAttribute => {
                        UpdateMessageErrorSubcode::UnrecognizedWellKnownAttribute
                    }
                    UpdateMessageError::OptionalAttributeError => {
                        UpdateMessageErrorSubcode::OptionalAttributeError
                    }
                    UpdateMessageError::InvalidNetworkField => {
                        UpdateMessageErrorSubcode::InvalidNetworkField
                    }
                } as u8;
            }
            DecodeError::RouteRefreshMessage(error) => {
                error_code = ErrorCode::RouteRefreshMessageError as u8;
                error_subcode = match error {
                    RouteRefreshMessageError::InvalidMessageLength(..) => {
                        RouteRefreshErrorSubcode::InvalidMessageLength
                    }
                } as u8;
            }
        }

        NotificationMsg {
            error_code,
            error_subcode,
            data,
        }
    }
}

// ===== impl KeepaliveMsg =====

impl KeepaliveMsg {
    const LEN: u16 = 19;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::Keepalive as u8);
    }

    pub fn decode(_buf: &mut Bytes) -> DecodeResult<Self> {
        // A KEEPALIVE message consists of only the message header.
        Ok(KeepaliveMsg {})
    }
}

// ===== impl RouteRefreshMsg =====

impl RouteRefreshMsg {
    const LEN: u16 = 23;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::RouteRefresh as u8);
        buf.put_u16(self.afi);
        buf.put_u8(0);
        buf.put_u8(self.safi);
    }

    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let afi = buf.try_get_u16()?;
        let _reserved = buf.try_get_u8()?;
        let safi = buf.try_get_u8()?;
        Ok(RouteRefreshMsg { afi, safi })
    }

    // Table this request refers to, if it is one we know of.
    pub fn afi_safi(&self) -> Option<AfiSafi> {
        let afi = Afi::from_u16(self.afi)?;
        let safi = Safi::from_u8(self.safi)?;
        AfiSafi::from_afi_safi(afi, safi)
    }
}

impl From<AfiSafi> for RouteRefreshMsg {
    fn from(afi_safi: AfiSafi) -> RouteRefreshMsg {
        RouteRefreshMsg {
            afi: afi_safi.afi() as u16,
            safi: afi_safi.safi() as u8,
        }
    }
}

// ===== impl EncodeCxt =====

impl EncodeCxt {
    pub(crate) fn four_byte_asn(&self) -> bool {
        self.capabilities
            .contains(&NegotiatedCapability::FourOctetAsNumber)
    }
}

// ===== impl DecodeCxt =====

impl DecodeCxt {
    pub(crate) fn four_byte_asn(&self) -> bool {
        self.capabilities
            .contains(&NegotiatedCapability::FourOctetAsNumber)
    }

    pub(crate) fn add_path_rx(&self, afi_safi: AfiSafi) -> bool {
        add_path_mode(&self.capabilities, afi_safi).is_some_and(receives)
    }
}

// ===== helper functions =====

fn receives(mode: AddPathMode) -> bool {
    matches!(mode, AddPathMode::Receive | AddPathMode::ReceiveSend)
}

fn sends(mode: AddPathMode) -> bool {
    matches!(mode, AddPathMode::Send | AddPathMode::ReceiveSend)
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use maplit::btreeset;

    use super::*;

    fn add_path(afi: Afi, mode: AddPathMode) -> Capability {
        Capability::AddPath(btreeset![AddPathTuple {
            afi,
            safi: Safi::Unicast,
            mode,
        }])
    }

    fn graceful_restart(afis: &[Afi]) -> Capability {
        Capability::GracefulRestart {
            flags: GrRestartFlags::empty(),
            restart_time: 120,
            tuples: afis
                .iter()
                .map(|afi| GrTuple {
                    afi: *afi,
                    safi: Safi::Unicast,
                    flags: GrAfiFlags::FORWARDING_STATE,
                })
                .collect(),
        }
    }

    #[test]
    fn add_path_is_negotiated_per_direction() {
        let local = btreeset![add_path(Afi::Ipv4, AddPathMode::ReceiveSend)];
        let remote = btreeset![add_path(Afi::Ipv4, AddPathMode::Receive)];
        let negotiated = negotiate(&local, &remote);
        assert_eq!(
            add_path_mode(&negotiated, AfiSafi::Ipv4Unicast),
            Some(AddPathMode::Send)
        );

        let remote = btreeset![add_path(Afi::Ipv4, AddPathMode::Send)];
        let negotiated = negotiate(&local, &remote);
        assert_eq!(
            add_path_mode(&negotiated, AfiSafi::Ipv4Unicast),
            Some(AddPathMode::Receive)
        );

        let local = btreeset![add_path(Afi::Ipv4, AddPathMode::Receive)];
        let remote = btreeset![add_path(Afi::Ipv4, AddPathMode::Receive)];
        let negotiated = negotiate(&local, &remote);
        assert_eq!(add_path_mode(&negotiated, AfiSafi::Ipv4Unicast), None);
    }

    #[test]
    fn graceful_restart_requires_both_sides() {
        let local = btreeset![graceful_restart(&[Afi::Ipv4, Afi::Ipv6])];
        let remote = btreeset![graceful_restart(&[Afi::Ipv4])];
        let negotiated = negotiate(&local, &remote);
        assert!(graceful_restart_enabled(&negotiated, AfiSafi::Ipv4Unicast));
        assert!(!graceful_restart_enabled(&negotiated, AfiSafi::Ipv6Unicast));

        let negotiated = negotiate(&local, &BTreeSet::new());
        assert!(!graceful_restart_enabled(&negotiated, AfiSafi::Ipv4Unicast));
    }

    #[test]
    fn ipv4_unicast_is_implied_without_multiprotocol() {
        let negotiated = BTreeSet::new();
        assert!(afi_safi_enabled(&negotiated, AfiSafi::Ipv4Unicast));
        assert!(!afi_safi_enabled(&negotiated, AfiSafi::Ipv6Unicast));

        let mp = Capability::MultiProtocol {
            afi: Afi::Ipv6,
            safi: Safi::Unicast,
        };
        let negotiated = negotiate(&btreeset![mp.clone()], &btreeset![mp]);
        assert!(!afi_safi_enabled(&negotiated, AfiSafi::Ipv4Unicast));
        assert!(afi_safi_enabled(&negotiated, AfiSafi::Ipv6Unicast));
    }

    #[test]
    fn end_of_rib_markers() {
        for afi_safi in [AfiSafi::Ipv4Unicast, AfiSafi::Ipv6Unicast] {
            let msg = UpdateMsg::end_of_rib(afi_safi);
            assert_eq!(msg.is_end_of_rib(), Some(afi_safi));
        }

        let msg = UpdateMsg {
            reach: None,
            unreach: None,
            mp_reach: None,
            mp_unreach: Some(MpUnreachNlri::Ipv6Unicast {
                prefixes: vec![Nlri {
                    prefix: "2001:db8::/32".parse().unwrap(),
                    path_id: None,
                }],
            }),
            attrs: None,
        };
        assert_eq!(msg.is_end_of_rib(), None);
    }

    #[test]
    fn partial_message_has_no_length() {
        let msg = Message::Keepalive(KeepaliveMsg {});
        let bytes = msg.encode(&EncodeCxt::default());
        assert_eq!(Message::get_message_len(&bytes[..10]), None);
        assert_eq!(Message::get_message_len(&bytes), Some(19));
    }
}
