//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use itertools::Itertools;
use rbgp_utils::bgp::AfiSafi;
use rbgp_utils::ip::{
    Ipv4AddrExt, Ipv4NetworkExt, Ipv6AddrExt, Ipv6NetworkExt,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::instance::Tables;
use crate::neighbor::PeerType;
use crate::packet::attribute::{self, ATTR_MIN_LEN_EXT, Attrs, BaseAttrs};
use crate::packet::consts::{Afi, Safi};
use crate::packet::error::{DecodeResult, UpdateMessageError};
use crate::packet::message::{
    Message, MpReachNlri, MpUnreachNlri, ReachNlri, UnreachNlri, UpdateMsg,
};
use crate::rib::export::UpdateQueue;
use crate::rib::table::TableHandle;

// One NLRI entry: the family-specific key plus the optional ADD-PATH
// identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Nlri<P> {
    pub prefix: P,
    pub path_id: Option<u32>,
}

// Wire codec for the NLRI of a single address family.
//
// The decision process only ever sees `Nlri<Self::Prefix>` as an opaque key.
pub trait NlriCodec {
    // Address Family Identifier.
    const AFI: Afi;
    // Subsequent Address Family Identifier.
    const SAFI: Safi;
    // Upper bound on the encoded size of a single prefix.
    const MAX_PREFIX_LEN: u16;

    // Family-specific route key.
    type Prefix: Copy
        + Debug
        + Display
        + Eq
        + Hash
        + Ord
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + Into<IpNetwork>
        + 'static;

    // Decodes one prefix. Semantically invalid prefixes are skipped by
    // returning `None`.
    fn decode_prefix(buf: &mut Bytes) -> DecodeResult<Option<Self::Prefix>>;

    // Encodes one prefix.
    fn encode_prefix(prefix: &Self::Prefix, buf: &mut BytesMut);

    // Parses a list of NLRIs, each optionally preceded by a path identifier.
    fn parse(
        buf: &mut Bytes,
        add_path: bool,
    ) -> DecodeResult<Vec<Nlri<Self::Prefix>>> {
        let mut nlris = Vec::new();
        while buf.remaining() > 0 {
            let path_id = if add_path {
                let path_id = buf
                    .try_get_u32()
                    .map_err(|_| UpdateMessageError::InvalidNetworkField)?;
                Some(path_id)
            } else {
                None
            };
            if let Some(prefix) = Self::decode_prefix(buf)? {
                nlris.push(Nlri { prefix, path_id });
            }
        }
        Ok(nlris)
    }

    // Serializes a list of NLRIs. A path identifier is written whenever the
    // entry carries one.
    fn serialize(nlris: &[Nlri<Self::Prefix>], buf: &mut BytesMut) {
        for nlri in nlris {
            if let Some(path_id) = nlri.path_id {
                buf.put_u32(path_id);
            }
            Self::encode_prefix(&nlri.prefix, buf);
        }
    }
}

// BGP address-family specific code.
pub trait AddressFamily: NlriCodec + Debug + Send + Sync + Sized + 'static {
    // Combined AFI and SAFI.
    const AFI_SAFI: AfiSafi;

    // Get the table handle for this address family, if the table is enabled.
    fn table(tables: &Tables) -> Option<&TableHandle<Self>>;

    // Modify the next hop(s) for transmission.
    fn nexthop_tx_change(
        local_addr: IpAddr,
        peer_type: PeerType,
        attrs: &mut BaseAttrs,
    );

    // Fixed overhead of an UPDATE carrying reachable prefixes with the given
    // attributes.
    fn reach_overhead(attrs: &Attrs) -> u16;

    // Fixed overhead of an UPDATE carrying only unreachable prefixes.
    fn unreach_overhead() -> u16;

    // Builds an UPDATE announcing the given NLRIs. Returns `None` when the
    // attributes lack a usable next hop for this family.
    fn reach_msg(nlris: Vec<Nlri<Self::Prefix>>, attrs: &Attrs)
    -> Option<UpdateMsg>;

    // Builds an UPDATE withdrawing the given NLRIs.
    fn unreach_msg(nlris: Vec<Nlri<Self::Prefix>>) -> UpdateMsg;

    // Build BGP UPDATE messages based on the provided update queue.
    fn build_updates(queue: &mut UpdateQueue<Self>) -> Vec<Message> {
        let mut msgs = vec![];
        let reach = std::mem::take(&mut queue.reach);
        let unreach = std::mem::take(&mut queue.unreach);

        // Unreachable prefixes.
        if !unreach.is_empty() {
            let max = (Message::MAX_LEN - Self::unreach_overhead())
                / (Self::MAX_PREFIX_LEN + 4);

            msgs.extend(
                unreach.into_iter().chunks(max as usize).into_iter().map(
                    |chunk| Message::Update(Self::unreach_msg(chunk.collect())),
                ),
            );
        }

        // Reachable prefixes.
        for (attrs, nlris) in reach.into_iter() {
            let overhead = Self::reach_overhead(&attrs);
            let max =
                Message::MAX_LEN.saturating_sub(overhead) / (Self::MAX_PREFIX_LEN + 4);
            if max == 0 {
                continue;
            }

            for chunk in nlris.into_iter().chunks(max as usize).into_iter() {
                if let Some(msg) = Self::reach_msg(chunk.collect(), &attrs) {
                    msgs.push(Message::Update(msg));
                }
            }
        }

        msgs
    }

    // Builds the End-of-RIB marker for this address family.
    fn end_of_rib() -> Message {
        Message::Update(UpdateMsg::end_of_rib(Self::AFI_SAFI))
    }
}

#[derive(Debug)]
pub struct Ipv4Unicast;

#[derive(Debug)]
pub struct Ipv6Unicast;

// ===== impl Ipv4Unicast =====

impl NlriCodec for Ipv4Unicast {
    const AFI: Afi = Afi::Ipv4;
    const SAFI: Safi = Safi::Unicast;
    const MAX_PREFIX_LEN: u16 = 1 + Ipv4Addr::LENGTH as u16;

    type Prefix = Ipv4Network;

    fn decode_prefix(buf: &mut Bytes) -> DecodeResult<Option<Ipv4Network>> {
        // Parse prefix length.
        let plen = buf
            .try_get_u8()
            .map_err(|_| UpdateMessageError::InvalidNetworkField)?;
        let plen_wire = prefix_wire_len(plen);
        if plen_wire > buf.remaining() || plen > Ipv4Network::MAX_PREFIXLEN {
            return Err(UpdateMessageError::InvalidNetworkField.into());
        }

        // Parse prefix address (variable length).
        let mut prefix_bytes = [0; Ipv4Addr::LENGTH];
        buf.copy_to_slice(&mut prefix_bytes[..plen_wire]);
        let prefix = Ipv4Addr::from(prefix_bytes);
        let prefix = Ipv4Network::new(prefix, plen)
            .map(|prefix| prefix.apply_mask())
            .map_err(|_| UpdateMessageError::InvalidNetworkField)?;

        // Ignore semantically incorrect prefix.
        if !prefix.is_routable() {
            return Ok(None);
        }

        Ok(Some(prefix))
    }

    fn encode_prefix(prefix: &Ipv4Network, buf: &mut BytesMut) {
        // Encode prefix length.
        let plen = prefix.prefix();
        buf.put_u8(plen);

        // Encode prefix address (variable length).
        let prefix_bytes = prefix.ip().octets();
        let plen_wire = prefix_wire_len(plen);
        buf.put(&prefix_bytes[0..plen_wire]);
    }
}

impl AddressFamily for Ipv4Unicast {
    const AFI_SAFI: AfiSafi = AfiSafi::Ipv4Unicast;

    fn table(tables: &Tables) -> Option<&TableHandle<Self>> {
        tables.ipv4_unicast.as_ref()
    }

    fn nexthop_tx_change(
        local_addr: IpAddr,
        peer_type: PeerType,
        attrs: &mut BaseAttrs,
    ) {
        match peer_type {
            PeerType::Internal => {
                // Next hop isn't modified.
            }
            PeerType::External => match local_addr {
                IpAddr::V4(src_addr) => {
                    // BGP over IPv4.
                    //
                    // Use source address of the eBGP session.
                    attrs.nexthop = Some(src_addr.into())
                }
                IpAddr::V6(_) => {
                    // BGP over IPv6 has no IPv4 address to offer.
                    attrs.nexthop = None;
                }
            },
        }
    }

    fn reach_overhead(attrs: &Attrs) -> u16 {
        UpdateMsg::MIN_LEN + attrs.length() + attribute::nexthop::length()
    }

    fn unreach_overhead() -> u16 {
        UpdateMsg::MIN_LEN
    }

    fn reach_msg(
        nlris: Vec<Nlri<Ipv4Network>>,
        attrs: &Attrs,
    ) -> Option<UpdateMsg> {
        let Some(IpAddr::V4(nexthop)) = attrs.base.nexthop else {
            return None;
        };
        Some(UpdateMsg {
            reach: Some(ReachNlri {
                prefixes: nlris,
                nexthop,
            }),
            unreach: None,
            mp_reach: None,
            mp_unreach: None,
            attrs: Some(attrs.clone()),
        })
    }

    fn unreach_msg(nlris: Vec<Nlri<Ipv4Network>>) -> UpdateMsg {
        UpdateMsg {
            reach: None,
            unreach: Some(UnreachNlri { prefixes: nlris }),
            mp_reach: None,
            mp_unreach: None,
            attrs: None,
        }
    }
}

// ===== impl Ipv6Unicast =====

impl NlriCodec for Ipv6Unicast {
    const AFI: Afi = Afi::Ipv6;
    const SAFI: Safi = Safi::Unicast;
    const MAX_PREFIX_LEN: u16 = 1 + Ipv6Addr::LENGTH as u16;

    type Prefix = Ipv6Network;

    fn decode_prefix(buf: &mut Bytes) -> DecodeResult<Option<Ipv6Network>> {
        // Parse prefix length.
        let plen = buf
            .try_get_u8()
            .map_err(|_| UpdateMessageError::InvalidNetworkField)?;
        let plen_wire = prefix_wire_len(plen);
        if plen_wire > buf.remaining() || plen > Ipv6Network::MAX_PREFIXLEN {
            return Err(UpdateMessageError::InvalidNetworkField.into());
        }

        // Parse prefix address (variable length).
        let mut prefix_bytes = [0; Ipv6Addr::LENGTH];
        buf.copy_to_slice(&mut prefix_bytes[..plen_wire]);
        let prefix = Ipv6Addr::from(prefix_bytes);
        let prefix = Ipv6Network::new(prefix, plen)
            .map(|prefix| prefix.apply_mask())
            .map_err(|_| UpdateMessageError::InvalidNetworkField)?;

        // Ignore semantically incorrect prefix.
        if !prefix.is_routable() {
            return Ok(None);
        }

        Ok(Some(prefix))
    }

    fn encode_prefix(prefix: &Ipv6Network, buf: &mut BytesMut) {
        // Encode prefix length.
        let plen = prefix.prefix();
        buf.put_u8(plen);

        // Encode prefix address (variable length).
        let prefix_bytes = prefix.ip().octets();
        let plen_wire = prefix_wire_len(plen);
        buf.put(&prefix_bytes[0..plen_wire]);
    }
}

impl AddressFamily for Ipv6Unicast {
    const AFI_SAFI: AfiSafi = AfiSafi::Ipv6Unicast;

    fn table(tables: &Tables) -> Option<&TableHandle<Self>> {
        tables.ipv6_unicast.as_ref()
    }

    fn nexthop_tx_change(
        local_addr: IpAddr,
        peer_type: PeerType,
        attrs: &mut BaseAttrs,
    ) {
        match peer_type {
            PeerType::Internal => {
                // Global next hop isn't modified.
            }
            PeerType::External => {
                // Update global next hop.
                match local_addr {
                    IpAddr::V4(src_addr) => {
                        // BGP over IPv4.
                        //
                        // Use source address of the eBGP session
                        // (IPv4-mapped IPv6 address).
                        attrs.nexthop = Some(src_addr.to_ipv6_mapped().into())
                    }
                    IpAddr::V6(src_addr) => {
                        // BGP over IPv6.
                        //
                        // Use source address of the eBGP session.
                        attrs.nexthop = Some(src_addr.into())
                    }
                }

                // Unset link-local next hop.
                attrs.ll_nexthop = None;
            }
        }
    }

    fn reach_overhead(attrs: &Attrs) -> u16 {
        let nexthop_len = if attrs.base.ll_nexthop.is_some() {
            Ipv6Addr::LENGTH * 2
        } else {
            Ipv6Addr::LENGTH
        };
        UpdateMsg::MIN_LEN
            + attrs.length()
            + ATTR_MIN_LEN_EXT
            + MpReachNlri::MIN_LEN
            + nexthop_len as u16
    }

    fn unreach_overhead() -> u16 {
        UpdateMsg::MIN_LEN + ATTR_MIN_LEN_EXT + MpUnreachNlri::MIN_LEN
    }

    fn reach_msg(
        nlris: Vec<Nlri<Ipv6Network>>,
        attrs: &Attrs,
    ) -> Option<UpdateMsg> {
        let nexthop = match attrs.base.nexthop? {
            IpAddr::V4(addr) => addr.to_ipv6_mapped(),
            IpAddr::V6(addr) => addr,
        };
        let mp_reach = MpReachNlri::Ipv6Unicast {
            prefixes: nlris,
            nexthop,
            ll_nexthop: attrs.base.ll_nexthop,
        };
        Some(UpdateMsg {
            reach: None,
            unreach: None,
            mp_reach: Some(mp_reach),
            mp_unreach: None,
            attrs: Some(attrs.clone()),
        })
    }

    fn unreach_msg(nlris: Vec<Nlri<Ipv6Network>>) -> UpdateMsg {
        UpdateMsg {
            reach: None,
            unreach: None,
            mp_reach: None,
            mp_unreach: Some(MpUnreachNlri::Ipv6Unicast { prefixes: nlris }),
            attrs: None,
        }
    }
}

// ===== helper functions =====

// Calculates the number of bytes required to encode a prefix.
fn prefix_wire_len(len: u8) -> usize {
    (len as usize).div_ceil(8)
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_path_identifiers_are_parsed() {
        let mut buf = Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x07, 0x18, 0x0a, 0x00, 0x01, 0x00, 0x00,
            0x00, 0x08, 0x18, 0x0a, 0x00, 0x01,
        ]);
        let nlris = Ipv4Unicast::parse(&mut buf, true).unwrap();
        let prefix: Ipv4Network = "10.0.1.0/24".parse().unwrap();
        assert_eq!(
            nlris,
            vec![
                Nlri {
                    prefix,
                    path_id: Some(7)
                },
                Nlri {
                    prefix,
                    path_id: Some(8)
                },
            ]
        );
    }

    #[test]
    fn host_bits_are_masked() {
        let mut buf = Bytes::from_static(&[0x10, 0x0a, 0x01]);
        let nlris = Ipv4Unicast::parse(&mut buf, false).unwrap();
        assert_eq!(nlris[0].prefix, "10.1.0.0/16".parse().unwrap());
    }

    #[test]
    fn truncated_prefix_is_rejected() {
        let mut buf = Bytes::from_static(&[0x18, 0x0a]);
        assert!(Ipv4Unicast::parse(&mut buf, false).is_err());

        let mut buf = Bytes::from_static(&[0x81]);
        assert!(Ipv6Unicast::parse(&mut buf, false).is_err());
    }

    #[test]
    fn ebgp_nexthop_self() {
        let mut attrs = BaseAttrs {
            origin: crate::packet::consts::Origin::Igp,
            as_path: Default::default(),
            as4_path: None,
            nexthop: Some("10.0.0.1".parse().unwrap()),
            ll_nexthop: Some("fe80::1".parse().unwrap()),
            med: None,
            local_pref: None,
            aggregator: None,
            as4_aggregator: None,
            atomic_aggregate: false,
            originator_id: None,
            cluster_list: None,
        };
        let local: IpAddr = "192.0.2.1".parse().unwrap();

        Ipv4Unicast::nexthop_tx_change(local, PeerType::Internal, &mut attrs);
        assert_eq!(attrs.nexthop, Some("10.0.0.1".parse().unwrap()));

        Ipv6Unicast::nexthop_tx_change(local, PeerType::External, &mut attrs);
        assert_eq!(attrs.nexthop, Some("::ffff:192.0.2.1".parse().unwrap()));
        assert_eq!(attrs.ll_nexthop, None);
    }
}
