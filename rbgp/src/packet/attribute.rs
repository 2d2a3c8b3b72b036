//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_new::new;
use num_traits::FromPrimitive;
use rbgp_utils::bytes::{BytesExt, BytesMutExt};
use rbgp_utils::ip::Ipv4AddrExt;
use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::neighbor::PeerType;
use crate::packet::consts::{
    AS_TRANS, AsPathSegmentType, AttrFlags, AttrType, Origin,
    WellKnownCommunities,
};
use crate::packet::error::{AttrError, UpdateMessageError};
use crate::packet::message::{
    DecodeCxt, EncodeCxt, MpReachNlri, MpUnreachNlri, ReachNlri,
};

pub const ATTR_MIN_LEN: u16 = 3;
pub const ATTR_MIN_LEN_EXT: u16 = 4;

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Attrs {
    pub base: BaseAttrs,
    pub comm: Option<Comms>,
    pub unknown: Vec<UnknownAttr>,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct BaseAttrs {
    pub origin: Origin,
    pub as_path: AsPath,
    pub as4_path: Option<AsPath>,
    pub nexthop: Option<IpAddr>,
    pub ll_nexthop: Option<Ipv6Addr>,
    pub med: Option<u32>,
    pub local_pref: Option<u32>,
    pub aggregator: Option<Aggregator>,
    pub as4_aggregator: Option<Aggregator>,
    pub atomic_aggregate: bool,
    pub originator_id: Option<Ipv4Addr>,
    pub cluster_list: Option<ClusterList>,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct AsPath {
    pub segments: VecDeque<AsPathSegment>,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct AsPathSegment {
    pub seg_type: AsPathSegmentType,
    pub members: VecDeque<u32>,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Aggregator {
    pub asn: u32,
    pub identifier: Ipv4Addr,
}

// CLUSTER_LIST attribute. The most recently prepended cluster comes first.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct ClusterList(pub VecDeque<Ipv4Addr>);

// Re-exports for convenience.
pub type Comm = rbgp_utils::bgp::Comm;

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct CommList<T: CommType>(pub BTreeSet<T>);

pub trait CommType:
    Clone + std::fmt::Debug + Eq + std::hash::Hash + Ord + PartialEq + PartialOrd
{
    const TYPE: AttrType;
    const LENGTH: usize;

    fn encode(&self, buf: &mut BytesMut);
    fn decode(buf: &mut Bytes) -> Result<Self, AttrError>;
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct UnknownAttr {
    pub attr_type: u8,
    pub flags: AttrFlags,
    pub length: u16,
    pub value: Bytes,
}

// Useful type definitions.
pub type Comms = CommList<Comm>;

// ===== impl Attrs =====

impl Attrs {
    pub(crate) fn encode(
        &self,
        buf: &mut BytesMut,
        reach: &Option<ReachNlri>,
        cxt: &EncodeCxt,
    ) {
        let four_byte_asn_cap = cxt.four_byte_asn();

        // RFC 4271 - Section 5:
        // "The sender of an UPDATE message SHOULD order path attributes within
        // the UPDATE message in ascending order of attribute type".

        // ORIGIN attribute.
        origin::encode(self.base.origin, buf);

        // AS_PATH attribute.
        self.base.as_path.encode(
            buf,
            AttrFlags::TRANSITIVE,
            AttrType::AsPath,
            four_byte_asn_cap,
        );

        // NEXT_HOP attribute.
        if let Some(reach) = reach {
            nexthop::encode(reach.nexthop, buf);
        }

        // MULTI_EXIT_DISC attribute.
        if let Some(metric) = self.base.med {
            med::encode(metric, buf);
        }

        // LOCAL_PREF attribute.
        if let Some(local_pref) = self.base.local_pref {
            local_pref::encode(local_pref, buf);
        }

        // ATOMIC_AGGREGATE attribute.
        if self.base.atomic_aggregate {
            atomic_aggregate::encode(buf);
        }

        // AGGREGATOR attribute.
        if let Some(aggregator) = &self.base.aggregator {
            aggregator.encode(
                buf,
                AttrFlags::TRANSITIVE | AttrFlags::OPTIONAL,
                AttrType::Aggregator,
                four_byte_asn_cap,
            );
        }

        // COMMUNITIES attribute.
        if let Some(comm) = &self.comm {
            comm.encode(buf);
        }

        // ORIGINATOR_ID attribute.
        if let Some(originator_id) = self.base.originator_id {
            originator_id::encode(originator_id, buf);
        }

        // CLUSTER_LIST attribute.
        if let Some(cluster_list) = &self.base.cluster_list {
            cluster_list.encode(buf);
        }

        // AS4_PATH attribute.
        if let Some(as4_path) = &self.base.as4_path {
            as4_path.encode(
                buf,
                AttrFlags::TRANSITIVE | AttrFlags::OPTIONAL,
                AttrType::As4Path,
                true,
            );
        }

        // AS4_AGGREGATOR attribute.
        if let Some(as4_aggregator) = &self.base.as4_aggregator {
            as4_aggregator.encode(
                buf,
                AttrFlags::TRANSITIVE | AttrFlags::OPTIONAL,
                AttrType::As4Aggregator,
                true,
            );
        }

        // Unrecognized optional transitive attributes.
        for attr in &self.unknown {
            attr.encode(buf);
        }
    }

    pub(crate) fn decode(
        buf: &mut Bytes,
        cxt: &DecodeCxt,
        nexthop: &mut Option<Ipv4Addr>,
        nlri_present: bool,
        mp_unreach: &mut Option<MpUnreachNlri>,
        mp_reach: &mut Option<MpReachNlri>,
    ) -> Result<Option<Self>, UpdateMessageError> {
        let mut origin = None;
        let mut as_path = None;
        let mut as4_path = None;
        let mut med = None;
        let mut local_pref = None;
        let mut aggregator = None;
        let mut as4_aggregator = None;
        let mut atomic_aggregate = false;
        let mut originator_id = None;
        let mut cluster_list = None;
        let mut comm = None;
        let mut unknown = vec![];
        let mut withdraw = false;

        let four_byte_asn_cap = cxt.four_byte_asn();

        // List of parsed attributes.
        let mut attr_list = HashSet::new();

        // Parse attributes.
        while buf.remaining() > 0 {
            // Parse attribute header. A truncated header makes the rest of
            // the attribute list unusable.
            let Ok((mut attr_flags, attr_type_raw, mut buf)) =
                attribute_header(buf)
            else {
                withdraw = true;
                break;
            };
            let attr_type = AttrType::from_u8(attr_type_raw);

            // RFC 7606 - Section 3.c:
            // "If the value of either the Optional or Transitive bits in the
            // Attribute Flags is in conflict with their specified values, then
            // the attribute MUST be treated as malformed and the
            // "treat-as-withdraw" approach used".
            if let Some(attr_type) = attr_type
                && (attr_flags & (AttrFlags::OPTIONAL | AttrFlags::TRANSITIVE))
                    != attribute_flags(attr_type)
            {
                withdraw = true;
                continue;
            }

            // RFC 7606 - Section 3.g:
            // "If the MP_REACH_NLRI attribute or the MP_UNREACH_NLRI attribute
            // appears more than once in the UPDATE message, then a NOTIFICATION
            // message MUST be sent with the Error Subcode "Malformed Attribute
            // List". If any other attribute (whether recognized or
            // unrecognized) appears more than once in an UPDATE message, then
            // all the occurrences of the attribute other than the first one
            // SHALL be discarded and the UPDATE message will continue to be
            // processed".
            if !attr_list.insert(attr_type_raw) {
                if matches!(
                    attr_type,
                    Some(AttrType::MpReachNlri | AttrType::MpUnreachNlri)
                ) {
                    return Err(UpdateMessageError::MalformedAttributeList);
                } else {
                    continue;
                }
            }

            // Parse attribute value.
            match attr_type {
                // Known attribute.
                Some(attr_type) => {
                    if let Err(error) = match attr_type {
                        AttrType::Origin => {
                            origin::decode(&mut buf, &mut origin)
                        }
                        AttrType::AsPath => AsPath::decode(
                            &mut buf,
                            cxt,
                            attr_type,
                            four_byte_asn_cap,
                            &mut as_path,
                        ),
                        AttrType::Nexthop => nexthop::decode(&mut buf, nexthop),
                        AttrType::Med => med::decode(&mut buf, &mut med),
                        AttrType::LocalPref => {
                            local_pref::decode(&mut buf, cxt, &mut local_pref)
                        }
                        AttrType::AtomicAggregate => atomic_aggregate::decode(
                            &mut buf,
                            &mut atomic_aggregate,
                        ),
                        AttrType::Aggregator => Aggregator::decode(
                            &mut buf,
                            attr_type,
                            four_byte_asn_cap,
                            &mut aggregator,
                        ),
                        AttrType::Communities => {
                            Comms::decode(&mut buf, &mut comm)
                        }
                        AttrType::OriginatorId => originator_id::decode(
                            &mut buf,
                            cxt,
                            &mut originator_id,
                        ),
                        AttrType::ClusterList => ClusterList::decode(
                            &mut buf,
                            cxt,
                            &mut cluster_list,
                        ),
                        AttrType::MpReachNlri => {
                            MpReachNlri::decode(&mut buf, cxt, mp_reach)
                        }
                        AttrType::MpUnreachNlri => {
                            MpUnreachNlri::decode(&mut buf, cxt, mp_unreach)
                        }
                        AttrType::As4Path => AsPath::decode(
                            &mut buf,
                            cxt,
                            attr_type,
                            four_byte_asn_cap,
                            &mut as4_path,
                        ),
                        AttrType::As4Aggregator => Aggregator::decode(
                            &mut buf,
                            attr_type,
                            four_byte_asn_cap,
                            &mut as4_aggregator,
                        ),
                    } {
                        // Log malformed attribute.
                        Debug::NbrAttrError(attr_type, error).log();

                        // Process malformed attribute.
                        match error {
                            AttrError::Discard => continue,
                            AttrError::Withdraw => withdraw = true,
                            AttrError::Reset => {
                                return Err(
                                    UpdateMessageError::OptionalAttributeError,
                                );
                            }
                        }
                    }
                }
                // Unknown attribute.
                None => {
                    // RFC 4271 - Section 6.3:
                    // "If any of the well-known mandatory attributes are not
                    // recognized, then the Error Subcode MUST be set to
                    // Unrecognized Well-known Attribute".
                    if !attr_flags.contains(AttrFlags::OPTIONAL) {
                        return Err(
                            UpdateMessageError::UnrecognizedWellKnownAttribute,
                        );
                    }

                    // RFC 4271 - Section 9:
                    // "If an optional non-transitive attribute is unrecognized,
                    // it is quietly ignored".
                    if !attr_flags.contains(AttrFlags::TRANSITIVE) {
                        continue;
                    }

                    // RFC 4271 - Section 9:
                    // "If an optional transitive attribute is unrecognized, the
                    // Partial bit in the attribute flags octet is set to 1, and
                    // the attribute is retained for propagation to other BGP
                    // speakers".
                    attr_flags.insert(AttrFlags::PARTIAL);
                    let attr_len = buf.len() as u16;
                    unknown.push(UnknownAttr::new(
                        attr_type_raw,
                        attr_flags,
                        attr_len,
                        buf,
                    ));
                }
            }
        }

        // Check for missing well-known attributes.
        //
        // RFC 7606 - Section 3.d:
        // "If any of the well-known mandatory attributes are not present in
        //  an UPDATE message, then "treat-as-withdraw" MUST be used".
        let mut attrs = None;
        if !withdraw
            && let Some(origin) = origin
            && let Some(as_path) = as_path
            && (local_pref.is_some() || cxt.peer_type == PeerType::External)
            && (nexthop.is_some() || !nlri_present)
        {
            attrs = Some(Attrs {
                base: BaseAttrs {
                    origin,
                    as_path,
                    as4_path,
                    nexthop: None,
                    ll_nexthop: None,
                    med,
                    local_pref,
                    aggregator,
                    as4_aggregator,
                    atomic_aggregate,
                    originator_id,
                    cluster_list,
                },
                comm,
                unknown,
            });
        }
        Ok(attrs)
    }

    // Encoded length of all attributes, not counting NEXT_HOP and the
    // multiprotocol attributes.
    pub(crate) fn length(&self) -> u16 {
        let mut length = 0;

        length += origin::length();
        length += self.base.as_path.length();
        if self.base.med.is_some() {
            length += med::length();
        }
        if self.base.local_pref.is_some() {
            length += local_pref::length();
        }
        if self.base.atomic_aggregate {
            length += atomic_aggregate::length();
        }
        if let Some(aggregator) = &self.base.aggregator {
            length += aggregator.length();
        }
        if let Some(comm) = &self.comm {
            length += comm.length();
        }
        if self.base.originator_id.is_some() {
            length += originator_id::length();
        }
        if let Some(cluster_list) = &self.base.cluster_list {
            length += cluster_list.length();
        }
        if let Some(as4_path) = &self.base.as4_path {
            length += as4_path.length();
        }
        if let Some(as4_aggregator) = &self.base.as4_aggregator {
            length += as4_aggregator.length();
        }
        length += self.unknown.iter().map(|attr| attr.length()).sum::<u16>();

        length
    }

    // Returns whether the given well-known community is attached.
    pub(crate) fn has_community(&self, community: WellKnownCommunities) -> bool {
        self.comm
            .as_ref()
            .is_some_and(|comm| comm.iter().any(|c| c.is(community)))
    }
}

// ===== ORIGIN attribute =====

mod origin {
    use super::*;
    const LEN: u8 = 1;

    pub(super) fn encode(origin: Origin, buf: &mut BytesMut) {
        buf.put_u8(AttrFlags::TRANSITIVE.bits());
        buf.put_u8(AttrType::Origin as u8);
        buf.put_u8(LEN);
        buf.put_u8(origin as u8);
    }

    pub(super) fn decode(
        buf: &mut Bytes,
        origin: &mut Option<Origin>,
    ) -> Result<(), AttrError> {
        if buf.remaining() != LEN as usize {
            return Err(AttrError::Withdraw);
        }

        let value = buf.try_get_u8()?;
        match Origin::from_u8(value) {
            Some(value) => {
                *origin = Some(value);
                Ok(())
            }
            None => Err(AttrError::Withdraw),
        }
    }

    pub(super) fn length() -> u16 {
        ATTR_MIN_LEN + LEN as u16
    }
}

// ===== impl AsPath =====

impl AsPath {
    fn encode(
        &self,
        buf: &mut BytesMut,
        mut attr_flags: AttrFlags,
        attr_type: AttrType,
        four_byte_asns: bool,
    ) {
        attr_flags.insert(AttrFlags::EXTENDED);
        buf.put_u8(attr_flags.bits());
        buf.put_u8(attr_type as u8);

        // The length field will be initialized later.
        let start_pos = buf.len();
        buf.put_u16(0);

        // Encode attribute data.
        for segment in &self.segments {
            segment.encode(buf, four_byte_asns);
        }

        // Rewrite attribute length.
        let attr_len = (buf.len() - start_pos - 2) as u16;
        buf[start_pos..start_pos + 2].copy_from_slice(&attr_len.to_be_bytes());
    }

    fn decode(
        buf: &mut Bytes,
        cxt: &DecodeCxt,
        attr_type: AttrType,
        four_byte_asn_cap: bool,
        as_path: &mut Option<AsPath>,
    ) -> Result<(), AttrError> {
        if attr_type == AttrType::As4Path && four_byte_asn_cap {
            return Err(AttrError::Discard);
        }

        let four_byte_asns =
            four_byte_asn_cap || attr_type == AttrType::As4Path;

        // Decode AS Path segments.
        let mut segments = VecDeque::new();
        while buf.remaining() > 0 {
            let segment =
                AsPathSegment::decode(buf, attr_type, four_byte_asns)?;
            segments.push_back(segment);
        }
        let value = AsPath { segments };

        // First AS check for eBGP peers.
        if attr_type == AttrType::AsPath
            && cxt.peer_type == PeerType::External
            && value
                .segments
                .iter()
                .find(|segment| segment.seg_type == AsPathSegmentType::Sequence)
                .and_then(|segment| segment.members.front().copied())
                != Some(cxt.peer_as)
        {
            return Err(AttrError::Withdraw);
        }

        *as_path = Some(value);
        Ok(())
    }

    pub(super) fn length(&self) -> u16 {
        ATTR_MIN_LEN_EXT
            + self
                .segments
                .iter()
                .map(|segment| segment.length())
                .sum::<u16>()
    }

    // Number of ASes counted by the decision process. An AS_SET counts as a
    // single hop regardless of its size.
    pub(crate) fn path_length(&self) -> u32 {
        self.segments
            .iter()
            .map(|segment| match segment.seg_type {
                AsPathSegmentType::Set => 1,
                AsPathSegmentType::Sequence => segment.members.len(),
                // RFC 5065 - Section 5.3:
                // "When comparing routes using AS_PATH length, CONFED_SEQUENCE
                // and CONFED_SETs SHOULD NOT be counted".
                AsPathSegmentType::ConfedSequence
                | AsPathSegmentType::ConfedSet => 0,
            })
            .sum::<usize>() as u32
    }

    // Neighboring AS, as used for MED comparability.
    pub(crate) fn first(&self) -> Option<u32> {
        self.segments
            .front()
            .filter(|segment| segment.seg_type == AsPathSegmentType::Sequence)
            .and_then(|segment| segment.members.front().copied())
    }

    pub(crate) fn prepend(&mut self, asn: u32) {
        if let Some(segment) = self.segments.front_mut()
            && segment.seg_type == AsPathSegmentType::Sequence
            && segment.members.len() < 255
        {
            segment.members.push_front(asn);
        } else {
            self.segments.push_front(AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: [asn].into(),
            });
        }
    }

    pub(crate) fn contains(&self, asn: u32) -> bool {
        self.segments.iter().any(|segment| segment.contains(asn))
    }
}

impl AsPathSegment {
    const MIN_LEN: u16 = 2;

    fn encode(&self, buf: &mut BytesMut, four_byte_asns: bool) {
        buf.put_u8(self.seg_type as u8);
        buf.put_u8(self.members.len() as u8);
        for member in &self.members {
            encode_asn(buf, *member, four_byte_asns);
        }
    }

    fn decode(
        buf: &mut Bytes,
        attr_type: AttrType,
        four_byte_asns: bool,
    ) -> Result<Self, AttrError> {
        let malformed = if attr_type == AttrType::AsPath {
            AttrError::Withdraw
        } else {
            AttrError::Discard
        };

        // Decode segment type.
        let seg_type = buf.try_get_u8().map_err(|_| malformed)?;
        let Some(seg_type) = AsPathSegmentType::from_u8(seg_type) else {
            return Err(malformed);
        };

        // Decode segment length.
        let seg_len = buf.try_get_u8().map_err(|_| malformed)?;
        if seg_len == 0 {
            return Err(malformed);
        }

        // Decode segment members.
        let members = (0..seg_len as usize)
            .map(|_| decode_asn(buf, four_byte_asns))
            .collect::<Result<VecDeque<_>, _>>()
            .map_err(|_| malformed)?;
        let segment = AsPathSegment { seg_type, members };

        // RFC 7607's AS 0 processing.
        if segment.contains(0) {
            return Err(malformed);
        }

        Ok(segment)
    }

    pub(super) fn length(&self) -> u16 {
        // Assume four-byte ASNs for practical purposes.
        Self::MIN_LEN + self.members.len() as u16 * 4
    }

    fn contains(&self, asn: u32) -> bool {
        self.members.iter().any(|member| asn == *member)
    }
}

// ===== NEXT_HOP attribute =====

pub(crate) mod nexthop {
    use super::*;
    const LEN: u8 = 4;

    pub(super) fn encode(addr: Ipv4Addr, buf: &mut BytesMut) {
        buf.put_u8(AttrFlags::TRANSITIVE.bits());
        buf.put_u8(AttrType::Nexthop as u8);
        buf.put_u8(LEN);
        buf.put_ipv4(&addr);
    }

    pub(super) fn decode(
        buf: &mut Bytes,
        nexthop: &mut Option<Ipv4Addr>,
    ) -> Result<(), AttrError> {
        if buf.remaining() != LEN as usize {
            return Err(AttrError::Withdraw);
        }

        let value = buf.try_get_ipv4()?;
        *nexthop = Some(value);
        Ok(())
    }

    pub(crate) fn length() -> u16 {
        ATTR_MIN_LEN + LEN as u16
    }
}

// ===== MULTI_EXIT_DISC attribute =====

mod med {
    use super::*;
    const LEN: u8 = 4;

    pub(super) fn encode(metric: u32, buf: &mut BytesMut) {
        buf.put_u8(AttrFlags::OPTIONAL.bits());
        buf.put_u8(AttrType::Med as u8);
        buf.put_u8(LEN);
        buf.put_u32(metric);
    }

    pub(super) fn decode(
        buf: &mut Bytes,
        med: &mut Option<u32>,
    ) -> Result<(), AttrError> {
        if buf.remaining() != LEN as usize {
            return Err(AttrError::Withdraw);
        }

        let value = buf.try_get_u32()?;
        *med = Some(value);
        Ok(())
    }

    pub(super) fn length() -> u16 {
        ATTR_MIN_LEN + LEN as u16
    }
}

// ===== LOCAL_PREF attribute =====

mod local_pref {
    use super::*;
    const LEN: u8 = 4;

    pub(super) fn encode(local_pref: u32, buf: &mut BytesMut) {
        buf.put_u8(AttrFlags::TRANSITIVE.bits());
        buf.put_u8(AttrType::LocalPref as u8);
        buf.put_u8(LEN);
        buf.put_u32(local_pref);
    }

    pub(super) fn decode(
        buf: &mut Bytes,
        cxt: &DecodeCxt,
        local_pref: &mut Option<u32>,
    ) -> Result<(), AttrError> {
        if cxt.peer_type == PeerType::External {
            return Err(AttrError::Discard);
        }

        if buf.remaining() != LEN as usize {
            return Err(AttrError::Withdraw);
        }

        let value = buf.try_get_u32()?;
        *local_pref = Some(value);
        Ok(())
    }

    pub(super) fn length() -> u16 {
        ATTR_MIN_LEN + LEN as u16
    }
}

// ===== ATOMIC_AGGREGATE attribute =====

mod atomic_aggregate {
    use super::*;
    const LEN: u8 = 0;

    pub(super) fn encode(buf: &mut BytesMut) {
        buf.put_u8(AttrFlags::TRANSITIVE.bits());
        buf.put_u8(AttrType::AtomicAggregate as u8);
        buf.put_u8(LEN);
    }

    pub(super) fn decode(
        buf: &mut Bytes,
        atomic_aggregate: &mut bool,
    ) -> Result<(), AttrError> {
        if buf.remaining() != LEN as usize {
            return Err(AttrError::Discard);
        }

        *atomic_aggregate = true;
        Ok(())
    }

    pub(super) fn length() -> u16 {
        ATTR_MIN_LEN + LEN as u16
    }
}

// ===== impl Aggregator =====

impl Aggregator {
    fn encode(
        &self,
        buf: &mut BytesMut,
        attr_flags: AttrFlags,
        attr_type: AttrType,
        four_byte_asns: bool,
    ) {
        buf.put_u8(attr_flags.bits());
        buf.put_u8(attr_type as u8);

        // The length field will be initialized later.
        let start_pos = buf.len();
        buf.put_u8(0);

        // Encode attribute data.
        encode_asn(buf, self.asn, four_byte_asns);
        buf.put_ipv4(&self.identifier);

        // Rewrite attribute length.
        let attr_len = buf.len() - start_pos - 1;
        buf[start_pos] = attr_len as u8;
    }

    fn decode(
        buf: &mut Bytes,
        attr_type: AttrType,
        four_byte_asn_cap: bool,
        aggregator: &mut Option<Self>,
    ) -> Result<(), AttrError> {
        if attr_type == AttrType::As4Aggregator && four_byte_asn_cap {
            return Err(AttrError::Discard);
        }

        let four_byte_asns =
            four_byte_asn_cap || attr_type == AttrType::As4Aggregator;
        let len = if four_byte_asns { 8 } else { 6 };
        if buf.remaining() != len {
            return Err(AttrError::Discard);
        }

        let asn = decode_asn(buf, four_byte_asns)?;
        let identifier = buf.try_get_ipv4()?;

        // RFC 7607's AS 0 processing.
        if asn == 0 {
            return Err(AttrError::Discard);
        }

        *aggregator = Some(Aggregator { asn, identifier });
        Ok(())
    }

    pub(super) fn length(&self) -> u16 {
        // Assume four-byte ASN for practical purposes.
        ATTR_MIN_LEN + 4 + Ipv4Addr::LENGTH as u16
    }
}

// ===== ORIGINATOR_ID attribute =====

mod originator_id {
    use super::*;
    const LEN: u8 = 4;

    pub(super) fn encode(originator_id: Ipv4Addr, buf: &mut BytesMut) {
        buf.put_u8(AttrFlags::OPTIONAL.bits());
        buf.put_u8(AttrType::OriginatorId as u8);
        buf.put_u8(LEN);
        buf.put_ipv4(&originator_id);
    }

    pub(super) fn decode(
        buf: &mut Bytes,
        cxt: &DecodeCxt,
        originator_id: &mut Option<Ipv4Addr>,
    ) -> Result<(), AttrError> {
        if cxt.peer_type == PeerType::External {
            return Err(AttrError::Discard);
        }

        if buf.remaining() != LEN as usize {
            return Err(AttrError::Withdraw);
        }

        let value = buf.try_get_ipv4()?;
        *originator_id = Some(value);
        Ok(())
    }

    pub(super) fn length() -> u16 {
        ATTR_MIN_LEN + LEN as u16
    }
}

// ===== impl ClusterList =====

impl ClusterList {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((AttrFlags::OPTIONAL | AttrFlags::EXTENDED).bits());
        buf.put_u8(AttrType::ClusterList as u8);

        // The length field will be initialized later.
        let start_pos = buf.len();
        buf.put_u16(0);

        // Encode attribute data.
        for cluster_id in &self.0 {
            buf.put_ipv4(cluster_id);
        }

        // Rewrite attribute length.
        let attr_len = (buf.len() - start_pos - 2) as u16;
        buf[start_pos..start_pos + 2].copy_from_slice(&attr_len.to_be_bytes());
    }

    fn decode(
        buf: &mut Bytes,
        cxt: &DecodeCxt,
        cluster_list: &mut Option<Self>,
    ) -> Result<(), AttrError> {
        if cxt.peer_type == PeerType::External {
            return Err(AttrError::Discard);
        }

        if buf.remaining() == 0 || buf.remaining() % 4 != 0 {
            return Err(AttrError::Withdraw);
        }

        let mut list = VecDeque::new();
        while buf.remaining() > 0 {
            let cluster_id = buf.try_get_ipv4()?;
            list.push_back(cluster_id);
        }

        *cluster_list = Some(ClusterList(list));
        Ok(())
    }

    fn length(&self) -> u16 {
        ATTR_MIN_LEN_EXT + (self.0.len() * Ipv4Addr::LENGTH) as u16
    }

    pub(crate) fn contains(&self, cluster_id: Ipv4Addr) -> bool {
        self.0.contains(&cluster_id)
    }

    pub(crate) fn prepend(&mut self, cluster_id: Ipv4Addr) {
        self.0.push_front(cluster_id);
    }
}

// ===== impl Comm =====

impl CommType for Comm {
    const TYPE: AttrType = AttrType::Communities;
    const LENGTH: usize = 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.0);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, AttrError> {
        let value = buf.try_get_u32()?;
        Ok(Self(value))
    }
}

// ===== impl CommList =====

impl<T: CommType> CommList<T> {
    fn encode(&self, buf: &mut BytesMut) {
        let attr_flags =
            AttrFlags::TRANSITIVE | AttrFlags::OPTIONAL | AttrFlags::EXTENDED;
        buf.put_u8(attr_flags.bits());
        buf.put_u8(T::TYPE as u8);

        // The length field will be initialized later.
        let start_pos = buf.len();
        buf.put_u16(0);

        // Encode attribute data.
        for value in &self.0 {
            value.encode(buf);
        }

        // Rewrite attribute length.
        let attr_len = (buf.len() - start_pos - 2) as u16;
        buf[start_pos..start_pos + 2].copy_from_slice(&attr_len.to_be_bytes());
    }

    fn decode(
        buf: &mut Bytes,
        comm: &mut Option<Self>,
    ) -> Result<(), AttrError> {
        if buf.remaining() == 0 || buf.remaining() % T::LENGTH != 0 {
            return Err(AttrError::Withdraw);
        }

        let mut list = BTreeSet::new();
        while buf.remaining() >= T::LENGTH {
            let value = T::decode(buf)?;
            list.insert(value);
        }

        *comm = Some(CommList(list));
        Ok(())
    }

    fn length(&self) -> u16 {
        ATTR_MIN_LEN_EXT + (self.0.len() * T::LENGTH) as u16
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }
}

// ===== impl UnknownAttr =====

impl UnknownAttr {
    fn encode(&self, buf: &mut BytesMut) {
        let mut flags = self.flags;
        let extended = self.value.len() > u8::MAX as usize;
        flags.set(AttrFlags::EXTENDED, extended);
        buf.put_u8(flags.bits());
        buf.put_u8(self.attr_type);
        if extended {
            buf.put_u16(self.value.len() as u16);
        } else {
            buf.put_u8(self.value.len() as u8);
        }
        buf.put_slice(&self.value);
    }

    fn length(&self) -> u16 {
        let hdr_len = if self.value.len() > u8::MAX as usize {
            ATTR_MIN_LEN_EXT
        } else {
            ATTR_MIN_LEN
        };
        hdr_len + self.value.len() as u16
    }
}

// ===== helper functions =====

// Splits off the next attribute, returning its flags, raw type and value.
fn attribute_header(
    buf: &mut Bytes,
) -> Result<(AttrFlags, u8, Bytes), bytes::TryGetError> {
    let attr_flags = AttrFlags::from_bits_truncate(buf.try_get_u8()?);
    let attr_type = buf.try_get_u8()?;
    let attr_len = if attr_flags.contains(AttrFlags::EXTENDED) {
        buf.try_get_u16()? as usize
    } else {
        buf.try_get_u8()? as usize
    };
    let value = buf.try_split_to(attr_len)?;
    Ok((attr_flags, attr_type, value))
}

fn attribute_flags(attr_type: AttrType) -> AttrFlags {
    match attr_type {
        // Well-known.
        AttrType::Origin
        | AttrType::AsPath
        | AttrType::Nexthop
        | AttrType::LocalPref
        | AttrType::AtomicAggregate => AttrFlags::TRANSITIVE,

        // Optional non-transitive.
        AttrType::Med
        | AttrType::OriginatorId
        | AttrType::ClusterList
        | AttrType::MpReachNlri
        | AttrType::MpUnreachNlri => AttrFlags::OPTIONAL,

        // Optional transitive.
        AttrType::Aggregator
        | AttrType::Communities
        | AttrType::As4Path
        | AttrType::As4Aggregator => AttrFlags::TRANSITIVE | AttrFlags::OPTIONAL,
    }
}

fn encode_asn(buf: &mut BytesMut, asn: u32, four_byte_asns: bool) {
    if four_byte_asns {
        buf.put_u32(asn)
    } else {
        // RFC 6793: ASNs that don't fit in two octets are replaced by AS_TRANS.
        buf.put_u16(u16::try_from(asn).unwrap_or(AS_TRANS))
    }
}

fn decode_asn(
    buf: &mut Bytes,
    four_byte_asns: bool,
) -> Result<u32, AttrError> {
    let asn = if four_byte_asns {
        buf.try_get_u32()?
    } else {
        buf.try_get_u16()? as u32
    };
    Ok(asn)
}

// ===== unit tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[(AsPathSegmentType, &[u32])]) -> AsPath {
        AsPath {
            segments: segments
                .iter()
                .map(|(seg_type, members)| AsPathSegment {
                    seg_type: *seg_type,
                    members: members.iter().copied().collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn as_set_counts_as_one_hop() {
        let as_path = path(&[
            (AsPathSegmentType::Sequence, &[1, 2, 3]),
            (AsPathSegmentType::Set, &[4, 5, 6, 7]),
        ]);
        assert_eq!(as_path.path_length(), 4);
        assert_eq!(as_path.first(), Some(1));
    }

    #[test]
    fn prepend_merges_into_leading_sequence() {
        let mut as_path = path(&[(AsPathSegmentType::Sequence, &[2, 3])]);
        as_path.prepend(1);
        assert_eq!(as_path, path(&[(AsPathSegmentType::Sequence, &[1, 2, 3])]));
    }

    #[test]
    fn prepend_before_leading_set_adds_segment() {
        let mut as_path = path(&[(AsPathSegmentType::Set, &[2, 3])]);
        as_path.prepend(1);
        assert_eq!(
            as_path,
            path(&[
                (AsPathSegmentType::Sequence, &[1]),
                (AsPathSegmentType::Set, &[2, 3]),
            ])
        );
        assert_eq!(as_path.first(), Some(1));
    }

    #[test]
    fn leading_set_has_no_neighbor_as() {
        let as_path = path(&[(AsPathSegmentType::Set, &[2, 3])]);
        assert_eq!(as_path.first(), None);
    }

    #[test]
    fn cluster_list_keeps_order() {
        let mut list = ClusterList(
            [Ipv4Addr::new(2, 2, 2, 2), Ipv4Addr::new(1, 1, 1, 1)].into(),
        );
        list.prepend(Ipv4Addr::new(3, 3, 3, 3));
        assert_eq!(
            list.0.iter().copied().collect::<Vec<_>>(),
            vec![
                Ipv4Addr::new(3, 3, 3, 3),
                Ipv4Addr::new(2, 2, 2, 2),
                Ipv4Addr::new(1, 1, 1, 1),
            ]
        );
        assert!(list.contains(Ipv4Addr::new(1, 1, 1, 1)));
    }
}
