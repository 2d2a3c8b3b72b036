//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::packet::consts::{CeaseSubcode, ErrorCode, OpenMessageErrorSubcode};
use crate::packet::message::{NotificationMsg, OpenMsg};

// Registry of configured peers and their live sessions.
//
// Cloning the registry yields another handle to the same table. Every
// admission decision is taken under a single lock, so two connections from
// the same peer can never both be admitted.
#[derive(Clone, Debug, Default)]
pub struct PeerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    peers: BTreeMap<IpAddr, PeerEntry>,
}

#[derive(Debug)]
struct PeerEntry {
    prefs: PeerPrefs,
    session: Option<SessionId>,
}

// Parameters an incoming OPEN is validated against.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PeerPrefs {
    pub local_as: u32,
    pub local_id: Ipv4Addr,
    pub peer_as: u32,
    // The peer must advertise the 4-octet AS capability.
    pub four_byte_asn: bool,
}

// Identity of one session: the BGP identifier of the side that opened the
// connection, the one of the side that accepted it, and the AS of the side
// that opened it.
//
// Two sessions are the same when they join the same pair of speakers,
// whichever side initiated them.
#[derive(Clone, Copy, Debug)]
#[derive(Deserialize, Serialize)]
pub struct SessionId {
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
    pub asn: u32,
}

// Outcome of a successful admission.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Admission {
    Accepted,
    // The new connection wins a collision. The existing session must be
    // closed before the new one proceeds.
    DroppedPrevious,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RegistryError {
    // The new connection loses a collision.
    Dropped,
    // Same session initiated from the same side twice.
    Duplicate,
    // Known peer reconnecting with different identifiers.
    IdentifierMismatch,
    BadPeerAs(u32),
    BadBgpId(Ipv4Addr),
    UnsupportedCapability,
    NotConfigured,
}

// ===== impl PeerRegistry =====

impl PeerRegistry {
    // Registers (or updates) the preferences for a peer. An existing
    // session is left untouched.
    pub fn add_peer(&self, addr: IpAddr, prefs: PeerPrefs) {
        let mut inner = self.lock();
        inner
            .peers
            .entry(addr)
            .and_modify(|entry| entry.prefs = prefs)
            .or_insert(PeerEntry {
                prefs,
                session: None,
            });
    }

    pub fn remove_peer(&self, addr: &IpAddr) {
        self.lock().peers.remove(addr);
    }

    // Forgets the live session of a peer, keeping its preferences.
    pub fn remove_peer_session(&self, addr: &IpAddr) {
        if let Some(entry) = self.lock().peers.get_mut(addr) {
            entry.session = None;
        }
    }

    pub fn is_peer_configured(&self, addr: &IpAddr) -> bool {
        self.lock().peers.contains_key(addr)
    }

    pub fn peer_prefs(&self, addr: &IpAddr) -> Result<PeerPrefs, RegistryError> {
        self.lock()
            .peers
            .get(addr)
            .map(|entry| entry.prefs)
            .ok_or(RegistryError::NotConfigured)
    }

    pub fn session(&self, addr: &IpAddr) -> Option<SessionId> {
        self.lock().peers.get(addr).and_then(|entry| entry.session)
    }

    // Decides whether a connection that has just received the peer's OPEN
    // may proceed.
    //
    // With no live session, the OPEN is validated and the session
    // registered. Otherwise the connection that was initiated by the speaker
    // with the higher BGP identifier survives, falling back to the higher AS
    // number. In the `DroppedPrevious` case nothing is registered: the
    // caller closes the previous session and submits the OPEN again.
    pub fn resolve_incoming(
        &self,
        addr: &IpAddr,
        current: SessionId,
        open: &OpenMsg,
    ) -> Result<Admission, RegistryError> {
        let mut inner = self.lock();
        let entry = inner
            .peers
            .get_mut(addr)
            .ok_or(RegistryError::NotConfigured)?;

        if let Some(previous) = entry.session {
            if previous != current {
                return Err(RegistryError::IdentifierMismatch);
            }
            if previous.from > current.from {
                return Err(RegistryError::Dropped);
            }
            if current.from > previous.from {
                entry.session = None;
                return Ok(Admission::DroppedPrevious);
            }
            if previous.asn > current.asn {
                return Err(RegistryError::Dropped);
            }
            if current.asn > previous.asn {
                entry.session = None;
                return Ok(Admission::DroppedPrevious);
            }
            return Err(RegistryError::Duplicate);
        }

        validate_open(&entry.prefs, open)?;
        entry.session = Some(current);
        Ok(Admission::Accepted)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===== impl SessionId =====

impl PartialEq for SessionId {
    fn eq(&self, other: &SessionId) -> bool {
        (self.from == other.from && self.to == other.to)
            || (self.from == other.to && self.to == other.from)
    }
}

impl Eq for SessionId {}

// ===== impl RegistryError =====

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Dropped => {
                write!(f, "connection collision, dropping new connection")
            }
            RegistryError::Duplicate => {
                write!(f, "session already established")
            }
            RegistryError::IdentifierMismatch => {
                write!(f, "session reestablished with different identifiers")
            }
            RegistryError::BadPeerAs(asn) => {
                write!(f, "unexpected peer AS {asn}")
            }
            RegistryError::BadBgpId(identifier) => {
                write!(f, "peer uses the local BGP identifier {identifier}")
            }
            RegistryError::UnsupportedCapability => {
                write!(f, "peer lacks the 4-octet AS capability")
            }
            RegistryError::NotConfigured => {
                write!(f, "peer not configured")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<RegistryError> for NotificationMsg {
    fn from(error: RegistryError) -> NotificationMsg {
        match error {
            RegistryError::Dropped
            | RegistryError::Duplicate
            | RegistryError::IdentifierMismatch => NotificationMsg::new(
                ErrorCode::Cease,
                CeaseSubcode::ConnectionCollisionResolution,
            ),
            RegistryError::NotConfigured => NotificationMsg::new(
                ErrorCode::Cease,
                CeaseSubcode::ConnectionRejected,
            ),
            RegistryError::BadPeerAs(_) => NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::BadPeerAs,
            ),
            RegistryError::BadBgpId(_) => NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::BadBgpIdentifier,
            ),
            RegistryError::UnsupportedCapability => NotificationMsg::new(
                ErrorCode::OpenMessageError,
                OpenMessageErrorSubcode::UnsupportedCapability,
            ),
        }
    }
}

// ===== helper functions =====

fn validate_open(prefs: &PeerPrefs, open: &OpenMsg) -> Result<(), RegistryError> {
    let four_byte_asn = open
        .capabilities
        .iter()
        .any(|cap| cap.is_four_octet_as_number());
    if prefs.four_byte_asn && !four_byte_asn {
        return Err(RegistryError::UnsupportedCapability);
    }

    let remote_as = open.real_as();
    if remote_as != prefs.peer_as {
        return Err(RegistryError::BadPeerAs(remote_as));
    }

    if open.identifier == prefs.local_id {
        return Err(RegistryError::BadBgpId(open.identifier));
    }

    Ok(())
}

// ===== unit tests =====
