//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use crate::af::{AddressFamily, Ipv4Unicast, Ipv6Unicast, Nlri};
use crate::debug::Debug;
use crate::error::{Error, NbrRxError};
use crate::instance::InstanceView;
use crate::neighbor::{Neighbor, Neighbors, fsm};
use crate::network::{ConnDirection, Connection};
use crate::packet::attribute::Attrs;
use crate::packet::message::{
    Message, MpReachNlri, MpUnreachNlri, RouteRefreshMsg, UpdateMsg,
};
use crate::registry::RegistryError;
use crate::rib::table::TableMsg;

// Routes carried by one UPDATE message for a single table.
struct UpdateBatch<A: AddressFamily> {
    reach: Vec<(Attrs, Vec<Nlri<A::Prefix>>)>,
    unreach: Vec<Nlri<A::Prefix>>,
}

// ===== TCP connection request =====

pub(crate) fn process_tcp_accept(
    instance: &mut InstanceView<'_>,
    neighbors: &mut Neighbors,
    conn: Connection,
) -> Result<(), Error> {
    // Lookup neighbor.
    let remote_addr = conn.conn_info.remote_addr;
    let Some(nbr) = neighbors.get_mut(&remote_addr) else {
        Debug::NbrConnRejected(&remote_addr, &RegistryError::NotConfigured)
            .log();
        return Ok(());
    };

    process_connection(instance, nbr, conn, ConnDirection::Inbound);

    Ok(())
}

// ===== TCP connection established =====

pub(crate) fn process_tcp_connect(
    instance: &mut InstanceView<'_>,
    neighbors: &mut Neighbors,
    nbr_addr: IpAddr,
    conn: Connection,
) -> Result<(), Error> {
    // Lookup neighbor.
    let Some(nbr) = neighbors.get_mut(&nbr_addr) else {
        return Ok(());
    };
    nbr.tasks.connect = None;

    process_connection(instance, nbr, conn, ConnDirection::Outbound);

    Ok(())
}

fn process_connection(
    instance: &mut InstanceView<'_>,
    nbr: &mut Neighbor,
    conn: Connection,
    direction: ConnDirection,
) {
    match nbr.state {
        // Connections are refused while the neighbor is stopped.
        fsm::State::Idle => (),
        fsm::State::Connect | fsm::State::Active => {
            // Invoke FSM event.
            nbr.fsm_event(instance, fsm::Event::Connected(conn, direction));
        }
        fsm::State::OpenSent
        | fsm::State::OpenConfirm
        | fsm::State::Established => {
            // Possible collision, settled once the peer's OPEN arrives.
            nbr.pending_setup(instance, conn, direction);
        }
    }
}

// ===== neighbor message receipt =====

pub(crate) fn process_nbr_msg(
    instance: &mut InstanceView<'_>,
    neighbors: &mut Neighbors,
    nbr_addr: IpAddr,
    conn_id: u64,
    msg: Result<Message, NbrRxError>,
) -> Result<(), Error> {
    // Lookup neighbor.
    let Some(nbr) = neighbors.get_mut(&nbr_addr) else {
        return Ok(());
    };

    // Dispatch to the connection the message was read from. Messages from
    // connections that were closed in the meantime are dropped.
    if nbr.conn_id == Some(conn_id) {
        process_nbr_session_msg(instance, nbr, msg);
    } else if nbr
        .pending
        .as_ref()
        .is_some_and(|pending| pending.conn_id == conn_id)
    {
        if let Ok(msg) = &msg {
            Debug::NbrMsgRx(&nbr.remote_addr, msg).log();
            nbr.statistics.msgs_rcvd.update(msg);
        }
        nbr.pending_message(instance, msg);
    }

    Ok(())
}

// Processes a message read from the neighbor's current connection.
pub(crate) fn process_nbr_session_msg(
    instance: &mut InstanceView<'_>,
    nbr: &mut Neighbor,
    msg: Result<Message, NbrRxError>,
) {
    match msg {
        Ok(msg) => {
            Debug::NbrMsgRx(&nbr.remote_addr, &msg).log();

            // Update statistics.
            nbr.statistics.msgs_rcvd.update(&msg);

            match msg {
                Message::Open(msg) => {
                    nbr.fsm_event(instance, fsm::Event::RcvdOpen(msg));
                }
                Message::Update(msg) => {
                    nbr.fsm_event(instance, fsm::Event::RcvdUpdate);
                    if let Err(error) = process_nbr_update(instance, nbr, msg)
                    {
                        error.log();
                    }
                }
                Message::Notification(msg) => {
                    nbr.fsm_event(instance, fsm::Event::RcvdNotif(msg));
                }
                Message::Keepalive(_) => {
                    let established = nbr.state == fsm::State::Established;
                    nbr.fsm_event(instance, fsm::Event::RcvdKalive);

                    // A quiet keepalive interval ends the initial update for
                    // peers that never send End-of-RIB.
                    if established && nbr.state == fsm::State::Established {
                        for afi_safi in nbr.sync.keepalive_received() {
                            nbr.table_synced(instance, afi_safi, false);
                        }
                    }
                }
                Message::RouteRefresh(msg) => {
                    if let Err(error) =
                        process_nbr_route_refresh(instance, nbr, msg)
                    {
                        error.log();
                    }
                }
            }
        }
        Err(error) => match error {
            NbrRxError::TcpConnClosed => {
                nbr.fsm_event(instance, fsm::Event::ConnFail);
            }
            NbrRxError::MsgDecodeError(error) => {
                nbr.fsm_event(instance, fsm::Event::RcvdError(error));
            }
        },
    }
}

fn process_nbr_update(
    instance: &mut InstanceView<'_>,
    nbr: &mut Neighbor,
    msg: UpdateMsg,
) -> Result<(), Error> {
    // End-of-RIB marker.
    if let Some(afi_safi) = msg.is_end_of_rib() {
        // A table already synced by keepalives may still hold stale routes.
        let synced = nbr.sync.update_received(afi_safi, true);
        if synced || nbr.stale_tables.contains(&afi_safi) {
            nbr.table_synced(instance, afi_safi, true);
        }
        return Ok(());
    }

    let mut ipv4 = UpdateBatch::<Ipv4Unicast>::default();
    let mut ipv6 = UpdateBatch::<Ipv6Unicast>::default();

    // Process IPv4 unreachable NLRIs.
    if let Some(unreach) = msg.unreach {
        ipv4.unreach.extend(unreach.prefixes);
    }

    // Process multiprotocol unreachable NLRIs.
    if let Some(mp_unreach) = msg.mp_unreach {
        match mp_unreach {
            MpUnreachNlri::Ipv4Unicast { prefixes } => {
                ipv4.unreach.extend(prefixes);
            }
            MpUnreachNlri::Ipv6Unicast { prefixes } => {
                ipv6.unreach.extend(prefixes);
            }
        }
    }

    // Process IPv4 reachable NLRIs.
    //
    // Use nexthop from the NEXTHOP attribute.
    if let Some(reach) = msg.reach {
        if let Some(attrs) = &msg.attrs {
            let mut attrs = attrs.clone();
            attrs.base.nexthop = Some(reach.nexthop.into());
            ipv4.reach.push((attrs, reach.prefixes));
        } else {
            // Treat as withdraw.
            ipv4.unreach.extend(reach.prefixes);
        }
    }

    // Process multiprotocol reachable NLRIs.
    //
    // Use nexthop(s) from the MP_REACH_NLRI attribute.
    if let Some(mp_reach) = msg.mp_reach {
        match (mp_reach, msg.attrs) {
            (MpReachNlri::Ipv4Unicast { prefixes, nexthop }, Some(mut attrs)) => {
                attrs.base.nexthop = Some(nexthop.into());
                ipv4.reach.push((attrs, prefixes));
            }
            (
                MpReachNlri::Ipv6Unicast {
                    prefixes,
                    nexthop,
                    ll_nexthop,
                },
                Some(mut attrs),
            ) => {
                attrs.base.nexthop = Some(nexthop.into());
                attrs.base.ll_nexthop = ll_nexthop;
                ipv6.reach.push((attrs, prefixes));
            }
            // Treat as withdraw.
            (MpReachNlri::Ipv4Unicast { prefixes, .. }, None) => {
                ipv4.unreach.extend(prefixes);
            }
            (MpReachNlri::Ipv6Unicast { prefixes, .. }, None) => {
                ipv6.unreach.extend(prefixes);
            }
        }
    }

    ipv4.send(instance, nbr)?;
    ipv6.send(instance, nbr)?;

    Ok(())
}

fn process_nbr_route_refresh(
    instance: &mut InstanceView<'_>,
    nbr: &mut Neighbor,
    msg: RouteRefreshMsg,
) -> Result<(), Error> {
    if nbr.state != fsm::State::Established {
        return Ok(());
    }

    // Requests for unknown or unexchanged tables are ignored.
    let Some(afi_safi) = msg.afi_safi() else {
        return Ok(());
    };
    if !nbr.session_tables.contains(&afi_safi) {
        return Ok(());
    }

    // Re-send the current Adj-RIB-Out.
    instance
        .state
        .tables
        .route_refresh(afi_safi, nbr.remote_addr)
}

// ===== neighbor timer expiry =====

pub(crate) fn process_nbr_timer(
    instance: &mut InstanceView<'_>,
    neighbors: &mut Neighbors,
    nbr_addr: IpAddr,
    timer: fsm::Timer,
) -> Result<(), Error> {
    // Lookup neighbor.
    let Some(nbr) = neighbors.get_mut(&nbr_addr) else {
        return Ok(());
    };

    match timer {
        fsm::Timer::GracefulRestart => nbr.gr_restart_expired(instance),
        _ => nbr.fsm_event(instance, fsm::Event::Timer(timer)),
    }

    Ok(())
}

// ===== impl UpdateBatch =====

impl<A> UpdateBatch<A>
where
    A: AddressFamily,
{
    // Hands the routes over to the table, in receipt order.
    fn send(
        self,
        instance: &InstanceView<'_>,
        nbr: &mut Neighbor,
    ) -> Result<(), Error> {
        if self.reach.is_empty() && self.unreach.is_empty() {
            return Ok(());
        }

        // Routes for tables not exchanged over this session are ignored.
        if !nbr.session_tables.contains(&A::AFI_SAFI) {
            return Ok(());
        }
        nbr.sync.update_received(A::AFI_SAFI, false);

        let Some(table) = A::table(&instance.state.tables) else {
            return Ok(());
        };
        let addr = nbr.remote_addr;
        let mut reach = self.reach.into_iter();
        table.send(TableMsg::Update {
            addr,
            reach: reach.next(),
            unreach: self.unreach,
        })?;
        for reach in reach {
            table.send(TableMsg::Update {
                addr,
                reach: Some(reach),
                unreach: vec![],
            })?;
        }

        Ok(())
    }
}

impl<A> Default for UpdateBatch<A>
where
    A: AddressFamily,
{
    fn default() -> UpdateBatch<A> {
        UpdateBatch {
            reach: Default::default(),
            unreach: Default::default(),
        }
    }
}
