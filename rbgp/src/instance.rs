//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, SocketAddr};

use ipnetwork::{Ipv4Network, Ipv6Network};
use rbgp_utils::bgp::AfiSafi;
use rbgp_utils::task::Task;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{Instrument, debug_span};

use crate::af::{AddressFamily, Ipv4Unicast, Ipv6Unicast};
use crate::config::{InstanceCfg, NeighborCfg, TableCfg};
use crate::debug::Debug;
use crate::error::{Error, IoError};
use crate::neighbor::{ClearType, Neighbor, NeighborState, Neighbors, fsm};
use crate::network::Connection;
use crate::packet::consts::{CeaseSubcode, ErrorCode};
use crate::packet::message::NotificationMsg;
use crate::registry::{PeerPrefs, PeerRegistry};
use crate::rib::table::{
    PeerInfo, TableCxt, TableHandle, TableMsg, TableSnapshot,
};
use crate::tasks::messages::ProtocolInputMsg;
use crate::tasks::messages::input::{
    AdminMsg, NbrRxMsg, NbrTimerMsg, TcpAcceptMsg, TcpConnectMsg,
};
use crate::tasks::messages::output::NbrTxMsg;
use crate::{events, tasks};

// Handle used to drive a running BGP instance.
//
// The instance shuts down, closing every session, once all clones of its
// handle are dropped.
#[derive(Clone, Debug)]
pub struct InstanceHandle {
    admin: Sender<AdminMsg>,
    tcp_accept: Sender<TcpAcceptMsg>,
}

#[derive(Debug)]
pub struct Instance {
    // Instance configuration data.
    pub config: InstanceCfg,
    // Instance state data.
    pub state: InstanceState,
    // Instance neighbors.
    pub neighbors: Neighbors,
    // Instance Tx channels.
    pub tx: ProtocolInputChannelsTx,
    // TCP listening tasks.
    listeners: Vec<Task<()>>,
}

#[derive(Debug)]
pub struct InstanceState {
    // Routing tables, one per enabled address family.
    pub tables: Tables,
    // Configured peers and their live sessions.
    pub registry: PeerRegistry,
    // Identifier given to the next transport connection.
    next_conn_id: u64,
}

// Handles to the enabled routing tables.
#[derive(Clone, Debug, Default)]
pub struct Tables {
    pub ipv4_unicast: Option<TableHandle<Ipv4Unicast>>,
    pub ipv6_unicast: Option<TableHandle<Ipv6Unicast>>,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    // TCP accept event.
    pub tcp_accept: Sender<TcpAcceptMsg>,
    // TCP connect event.
    pub tcp_connect: Sender<TcpConnectMsg>,
    // TCP neighbor message.
    pub nbr_msg_rx: Sender<NbrRxMsg>,
    // Neighbor timeout event.
    pub nbr_timer: Sender<NbrTimerMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    // TCP accept event.
    pub tcp_accept: Receiver<TcpAcceptMsg>,
    // TCP connect event.
    pub tcp_connect: Receiver<TcpConnectMsg>,
    // TCP neighbor message.
    pub nbr_msg_rx: Receiver<NbrRxMsg>,
    // Neighbor timeout event.
    pub nbr_timer: Receiver<NbrTimerMsg>,
    // Operator command.
    pub admin: Receiver<AdminMsg>,
}

pub struct InstanceView<'a> {
    pub config: &'a InstanceCfg,
    pub state: &'a mut InstanceState,
    pub tx: &'a ProtocolInputChannelsTx,
}

// ===== impl InstanceHandle =====

impl InstanceHandle {
    // Spawns a new BGP instance with the given configuration.
    pub fn spawn(config: InstanceCfg) -> InstanceHandle {
        let (tx, rx) = protocol_input_channels();
        let handle = InstanceHandle {
            admin: tx.admin.clone(),
            tcp_accept: tx.protocol.tcp_accept.clone(),
        };

        let span = debug_span!("bgp-instance", asn = config.asn);
        let instance = Instance::new(config, tx.protocol);
        let mut task = Task::spawn(
            async move {
                instance.run(rx).await;
            }
            .instrument(span),
        );
        task.detach();

        handle
    }

    // Accepts connections on the given address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<(), Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(IoError::TcpSocketError)?;
        self.send(AdminMsg::Listen { listener }).await
    }

    // Hands over a connection accepted outside the instance.
    pub async fn accept(&self, conn: Connection) -> Result<(), Error> {
        self.tcp_accept
            .send(TcpAcceptMsg { conn })
            .await
            .map_err(|_| Error::InstanceClosed)
    }

    pub async fn peer_add(
        &self,
        addr: IpAddr,
        config: NeighborCfg,
    ) -> Result<(), Error> {
        self.send(AdminMsg::PeerAdd { addr, config }).await
    }

    pub async fn peer_remove(&self, addr: IpAddr) -> Result<(), Error> {
        self.send(AdminMsg::PeerRemove { addr }).await
    }

    pub async fn table_enable(
        &self,
        afi_safi: AfiSafi,
        config: TableCfg,
    ) -> Result<(), Error> {
        self.send(AdminMsg::TableEnable { afi_safi, config }).await
    }

    pub async fn table_disable(&self, afi_safi: AfiSafi) -> Result<(), Error> {
        self.send(AdminMsg::TableDisable { afi_safi }).await
    }

    // Re-advertises the Adj-RIB-Out toward a peer, for one table or for all
    // of them.
    pub async fn route_refresh(
        &self,
        addr: IpAddr,
        afi_safi: Option<AfiSafi>,
    ) -> Result<(), Error> {
        self.send(AdminMsg::RouteRefresh { addr, afi_safi }).await
    }

    pub async fn clear_session(
        &self,
        addr: IpAddr,
        clear_type: ClearType,
    ) -> Result<(), Error> {
        self.send(AdminMsg::ClearSession { addr, clear_type }).await
    }

    // Returns the operational state of a neighbor.
    pub async fn neighbor_state(
        &self,
        addr: IpAddr,
    ) -> Result<Option<NeighborState>, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(AdminMsg::NeighborQuery { addr, tx }).await?;
        rx.await.map_err(|_| Error::InstanceClosed)
    }

    // Returns the contents of the IPv4 unicast table, if enabled.
    pub async fn ipv4_unicast(
        &self,
    ) -> Result<Option<TableSnapshot<Ipv4Network>>, Error> {
        let tables = self.tables().await?;
        match tables.ipv4_unicast {
            Some(table) => Ok(table.query().await),
            None => Ok(None),
        }
    }

    // Returns the contents of the IPv6 unicast table, if enabled.
    pub async fn ipv6_unicast(
        &self,
    ) -> Result<Option<TableSnapshot<Ipv6Network>>, Error> {
        let tables = self.tables().await?;
        match tables.ipv6_unicast {
            Some(table) => Ok(table.query().await),
            None => Ok(None),
        }
    }

    async fn tables(&self) -> Result<Tables, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(AdminMsg::TablesQuery { tx }).await?;
        rx.await.map_err(|_| Error::InstanceClosed)
    }

    async fn send(&self, msg: AdminMsg) -> Result<(), Error> {
        self.admin.send(msg).await.map_err(|_| Error::InstanceClosed)
    }
}

// ===== impl Instance =====

impl Instance {
    fn new(mut config: InstanceCfg, tx: ProtocolInputChannelsTx) -> Instance {
        let mut state = InstanceState {
            tables: Default::default(),
            registry: Default::default(),
            next_conn_id: 0,
        };

        // Spawn the initially enabled tables.
        for (afi_safi, table_cfg) in config.tables.clone() {
            if table_cfg.enabled {
                state.tables.enable(afi_safi, &config, table_cfg);
            } else {
                config.tables.remove(&afi_safi);
            }
        }

        Instance {
            config,
            state,
            neighbors: Default::default(),
            tx,
            listeners: Default::default(),
        }
    }

    // Runs the instance event loop until every handle is dropped.
    async fn run(mut self, mut rx: ProtocolInputChannelsRx) {
        Debug::InstanceStart.log();

        while let Some(msg) = rx.recv().await {
            if let Err(error) = self.process_protocol_msg(msg) {
                error.log();
            }
        }

        self.stop();
    }

    // Stops the BGP instance.
    fn stop(&mut self) {
        Debug::InstanceStop.log();

        // Stop neighbors.
        let (mut instance, neighbors) = self.as_view();
        let error_code = ErrorCode::Cease;
        let error_subcode = CeaseSubcode::AdministrativeShutdown;
        for nbr in neighbors.values_mut() {
            let msg = NotificationMsg::new(error_code, error_subcode);
            nbr.shutdown(&mut instance, msg);
        }
        self.neighbors.clear();
        self.listeners.clear();
    }

    // Returns a view struct for the instance.
    pub(crate) fn as_view(&mut self) -> (InstanceView<'_>, &mut Neighbors) {
        let instance = InstanceView {
            config: &self.config,
            state: &mut self.state,
            tx: &self.tx,
        };
        (instance, &mut self.neighbors)
    }

    fn process_protocol_msg(
        &mut self,
        msg: ProtocolInputMsg,
    ) -> Result<(), Error> {
        let (mut instance, neighbors) = self.as_view();
        match msg {
            // Accepted TCP connection request.
            ProtocolInputMsg::TcpAccept(msg) => {
                events::process_tcp_accept(&mut instance, neighbors, msg.conn)?;
            }
            // Established TCP connection.
            ProtocolInputMsg::TcpConnect(msg) => {
                events::process_tcp_connect(
                    &mut instance,
                    neighbors,
                    msg.nbr_addr,
                    msg.conn,
                )?;
            }
            // Received message from neighbor.
            ProtocolInputMsg::NbrRx(msg) => {
                events::process_nbr_msg(
                    &mut instance,
                    neighbors,
                    msg.nbr_addr,
                    msg.conn_id,
                    msg.msg,
                )?;
            }
            // Neighbor's timeout has expired.
            ProtocolInputMsg::NbrTimer(msg) => {
                events::process_nbr_timer(
                    &mut instance,
                    neighbors,
                    msg.nbr_addr,
                    msg.timer,
                )?;
            }
            // Operator command.
            ProtocolInputMsg::Admin(msg) => {
                self.process_admin_msg(msg)?;
            }
        }

        Ok(())
    }

    fn process_admin_msg(&mut self, msg: AdminMsg) -> Result<(), Error> {
        match msg {
            AdminMsg::Listen { listener } => {
                let task = tasks::tcp_listener(listener, &self.tx.tcp_accept);
                self.listeners.push(task);
            }
            AdminMsg::PeerAdd { addr, config } => {
                self.peer_add(addr, config);
            }
            AdminMsg::PeerRemove { addr } => {
                self.peer_remove(addr);
            }
            AdminMsg::TableEnable { afi_safi, config } => {
                self.table_enable(afi_safi, config)?;
            }
            AdminMsg::TableDisable { afi_safi } => {
                self.table_disable(afi_safi);
            }
            AdminMsg::RouteRefresh { addr, afi_safi } => {
                let (instance, neighbors) = self.as_view();
                let Some(nbr) = neighbors.get(&addr) else {
                    return Ok(());
                };
                if nbr.state != fsm::State::Established {
                    return Ok(());
                }
                for session_afi_safi in nbr
                    .session_tables
                    .iter()
                    .copied()
                    .filter(|af| afi_safi.is_none_or(|afi_safi| afi_safi == *af))
                {
                    instance
                        .state
                        .tables
                        .route_refresh(session_afi_safi, addr)?;
                }
            }
            AdminMsg::ClearSession { addr, clear_type } => {
                let (mut instance, neighbors) = self.as_view();
                if let Some(nbr) = neighbors.get_mut(&addr) {
                    nbr.clear_session(&mut instance, clear_type);
                }
            }
            AdminMsg::NeighborQuery { addr, tx } => {
                let state = self.neighbors.get(&addr).map(Neighbor::snapshot);
                let _ = tx.send(state);
            }
            AdminMsg::TablesQuery { tx } => {
                let _ = tx.send(self.state.tables.clone());
            }
        }

        Ok(())
    }

    // Adds a neighbor and starts its FSM. Adding a known neighbor does
    // nothing.
    fn peer_add(&mut self, addr: IpAddr, config: NeighborCfg) {
        if self.neighbors.contains_key(&addr) {
            return;
        }

        let prefs = PeerPrefs {
            local_as: self.config.asn,
            local_id: self.config.identifier,
            peer_as: config.peer_as,
            four_byte_asn: config.four_byte_asn,
        };
        self.state.registry.add_peer(addr, prefs);

        let (mut instance, neighbors) = self.as_view();
        let nbr = neighbors
            .entry(addr)
            .or_insert_with(|| Neighbor::new(addr, config));
        nbr.fsm_event(&mut instance, fsm::Event::Start);
    }

    // Closes the neighbor's session and forgets it.
    fn peer_remove(&mut self, addr: IpAddr) {
        let Some(mut nbr) = self.neighbors.remove(&addr) else {
            return;
        };

        let (mut instance, _) = self.as_view();
        let msg = NotificationMsg::new(
            ErrorCode::Cease,
            CeaseSubcode::PeerDeConfigured,
        );
        nbr.shutdown(&mut instance, msg);
        instance.state.registry.remove_peer(&addr);
    }

    fn table_enable(
        &mut self,
        afi_safi: AfiSafi,
        config: TableCfg,
    ) -> Result<(), Error> {
        if self.state.tables.is_enabled(afi_safi) {
            return Ok(());
        }

        Debug::TableEnable(afi_safi).log();
        let config = TableCfg {
            enabled: true,
            ..config
        };
        self.config.tables.insert(afi_safi, config);
        self.state.tables.enable(afi_safi, &self.config, config);

        // Established sessions that negotiated the table start using it.
        let (mut instance, neighbors) = self.as_view();
        for nbr in neighbors.values_mut() {
            nbr.table_enabled(&mut instance, afi_safi)?;
        }

        Ok(())
    }

    fn table_disable(&mut self, afi_safi: AfiSafi) {
        if !self.state.tables.is_enabled(afi_safi) {
            return;
        }

        Debug::TableDisable(afi_safi).log();
        self.config.tables.remove(&afi_safi);
        self.state.tables.disable(afi_safi);
        for nbr in self.neighbors.values_mut() {
            nbr.table_disabled(afi_safi);
        }
    }
}

// ===== impl InstanceState =====

impl InstanceState {
    // Returns a new, never used, connection identifier.
    pub(crate) fn conn_id_next(&mut self) -> u64 {
        self.next_conn_id += 1;
        self.next_conn_id
    }
}

// ===== impl Tables =====

impl Tables {
    fn is_enabled(&self, afi_safi: AfiSafi) -> bool {
        match afi_safi {
            AfiSafi::Ipv4Unicast => self.ipv4_unicast.is_some(),
            AfiSafi::Ipv6Unicast => self.ipv6_unicast.is_some(),
        }
    }

    fn enable(
        &mut self,
        afi_safi: AfiSafi,
        instance_cfg: &InstanceCfg,
        table_cfg: TableCfg,
    ) {
        let cxt = TableCxt {
            asn: instance_cfg.asn,
            identifier: instance_cfg.identifier,
            cluster_id: instance_cfg.cluster_id(),
            always_compare_med: instance_cfg.always_compare_med,
            mode: table_cfg.path_selection,
        };
        match afi_safi {
            AfiSafi::Ipv4Unicast => {
                self.ipv4_unicast = Some(TableHandle::spawn(cxt));
            }
            AfiSafi::Ipv6Unicast => {
                self.ipv6_unicast = Some(TableHandle::spawn(cxt));
            }
        }
    }

    // Dropping the last handle stops the table task.
    fn disable(&mut self, afi_safi: AfiSafi) {
        match afi_safi {
            AfiSafi::Ipv4Unicast => self.ipv4_unicast = None,
            AfiSafi::Ipv6Unicast => self.ipv6_unicast = None,
        }
    }

    pub(crate) fn peer_up(
        &self,
        afi_safi: AfiSafi,
        info: PeerInfo,
        tx: UnboundedSender<NbrTxMsg>,
    ) -> Result<(), Error> {
        match afi_safi {
            AfiSafi::Ipv4Unicast => {
                table_send::<Ipv4Unicast>(self, TableMsg::PeerUp { info, tx })
            }
            AfiSafi::Ipv6Unicast => {
                table_send::<Ipv6Unicast>(self, TableMsg::PeerUp { info, tx })
            }
        }
    }

    pub(crate) fn peer_down(
        &self,
        afi_safi: AfiSafi,
        addr: IpAddr,
        retain_stale: bool,
    ) -> Result<(), Error> {
        match afi_safi {
            AfiSafi::Ipv4Unicast => table_send::<Ipv4Unicast>(
                self,
                TableMsg::PeerDown { addr, retain_stale },
            ),
            AfiSafi::Ipv6Unicast => table_send::<Ipv6Unicast>(
                self,
                TableMsg::PeerDown { addr, retain_stale },
            ),
        }
    }

    pub(crate) fn purge_stale(
        &self,
        afi_safi: AfiSafi,
        addr: IpAddr,
    ) -> Result<(), Error> {
        match afi_safi {
            AfiSafi::Ipv4Unicast => {
                table_send::<Ipv4Unicast>(self, TableMsg::PurgeStale { addr })
            }
            AfiSafi::Ipv6Unicast => {
                table_send::<Ipv6Unicast>(self, TableMsg::PurgeStale { addr })
            }
        }
    }

    pub(crate) fn route_refresh(
        &self,
        afi_safi: AfiSafi,
        addr: IpAddr,
    ) -> Result<(), Error> {
        match afi_safi {
            AfiSafi::Ipv4Unicast => table_send::<Ipv4Unicast>(
                self,
                TableMsg::RouteRefresh { addr },
            ),
            AfiSafi::Ipv6Unicast => table_send::<Ipv6Unicast>(
                self,
                TableMsg::RouteRefresh { addr },
            ),
        }
    }
}

// ===== impl ProtocolInputChannelsRx =====

impl ProtocolInputChannelsRx {
    // Returns `None` once the last instance handle is gone.
    async fn recv(&mut self) -> Option<ProtocolInputMsg> {
        tokio::select! {
            biased;
            msg = self.tcp_accept.recv() => {
                msg.map(ProtocolInputMsg::TcpAccept)
            }
            msg = self.tcp_connect.recv() => {
                msg.map(ProtocolInputMsg::TcpConnect)
            }
            msg = self.nbr_msg_rx.recv() => {
                msg.map(ProtocolInputMsg::NbrRx)
            }
            msg = self.nbr_timer.recv() => {
                msg.map(ProtocolInputMsg::NbrTimer)
            }
            msg = self.admin.recv() => {
                msg.map(ProtocolInputMsg::Admin)
            }
        }
    }
}

// ===== helper functions =====

struct InputChannelsTx {
    protocol: ProtocolInputChannelsTx,
    admin: Sender<AdminMsg>,
}

fn protocol_input_channels() -> (InputChannelsTx, ProtocolInputChannelsRx) {
    let (tcp_acceptp, tcp_acceptc) = mpsc::channel(4);
    let (tcp_connectp, tcp_connectc) = mpsc::channel(4);
    let (nbr_msg_rxp, nbr_msg_rxc) = mpsc::channel(4);
    let (nbr_timerp, nbr_timerc) = mpsc::channel(4);
    let (adminp, adminc) = mpsc::channel(4);

    let tx = InputChannelsTx {
        protocol: ProtocolInputChannelsTx {
            tcp_accept: tcp_acceptp,
            tcp_connect: tcp_connectp,
            nbr_msg_rx: nbr_msg_rxp,
            nbr_timer: nbr_timerp,
        },
        admin: adminp,
    };
    let rx = ProtocolInputChannelsRx {
        tcp_accept: tcp_acceptc,
        tcp_connect: tcp_connectc,
        nbr_msg_rx: nbr_msg_rxc,
        nbr_timer: nbr_timerc,
        admin: adminc,
    };

    (tx, rx)
}

// Sends a message to a table, doing nothing if the table is disabled.
fn table_send<A>(tables: &Tables, msg: TableMsg<A>) -> Result<(), Error>
where
    A: AddressFamily,
{
    match A::table(tables) {
        Some(table) => table.send(msg),
        None => Ok(()),
    }
}
