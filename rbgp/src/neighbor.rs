//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU32};

use chrono::{DateTime, Utc};
use rbgp_utils::bgp::AfiSafi;
use rbgp_utils::task::{IntervalTask, Task, TimeoutTask};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, Sender, UnboundedSender};

use crate::config::{InstanceCfg, NeighborCfg, PeerRole};
use crate::debug::Debug;
use crate::error::{Error, NbrRxError};
use crate::instance::InstanceView;
use crate::network::{ConnDirection, ConnInfo, Connection};
use crate::packet::consts::{
    AS_TRANS, AddPathMode, AfiSafiExt, BGP_VERSION, CeaseSubcode, ErrorCode,
    FsmErrorSubcode, GrAfiFlags, GrRestartFlags,
};
use crate::packet::message::{
    AddPathTuple, Capability, DecodeCxt, EncodeCxt, GrTuple, KeepaliveMsg,
    Message, NegotiatedCapability, NotificationMsg, OpenMsg, RouteRefreshMsg,
    add_path_mode, afi_safi_enabled, graceful_restart_enabled, negotiate,
};
use crate::registry::{Admission, RegistryError, SessionId};
use crate::rib::sync::SyncTracker;
use crate::rib::table::PeerInfo;
use crate::tasks::messages::input::{NbrRxMsg, NbrTimerMsg, TcpConnectMsg};
use crate::tasks::messages::output::NbrTxMsg;
use crate::{events, tasks};

// Large hold-time used during session initialization.
const LARGE_HOLDTIME: u16 = 240;

// BGP neighbor.
#[derive(Debug)]
pub struct Neighbor {
    pub remote_addr: IpAddr,
    pub config: NeighborCfg,
    pub state: fsm::State,
    pub conn_id: Option<u64>,
    pub conn_info: Option<ConnInfo>,
    pub direction: Option<ConnDirection>,
    pub identifier: Option<Ipv4Addr>,
    pub holdtime_nego: Option<u16>,
    pub capabilities_adv: BTreeSet<Capability>,
    pub capabilities_rcvd: BTreeSet<Capability>,
    pub capabilities_nego: BTreeSet<NegotiatedCapability>,
    // Tables exchanged over the current session.
    pub session_tables: BTreeSet<AfiSafi>,
    // Tables holding stale routes from a previous session.
    pub stale_tables: BTreeSet<AfiSafi>,
    pub sync: SyncTracker,
    pub notification_sent: Option<(DateTime<Utc>, NotificationMsg)>,
    pub notification_rcvd: Option<(DateTime<Utc>, NotificationMsg)>,
    pub last_established: Option<DateTime<Utc>>,
    pub statistics: NeighborStatistics,
    pub tasks: NeighborTasks,
    pub gr_restart: Option<TimeoutTask>,
    pub pending: Option<PendingConn>,
    pub msg_txp: Option<UnboundedSender<NbrTxMsg>>,
}

// BGP peer type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PeerType {
    Internal,
    External,
}

// Neighbor statistics.
#[derive(Debug, Default)]
pub struct NeighborStatistics {
    pub established_transitions: u32,
    pub msgs_rcvd: MessageStatistics,
    pub msgs_sent: MessageStatistics,
}

// Inbound and outbound message counters.
#[derive(Debug, Default)]
pub struct MessageStatistics {
    pub total: Arc<AtomicU32>,
    pub updates: u32,
    pub notifications: u32,
    pub route_refreshes: u32,
}

// Neighbor tasks.
#[derive(Debug, Default)]
pub struct NeighborTasks {
    pub autostart: Option<TimeoutTask>,
    pub connect: Option<Task<()>>,
    pub connect_retry: Option<TimeoutTask>,
    pub tcp_rx: Option<Task<()>>,
    pub keepalive: Option<IntervalTask>,
    pub holdtime: Option<TimeoutTask>,
}

// Second connection from the same peer, held until the collision with the
// current one can be resolved.
#[derive(Debug)]
pub struct PendingConn {
    pub conn_id: u64,
    pub conn_info: ConnInfo,
    pub direction: ConnDirection,
    pub capabilities_adv: BTreeSet<Capability>,
    pub open: Option<OpenMsg>,
    // Messages received after the OPEN, replayed if this connection wins.
    pub backlog: Vec<Message>,
    msg_txp: UnboundedSender<NbrTxMsg>,
    tcp_rx: Task<()>,
}

// Administrative session reset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ClearType {
    // Close with a Hard Reset and flush every route learned from the peer.
    Hard,
    // Ask the peer to re-send its routes.
    Soft,
    // Drop the connection, keeping the peer's routes as stale.
    Graceful,
}

// Operational state of a neighbor.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NeighborState {
    pub remote_addr: IpAddr,
    pub state: fsm::State,
    pub conn_info: Option<ConnInfo>,
    pub identifier: Option<Ipv4Addr>,
    pub holdtime_nego: Option<u16>,
    pub capabilities_nego: BTreeSet<NegotiatedCapability>,
    pub session_tables: BTreeSet<AfiSafi>,
    pub stale_tables: BTreeSet<AfiSafi>,
    pub notification_sent: Option<(DateTime<Utc>, NotificationMsg)>,
    pub notification_rcvd: Option<(DateTime<Utc>, NotificationMsg)>,
    pub last_established: Option<DateTime<Utc>>,
    pub established_transitions: u32,
    pub msgs_rcvd: MessageCounters,
    pub msgs_sent: MessageCounters,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MessageCounters {
    pub total: u32,
    pub updates: u32,
    pub notifications: u32,
    pub route_refreshes: u32,
}

// Type aliases.
pub type Neighbors = BTreeMap<IpAddr, Neighbor>;

// Finite State Machine.
pub mod fsm {
    use serde::{Deserialize, Serialize};

    use crate::network::{ConnDirection, Connection};
    use crate::packet::error::DecodeError;
    use crate::packet::message::{NotificationMsg, OpenMsg};

    // FSM states.
    #[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
    #[derive(Deserialize, Serialize)]
    pub enum State {
        Idle,
        Connect,
        Active,
        OpenSent,
        OpenConfirm,
        Established,
    }

    // FSM events.
    //
    // The original RFC FSM events are listed above each event for clarity.
    #[derive(Debug)]
    pub enum Event {
        // ManualStart
        // ManualStart_with_PassiveTcpEstablishment
        Start,
        // ManualStop
        Stop(Option<NotificationMsg>),
        // Tcp_CR_Acked
        // TcpConnectionConfirmed
        Connected(Connection, ConnDirection),
        // TcpConnectionFails
        ConnFail,
        // BGPHeaderErr
        // BGPOpenMsgErr
        // UpdateMsgErr
        RcvdError(DecodeError),
        // BGPOpen
        RcvdOpen(OpenMsg),
        // NotifMsg
        RcvdNotif(NotificationMsg),
        // KeepAliveMsg
        RcvdKalive,
        // UpdateMsg
        RcvdUpdate,
        // ConnectRetryTimer_Expires
        // HoldTimer_Expires
        // AutomaticStart
        // AutomaticStart_with_PassiveTcpEstablishment
        Timer(Timer),
    }

    // BGP timers.
    //
    // Note: KEEPALIVE messages are sent independently, separate from the FSM.
    // The restart timer only concerns routes retained from a lost session.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    pub enum Timer {
        ConnectRetry,
        Hold,
        AutoStart,
        GracefulRestart,
    }
}

// ===== impl Neighbor =====

impl Neighbor {
    // Creates a new neighbor in the Idle state.
    pub(crate) fn new(remote_addr: IpAddr, config: NeighborCfg) -> Neighbor {
        Debug::NbrCreate(&remote_addr).log();

        Neighbor {
            remote_addr,
            config,
            state: fsm::State::Idle,
            conn_id: None,
            conn_info: None,
            direction: None,
            identifier: None,
            holdtime_nego: None,
            capabilities_adv: Default::default(),
            capabilities_rcvd: Default::default(),
            capabilities_nego: Default::default(),
            session_tables: Default::default(),
            stale_tables: Default::default(),
            sync: Default::default(),
            notification_sent: None,
            notification_rcvd: None,
            last_established: None,
            statistics: Default::default(),
            tasks: Default::default(),
            gr_restart: None,
            pending: None,
            msg_txp: None,
        }
    }

    pub(crate) fn peer_type(&self) -> PeerType {
        match self.config.role {
            PeerRole::Ebgp => PeerType::External,
            PeerRole::Ibgp | PeerRole::RrClient => PeerType::Internal,
        }
    }

    // Injects an event into the neighbor's FSM.
    pub(crate) fn fsm_event(
        &mut self,
        instance: &mut InstanceView<'_>,
        event: fsm::Event,
    ) {
        Debug::NbrFsmEvent(&self.remote_addr, &event).log();

        // Process FSM event.
        let next_state = match self.state {
            // Idle state
            fsm::State::Idle => match event {
                fsm::Event::Start
                | fsm::Event::Timer(fsm::Timer::AutoStart) => {
                    self.connect_retry_start(&instance.tx.nbr_timer);
                    if self.config.passive {
                        Some(fsm::State::Active)
                    } else {
                        self.connect(&instance.tx.tcp_connect);
                        Some(fsm::State::Connect)
                    }
                }
                _ => None,
            },
            // Connect state
            fsm::State::Connect => match event {
                fsm::Event::Start => None,
                fsm::Event::Stop(_) => {
                    self.session_close(instance, None, false);
                    Some(fsm::State::Idle)
                }
                fsm::Event::Connected(conn, direction) => {
                    self.connect_retry_stop();
                    self.connection_setup(instance, conn, direction);
                    self.open_send(instance.config);
                    self.holdtime_start(LARGE_HOLDTIME, &instance.tx.nbr_timer);
                    Some(fsm::State::OpenSent)
                }
                fsm::Event::ConnFail => {
                    self.session_close(instance, None, true);
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdError(error) => {
                    let msg = NotificationMsg::from(error);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
                fsm::Event::Timer(fsm::Timer::ConnectRetry) => {
                    self.connect(&instance.tx.tcp_connect);
                    self.connect_retry_start(&instance.tx.nbr_timer);
                    None
                }
                _ => {
                    // FSM error.
                    self.session_close(instance, None, false);
                    Some(fsm::State::Idle)
                }
            },
            // Active state
            fsm::State::Active => match event {
                fsm::Event::Start => None,
                fsm::Event::Stop(_) => {
                    self.session_close(instance, None, false);
                    Some(fsm::State::Idle)
                }
                fsm::Event::Connected(conn, direction) => {
                    self.connect_retry_stop();
                    self.connection_setup(instance, conn, direction);
                    self.open_send(instance.config);
                    self.holdtime_start(LARGE_HOLDTIME, &instance.tx.nbr_timer);
                    Some(fsm::State::OpenSent)
                }
                fsm::Event::ConnFail => {
                    self.session_close(instance, None, true);
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdError(error) => {
                    let msg = NotificationMsg::from(error);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
                fsm::Event::Timer(fsm::Timer::ConnectRetry) => {
                    self.connect_retry_start(&instance.tx.nbr_timer);
                    if self.config.passive {
                        None
                    } else {
                        self.connect(&instance.tx.tcp_connect);
                        Some(fsm::State::Connect)
                    }
                }
                _ => {
                    // FSM error.
                    self.session_close(instance, None, false);
                    Some(fsm::State::Idle)
                }
            },
            // OpenSent state
            fsm::State::OpenSent => match event {
                fsm::Event::Start => None,
                fsm::Event::Stop(msg) => {
                    let retain_stale = msg.is_none();
                    self.session_close(instance, msg, retain_stale);
                    Some(fsm::State::Idle)
                }
                fsm::Event::ConnFail => {
                    self.session_close(instance, None, true);
                    self.connect_retry_start(&instance.tx.nbr_timer);
                    Some(fsm::State::Active)
                }
                fsm::Event::RcvdError(error) => {
                    let msg = NotificationMsg::from(error);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdOpen(msg) => {
                    let next_state = self.open_process(instance, msg);
                    Some(next_state)
                }
                fsm::Event::RcvdNotif(msg) => {
                    self.notification_rcvd = Some((Utc::now(), msg));
                    self.session_close(instance, None, false);
                    Some(fsm::State::Idle)
                }
                fsm::Event::Timer(fsm::Timer::Hold) => {
                    let error_code = ErrorCode::HoldTimerExpired;
                    let error_subcode = 0;
                    let msg = NotificationMsg::new(error_code, error_subcode);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
                _ => {
                    // FSM error.
                    let error_code = ErrorCode::FiniteStateMachineError;
                    let error_subcode =
                        FsmErrorSubcode::UnexpectedMessageInOpenSent;
                    let msg = NotificationMsg::new(error_code, error_subcode);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
            },
            // OpenConfirm state
            fsm::State::OpenConfirm => match event {
                fsm::Event::Start => None,
                fsm::Event::Stop(msg) => {
                    let retain_stale = msg.is_none();
                    self.session_close(instance, msg, retain_stale);
                    Some(fsm::State::Idle)
                }
                fsm::Event::ConnFail => {
                    self.session_close(instance, None, true);
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdError(error) => {
                    let msg = NotificationMsg::from(error);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdNotif(msg) => {
                    self.notification_rcvd = Some((Utc::now(), msg));
                    self.session_close(instance, None, false);
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdKalive => {
                    self.holdtime_restart();
                    Some(fsm::State::Established)
                }
                fsm::Event::Timer(fsm::Timer::Hold) => {
                    let error_code = ErrorCode::HoldTimerExpired;
                    let error_subcode = 0;
                    let msg = NotificationMsg::new(error_code, error_subcode);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
                _ => {
                    // FSM error.
                    let error_code = ErrorCode::FiniteStateMachineError;
                    let error_subcode =
                        FsmErrorSubcode::UnexpectedMessageInOpenConfirm;
                    let msg = NotificationMsg::new(error_code, error_subcode);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
            },
            // Established state
            fsm::State::Established => match event {
                fsm::Event::Start => None,
                fsm::Event::Stop(msg) => {
                    let retain_stale = msg.is_none();
                    self.session_close(instance, msg, retain_stale);
                    Some(fsm::State::Idle)
                }
                fsm::Event::ConnFail => {
                    self.session_close(instance, None, true);
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdError(error) => {
                    let msg = NotificationMsg::from(error);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdNotif(msg) => {
                    self.notification_rcvd = Some((Utc::now(), msg));
                    self.session_close(instance, None, false);
                    Some(fsm::State::Idle)
                }
                fsm::Event::RcvdKalive | fsm::Event::RcvdUpdate => {
                    self.holdtime_restart();
                    None
                }
                fsm::Event::Timer(fsm::Timer::Hold) => {
                    let error_code = ErrorCode::HoldTimerExpired;
                    let error_subcode = 0;
                    let msg = NotificationMsg::new(error_code, error_subcode);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
                _ => {
                    // FSM error.
                    let error_code = ErrorCode::FiniteStateMachineError;
                    let error_subcode =
                        FsmErrorSubcode::UnexpectedMessageInEstablished;
                    let msg = NotificationMsg::new(error_code, error_subcode);
                    self.session_close(instance, Some(msg), false);
                    Some(fsm::State::Idle)
                }
            },
        };

        // Change to next FSM state when applicable.
        if let Some(next_state) = next_state
            && self.state != next_state
        {
            if next_state == fsm::State::Idle {
                self.autostart_start(&instance.tx.nbr_timer);
            } else {
                self.autostart_stop();
            }

            self.fsm_state_change(instance, next_state);
        }

        // A deferred collision can be resolved once both OPENs are known.
        if self.state >= fsm::State::OpenConfirm
            && self.pending.as_ref().is_some_and(|p| p.open.is_some())
        {
            self.collision_check(instance);
        }

        // The pending connection takes over once the current one is gone.
        if self.state == fsm::State::Idle && self.pending.is_some() {
            self.pending_promote(instance);
        }
    }

    // Updates the neighbor's FSM state.
    fn fsm_state_change(
        &mut self,
        instance: &mut InstanceView<'_>,
        next_state: fsm::State,
    ) {
        Debug::NbrFsmTransition(&self.remote_addr, &self.state, &next_state)
            .log();

        // Keep track of the time that the BGP session last transitioned in or
        // out of the Established state.
        if self.state == fsm::State::Established
            || next_state == fsm::State::Established
        {
            self.last_established = Some(Utc::now());
        }

        if next_state == fsm::State::Established {
            // Update statistics.
            self.statistics.established_transitions += 1;

            // Initialize session.
            self.state = next_state;
            if let Err(error) = self.session_init(instance) {
                Error::NbrSessionUpFailed(self.remote_addr, Box::new(error))
                    .log();
                let msg = NotificationMsg::new(
                    ErrorCode::Cease,
                    CeaseSubcode::OutOfResources,
                );
                self.fsm_event(instance, fsm::Event::Stop(Some(msg)));
            }
            return;
        }

        self.state = next_state;
    }

    // Sets up the connection for the BGP neighbor, spawning necessary tasks for
    // TCP communication.
    fn connection_setup(
        &mut self,
        instance: &mut InstanceView<'_>,
        conn: Connection,
        direction: ConnDirection,
    ) {
        let conn_id = instance.state.conn_id_next();
        let conn_info = conn.conn_info;
        self.capabilities_adv = self.capabilities_build(instance.config);
        let (msg_txp, tcp_rx) = self.connection_spawn(
            conn,
            conn_id,
            self.capabilities_adv.clone(),
            &instance.tx.nbr_msg_rx,
        );

        self.conn_id = Some(conn_id);
        self.conn_info = Some(conn_info);
        self.direction = Some(direction);
        self.msg_txp = Some(msg_txp);
        self.tasks.tcp_rx = Some(tcp_rx);
    }

    // Spawns the Rx and Tx tasks of a connection.
    fn connection_spawn(
        &self,
        conn: Connection,
        conn_id: u64,
        capabilities_adv: BTreeSet<Capability>,
        nbr_msg_rxp: &Sender<NbrRxMsg>,
    ) -> (UnboundedSender<NbrTxMsg>, Task<()>) {
        let Connection { reader, writer, .. } = conn;

        // Spawn neighbor TCP Tx task.
        let (msg_txp, msg_txc) = mpsc::unbounded_channel();
        let cxt = EncodeCxt {
            capabilities: Default::default(),
        };
        let mut tx_task = tasks::nbr_tx(self, cxt, writer, msg_txc);

        // Spawn neighbor TCP Rx task.
        let cxt = DecodeCxt {
            peer_type: self.peer_type(),
            peer_as: self.config.peer_as,
            capabilities: Default::default(),
        };
        let tcp_rx = tasks::nbr_rx(
            self,
            conn_id,
            cxt,
            capabilities_adv,
            reader,
            nbr_msg_rxp,
        );

        // No need to keep track of the Tx task since it gracefully exits as
        // soon as the tx end of its mpsc channel is dropped. This ensures that
        // messages sent during neighbor shutdown will be delivered.
        tx_task.detach();

        (msg_txp, tcp_rx)
    }

    // Initializes the BGP session.
    fn session_init(
        &mut self,
        instance: &mut InstanceView<'_>,
    ) -> Result<(), Error> {
        // Compute the negotiated capabilities.
        self.capabilities_nego =
            negotiate(&self.capabilities_adv, &self.capabilities_rcvd);

        // Update the Tx task with the negotiated capabilities.
        if let Some(msg_txp) = &self.msg_txp {
            let msg =
                NbrTxMsg::UpdateCapabilities(self.capabilities_nego.clone());
            let _ = msg_txp.send(msg);
        }

        // Tables exchanged over this session.
        self.session_tables = local_tables(instance.config, &self.config)
            .filter(|afi_safi| {
                afi_safi_enabled(&self.capabilities_nego, *afi_safi)
            })
            .collect();
        self.sync = SyncTracker::new(self.session_tables.iter().copied());

        // Stale routes the peer can no longer refresh are flushed right away.
        let purged = self
            .stale_tables
            .iter()
            .copied()
            .filter(|afi_safi| {
                !self.session_tables.contains(afi_safi)
                    || !graceful_restart_enabled(
                        &self.capabilities_nego,
                        *afi_safi,
                    )
            })
            .collect::<Vec<_>>();
        for afi_safi in purged {
            self.stale_purge(instance, afi_safi);
        }

        // The remaining stale routes now wait for End-of-RIB.
        self.gr_restart = None;

        // Register the peer in each table, triggering the initial dump.
        for afi_safi in self.session_tables.clone() {
            self.table_peer_up(instance, afi_safi)?;
        }

        Ok(())
    }

    // Registers the peer in one table, which then sends its initial dump.
    fn table_peer_up(
        &self,
        instance: &mut InstanceView<'_>,
        afi_safi: AfiSafi,
    ) -> Result<(), Error> {
        let (Some(identifier), Some(conn_info), Some(msg_txp)) =
            (self.identifier, self.conn_info, self.msg_txp.clone())
        else {
            return Ok(());
        };
        let afi_safi_cfg = self.config.afi_safi(afi_safi);
        let info = PeerInfo {
            addr: self.remote_addr,
            identifier,
            local_addr: conn_info.local_addr,
            peer_as: self.config.peer_as,
            role: self.config.role,
            policy: afi_safi_cfg.policy,
            add_path_tx: matches!(
                add_path_mode(&self.capabilities_nego, afi_safi),
                Some(AddPathMode::Send | AddPathMode::ReceiveSend)
            ),
        };
        instance.state.tables.peer_up(afi_safi, info, msg_txp)
    }

    // Starts exchanging routes of a table enabled while the session is up.
    pub(crate) fn table_enabled(
        &mut self,
        instance: &mut InstanceView<'_>,
        afi_safi: AfiSafi,
    ) -> Result<(), Error> {
        if self.state != fsm::State::Established
            || !self.config.afi_safi.contains_key(&afi_safi)
            || !afi_safi_enabled(&self.capabilities_nego, afi_safi)
        {
            return Ok(());
        }

        self.session_tables.insert(afi_safi);
        self.table_peer_up(instance, afi_safi)
    }

    // Forgets a table that was removed, along with its stale routes.
    pub(crate) fn table_disabled(&mut self, afi_safi: AfiSafi) {
        self.session_tables.remove(&afi_safi);
        self.stale_tables.remove(&afi_safi);
        if self.stale_tables.is_empty() {
            self.gr_restart = None;
        }
    }

    // Closes the BGP session, performing necessary cleanup and releasing resources.
    //
    // With `retain_stale`, routes of tables that negotiated graceful restart
    // are kept as stale instead of being withdrawn.
    fn session_close(
        &mut self,
        instance: &mut InstanceView<'_>,
        send_notif: Option<NotificationMsg>,
        retain_stale: bool,
    ) {
        // Send a notification message.
        if self.state >= fsm::State::OpenSent
            && let Some(msg) = send_notif
        {
            self.message_send(Message::Notification(msg));
        }

        // Set the ConnectRetryTimer to zero.
        self.connect_retry_stop();

        // Release the registry slot taken when the OPEN was accepted.
        if self.state >= fsm::State::OpenConfirm {
            instance
                .state
                .registry
                .remove_peer_session(&self.remote_addr);
        }

        // Withdraw or retain the routes learned over this session.
        let restart_time = self.gr_restart_time();
        for afi_safi in std::mem::take(&mut self.session_tables) {
            let retain = retain_stale
                && graceful_restart_enabled(&self.capabilities_nego, afi_safi);
            if let Err(error) = instance.state.tables.peer_down(
                afi_safi,
                self.remote_addr,
                retain,
            ) {
                error.log();
            }
            if retain {
                Debug::NbrGrRetain(&self.remote_addr, afi_safi, restart_time)
                    .log();
                self.stale_tables.insert(afi_safi);
            } else {
                self.stale_tables.remove(&afi_safi);
            }
        }
        if retain_stale && !self.stale_tables.is_empty() {
            self.gr_restart_start(restart_time, &instance.tx.nbr_timer);
        } else if self.stale_tables.is_empty() {
            self.gr_restart = None;
        }

        // Release all resources.
        self.conn_id = None;
        self.conn_info = None;
        self.direction = None;
        self.identifier = None;
        self.holdtime_nego = None;
        self.capabilities_adv.clear();
        self.capabilities_rcvd.clear();
        self.capabilities_nego.clear();
        self.sync = Default::default();
        self.tasks = Default::default();
        self.msg_txp = None;
    }

    // Enqueues a single BGP message for transmission.
    pub(crate) fn message_send(&mut self, msg: Message) {
        Debug::NbrMsgTx(&self.remote_addr, &msg).log();

        // Update statistics.
        self.statistics.msgs_sent.update(&msg);

        // Keep track of the last sent notification.
        if let Message::Notification(msg) = &msg {
            self.notification_sent = Some((Utc::now(), msg.clone()));
        }

        // Ignore any possible error as the connection might have gone down
        // already.
        let nbr_addr = self.remote_addr;
        if let Some(msg_txp) = &self.msg_txp {
            let msg = NbrTxMsg::SendMessage { nbr_addr, msg };
            let _ = msg_txp.send(msg);
        }
    }

    // Enqueues a list of BGP messages for transmission.
    //
    // This method is more efficient for handling a large number of messages,
    // as they are sent all at once.
    pub(crate) fn message_list_send(&mut self, msg_list: Vec<Message>) {
        for msg in &msg_list {
            Debug::NbrMsgTx(&self.remote_addr, msg).log();

            // Update statistics.
            self.statistics.msgs_sent.update(msg);
        }

        let nbr_addr = self.remote_addr;
        if let Some(msg_txp) = &self.msg_txp {
            let msg = NbrTxMsg::SendMessageList { nbr_addr, msg_list };
            let _ = msg_txp.send(msg);
        }
    }

    // Builds the capabilities advertised in our OPEN message.
    fn capabilities_build(
        &self,
        instance_cfg: &InstanceCfg,
    ) -> BTreeSet<Capability> {
        let tables = local_tables(instance_cfg, &self.config).collect::<Vec<_>>();
        let mut capabilities = BTreeSet::new();

        // Multiprotocol capabilities.
        for afi_safi in &tables {
            capabilities.insert(Capability::MultiProtocol {
                afi: afi_safi.afi(),
                safi: afi_safi.safi(),
            });
        }

        if self.config.four_byte_asn {
            capabilities.insert(Capability::FourOctetAsNumber {
                asn: instance_cfg.asn,
            });
        }
        if self.config.route_refresh {
            capabilities.insert(Capability::RouteRefresh);
        }

        // ADD-PATH capability.
        let add_path = tables
            .iter()
            .filter_map(|afi_safi| {
                self.config.afi_safi(*afi_safi).add_path.map(|mode| {
                    AddPathTuple {
                        afi: afi_safi.afi(),
                        safi: afi_safi.safi(),
                        mode,
                    }
                })
            })
            .collect::<BTreeSet<_>>();
        if !add_path.is_empty() {
            capabilities.insert(Capability::AddPath(add_path));
        }

        // Graceful restart capability.
        let gr_tuples = tables
            .iter()
            .filter_map(|afi_safi| {
                let afi_safi_cfg = self.config.afi_safi(*afi_safi);
                afi_safi_cfg.graceful_restart.then(|| GrTuple {
                    afi: afi_safi.afi(),
                    safi: afi_safi.safi(),
                    flags: if afi_safi_cfg.forwarding_preserved {
                        GrAfiFlags::FORWARDING_STATE
                    } else {
                        GrAfiFlags::empty()
                    },
                })
            })
            .collect::<BTreeSet<_>>();
        if !gr_tuples.is_empty() {
            capabilities.insert(Capability::GracefulRestart {
                flags: GrRestartFlags::empty(),
                restart_time: self.config.graceful_restart.restart_time,
                tuples: gr_tuples,
            });
        }

        capabilities
    }

    // Builds an OPEN message carrying the given capabilities.
    fn open_build(
        &self,
        instance_cfg: &InstanceCfg,
        capabilities: BTreeSet<Capability>,
    ) -> Message {
        Message::Open(OpenMsg {
            version: BGP_VERSION,
            my_as: instance_cfg.asn.try_into().unwrap_or(AS_TRANS),
            holdtime: self.config.holdtime,
            identifier: instance_cfg.identifier,
            capabilities,
        })
    }

    // Sends a BGP OPEN message based on the local configuration.
    fn open_send(&mut self, instance_cfg: &InstanceCfg) {
        let msg = self.open_build(instance_cfg, self.capabilities_adv.clone());
        self.message_send(msg);
    }

    // Processes the received OPEN message while in the OpenSent state.
    fn open_process(
        &mut self,
        instance: &mut InstanceView<'_>,
        msg: OpenMsg,
    ) -> fsm::State {
        // Admit the session through the registry.
        let direction = self.direction.unwrap_or(ConnDirection::Inbound);
        let session = session_id(direction, &msg, instance.config);
        let registry = &instance.state.registry;
        let mut result =
            registry.resolve_incoming(&self.remote_addr, session, &msg);
        if let Ok(Admission::DroppedPrevious) = result {
            // Leftover from a session that is already gone.
            result =
                registry.resolve_incoming(&self.remote_addr, session, &msg);
        }
        if let Err(error) = result {
            Error::NbrOpenRejected(self.remote_addr, error).log();
            self.session_close(instance, Some(error.into()), false);
            return fsm::State::Idle;
        }

        // Calculate negotiated hold-time.
        let holdtime_nego = std::cmp::min(msg.holdtime, self.config.holdtime);

        // Set the ConnectRetryTimer to zero.
        self.connect_retry_stop();

        // Send Keepalive message.
        self.message_send(Message::Keepalive(KeepaliveMsg {}));

        // Keep track of the received data.
        self.identifier = Some(msg.identifier);
        self.holdtime_nego = (holdtime_nego != 0).then_some(holdtime_nego);
        self.capabilities_rcvd = msg.capabilities;

        // Start Keepalive interval and session hold timer.
        if holdtime_nego != 0 {
            self.keepalive_interval_start(holdtime_nego);
            self.holdtime_start(holdtime_nego, &instance.tx.nbr_timer);
        } else {
            self.holdtime_stop();
        }

        // Transition to the OpenConfirm state.
        fsm::State::OpenConfirm
    }

    // Takes in a connection that arrived while another one is already past
    // the OPEN exchange.
    pub(crate) fn pending_setup(
        &mut self,
        instance: &mut InstanceView<'_>,
        conn: Connection,
        direction: ConnDirection,
    ) {
        // At most two connections per peer.
        if self.pending.is_some() {
            return;
        }

        let conn_id = instance.state.conn_id_next();
        let conn_info = conn.conn_info;
        let capabilities_adv = self.capabilities_build(instance.config);
        let (msg_txp, tcp_rx) = self.connection_spawn(
            conn,
            conn_id,
            capabilities_adv.clone(),
            &instance.tx.nbr_msg_rx,
        );
        let open = self.open_build(instance.config, capabilities_adv.clone());
        self.pending = Some(PendingConn {
            conn_id,
            conn_info,
            direction,
            capabilities_adv,
            open: None,
            backlog: vec![],
            msg_txp,
            tcp_rx,
        });
        self.pending_send(open);
    }

    // Processes a message read from the pending connection.
    pub(crate) fn pending_message(
        &mut self,
        instance: &mut InstanceView<'_>,
        msg: Result<Message, NbrRxError>,
    ) {
        let Some(pending) = &mut self.pending else {
            return;
        };

        match msg {
            Ok(Message::Open(open)) if pending.open.is_none() => {
                pending.open = Some(open);
                if self.state >= fsm::State::OpenConfirm {
                    self.collision_check(instance);
                }
            }
            Ok(Message::Notification(_)) | Err(_) => {
                self.pending = None;
            }
            Ok(msg) if pending.open.is_some() && !msg.is_open() => {
                pending.backlog.push(msg);
            }
            Ok(_) => {
                let msg = NotificationMsg::new(
                    ErrorCode::FiniteStateMachineError,
                    FsmErrorSubcode::UnexpectedMessageInOpenSent,
                );
                self.pending_reject(msg);
            }
        }
    }

    // Decides which of the two connections survives.
    fn collision_check(&mut self, instance: &mut InstanceView<'_>) {
        let Some(pending) = &self.pending else {
            return;
        };
        let Some(open) = &pending.open else {
            return;
        };

        let session = session_id(pending.direction, open, instance.config);
        let registry = &instance.state.registry;
        match registry.resolve_incoming(&self.remote_addr, session, open) {
            Ok(admission) => {
                // The winner registers itself once its OPEN is replayed.
                if admission == Admission::Accepted {
                    registry.remove_peer_session(&self.remote_addr);
                }
                Debug::NbrConnReplaced(&self.remote_addr).log();
                let msg = NotificationMsg::new(
                    ErrorCode::Cease,
                    CeaseSubcode::ConnectionCollisionResolution,
                );
                self.fsm_event(instance, fsm::Event::Stop(Some(msg)));
            }
            Err(RegistryError::Duplicate)
                if self.state == fsm::State::Established =>
            {
                // The peer reconnecting the same way it did before means it
                // lost the previous session, typically across a restart.
                Debug::NbrConnReplaced(&self.remote_addr).log();
                self.fsm_event(instance, fsm::Event::Stop(None));
            }
            Err(error) => {
                Debug::NbrConnRejected(&self.remote_addr, &error).log();
                self.pending_reject(error.into());
            }
        }
    }

    // Closes the pending connection.
    fn pending_reject(&mut self, msg: NotificationMsg) {
        self.pending_send(Message::Notification(msg));
        self.pending = None;
    }

    // Enqueues a message on the pending connection.
    fn pending_send(&mut self, msg: Message) {
        let Some(pending) = &self.pending else {
            return;
        };
        Debug::NbrMsgTx(&self.remote_addr, &msg).log();
        self.statistics.msgs_sent.update(&msg);
        let nbr_addr = self.remote_addr;
        let _ = pending.msg_txp.send(NbrTxMsg::SendMessage { nbr_addr, msg });
    }

    // Makes the pending connection the current one.
    fn pending_promote(&mut self, instance: &mut InstanceView<'_>) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        self.autostart_stop();
        self.connect_retry_stop();
        self.conn_id = Some(pending.conn_id);
        self.conn_info = Some(pending.conn_info);
        self.direction = Some(pending.direction);
        self.capabilities_adv = pending.capabilities_adv;
        self.msg_txp = Some(pending.msg_txp);
        self.tasks.tcp_rx = Some(pending.tcp_rx);
        self.holdtime_start(LARGE_HOLDTIME, &instance.tx.nbr_timer);
        self.fsm_state_change(instance, fsm::State::OpenSent);

        // Replay what the connection received so far.
        let conn_id = pending.conn_id;
        if let Some(open) = pending.open {
            self.fsm_event(instance, fsm::Event::RcvdOpen(open));
        }
        for msg in pending.backlog {
            if self.conn_id != Some(conn_id) {
                break;
            }
            events::process_nbr_session_msg(instance, self, Ok(msg));
        }
    }

    // Resets the session on operator request.
    pub(crate) fn clear_session(
        &mut self,
        instance: &mut InstanceView<'_>,
        clear_type: ClearType,
    ) {
        match clear_type {
            ClearType::Hard => {
                // Close the session with the "Hard Reset" subcode.
                self.pending = None;
                let msg = NotificationMsg::new(
                    ErrorCode::Cease,
                    CeaseSubcode::HardReset,
                );
                self.fsm_event(instance, fsm::Event::Stop(Some(msg)));
                self.stale_purge_all(instance);
            }
            ClearType::Graceful => {
                // Drop the connection without a NOTIFICATION so that both
                // sides keep forwarding with the routes they have.
                self.pending = None;
                self.fsm_event(instance, fsm::Event::Stop(None));
            }
            ClearType::Soft => {
                if self.state != fsm::State::Established
                    || !self
                        .capabilities_nego
                        .contains(&NegotiatedCapability::RouteRefresh)
                {
                    return;
                }

                // Request the Adj-RIB-In for this neighbor to be re-sent.
                let msg_list = self
                    .session_tables
                    .iter()
                    .map(|afi_safi| {
                        Message::RouteRefresh(RouteRefreshMsg::from(*afi_safi))
                    })
                    .collect::<Vec<_>>();
                if !msg_list.is_empty() {
                    self.message_list_send(msg_list);
                }
            }
        }
    }

    // Tears the neighbor down before it is removed.
    pub(crate) fn shutdown(
        &mut self,
        instance: &mut InstanceView<'_>,
        msg: NotificationMsg,
    ) {
        Debug::NbrDelete(&self.remote_addr).log();
        self.pending = None;
        self.fsm_event(instance, fsm::Event::Stop(Some(msg)));
        self.stale_purge_all(instance);
        self.tasks = Default::default();
    }

    // Accounts for a table being fully received from the peer.
    //
    // Only an explicit End-of-RIB sweeps the stale routes of a restarting
    // peer; an implicit keepalive sync leaves them in place.
    pub(crate) fn table_synced(
        &mut self,
        instance: &mut InstanceView<'_>,
        afi_safi: AfiSafi,
        end_of_rib: bool,
    ) {
        Debug::NbrTableSynced(&self.remote_addr, afi_safi).log();
        if end_of_rib && self.stale_tables.contains(&afi_safi) {
            self.stale_purge(instance, afi_safi);
        }
    }

    // Handles expiry of the restart timer.
    pub(crate) fn gr_restart_expired(&mut self, instance: &mut InstanceView<'_>) {
        Debug::NbrGrExpired(&self.remote_addr).log();
        self.stale_purge_all(instance);
    }

    // Drops the stale routes left in a table.
    fn stale_purge(&mut self, instance: &mut InstanceView<'_>, afi_safi: AfiSafi) {
        self.stale_tables.remove(&afi_safi);
        if let Err(error) = instance
            .state
            .tables
            .purge_stale(afi_safi, self.remote_addr)
        {
            error.log();
        }
        if self.stale_tables.is_empty() {
            self.gr_restart = None;
        }
    }

    fn stale_purge_all(&mut self, instance: &mut InstanceView<'_>) {
        let tables = self.stale_tables.iter().copied().collect::<Vec<_>>();
        for afi_safi in tables {
            self.stale_purge(instance, afi_safi);
        }
    }

    // Restart time advertised by the peer.
    fn gr_restart_time(&self) -> u16 {
        self.capabilities_rcvd
            .iter()
            .find_map(|cap| match cap {
                Capability::GracefulRestart { restart_time, .. } => {
                    Some(*restart_time)
                }
                _ => None,
            })
            .unwrap_or(0)
    }

    // Starts the restart timer bounding how long stale routes are kept.
    fn gr_restart_start(
        &mut self,
        restart_time: u16,
        nbr_timerp: &Sender<NbrTimerMsg>,
    ) {
        let task = tasks::nbr_timer(
            self,
            fsm::Timer::GracefulRestart,
            restart_time,
            nbr_timerp,
        );
        self.gr_restart = Some(task);
    }

    // Returns the neighbor's operational state.
    pub(crate) fn snapshot(&self) -> NeighborState {
        NeighborState {
            remote_addr: self.remote_addr,
            state: self.state,
            conn_info: self.conn_info,
            identifier: self.identifier,
            holdtime_nego: self.holdtime_nego,
            capabilities_nego: self.capabilities_nego.clone(),
            session_tables: self.session_tables.clone(),
            stale_tables: self.stale_tables.clone(),
            notification_sent: self.notification_sent.clone(),
            notification_rcvd: self.notification_rcvd.clone(),
            last_established: self.last_established,
            established_transitions: self.statistics.established_transitions,
            msgs_rcvd: self.statistics.msgs_rcvd.counters(),
            msgs_sent: self.statistics.msgs_sent.counters(),
        }
    }

    // Starts the auto-start timer.
    fn autostart_start(&mut self, nbr_timerp: &Sender<NbrTimerMsg>) {
        let idle_hold_time = 1;
        let task = tasks::nbr_timer(
            self,
            fsm::Timer::AutoStart,
            idle_hold_time,
            nbr_timerp,
        );
        self.tasks.autostart = Some(task);
    }

    // Stops the auto-start timer.
    fn autostart_stop(&mut self) {
        self.tasks.autostart = None;
    }

    // Starts a TCP connection task to the neighbor's remote address.
    fn connect(&mut self, tcp_connectp: &Sender<TcpConnectMsg>) {
        let task = tasks::tcp_connect(self, tcp_connectp);
        self.tasks.connect = Some(task);
    }

    // Starts the Keepalive Tx interval.
    fn keepalive_interval_start(&mut self, holdtime_nego: u16) {
        let interval = self.config.keepalive.unwrap_or(holdtime_nego / 3);
        self.tasks.keepalive =
            tasks::nbr_kalive_interval(self, interval.max(1));
    }

    // Starts the session hold timer.
    fn holdtime_start(
        &mut self,
        seconds: u16,
        nbr_timerp: &Sender<NbrTimerMsg>,
    ) {
        let task =
            tasks::nbr_timer(self, fsm::Timer::Hold, seconds, nbr_timerp);
        self.tasks.holdtime = Some(task);
    }

    // Restarts the session hold timer if the negotiated HoldTime value is
    // non-zero.
    pub(crate) fn holdtime_restart(&mut self) {
        if let Some(holdtime) = self.tasks.holdtime.as_mut() {
            holdtime.reset(None);
        }
    }

    // Stops the session hold timer.
    fn holdtime_stop(&mut self) {
        self.tasks.holdtime = None;
    }

    // Starts the connect retry timer.
    fn connect_retry_start(&mut self, nbr_timerp: &Sender<NbrTimerMsg>) {
        let task = tasks::nbr_timer(
            self,
            fsm::Timer::ConnectRetry,
            self.config.connect_retry,
            nbr_timerp,
        );
        self.tasks.connect_retry = Some(task);
    }

    // Stops the connect retry timer.
    fn connect_retry_stop(&mut self) {
        self.tasks.connect_retry = None;
    }
}

// ===== impl MessageStatistics =====

impl MessageStatistics {
    pub(crate) fn update(&mut self, msg: &Message) {
        self.total.fetch_add(1, atomic::Ordering::Relaxed);
        match msg {
            Message::Update(_) => {
                self.updates += 1;
            }
            Message::Notification(_) => {
                self.notifications += 1;
            }
            Message::RouteRefresh(_) => {
                self.route_refreshes += 1;
            }
            _ => {}
        }
    }

    fn counters(&self) -> MessageCounters {
        MessageCounters {
            total: self.total.load(atomic::Ordering::Relaxed),
            updates: self.updates,
            notifications: self.notifications,
            route_refreshes: self.route_refreshes,
        }
    }
}

// ===== helper functions =====

// Tables both configured for the neighbor and enabled on the instance.
fn local_tables<'a>(
    instance_cfg: &'a InstanceCfg,
    nbr_cfg: &'a NeighborCfg,
) -> impl Iterator<Item = AfiSafi> + 'a {
    nbr_cfg.afi_safi.keys().copied().filter(|afi_safi| {
        instance_cfg
            .tables
            .get(afi_safi)
            .is_some_and(|table| table.enabled)
    })
}

// Identity of the session carried by a connection, given the peer's OPEN.
fn session_id(
    direction: ConnDirection,
    open: &OpenMsg,
    instance_cfg: &InstanceCfg,
) -> SessionId {
    match direction {
        ConnDirection::Inbound => SessionId {
            from: open.identifier,
            to: instance_cfg.identifier,
            asn: open.real_as(),
        },
        ConnDirection::Outbound => SessionId {
            from: instance_cfg.identifier,
            to: open.identifier,
            asn: instance_cfg.asn,
        },
    }
}
