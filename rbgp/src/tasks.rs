//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::sync::{Arc, atomic};
use std::time::Duration;

use rbgp_utils::task::{IntervalTask, Task, TimeoutTask};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};
use tokio::time::sleep;
use tracing::{Instrument, debug_span, error};

use crate::debug::Debug;
use crate::error::NbrRxError;
use crate::neighbor::{Neighbor, fsm};
use crate::network::{self, ConnReader, ConnWriter};
use crate::packet::message::{
    Capability, DecodeCxt, EncodeCxt, KeepaliveMsg, Message,
};

//
// BGP tasks diagram:
//                                     +--------------+
//                                     |    handle    |
//                                     +--------------+
//                                            |
//                                            |
//                             admin_rx (1x)  V
//                                     +--------------+
//                                     |              |
//                tcp_listener (Nx) -> |              | -> (Nx) nbr_tx
//                 tcp_connect (Nx) -> |              | -> (Nx) nbr_kalive_interval
//                      nbr_rx (Nx) -> |   instance   |
//                   nbr_timer (Nx) -> |              |
//                                     |              |
//                                     +--------------+
//                              table_tx (2x) |   ^ (Nx) nbr_tx
//                                            V   |
//                                     +--------------+
//                                     |    tables    |
//                                     +--------------+
//

// BGP inter-task message types.
pub mod messages {
    use std::collections::BTreeSet;
    use std::net::IpAddr;

    use rbgp_utils::bgp::AfiSafi;
    use serde::{Deserialize, Serialize};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use crate::config::{NeighborCfg, TableCfg};
    use crate::error::NbrRxError;
    use crate::instance::Tables;
    use crate::neighbor::{ClearType, NeighborState, fsm};
    use crate::network::Connection;
    use crate::packet::message::{Message, NegotiatedCapability};

    // Type aliases.
    pub type ProtocolInputMsg = input::ProtocolMsg;

    // Input messages (child task -> main task).
    pub mod input {
        use super::*;

        #[derive(Debug)]
        pub enum ProtocolMsg {
            TcpAccept(TcpAcceptMsg),
            TcpConnect(TcpConnectMsg),
            NbrRx(NbrRxMsg),
            NbrTimer(NbrTimerMsg),
            Admin(AdminMsg),
        }

        #[derive(Debug)]
        pub struct TcpAcceptMsg {
            pub conn: Connection,
        }

        #[derive(Debug)]
        pub struct TcpConnectMsg {
            pub nbr_addr: IpAddr,
            pub conn: Connection,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NbrRxMsg {
            pub nbr_addr: IpAddr,
            // Connection the message was read from.
            pub conn_id: u64,
            pub msg: Result<Message, NbrRxError>,
        }

        #[derive(Debug, Deserialize, Serialize)]
        pub struct NbrTimerMsg {
            pub nbr_addr: IpAddr,
            pub timer: fsm::Timer,
        }

        // Operator commands. Every one of them may be repeated safely.
        #[derive(Debug)]
        pub enum AdminMsg {
            Listen {
                listener: TcpListener,
            },
            PeerAdd {
                addr: IpAddr,
                config: NeighborCfg,
            },
            PeerRemove {
                addr: IpAddr,
            },
            TableEnable {
                afi_safi: AfiSafi,
                config: TableCfg,
            },
            TableDisable {
                afi_safi: AfiSafi,
            },
            // Re-advertise the Adj-RIB-Out toward a peer.
            RouteRefresh {
                addr: IpAddr,
                afi_safi: Option<AfiSafi>,
            },
            ClearSession {
                addr: IpAddr,
                clear_type: ClearType,
            },
            NeighborQuery {
                addr: IpAddr,
                tx: oneshot::Sender<Option<NeighborState>>,
            },
            TablesQuery {
                tx: oneshot::Sender<Tables>,
            },
        }
    }

    // Output messages (main task -> child task).
    pub mod output {
        use super::*;

        #[derive(Debug, Serialize)]
        pub enum NbrTxMsg {
            SendMessage {
                nbr_addr: IpAddr,
                msg: Message,
            },
            SendMessageList {
                nbr_addr: IpAddr,
                msg_list: Vec<Message>,
            },
            UpdateCapabilities(BTreeSet<NegotiatedCapability>),
        }
    }
}

// ===== BGP tasks =====

// TCP listening task.
pub(crate) fn tcp_listener(
    listener: TcpListener,
    tcp_acceptp: &Sender<messages::input::TcpAcceptMsg>,
) -> Task<()> {
    let span1 = debug_span!("session");
    let _span1_guard = span1.enter();
    let span2 = debug_span!("input");
    let _span2_guard = span2.enter();

    let tcp_acceptp = tcp_acceptp.clone();
    Task::spawn(
        async move {
            let _ = network::listen_loop(listener, tcp_acceptp).await;
        }
        .in_current_span(),
    )
}

// TCP connect task.
pub(crate) fn tcp_connect(
    nbr: &Neighbor,
    tcp_connectp: &Sender<messages::input::TcpConnectMsg>,
) -> Task<()> {
    let span = debug_span!("neighbor", addr = %nbr.remote_addr);
    let _span_guard = span.enter();

    let remote_addr = nbr.remote_addr;
    let tcp_connectp = tcp_connectp.clone();
    Task::spawn(
        async move {
            loop {
                match network::connect(remote_addr).await {
                    Ok(conn) => {
                        // Send message to the parent BGP task.
                        let msg = messages::input::TcpConnectMsg {
                            nbr_addr: remote_addr,
                            conn,
                        };
                        let _ = tcp_connectp.send(msg).await;
                        return;
                    }
                    Err(error) => {
                        error.log();
                        // Wait one second before trying again.
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        .in_current_span(),
    )
}

// Neighbor TCP Rx task.
pub(crate) fn nbr_rx(
    nbr: &Neighbor,
    conn_id: u64,
    cxt: DecodeCxt,
    capabilities_adv: BTreeSet<Capability>,
    reader: ConnReader,
    nbr_msg_rxp: &Sender<messages::input::NbrRxMsg>,
) -> Task<()> {
    let span1 = debug_span!("neighbor", addr = %nbr.remote_addr);
    let _span1_guard = span1.enter();
    let span2 = debug_span!("input");
    let _span2_guard = span2.enter();

    let nbr_addr = nbr.remote_addr;
    let nbr_msg_rxp = nbr_msg_rxp.clone();

    // The read loop runs in an inner task so that a panic while parsing
    // untrusted input is reported as a closed connection.
    Task::spawn(
        async move {
            let worker_task = {
                let nbr_msg_rxp = nbr_msg_rxp.clone();
                Task::spawn(
                    async move {
                        let _ = network::nbr_read_loop(
                            reader,
                            nbr_addr,
                            conn_id,
                            cxt,
                            capabilities_adv,
                            nbr_msg_rxp,
                        )
                        .await;
                    }
                    .in_current_span(),
                )
            };
            if let Err(error) = worker_task.await
                && error.is_panic()
            {
                error!(%error, "task panicked");
                let msg = messages::input::NbrRxMsg {
                    nbr_addr,
                    conn_id,
                    msg: Err(NbrRxError::TcpConnClosed),
                };
                let _ = nbr_msg_rxp.send(msg).await;
            }
        }
        .in_current_span(),
    )
}

// Neighbor TCP Tx task.
pub(crate) fn nbr_tx(
    nbr: &Neighbor,
    cxt: EncodeCxt,
    writer: ConnWriter,
    msg_txc: UnboundedReceiver<messages::output::NbrTxMsg>,
) -> Task<()> {
    let span1 = debug_span!("neighbor", addr = %nbr.remote_addr);
    let _span1_guard = span1.enter();
    let span2 = debug_span!("output");
    let _span2_guard = span2.enter();

    Task::spawn(
        async move {
            network::nbr_write_loop(writer, cxt, msg_txc).await;
        }
        .in_current_span(),
    )
}

// Neighbor timer task.
pub(crate) fn nbr_timer(
    nbr: &Neighbor,
    timer: fsm::Timer,
    seconds: u16,
    nbr_timerp: &Sender<messages::input::NbrTimerMsg>,
) -> TimeoutTask {
    let nbr_timerp = nbr_timerp.clone();
    let nbr_addr = nbr.remote_addr;

    TimeoutTask::new(
        Duration::from_secs(seconds.into()),
        move || {
            let nbr_timerp = nbr_timerp.clone();

            async move {
                let msg = messages::input::NbrTimerMsg { nbr_addr, timer };
                let _ = nbr_timerp.send(msg).await;
            }
        },
    )
}

// Send periodic keepalive messages.
pub(crate) fn nbr_kalive_interval(
    nbr: &Neighbor,
    interval: u16,
) -> Option<IntervalTask> {
    let msg_txp = nbr.msg_txp.as_ref()?.clone();
    let nbr_addr = nbr.remote_addr;
    let msg_counter = Arc::clone(&nbr.statistics.msgs_sent.total);

    let task = IntervalTask::new(
        Duration::from_secs(interval.into()),
        false,
        move || {
            let msg_txp = msg_txp.clone();
            let msg_counter = msg_counter.clone();

            async move {
                let msg = Message::Keepalive(KeepaliveMsg {});
                Debug::NbrMsgTx(&nbr_addr, &msg).log();

                let msg =
                    messages::output::NbrTxMsg::SendMessage { nbr_addr, msg };
                let _ = msg_txp.send(msg);
                msg_counter.fetch_add(1, atomic::Ordering::Relaxed);
            }
        },
    );
    Some(task)
}
