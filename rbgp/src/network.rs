//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};

use crate::error::{Error, IoError, NbrRxError};
use crate::packet::message::{
    Capability, DecodeCxt, EncodeCxt, Message, negotiate,
};
use crate::tasks::messages::input::{NbrRxMsg, TcpAcceptMsg};
use crate::tasks::messages::output::NbrTxMsg;

pub const BGP_PORT: u16 = 179;

// Type aliases.
pub type ConnReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ConnWriter = Box<dyn AsyncWrite + Send + Unpin>;

// Established transport connection toward a peer.
pub struct Connection {
    pub conn_info: ConnInfo,
    pub reader: ConnReader,
    pub writer: ConnWriter,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ConnInfo {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

// Which side opened the connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ConnDirection {
    Inbound,
    Outbound,
}

// ===== impl Connection =====

impl Connection {
    // Wraps any ordered, reliable byte stream.
    pub fn new<S>(stream: S, conn_info: ConnInfo) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Connection {
            conn_info,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Result<Connection, IoError> {
        let local = stream.local_addr().map_err(IoError::TcpInfoError)?;
        let remote = stream.peer_addr().map_err(IoError::TcpInfoError)?;
        let conn_info = ConnInfo {
            local_addr: local.ip(),
            local_port: local.port(),
            remote_addr: remote.ip(),
            remote_port: remote.port(),
        };
        let (reader, writer) = stream.into_split();
        Ok(Connection {
            conn_info,
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_info", &self.conn_info)
            .finish_non_exhaustive()
    }
}

// ===== global functions =====

pub(crate) async fn listen_loop(
    listener: TcpListener,
    tcp_acceptp: Sender<TcpAcceptMsg>,
) -> Result<(), SendError<TcpAcceptMsg>> {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => match Connection::from_tcp(stream) {
                Ok(conn) => {
                    tcp_acceptp.send(TcpAcceptMsg { conn }).await?;
                }
                Err(error) => {
                    error.log();
                }
            },
            Err(error) => {
                IoError::TcpAcceptError(error).log();
            }
        }
    }
}

pub(crate) async fn connect(remote_addr: IpAddr) -> Result<Connection, Error> {
    let sockaddr = SocketAddr::from((remote_addr, BGP_PORT));
    let stream = TcpStream::connect(sockaddr)
        .await
        .map_err(IoError::TcpConnectError)?;
    let conn = Connection::from_tcp(stream)?;
    Ok(conn)
}

pub(crate) async fn nbr_write_loop(
    mut writer: ConnWriter,
    mut cxt: EncodeCxt,
    mut nbr_msg_txc: UnboundedReceiver<NbrTxMsg>,
) {
    while let Some(msg) = nbr_msg_txc.recv().await {
        match msg {
            // Send message to the peer.
            NbrTxMsg::SendMessage { msg, .. } => {
                let buf = msg.encode(&cxt);
                if let Err(error) = writer.write_all(&buf).await {
                    IoError::TcpSendError(error).log();
                }
            }
            // Send list of messages to the peer.
            NbrTxMsg::SendMessageList { msg_list, .. } => {
                for msg in msg_list {
                    let buf = msg.encode(&cxt);
                    if let Err(error) = writer.write_all(&buf).await {
                        IoError::TcpSendError(error).log();
                    }
                }
            }
            // Update negotiated capabilities.
            NbrTxMsg::UpdateCapabilities(caps) => cxt.capabilities = caps,
        }
    }

    // All senders are gone: the session is over.
    let _ = writer.shutdown().await;
}

pub(crate) async fn nbr_read_loop(
    mut reader: ConnReader,
    nbr_addr: IpAddr,
    conn_id: u64,
    mut cxt: DecodeCxt,
    capabilities_adv: BTreeSet<Capability>,
    nbr_msg_rxp: Sender<NbrRxMsg>,
) -> Result<(), SendError<NbrRxMsg>> {
    const BUF_SIZE: usize = 65535;
    let mut buf = vec![0; BUF_SIZE];
    let mut data = Vec::with_capacity(BUF_SIZE);

    loop {
        // Read data from the network.
        match reader.read(&mut buf).await {
            Ok(0) => {
                // Notify that the connection was closed by the remote end.
                let msg = NbrRxMsg {
                    nbr_addr,
                    conn_id,
                    msg: Err(NbrRxError::TcpConnClosed),
                };
                nbr_msg_rxp.send(msg).await?;
                return Ok(());
            }
            Ok(num_bytes) => data.extend_from_slice(&buf[..num_bytes]),
            Err(error) => {
                IoError::TcpRecvError(error).log();
                let msg = NbrRxMsg {
                    nbr_addr,
                    conn_id,
                    msg: Err(NbrRxError::TcpConnClosed),
                };
                nbr_msg_rxp.send(msg).await?;
                return Ok(());
            }
        };

        // Decode message(s).
        while let Some(msg_size) = Message::get_message_len(&data) {
            let msg = Message::decode(&data[0..msg_size], &cxt)
                .map_err(NbrRxError::MsgDecodeError);
            data.drain(..msg_size);

            // The session's capabilities influence how later messages are
            // decoded.
            if let Ok(Message::Open(msg)) = &msg {
                cxt.capabilities =
                    negotiate(&capabilities_adv, &msg.capabilities);
            }

            // A decode error ends the session, nothing after it is usable.
            let fatal = msg.is_err();
            let msg = NbrRxMsg {
                nbr_addr,
                conn_id,
                msg,
            };
            nbr_msg_rxp.send(msg).await?;
            if fatal {
                return Ok(());
            }
        }
    }
}
