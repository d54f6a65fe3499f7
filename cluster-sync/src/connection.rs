//! Connection descriptions and point-to-point links.
//!
//! A [`Connection`] is the outbound half of a link: packets are encoded on the
//! caller's thread and handed to a writer task that owns the socket, so sends
//! never block and stay in order. Inbound halves are read by the receiver loop
//! with [`read_packet`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::lookup_host;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::packet::{Packet, MAX_FRAME_LEN};
use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcpip,
}

/// How to reach one node. Good for both listening and connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescription {
    #[serde(default)]
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
}

impl ConnectionDescription {
    pub fn tcpip(address: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: Protocol::Tcpip,
            address: address.into(),
            port,
        }
    }

    /// Resolves the address on the runtime, without blocking a worker.
    pub async fn socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = lookup_host((self.address.as_str(), self.port)).await?.collect();
        if addrs.is_empty() {
            return Err(Error::Config(format!("{self} does not resolve to any address")));
        }
        Ok(addrs)
    }
}

impl fmt::Display for ConnectionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for ConnectionDescription {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("expected host:port, got '{s}'")))?;
        if address.is_empty() {
            return Err(Error::Config(format!("missing host in '{s}'")));
        }
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in '{s}'")))?;
        Ok(Self::tcpip(address, port))
    }
}

/// Outbound half of a link to one peer.
pub struct Connection {
    description: ConnectionDescription,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Connection {
    /// Wraps the write half of a TCP stream. The writer task runs on `runtime`.
    pub fn spawn_tcp(
        runtime: &tokio::runtime::Handle,
        description: ConnectionDescription,
        writer: OwnedWriteHalf,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = description.to_string();
        runtime.spawn(write_loop(rx, writer, peer));
        Self {
            description,
            outbound: Mutex::new(Some(tx)),
        }
    }

    /// An in-memory link whose frames are collected by the returned receiver.
    pub fn pipe(description: ConnectionDescription) -> (Self, PipeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Self {
            description,
            outbound: Mutex::new(Some(tx)),
        };
        (connection, PipeReceiver { rx })
    }

    pub fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    pub fn send(&self, packet: &Packet) -> Result<()> {
        let frame = packet.encode_frame()?;
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or_else(closed_error)?;
        tx.send(frame).map_err(|_| closed_error())
    }

    /// Stops accepting packets. Frames already queued are still written.
    pub fn close(&self) {
        if self.outbound.lock().take().is_some() {
            debug!(peer = %self.description, "connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("description", &self.description)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))
}

async fn write_loop(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, mut writer: OwnedWriteHalf, peer: String) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            warn!(%peer, error = ?err, "failed to write frame");
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(%peer, error = ?err, "failed to shut down writer");
    }
}

/// Receiving end of [`Connection::pipe`].
pub struct PipeReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl PipeReceiver {
    pub fn try_recv_packet(&mut self) -> Option<Packet> {
        let frame = self.rx.try_recv().ok()?;
        Packet::decode(&frame[4..]).ok()
    }

    /// Every packet sent so far.
    pub fn drain(&mut self) -> Vec<Packet> {
        std::iter::from_fn(|| self.try_recv_packet()).collect()
    }
}

/// Reads one frame. Returns `None` when the peer closed the stream between
/// frames.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Packet::decode(&body).map(Some)
}

/// Announces the connecting node's identity.
pub async fn write_handshake<W>(writer: &mut W, node: NodeId) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&node.0.to_le_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_handshake<R>(reader: &mut R) -> Result<NodeId>
where
    R: AsyncRead + Unpin,
{
    let mut id_buf = [0u8; 4];
    reader
        .read_exact(&mut id_buf)
        .await
        .map_err(|err| Error::Handshake(format!("peer did not announce its node id: {err}")))?;
    let id = u32::from_le_bytes(id_buf);
    if id == 0 {
        return Err(Error::Handshake("peer announced node id 0".to_string()));
    }
    Ok(NodeId(id))
}
