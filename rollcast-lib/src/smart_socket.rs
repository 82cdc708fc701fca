//! Unified session endpoint: framed messages over direct TCP, or datagrams
//! relayed through an external UDP tunnel when the direct path is closed.
//! The data channel is the same type bound to UDP; a host-side data socket
//! locks onto the first peer that introduces itself.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::codec::{self, FrameCodec};
use crate::message::{IpAddrPort, Message};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 8 * 1024;

/// What a receive yields besides a plain message.
#[derive(Debug)]
pub enum SocketEvent {
    Message(Message),
    /// A UDP peer introduced itself on a bound socket.
    Accepted(SocketAddr),
    /// Clean close of the stream.
    Closed,
}

type PeerCell = Arc<Mutex<Option<SocketAddr>>>;

pub struct SmartSocket {
    sender: SmartSender,
    receiver: SmartReceiver,
    tunnel: bool,
}

impl SmartSocket {
    /// Control channel dial: direct TCP first, then the relayed UDP tunnel
    /// when the direct path fails or tunneling is forced.
    pub async fn connect_tcp(
        target: &IpAddrPort,
        force_tunnel: bool,
        relay: Option<&IpAddrPort>,
    ) -> Result<Self> {
        if !force_tunnel {
            let addr = target.to_socket_addr()?;
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Self::from_stream(stream),
                Ok(Err(err)) => debug!("direct connect to {target} failed: {err}"),
                Err(_) => debug!("direct connect to {target} timed out"),
            }
            if relay.is_none() {
                bail!("could not connect to {target}");
            }
        }
        let relay = relay.context("no relay server configured for UDP tunnel")?;
        Self::connect_tunnel(target, relay).await
    }

    /// An accepted control connection.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            sender: SmartSender::Tcp { write, local, peer },
            receiver: SmartReceiver::Tcp {
                read,
                codec: FrameCodec::new(),
            },
            tunnel: false,
        })
    }

    async fn connect_tunnel(target: &IpAddrPort, relay: &IpAddrPort) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        let relay_addr = relay.to_socket_addr()?;
        // Tell the relay which peer this flow belongs to; the relay owns the
        // pairing from here on.
        socket
            .send_to(
                &codec::encode_datagram(&Message::IpAddrPort(target.clone()))?,
                relay_addr,
            )
            .await?;
        debug!("tunneling to {target} via {relay}");
        Ok(Self::udp(socket, Some(relay_addr), true))
    }

    /// Data channel dial. The tunnel flag propagates from the control
    /// socket; empty intro datagrams make the remote's bound socket accept.
    pub async fn connect_udp(
        target: &IpAddrPort,
        tunnel: bool,
        relay: Option<&IpAddrPort>,
    ) -> Result<Self> {
        if tunnel {
            let relay = relay.context("no relay server configured for UDP tunnel")?;
            let out = Self::connect_tunnel(target, relay).await?;
            out.send_intro().await?;
            return Ok(out);
        }
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        let out = Self::udp(socket, Some(target.to_socket_addr()?), false);
        out.send_intro().await?;
        Ok(out)
    }

    /// Host-side data socket: prefer the session port, fall back to an
    /// ephemeral one when the bind is refused. The peer locks on the first
    /// inbound datagram.
    pub async fn bind_udp(preferred_port: u16) -> Result<Self> {
        let socket = match UdpSocket::bind(("0.0.0.0", preferred_port)).await {
            Ok(socket) => socket,
            Err(err) => {
                debug!("bind on data port {preferred_port} failed ({err}), using ephemeral");
                UdpSocket::bind(("0.0.0.0", 0)).await?
            }
        };
        Ok(Self::udp(Arc::new(socket), None, false))
    }

    fn udp(socket: Arc<UdpSocket>, peer: Option<SocketAddr>, tunnel: bool) -> Self {
        let peer: PeerCell = Arc::new(Mutex::new(peer));
        Self {
            sender: SmartSender::Udp {
                socket: Arc::clone(&socket),
                peer: Arc::clone(&peer),
            },
            receiver: SmartReceiver::Udp { socket, peer },
            tunnel,
        }
    }

    async fn send_intro(&self) -> Result<()> {
        let SmartSender::Udp { socket, peer } = &self.sender else {
            unreachable!("intro is a datagram concept");
        };
        let peer = (*peer.lock().unwrap()).context("intro without a peer")?;
        // A few spares; losing all of them shows up as a pending timeout.
        for _ in 0..3 {
            socket.send_to(&[], peer).await?;
        }
        Ok(())
    }

    pub fn is_tunnel(&self) -> bool {
        self.tunnel
    }

    pub fn local_port(&self) -> u16 {
        match &self.sender {
            SmartSender::Tcp { local, .. } => local.port(),
            SmartSender::Udp { socket, .. } => {
                socket.local_addr().map(|a| a.port()).unwrap_or_default()
            }
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.sender {
            SmartSender::Tcp { peer, .. } => Some(*peer),
            SmartSender::Udp { peer, .. } => *peer.lock().unwrap(),
        }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.sender.send(msg).await
    }

    /// Cancel-safe: a partial TCP frame stays buffered in the codec, an
    /// interrupted datagram read consumes nothing.
    pub async fn recv(&mut self) -> Result<SocketEvent> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (SmartSender, SmartReceiver) {
        (self.sender, self.receiver)
    }
}

pub enum SmartSender {
    Tcp {
        write: OwnedWriteHalf,
        local: SocketAddr,
        peer: SocketAddr,
    },
    Udp {
        socket: Arc<UdpSocket>,
        peer: PeerCell,
    },
}

impl SmartSender {
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        trace!("send {}", msg.kind());
        match self {
            Self::Tcp { write, .. } => {
                write.write_all(&codec::encode_frame(msg)?).await?;
                Ok(())
            }
            Self::Udp { socket, peer } => {
                let peer = (*peer.lock().unwrap()).context("data socket has no peer yet")?;
                socket.send_to(&codec::encode_datagram(msg)?, peer).await?;
                Ok(())
            }
        }
    }
}

pub enum SmartReceiver {
    Tcp {
        read: OwnedReadHalf,
        codec: FrameCodec,
    },
    Udp {
        socket: Arc<UdpSocket>,
        peer: PeerCell,
    },
}

impl SmartReceiver {
    pub async fn recv(&mut self) -> Result<SocketEvent> {
        match self {
            Self::Tcp { read, codec } => loop {
                if let Some(msg) = codec.decode()? {
                    trace!("recv {}", msg.kind());
                    return Ok(SocketEvent::Message(msg));
                }
                let n = read.read_buf(codec.buf_mut()).await?;
                if n == 0 {
                    if codec.has_partial() {
                        bail!("connection closed mid-frame");
                    }
                    return Ok(SocketEvent::Closed);
                }
            },
            Self::Udp { socket, peer } => loop {
                let mut buf = [0u8; MAX_DATAGRAM];
                let (n, from) = socket.recv_from(&mut buf).await?;
                let locked = *peer.lock().unwrap();
                match locked {
                    None => {
                        *peer.lock().unwrap() = Some(from);
                        if let Some(msg) = codec::decode_datagram(&buf[..n])? {
                            // Rare but legal: the peer's first datagram
                            // already carries a message.
                            trace!("recv {} (accepting {from})", msg.kind());
                            return Ok(SocketEvent::Message(msg));
                        }
                        return Ok(SocketEvent::Accepted(from));
                    }
                    Some(expected) if expected != from => {
                        trace!("dropping datagram from stray peer {from}");
                        continue;
                    }
                    Some(_) => match codec::decode_datagram(&buf[..n])? {
                        Some(msg) => {
                            trace!("recv {}", msg.kind());
                            return Ok(SocketEvent::Message(msg));
                        }
                        None => continue,
                    },
                }
            },
        }
    }
}
