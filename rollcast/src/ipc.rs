//! Bidirectional message stream to the game process: the session codec over
//! a loopback TCP channel. The controller binds before spawning and hands
//! the port to the child on its command line.

use anyhow::{bail, Result};
use rollcast_lib::codec::{self, FrameCodec};
use rollcast_lib::message::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::trace;

pub struct IpcServer {
    listener: TcpListener,
}

impl IpcServer {
    pub async fn bind() -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind("127.0.0.1:0").await?,
        })
    }

    pub async fn bind_on(port: u16) -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(("127.0.0.1", port)).await?,
        })
    }

    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or_default()
    }

    pub async fn accept(&self) -> Result<IpcChannel> {
        let (stream, peer) = self.listener.accept().await?;
        if !peer.ip().is_loopback() {
            bail!("refusing non-loopback IPC peer {peer}");
        }
        IpcChannel::from_stream(stream)
    }
}

pub struct IpcChannel {
    stream: TcpStream,
    codec: FrameCodec,
}

impl IpcChannel {
    fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            codec: FrameCodec::new(),
        })
    }

    /// Game-process side of the channel.
    pub async fn connect(port: u16) -> Result<Self> {
        Self::from_stream(TcpStream::connect(("127.0.0.1", port)).await?)
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        trace!("ipc send {}", msg.kind());
        self.stream.write_all(&codec::encode_frame(msg)?).await?;
        Ok(())
    }

    /// Cancel-safe; `Ok(None)` is the game going away.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = self.codec.decode()? {
                trace!("ipc recv {}", msg.kind());
                return Ok(Some(msg));
            }
            let n = self.stream.read_buf(self.codec.buf_mut()).await?;
            if n == 0 {
                if self.codec.has_partial() {
                    bail!("ipc channel closed mid-frame");
                }
                return Ok(None);
            }
        }
    }
}
