// NDJSON framing over TCP
//
// Both the control protocol and the overlay link protocol exchange one JSON
// object per line. `NdjsonConn` wraps a split `TcpStream` with typed
// send/receive helpers that map failures onto the agent's error taxonomy.
// Lines longer than `MAX_FRAME_BYTES` are rejected while they are read.

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::config::constants::MAX_FRAME_BYTES;
use crate::error::{AgentError, Result};

pub struct NdjsonConn {
    lines: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: OwnedWriteHalf,
    peer: String,
}

impl NdjsonConn {
    /// Connect to `addr` (`host:port`) within `deadline`.
    pub async fn connect(addr: &str, deadline: Duration) -> Result<Self> {
        let stream = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| AgentError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| AgentError::Network(format!("connecting to {}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream, addr.to_string()))
    }

    pub fn from_stream(stream: TcpStream, peer: String) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            lines: FramedRead::new(read, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
            writer,
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let mut line = serde_json::to_vec(frame)
            .map_err(|e| AgentError::Protocol(format!("encoding frame: {}", e)))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| AgentError::Network(format!("writing to {}: {}", self.peer, e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| AgentError::Network(format!("writing to {}: {}", self.peer, e)))
    }

    /// Next frame, or `None` when the peer closed the connection.
    pub async fn recv_opt<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            let line = match self.lines.next().await {
                None => return Ok(None),
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(AgentError::Protocol(format!(
                        "frame from {} exceeds {} bytes",
                        self.peer, MAX_FRAME_BYTES
                    )))
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    return Err(AgentError::Network(format!("reading from {}: {}", self.peer, e)))
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            tracing::trace!(peer = %self.peer, frame = %line, "Received frame");
            return serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| AgentError::Protocol(format!("malformed frame from {}: {}", self.peer, e)));
        }
    }

    /// Next frame within `deadline`; EOF is a network error.
    pub async fn recv<T: DeserializeOwned>(&mut self, deadline: Duration) -> Result<T> {
        match timeout(deadline, self.recv_opt()).await {
            Err(_) => Err(AgentError::Timeout(format!("waiting for reply from {}", self.peer))),
            Ok(Ok(Some(frame))) => Ok(frame),
            Ok(Ok(None)) => Err(AgentError::Network(format!(
                "connection closed by {}",
                self.peer
            ))),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Send `frame` and wait for one reply.
    pub async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &mut self,
        frame: &Req,
        deadline: Duration,
    ) -> Result<Resp> {
        self.send(frame).await?;
        self.recv(deadline).await
    }
}
