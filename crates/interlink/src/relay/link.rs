//! Frame-level I/O for one TCP connection.
//!
//! A reader task decodes frames into a channel so the owning connection task
//! can `select!` over inbound frames, outbound work, close requests and the
//! idle deadline without cancelling a half-read frame.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::codec::{Frame, FrameCodec};
use super::framing::{read_frame, write_frame};
use crate::error::FrameError;

const INBOUND_BUFFER: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Next event on a connection's inbound side.
#[derive(Debug)]
pub(crate) enum Inbound {
    Frame(Frame),
    /// Undecodable or unreadable input; the connection must close.
    Failed(String),
    /// The peer closed the stream.
    Closed,
    /// Nothing was sent or received for the idle timeout.
    IdleTimeout,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum LinkError {
    #[error("encode failed: {0}")]
    Encode(#[from] FrameError),
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("peer stopped reading for {0:?}")]
    Stalled(Duration),
}

pub(crate) struct LinkIo {
    writer: OwnedWriteHalf,
    inbound: mpsc::Receiver<Result<Frame, String>>,
    reader_task: JoinHandle<()>,
    codec: FrameCodec,
    idle_timeout: Duration,
    last_activity: Instant,
    peer_addr: SocketAddr,
}

impl LinkIo {
    pub(crate) fn new(stream: TcpStream, codec: FrameCodec, idle_timeout: Duration) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();
        let (tx, inbound) = mpsc::channel(INBOUND_BUFFER);
        let max_frame = codec.limits().max_frame_bytes;

        let reader_task = tokio::spawn(async move {
            loop {
                let item = match read_frame(&mut reader, max_frame).await {
                    Ok(Some(body)) => codec.decode(&body).map_err(|e| e.to_string()),
                    Ok(None) => break,
                    Err(e) => Err(e.to_string()),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            debug!("Reader for {} finished", peer_addr);
        });

        Ok(Self {
            writer,
            inbound,
            reader_task,
            codec,
            idle_timeout,
            last_activity: Instant::now(),
            peer_addr,
        })
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Waits for the next inbound event. Cancel-safe.
    pub(crate) async fn recv(&mut self) -> Inbound {
        let deadline = self.last_activity + self.idle_timeout;
        tokio::select! {
            item = self.inbound.recv() => {
                self.touch();
                match item {
                    Some(Ok(frame)) => Inbound::Frame(frame),
                    Some(Err(reason)) => Inbound::Failed(reason),
                    None => Inbound::Closed,
                }
            }
            _ = tokio::time::sleep_until(deadline) => Inbound::IdleTimeout,
        }
    }

    pub(crate) async fn send(&mut self, frame: &Frame) -> Result<(), LinkError> {
        let body = self.codec.encode(frame)?;
        self.send_raw(&body).await
    }

    /// Writes an already encoded frame body.
    ///
    /// The write must finish before the idle deadline; a peer that stops
    /// reading fails the link instead of blocking it.
    pub(crate) async fn send_raw(&mut self, body: &[u8]) -> Result<(), LinkError> {
        let deadline = self.last_activity + self.idle_timeout;
        match tokio::time::timeout_at(deadline, write_frame(&mut self.writer, body)).await {
            Ok(written) => written?,
            Err(_) => return Err(LinkError::Stalled(self.idle_timeout)),
        }
        self.touch();
        Ok(())
    }

    /// Flushes and shuts down the write side, then stops the reader.
    pub(crate) async fn close(&mut self) {
        let _ = tokio::time::timeout(CLOSE_GRACE, self.writer.shutdown()).await;
        self.reader_task.abort();
    }
}

impl Drop for LinkIo {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
