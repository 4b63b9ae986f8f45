//! Cross-process bridging
//!
//! Actors live in separate processes, so each end of a channel holds its own
//! [`Channel`] and the two are joined over a Unix domain socket. The consuming
//! side binds the socket and runs a *pump* that pushes every received frame
//! into its local queue. The producing side runs a *forwarder* that drains its
//! local queue onto the socket, retrying the connection until the consumer is
//! listening.
//!
//! Each bridge drives its task on a private current-thread tokio runtime on
//! its own OS thread, so neither side needs a runtime of its own.
//!
//! Frames are a little-endian `u32` length followed by the bincode encoding of
//! one message. Messages were already audit-logged by the producer, so the
//! pump does not log them again.

use std::io;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::channel::Payload;
use crate::{Channel, ChannelError, Result};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const CONNECT_RETRY: Duration = Duration::from_millis(20);

/// Which end of the socket a bridge serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeRole {
    /// Drains the local queue onto the socket
    Forwarder,
    /// Pushes frames from the socket into the local queue
    Pump,
}

/// Background task carrying one channel across a process boundary
pub struct Bridge {
    channel: String,
    role: BridgeRole,
    path: PathBuf,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("channel", &self.channel)
            .field("role", &self.role)
            .field("path", &self.path)
            .finish()
    }
}

impl Bridge {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn role(&self) -> BridgeRole {
        self.role
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Give the task up to `grace` to finish on its own (a forwarder drains
    /// its closed channel), then cancel it and join.
    pub fn shutdown(mut self, grace: Duration) {
        self.finish(grace);
    }

    fn finish(&mut self, grace: Duration) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        let deadline = Instant::now() + grace;
        while !thread.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if thread.join().is_err() {
            warn!(channel = %self.channel, "Bridge thread panicked");
        }

        if self.role == BridgeRole::Pump {
            let _ = std::fs::remove_file(&self.path);
        }
        debug!(channel = %self.channel, role = ?self.role, "Bridge stopped");
    }

    /// Run `task` on `runtime` in a dedicated thread until it completes or
    /// the bridge is stopped.
    fn spawn<F>(
        channel: &str,
        role: BridgeRole,
        path: PathBuf,
        runtime: Runtime,
        task: F,
    ) -> Result<Self>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (stop, stopped) = oneshot::channel::<()>();
        let prefix = match role {
            BridgeRole::Forwarder => "fwd",
            BridgeRole::Pump => "pump",
        };

        let thread = std::thread::Builder::new()
            .name(format!("{prefix}:{channel}"))
            .spawn(move || {
                runtime.block_on(async move {
                    tokio::select! {
                        _ = stopped => {}
                        _ = task => {}
                    }
                });
            })?;

        Ok(Self {
            channel: channel.to_string(),
            role,
            path,
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.finish(Duration::ZERO);
    }
}

fn bridge_runtime() -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

/// Encode one length-prefixed frame.
pub fn encode_frame<M: Payload>(msg: &M) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| ChannelError::bridge("frame", format!("frame of {} bytes", body.len())))?;

    let mut frame = Vec::with_capacity(4 + body.len());
    WriteBytesExt::write_u32::<LittleEndian>(&mut frame, len)?;
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one length-prefixed frame. A clean end of stream surfaces as an
/// `UnexpectedEof` I/O error.
pub async fn read_frame<M: Payload, R: AsyncRead + Unpin>(reader: &mut R) -> Result<M> {
    let len = reader.read_u32_le().await?;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::bridge(
            "frame",
            format!("peer sent frame of {len} bytes"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

fn is_eof(err: &ChannelError) -> bool {
    matches!(err, ChannelError::Io(e) if matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    ))
}

impl<M: Payload> Channel<M> {
    /// Forward everything put on this channel to the pump listening at `path`.
    pub fn forward_to(&self, path: impl AsRef<Path>) -> Result<Bridge> {
        let path = path.as_ref().to_path_buf();
        let runtime = bridge_runtime()?;
        let task = run_forwarder(self.clone(), path.clone());
        Bridge::spawn(self.name(), BridgeRole::Forwarder, path, runtime, task)
    }

    /// Bind `path` and push every frame received on it into this channel.
    ///
    /// The socket is bound before this returns, so a peer may connect as soon
    /// as the call completes.
    pub fn receive_from(&self, path: impl AsRef<Path>) -> Result<Bridge> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let runtime = bridge_runtime()?;
        let listener = {
            let _enter = runtime.enter();
            UnixListener::bind(&path).map_err(|e| {
                ChannelError::bridge(self.name(), format!("failed to bind {path:?}: {e}"))
            })?
        };
        debug!(channel = %self.name(), path = ?path, "Bridge listening");

        let task = run_pump(self.clone(), listener);
        Bridge::spawn(self.name(), BridgeRole::Pump, path, runtime, task)
    }
}

async fn run_forwarder<M: Payload>(channel: Channel<M>, path: PathBuf) {
    let mut stream = loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => break stream,
            Err(_) if channel.is_closed() && channel.is_empty() => return,
            Err(_) => tokio::time::sleep(CONNECT_RETRY).await,
        }
    };
    debug!(channel = %channel.name(), path = ?path, "Forwarder connected");

    loop {
        let msg = match channel.get_async(None).await {
            Ok(msg) => msg,
            Err(ChannelError::Closed { .. }) => break,
            Err(e) => {
                warn!(channel = %channel.name(), error = %e, "Forwarder stopped");
                break;
            }
        };

        let written = match encode_frame(&msg) {
            Ok(frame) => stream.write_all(&frame).await.map_err(ChannelError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(channel = %channel.name(), error = %e, "Failed to forward message");
            break;
        }
    }
    let _ = stream.shutdown().await;
}

async fn run_pump<M: Payload>(channel: Channel<M>, listener: UnixListener) {
    let stream = match listener.accept().await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(channel = %channel.name(), error = %e, "Pump accept failed");
            return;
        }
    };
    debug!(channel = %channel.name(), "Pump accepted peer");

    let mut reader = BufReader::new(stream);
    loop {
        match read_frame::<M, _>(&mut reader).await {
            Ok(msg) => {
                if channel.deliver(msg).await.is_err() {
                    break;
                }
            }
            Err(e) if is_eof(&e) => break,
            Err(e) => {
                warn!(channel = %channel.name(), error = %e, "Pump read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_layout() {
        let buf = encode_frame(&"abc".to_string()).unwrap();

        let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(body_len, buf.len() - 4);

        let msg: String = read_frame(&mut buf.as_slice()).await.unwrap();
        assert_eq!(msg, "abc");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        WriteBytesExt::write_u32::<LittleEndian>(&mut buf, MAX_FRAME_LEN + 1).unwrap();
        let err = read_frame::<String, _>(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Bridge { .. }));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_eof() {
        let buf = [1u8, 0];
        let err = read_frame::<String, _>(&mut &buf[..]).await.unwrap_err();
        assert!(is_eof(&err));
    }

    #[test]
    fn test_stop_cancels_idle_pump() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("idle.sock");
        let chan: Channel<u32> = Channel::new("idle", "A", "B");

        let pump = chan.receive_from(&path).unwrap();
        assert!(path.exists());
        assert!(!pump.is_finished());

        let started = Instant::now();
        pump.shutdown(Duration::ZERO);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!path.exists());
    }
}
