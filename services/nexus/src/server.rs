//! Remote control channel
//!
//! Three TCP listeners speaking newline-delimited UTF-8:
//!
//! - **control**: request/reply. Each line is a command for
//!   [`Nexus::command`]; each gets exactly one reply line.
//! - **output**: publish only. Every executed command is echoed to all
//!   subscribers.
//! - **logging**: publish only. Formatted log events from the
//!   [`LogPublisher`](crate::logging::LogPublisher).
//!
//! The supervisor itself runs on a dedicated thread that owns the [`Nexus`],
//! executes commands in arrival order and polls comm channels between them.
//! A `quit` command replies [`QUIT_REPLY`] and stops the server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use crate::supervisor::{Nexus, QUIT_REPLY};
use crate::Result;

const OUTPUT_BACKLOG: usize = 256;
const SUPERVISOR_POLL: Duration = Duration::from_millis(50);

/// Listener ports; 0 picks a free port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerPorts {
    pub control: u16,
    pub output: u16,
    pub logging: u16,
}

impl Default for ServerPorts {
    fn default() -> Self {
        Self {
            control: 5555,
            output: 5556,
            logging: 5557,
        }
    }
}

struct Request {
    line: String,
    reply: oneshot::Sender<String>,
}

pub struct ControlServer {
    control: TcpListener,
    output: TcpListener,
    logging: TcpListener,
    output_tx: broadcast::Sender<String>,
    log_tx: broadcast::Sender<String>,
}

impl ControlServer {
    /// Bind all three listeners on `host`. Log lines published on `log_tx`
    /// reach logging subscribers.
    pub async fn bind(host: &str, ports: ServerPorts, log_tx: broadcast::Sender<String>) -> Result<Self> {
        let control = TcpListener::bind((host, ports.control)).await?;
        let output = TcpListener::bind((host, ports.output)).await?;
        let logging = TcpListener::bind((host, ports.logging)).await?;
        let (output_tx, _) = broadcast::channel(OUTPUT_BACKLOG);

        Ok(Self {
            control,
            output,
            logging,
            output_tx,
            log_tx,
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control.local_addr()?)
    }

    pub fn output_addr(&self) -> Result<SocketAddr> {
        Ok(self.output.local_addr()?)
    }

    pub fn logging_addr(&self) -> Result<SocketAddr> {
        Ok(self.logging.local_addr()?)
    }

    /// Serve until a controller sends `quit`. The pipeline is destroyed
    /// before this returns.
    pub async fn run(self, nexus: Nexus) -> Result<()> {
        info!(
            control = ?self.control.local_addr().ok(),
            output = ?self.output.local_addr().ok(),
            logging = ?self.logging.local_addr().ok(),
            "Control server listening"
        );

        let (req_tx, req_rx) = crossbeam_channel::unbounded::<Request>();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let supervisor = std::thread::Builder::new()
            .name("nexus".into())
            .spawn(move || supervise(nexus, req_rx))?;

        let publishers = [
            tokio::spawn(publish(self.output, self.output_tx.clone(), stop_tx.subscribe())),
            tokio::spawn(publish(self.logging, self.log_tx.clone(), stop_tx.subscribe())),
        ];

        loop {
            tokio::select! {
                accepted = self.control.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Control accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "Controller connected");
                    tokio::spawn(control_session(
                        stream,
                        req_tx.clone(),
                        self.output_tx.clone(),
                        Arc::clone(&stop_tx),
                    ));
                }
                _ = stop_rx.changed() => break,
            }
        }

        let _ = stop_tx.send(true);
        drop(req_tx);
        for task in publishers {
            let _ = task.await;
        }
        if tokio::task::spawn_blocking(move || supervisor.join())
            .await
            .map_or(true, |joined| joined.is_err())
        {
            warn!("Supervisor thread panicked");
        }
        info!("Control server stopped");
        Ok(())
    }
}

/// Owns the supervisor: executes requests, polls while idle.
fn supervise(mut nexus: Nexus, requests: Receiver<Request>) {
    loop {
        match requests.recv_timeout(SUPERVISOR_POLL) {
            Ok(Request { line, reply }) => {
                let answer = nexus.command(&line);
                let quit = answer == QUIT_REPLY;
                let _ = reply.send(answer);
                if quit {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                nexus.poll();
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if let Err(e) = nexus.destroy() {
        warn!(error = %e, "Shutdown failed");
    }
}

async fn control_session(
    stream: TcpStream,
    requests: Sender<Request>,
    output: broadcast::Sender<String>,
    stop: Arc<watch::Sender<bool>>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Control session read failed");
                break;
            }
        };
        let command = line.trim().to_string();
        if command.is_empty() {
            continue;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            line: command.clone(),
            reply: reply_tx,
        };
        let reply = match requests.send(request) {
            Ok(()) => reply_rx.await.unwrap_or_else(|_| QUIT_REPLY.to_string()),
            Err(_) => QUIT_REPLY.to_string(),
        };
        info!(command = %command, reply = %reply, "Command executed");
        let _ = output.send(command);

        let quit = reply == QUIT_REPLY;
        if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
            break;
        }
        if quit {
            let _ = writer.flush().await;
            let _ = stop.send(true);
            break;
        }
    }
}

/// Accept subscribers on `listener` and forward every published line to them.
async fn publish(listener: TcpListener, tx: broadcast::Sender<String>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Subscriber connected");
                    tokio::spawn(subscriber(stream, tx.subscribe(), stop.clone()));
                }
                Err(e) => warn!(error = %e, "Subscriber accept failed"),
            },
            _ = stop.changed() => return,
        }
    }
}

async fn subscriber(mut stream: TcpStream, mut rx: broadcast::Receiver<String>, mut stop: watch::Receiver<bool>) {
    loop {
        let line = tokio::select! {
            received = rx.recv() => match received {
                Ok(line) => line,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Subscriber lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = stop.changed() => return,
        };
        if stream.write_all(format!("{line}\n").as_bytes()).await.is_err() {
            return;
        }
    }
}
