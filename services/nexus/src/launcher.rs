//! Worker launchers
//!
//! A [`Launcher`] turns one declared actor into a running worker. The
//! [`ProcessLauncher`] gives every actor its own OS process, re-executing the
//! `nexus` binary with the hidden `worker` subcommand; the actor's signal and
//! comm channels are bridged over Unix sockets in the runtime directory and
//! data channels are bridged directly between workers. The
//! [`ThreadLauncher`] runs each actor on a dedicated thread of the
//! supervisor process, sharing channels in memory.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use actors::{ActorContext, ActorRegistry, Comm, Message, Signal, Stage};
use channel::{socket_path, Bridge, Channel};
use nix::sys::signal::{kill, Signal as UnixSignal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use store::StoreClient;
use topology::{ActorGraph, ActorSpec};
use tracing::{debug, info, warn};

use crate::{NexusError, Result};

const REAP_POLL: Duration = Duration::from_millis(10);
const TERM_GRACE: Duration = Duration::from_millis(500);
const BRIDGE_GRACE: Duration = Duration::from_millis(200);

/// Everything a launcher needs to start one actor
pub struct LaunchContext<'a> {
    pub spec: &'a ActorSpec,
    pub graph: &'a ActorGraph,
    pub registry: &'a ActorRegistry,
    pub q_sig: Channel<Signal>,
    pub q_comm: Channel<Comm>,
    /// Data links keyed by this actor's port names
    pub inputs: Vec<(String, Channel<Message>)>,
    pub outputs: Vec<(String, Channel<Message>)>,
    pub store: StoreClient,
    pub runtime_dir: &'a Path,
}

impl LaunchContext<'_> {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.graph.settings().poll_interval_ms)
    }
}

/// A running worker as seen by the supervisor
pub trait WorkerHandle: Send {
    /// Human-readable identity for logs.
    fn id(&self) -> String;

    /// OS process id when the worker runs in a process of its own.
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_running(&mut self) -> bool;

    /// Wait up to `timeout` for the worker to exit. Returns true once it has.
    fn join(&mut self, timeout: Duration) -> bool;

    /// Stop the worker without its cooperation, as far as possible.
    fn terminate(&mut self);
}

pub trait Launcher: Send {
    fn launch(&self, ctx: LaunchContext<'_>) -> Result<Box<dyn WorkerHandle>>;
}

/// Runs every actor on its own thread inside the supervisor process
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadLauncher;

impl ThreadLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&self, ctx: LaunchContext<'_>) -> Result<Box<dyn WorkerHandle>> {
        let name = ctx.spec.name.clone();
        let kind = ctx.registry.build(ctx.spec)?;

        let mut actor_ctx = ActorContext::new(&name, ctx.q_sig.clone(), ctx.q_comm.clone(), ctx.store.clone())
            .with_poll_interval(ctx.poll_interval());
        for (port, link) in &ctx.inputs {
            actor_ctx = actor_ctx.with_input(port.as_str(), link.clone());
        }
        for (port, link) in &ctx.outputs {
            actor_ctx = actor_ctx.with_output(port.as_str(), link.clone());
        }

        let thread = std::thread::Builder::new()
            .name(format!("actor:{name}"))
            .spawn(move || match kind.run(&actor_ctx) {
                Ok(outcome) => debug!(actor = %actor_ctx.name(), steps = outcome.steps, "Actor thread finished"),
                Err(e) => actor_ctx.report(Comm::Error {
                    stage: Stage::Setup,
                    message: e.to_string(),
                }),
            })
            .map_err(|e| NexusError::launch(&name, e.to_string()))?;

        debug!(actor = %name, "Actor thread started");
        Ok(Box::new(ThreadWorker {
            name,
            q_sig: ctx.q_sig,
            thread: Some(thread),
        }))
    }
}

struct ThreadWorker {
    name: String,
    q_sig: Channel<Signal>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle for ThreadWorker {
    fn id(&self) -> String {
        format!("thread:{}", self.name)
    }

    fn is_running(&mut self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn join(&mut self, timeout: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                self.thread = Some(thread);
                return false;
            }
            std::thread::sleep(REAP_POLL);
        }
        if thread.join().is_err() {
            warn!(actor = %self.name, "Actor thread panicked");
        }
        true
    }

    /// Threads cannot be killed; closing the signal channel makes the run
    /// manager leave its loop after the current step.
    fn terminate(&mut self) {
        self.q_sig.close();
        if !self.join(TERM_GRACE) {
            warn!(actor = %self.name, "Actor thread did not exit, detaching");
            self.thread = None;
        }
    }
}

/// Boot description handed to a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerManifest {
    /// Actor this worker runs
    pub actor: String,
    /// Configuration text of the whole pipeline
    pub config: String,
    pub store_path: PathBuf,
    /// Directory holding every bridge socket
    pub socket_dir: PathBuf,
}

impl WorkerManifest {
    pub fn path_in(dir: &Path, actor: &str) -> PathBuf {
        dir.join(format!("{actor}.manifest.json"))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| NexusError::manifest(format!("cannot open {path:?}: {e}")))?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// Runs every actor in its own OS process
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    /// Launch workers by running `program worker --manifest <path>`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe() -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("nexus"));
        Self::new(program)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, ctx: LaunchContext<'_>) -> Result<Box<dyn WorkerHandle>> {
        let name = ctx.spec.name.clone();
        let manifest = WorkerManifest {
            actor: name.clone(),
            config: ctx.graph.source().to_string(),
            store_path: ctx.store.path().to_path_buf(),
            socket_dir: ctx.runtime_dir.to_path_buf(),
        };
        let manifest_path = WorkerManifest::path_in(ctx.runtime_dir, &name);
        manifest.write(&manifest_path)?;

        // Bind before spawning so the worker's forwarder finds us.
        let comm_bridge = ctx
            .q_comm
            .receive_from(socket_path(ctx.runtime_dir, ctx.q_comm.name()))?;
        let sig_bridge = ctx
            .q_sig
            .forward_to(socket_path(ctx.runtime_dir, ctx.q_sig.name()))?;

        let child = Command::new(&self.program)
            .arg("worker")
            .arg("--manifest")
            .arg(&manifest_path)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| NexusError::launch(&name, format!("cannot spawn {:?}: {e}", self.program)))?;

        info!(actor = %name, pid = child.id(), "Worker process started");
        Ok(Box::new(ProcessWorker {
            name,
            child,
            exited: false,
            bridges: vec![comm_bridge, sig_bridge],
        }))
    }
}

struct ProcessWorker {
    name: String,
    child: Child,
    exited: bool,
    bridges: Vec<Bridge>,
}

impl ProcessWorker {
    fn reap(&mut self) -> bool {
        if self.exited {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exited = true;
                if status.success() {
                    debug!(actor = %self.name, "Worker process exited");
                } else {
                    warn!(actor = %self.name, status = %status, "Worker process exited abnormally");
                }
                for bridge in self.bridges.drain(..) {
                    bridge.shutdown(BRIDGE_GRACE);
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(actor = %self.name, error = %e, "Failed to query worker process");
                false
            }
        }
    }
}

impl WorkerHandle for ProcessWorker {
    fn id(&self) -> String {
        format!("pid:{}", self.child.id())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_running(&mut self) -> bool {
        !self.reap()
    }

    fn join(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reap() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(REAP_POLL);
        }
    }

    fn terminate(&mut self) {
        if self.reap() {
            return;
        }
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Err(e) = kill(pid, UnixSignal::SIGTERM) {
            debug!(actor = %self.name, error = %e, "SIGTERM failed");
        }
        if self.join(TERM_GRACE) {
            return;
        }

        warn!(actor = %self.name, "Worker ignored SIGTERM, killing");
        if let Err(e) = self.child.kill() {
            warn!(actor = %self.name, error = %e, "Failed to kill worker");
        }
        let _ = self.child.wait();
        self.exited = true;
        for bridge in self.bridges.drain(..) {
            bridge.shutdown(Duration::ZERO);
        }
    }
}
