//! The Nexus supervisor
//!
//! Owns the object store, every channel and one [`ActorHandle`] per declared
//! actor. Lifecycle:
//!
//! ```text
//! uninitialized ──create──▶ constructed ──launch/start──▶ running ──destroy──▶ stopped
//!                                                                   ▲
//!        any state ─────────────────────destroy─────────────────────┘
//! ```
//!
//! Actor states move only in response to broadcasts, comm acknowledgments
//! and worker liveness. A failing actor moves to `error` alone; the rest of
//! the pipeline keeps running.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use actors::{ActorRegistry, Comm, Message, Signal};
use channel::Channel;
use store::Store;
use tempfile::TempDir;
use topology::{ActorGraph, ChannelSpec, GraphLoader, Settings, SUPERVISOR};
use tracing::{debug, error, info, warn};

use crate::handle::ActorHandle;
use crate::launcher::{LaunchContext, Launcher, ProcessLauncher};
use crate::state::{ActorState, Flags, NexusState};
use crate::{NexusError, Result};

/// Reply to the `quit` command telling controllers to exit.
pub const QUIT_REPLY: &str = "QUIT";

pub struct Nexus {
    name: String,
    registry: ActorRegistry,
    launcher: Box<dyn Launcher>,
    state: NexusState,
    flags: Flags,
    graph: Option<ActorGraph>,
    store: Option<Store>,
    runtime_dir: Option<TempDir>,
    actors: BTreeMap<String, ActorHandle>,
    comm_queues: BTreeMap<String, Channel<Comm>>,
    sig_queues: BTreeMap<String, Channel<Signal>>,
    data_queues: BTreeMap<String, Channel<Message>>,
}

impl fmt::Display for Nexus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Nexus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nexus")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("actors", &self.actors)
            .finish()
    }
}

impl Nexus {
    /// Supervisor launching one worker process per actor.
    pub fn new(name: impl Into<String>, registry: ActorRegistry) -> Self {
        Self {
            name: name.into(),
            registry,
            launcher: Box::new(ProcessLauncher::current_exe()),
            state: NexusState::Uninitialized,
            flags: Flags::default(),
            graph: None,
            store: None,
            runtime_dir: None,
            actors: BTreeMap::new(),
            comm_queues: BTreeMap::new(),
            sig_queues: BTreeMap::new(),
            data_queues: BTreeMap::new(),
        }
    }

    pub fn with_launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NexusState {
        self.state
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn graph(&self) -> Option<&ActorGraph> {
        self.graph.as_ref()
    }

    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }

    pub fn registry(&self) -> &ActorRegistry {
        &self.registry
    }

    /// Directory holding bridge sockets and worker manifests.
    pub fn runtime_dir(&self) -> Option<&Path> {
        self.runtime_dir.as_ref().map(TempDir::path)
    }

    pub fn actors(&self) -> &BTreeMap<String, ActorHandle> {
        &self.actors
    }

    pub fn actor_state(&self, actor: &str) -> Option<ActorState> {
        self.actors.get(actor).map(ActorHandle::state)
    }

    pub fn comm_queues(&self) -> &BTreeMap<String, Channel<Comm>> {
        &self.comm_queues
    }

    pub fn sig_queues(&self) -> &BTreeMap<String, Channel<Signal>> {
        &self.sig_queues
    }

    /// Data channels under both their producer and consumer names.
    pub fn data_queues(&self) -> &BTreeMap<String, Channel<Message>> {
        &self.data_queues
    }

    fn settings(&self) -> Settings {
        self.graph
            .as_ref()
            .map(|graph| graph.settings().clone())
            .unwrap_or_default()
    }

    /// Load, validate and construct the pipeline in `path`.
    pub fn create_from_file(&mut self, path: impl AsRef<Path>, store_size: Option<u64>) -> Result<()> {
        let path = path.as_ref();
        let graph = GraphLoader::new(&self.registry)
            .load_file(path)
            .inspect_err(|e| error!(nexus = %self.name, path = ?path, "{e}"))?;
        self.create(graph, store_size)
    }

    /// Load, validate and construct the pipeline described by `source`.
    pub fn create_from_str(&mut self, source: &str, store_size: Option<u64>) -> Result<()> {
        let graph = GraphLoader::new(&self.registry)
            .load(source)
            .inspect_err(|e| error!(nexus = %self.name, "{e}"))?;
        self.create(graph, store_size)
    }

    /// Start the store and allocate every channel and actor handle.
    /// `store_size` overrides the configured capacity.
    pub fn create(&mut self, graph: ActorGraph, store_size: Option<u64>) -> Result<()> {
        if !matches!(self.state, NexusState::Uninitialized | NexusState::Stopped) {
            return Err(NexusError::invalid_state("create", self.state));
        }

        let settings = graph.settings().clone();
        let store = Store::start(store_size.unwrap_or(settings.store_size))?;
        let runtime_dir = tempfile::Builder::new().prefix("nexus-").tempdir()?;

        for spec in graph.actors() {
            let name = spec.name.as_str();
            let comm = ChannelSpec::comm(name);
            let signal = ChannelSpec::signal(name);
            self.comm_queues
                .insert(comm.name.clone(), Channel::new(&comm.name, name, SUPERVISOR));
            self.sig_queues
                .insert(signal.name.clone(), Channel::new(&signal.name, SUPERVISOR, name));
            self.actors.insert(spec.name.clone(), ActorHandle::new(spec.clone()));
        }

        for spec in graph.channels() {
            let link = match settings.channel_capacity {
                Some(capacity) => {
                    Channel::bounded(&spec.name, &spec.source.actor, &spec.target.actor, capacity)
                }
                None => Channel::new(&spec.name, &spec.source.actor, &spec.target.actor),
            };
            if settings.audit_data {
                link.attach_store(store.client());
            }
            self.data_queues.insert(spec.alias(), link.clone());
            self.data_queues.insert(spec.name.clone(), link);
        }

        info!(
            nexus = %self.name,
            actors = self.actors.len(),
            channels = graph.channels().len(),
            runtime_dir = ?runtime_dir.path(),
            "Nexus created"
        );

        self.store = Some(store);
        self.runtime_dir = Some(runtime_dir);
        self.graph = Some(graph);
        self.flags.reset();
        self.state = NexusState::Constructed;
        Ok(())
    }

    /// Spawn one worker per actor. A launch failure moves only that actor to
    /// `error`.
    pub fn launch(&mut self) -> Result<()> {
        if self.state != NexusState::Constructed {
            return Err(NexusError::invalid_state("launch", self.state));
        }
        let (Some(graph), Some(store), Some(runtime_dir)) =
            (&self.graph, &self.store, &self.runtime_dir)
        else {
            return Err(NexusError::invalid_state("launch", self.state));
        };

        for spec in graph.actors() {
            let name = spec.name.as_str();
            let (Some(q_sig), Some(q_comm), Some(handle)) = (
                self.sig_queues.get(&ChannelSpec::signal(name).name),
                self.comm_queues.get(&ChannelSpec::comm(name).name),
                self.actors.get_mut(name),
            ) else {
                continue;
            };

            let links = |channels: Vec<&ChannelSpec>, inbound: bool| {
                channels
                    .into_iter()
                    .filter_map(|c| {
                        let port = if inbound { &c.target.port } else { &c.source.port };
                        self.data_queues.get(&c.name).map(|link| (port.clone(), link.clone()))
                    })
                    .collect::<Vec<_>>()
            };

            let ctx = LaunchContext {
                spec,
                graph,
                registry: &self.registry,
                q_sig: q_sig.clone(),
                q_comm: q_comm.clone(),
                inputs: links(graph.inputs_of(name).collect(), true),
                outputs: links(graph.outputs_of(name).collect(), false),
                store: store.client(),
                runtime_dir: runtime_dir.path(),
            };

            match self.launcher.launch(ctx) {
                Ok(worker) => {
                    debug!(actor = %name, worker = %worker.id(), "Actor launched");
                    handle.worker = Some(worker);
                }
                Err(e) => {
                    error!(actor = %name, error = %e, "Failed to launch actor");
                    handle.fail(e.to_string());
                }
            }
        }

        self.state = NexusState::Running;
        info!(nexus = %self.name, "Workers launched");
        Ok(())
    }

    /// Launch workers, set every actor up and start the pipeline.
    ///
    /// Waiting for setup acknowledgments is bounded by the configured setup
    /// timeout; actors still unsettled then are left out of `run`.
    pub fn start(&mut self) -> Result<()> {
        self.launch()?;

        let settings = self.settings();
        self.broadcast(Signal::Setup);

        let deadline = Instant::now() + Duration::from_millis(settings.setup_timeout_ms);
        let poll = Duration::from_millis(settings.poll_interval_ms.max(1));
        loop {
            self.poll();
            if self.flags.load {
                break;
            }
            if Instant::now() >= deadline {
                let pending: Vec<&str> = self
                    .actors
                    .values()
                    .filter(|a| !a.state().is_settled())
                    .map(ActorHandle::name)
                    .collect();
                warn!(nexus = %self.name, ?pending, "Timed out waiting for actor setup");
                break;
            }
            std::thread::sleep(poll);
        }

        let started = self.broadcast(Signal::Run);
        let failed = self
            .actors
            .values()
            .filter(|a| a.state() == ActorState::Error)
            .count();
        info!(nexus = %self.name, started, failed, "Pipeline running");
        Ok(())
    }

    /// Send `signal` to every launched actor that can act on it and update
    /// states and flags. Returns the number of actors signaled.
    pub fn broadcast(&mut self, signal: Signal) -> usize {
        let mut sent = 0;
        for handle in self.actors.values_mut() {
            if !handle.is_launched() {
                continue;
            }
            let eligible = match signal {
                Signal::Quit => true,
                Signal::Setup => handle.state == ActorState::Pending,
                Signal::Run | Signal::Resume => {
                    matches!(handle.state, ActorState::Ready | ActorState::Stopped)
                }
                Signal::Pause | Signal::Stop => {
                    matches!(handle.state, ActorState::Running | ActorState::Ready)
                }
            };
            if !eligible {
                continue;
            }

            let key = ChannelSpec::signal(handle.name()).name;
            let Some(q_sig) = self.sig_queues.get(&key) else {
                continue;
            };
            if let Err(e) = q_sig.put(signal) {
                warn!(actor = %handle.name(), %signal, error = %e, "Failed to send signal");
                continue;
            }
            sent += 1;

            handle.state = match (signal, handle.state) {
                (Signal::Setup, _) => ActorState::Setup,
                (Signal::Run | Signal::Resume, _) => ActorState::Running,
                (Signal::Pause, ActorState::Running) => ActorState::Ready,
                (_, state) => state,
            };
        }

        match signal {
            Signal::Run | Signal::Resume => self.flags.run = sent > 0 || self.flags.run,
            Signal::Pause | Signal::Stop => self.flags.run = false,
            Signal::Quit => self.flags.quit = true,
            Signal::Setup => {}
        }
        debug!(nexus = %self.name, %signal, sent, "Signal broadcast");
        sent
    }

    /// Drain every comm channel and check worker liveness. Returns the
    /// messages received, tagged with the reporting actor.
    pub fn poll(&mut self) -> Vec<(String, Comm)> {
        let mut received = Vec::new();

        for handle in self.actors.values_mut() {
            let key = ChannelSpec::comm(handle.name()).name;
            if let Some(q_comm) = self.comm_queues.get(&key) {
                while let Ok(comm) = q_comm.get_nowait() {
                    apply_comm(handle, &comm);
                    received.push((handle.name().to_string(), comm));
                }
            }

            let exited = handle.worker.as_mut().is_some_and(|w| !w.is_running());
            if exited && !self.flags.quit && handle.state != ActorState::Error {
                warn!(actor = %handle.name(), "Worker exited unexpectedly");
                handle.fail("worker exited unexpectedly");
            }
        }

        if !self.flags.load
            && self.state == NexusState::Running
            && self.actors.values().all(|a| a.state().is_settled())
        {
            self.flags.load = true;
            info!(nexus = %self.name, "Pipeline loaded");
        }
        received
    }

    /// Execute one text command from a controller and return the reply.
    pub fn command(&mut self, text: &str) -> String {
        let command = text.trim();
        if command.eq_ignore_ascii_case("status") {
            return self.status();
        }

        match command.parse::<Signal>() {
            Ok(Signal::Quit) => {
                if let Err(e) = self.destroy() {
                    error!(nexus = %self.name, error = %e, "Shutdown failed");
                }
                QUIT_REPLY.to_string()
            }
            Ok(signal) => {
                let sent = self.broadcast(signal);
                format!("{signal} sent to {sent} actor(s)")
            }
            Err(_) => format!("Unknown command: {command}"),
        }
    }

    /// One-line summary of supervisor and actor states.
    pub fn status(&self) -> String {
        let actors: Vec<String> = self
            .actors
            .values()
            .map(|a| format!("{}={}", a.name(), a.state()))
            .collect();
        format!(
            "{} {} quit={} run={} load={} [{}]",
            self.name,
            self.state,
            self.flags.quit,
            self.flags.run,
            self.flags.load,
            actors.join(" ")
        )
    }

    /// Tear everything down: quit actors, reap or terminate workers, close
    /// channels and the store, remove the runtime directory. Safe to call in
    /// any state and more than once.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == NexusState::Stopped {
            return Ok(());
        }
        let settings = self.settings();
        self.broadcast(Signal::Quit);

        let deadline = Instant::now() + Duration::from_millis(settings.shutdown_timeout_ms);
        for handle in self.actors.values_mut() {
            let Some(worker) = handle.worker.as_mut() else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !worker.join(remaining) {
                warn!(actor = %handle.spec.name, worker = %worker.id(), "Worker did not quit in time, terminating");
                worker.terminate();
            }
        }
        self.poll();

        for queue in self.sig_queues.values() {
            queue.close();
        }
        for queue in self.comm_queues.values() {
            queue.close();
        }
        for queue in self.data_queues.values() {
            queue.close();
        }

        let mut result = Ok(());
        if let Some(mut store) = self.store.take() {
            if let Err(e) = store.close() {
                error!(nexus = %self.name, error = %e, "Failed to close store");
                result = Err(e.into());
            }
        }
        if let Some(dir) = self.runtime_dir.take() {
            if let Err(e) = dir.close() {
                warn!(nexus = %self.name, error = %e, "Failed to remove runtime directory");
            }
        }

        self.actors.clear();
        self.comm_queues.clear();
        self.sig_queues.clear();
        self.data_queues.clear();
        self.graph = None;
        self.state = NexusState::Stopped;
        info!(nexus = %self.name, "Nexus destroyed");
        result
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        if !matches!(self.state, NexusState::Uninitialized | NexusState::Stopped) {
            let _ = self.destroy();
        }
    }
}

fn apply_comm(handle: &mut ActorHandle, comm: &Comm) {
    match comm {
        Comm::Started => debug!(actor = %handle.name(), "Actor started"),
        Comm::Ready => {
            if matches!(handle.state, ActorState::Pending | ActorState::Setup) {
                handle.state = ActorState::Ready;
            }
            info!(actor = %handle.name(), "Actor ready");
        }
        Comm::StopSuccess => {
            handle.state = ActorState::Stopped;
            info!(actor = %handle.name(), "Actor stopped");
        }
        Comm::Error { stage, message } => {
            error!(actor = %handle.name(), %stage, error = %message, "Actor reported an error");
            handle.fail(comm.to_string());
        }
        Comm::Status(text) => info!(actor = %handle.name(), status = %text, "Actor status"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ThreadLauncher;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_empty_config_is_logged() {
        let mut nexus = Nexus::new("test", ActorRegistry::with_samples());
        let err = nexus.create_from_str("\n", None).unwrap_err();
        assert!(matches!(
            err,
            NexusError::Topology(topology::TopologyError::ConfigEmpty)
        ));
        assert!(logs_contain("the config file is empty"));
        assert_eq!(nexus.state(), NexusState::Uninitialized);
    }

    #[test]
    fn test_launch_requires_create() {
        let mut nexus = Nexus::new("test", ActorRegistry::new()).with_launcher(ThreadLauncher::new());
        assert!(matches!(
            nexus.launch().unwrap_err(),
            NexusError::InvalidState { .. }
        ));
        assert!(matches!(
            nexus.start().unwrap_err(),
            NexusError::InvalidState { .. }
        ));
    }

    #[test]
    fn test_status_line() {
        let nexus = Nexus::new("lab", ActorRegistry::new());
        assert_eq!(
            nexus.status(),
            "lab uninitialized quit=false run=false load=false []"
        );
    }

    #[test]
    fn test_broadcast_skips_unlaunched_actors() {
        let mut nexus = Nexus::new("test", ActorRegistry::with_samples()).with_launcher(ThreadLauncher::new());
        nexus
            .create_from_str(
                "actors:\n  A: {class: Generator}\n  B: {class: Sink}\nconnections:\n  A.q_out: B.q_in\n",
                Some(100_000),
            )
            .unwrap();
        assert_eq!(nexus.broadcast(Signal::Setup), 0);
        assert!(nexus.sig_queues().values().all(Channel::is_empty));
        assert_eq!(nexus.command("setup"), "setup sent to 0 actor(s)");
    }
}
