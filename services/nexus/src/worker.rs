//! Worker process entry
//!
//! A worker boots from a [`WorkerManifest`], re-parses the pipeline
//! configuration to find its actor, attaches to the supervisor's store and
//! bridges its channels over the sockets in the runtime directory:
//!
//! - `<Actor>_sig`: pump (supervisor forwards signals here)
//! - `<Actor>_comm`: forwarder (supervisor pumps acknowledgments)
//! - each input channel: pump bound at `<channel>.sock`
//! - each output channel: forwarder to the consumer's `<channel>.sock`
//!
//! Output channels audit into the store on this side, so the consumer's pump
//! delivers without logging again.
//!
//! SIGTERM, SIGINT and SIGHUP are turned into a `quit` on the local signal
//! channel, so a worker asked to terminate still runs its actor's `stop` and
//! releases the store before exiting.

use std::path::Path;
use std::time::Duration;

use actors::{ActorContext, ActorRegistry, Comm, RunOutcome, Signal, Stage};
use channel::{socket_path, Bridge, BridgeRole, Channel};
use store::StoreClient;
use topology::{ChannelSpec, GraphLoader, SUPERVISOR};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use crate::launcher::WorkerManifest;
use crate::{NexusError, Result};

const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Run the actor described by the manifest at `path` until it quits.
pub fn run_worker(path: &Path, registry: &ActorRegistry) -> Result<RunOutcome> {
    let manifest = WorkerManifest::read(path)?;
    let graph = GraphLoader::new(registry).parse(&manifest.config)?;
    let spec = graph
        .actor(&manifest.actor)
        .ok_or_else(|| NexusError::manifest(format!("actor '{}' is not in the config", manifest.actor)))?;
    let settings = graph.settings();
    let dir = manifest.socket_dir.as_path();
    let name = spec.name.as_str();

    let store = StoreClient::attach(&manifest.store_path, name)?;
    let mut bridges: Vec<Bridge> = Vec::new();

    let signal = ChannelSpec::signal(name);
    let q_sig = Channel::new(&signal.name, SUPERVISOR, name);
    bridges.push(q_sig.receive_from(socket_path(dir, &signal.name))?);
    watch_termination(name, q_sig.clone())?;

    let comm = ChannelSpec::comm(name);
    let q_comm = Channel::new(&comm.name, name, SUPERVISOR);
    bridges.push(q_comm.forward_to(socket_path(dir, &comm.name))?);

    let mut ctx = ActorContext::new(name, q_sig, q_comm, store.clone())
        .with_poll_interval(Duration::from_millis(settings.poll_interval_ms));

    for input in graph.inputs_of(name) {
        let link = data_channel(input, settings.channel_capacity);
        bridges.push(link.receive_from(socket_path(dir, &input.name))?);
        ctx = ctx.with_input(input.target.port.as_str(), link);
    }
    for output in graph.outputs_of(name) {
        let link = data_channel(output, settings.channel_capacity);
        if settings.audit_data {
            link.attach_store(store.clone());
        }
        bridges.push(link.forward_to(socket_path(dir, &output.name))?);
        ctx = ctx.with_output(output.source.port.as_str(), link);
    }

    info!(actor = %name, pid = std::process::id(), "Worker started");
    let result = registry.build(spec).and_then(|kind| kind.run(&ctx));
    if let Err(e) = &result {
        error!(actor = %name, error = %e, "Worker failed");
        ctx.report(Comm::Error {
            stage: Stage::Setup,
            message: e.to_string(),
        });
    }

    // Closed outputs let forwarders drain what is queued, then exit.
    ctx.close_outputs();
    for bridge in bridges {
        let grace = match bridge.role() {
            BridgeRole::Forwarder => DRAIN_GRACE,
            BridgeRole::Pump => Duration::ZERO,
        };
        bridge.shutdown(grace);
    }
    info!(actor = %name, "Worker stopped");

    result.map_err(Into::into)
}

/// Deliver `quit` to the actor on the first termination signal.
fn watch_termination(name: &str, q_sig: Channel<Signal>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (mut terminate, mut interrupt, mut hangup) = {
        let _enter = runtime.enter();
        (
            signal(SignalKind::terminate())?,
            signal(SignalKind::interrupt())?,
            signal(SignalKind::hangup())?,
        )
    };

    let actor = name.to_string();
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            runtime.block_on(async {
                let received = tokio::select! {
                    _ = terminate.recv() => "SIGTERM",
                    _ = interrupt.recv() => "SIGINT",
                    _ = hangup.recv() => "SIGHUP",
                };
                warn!(actor = %actor, signal = received, "Termination requested, quitting");
                if let Err(e) = q_sig.put(Signal::Quit) {
                    debug!(actor = %actor, error = %e, "Actor already gone");
                }
            });
        })?;
    Ok(())
}

fn data_channel(spec: &ChannelSpec, capacity: Option<usize>) -> Channel<actors::Message> {
    match capacity {
        Some(capacity) => Channel::bounded(&spec.name, &spec.source.actor, &spec.target.actor, capacity),
        None => Channel::new(&spec.name, &spec.source.actor, &spec.target.actor),
    }
}
