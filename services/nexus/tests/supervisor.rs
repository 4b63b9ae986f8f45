//! Supervisor construction and in-process lifecycle.

use std::time::{Duration, Instant};

use actors::{Actor, ActorContext, ActorError, ActorRegistry, Message};
use nexus::{ActorState, Nexus, NexusError, NexusState, ThreadLauncher, QUIT_REPLY};
use topology::TopologyError;

fn config(name: &str) -> String {
    format!("{}/tests/configs/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn nexus() -> Nexus {
    Nexus::new("test", ActorRegistry::with_samples()).with_launcher(ThreadLauncher::new())
}

fn keys<V>(map: &std::collections::BTreeMap<String, V>) -> Vec<&str> {
    map.keys().map(String::as_str).collect()
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_display_is_name() {
    assert_eq!(nexus().to_string(), "test");
}

#[test]
fn test_create_registries() {
    let mut nex = nexus();
    nex.create_from_file(config("good_config.yaml"), Some(1_000_000)).unwrap();

    assert_eq!(nex.state(), NexusState::Constructed);
    assert_eq!(keys(nex.actors()), ["Acquirer", "Analysis"]);
    assert_eq!(keys(nex.comm_queues()), ["Acquirer_comm", "Analysis_comm"]);
    assert_eq!(keys(nex.sig_queues()), ["Acquirer_sig", "Analysis_sig"]);
    assert_eq!(keys(nex.data_queues()), ["Acquirer.q_out", "Analysis.q_in"]);
    assert_eq!(nex.flags().keys(), ["quit", "run", "load"]);
    assert!(nex.actors().values().all(|a| a.state() == ActorState::Pending));
    assert!(nex.actors().values().all(|a| !a.is_launched()));

    // Both aliases name the same queue.
    let out = &nex.data_queues()["Acquirer.q_out"];
    out.put(Message::Text("x".into())).unwrap();
    assert_eq!(nex.data_queues()["Analysis.q_in"].qsize(), 1);

    let runtime_dir = nex.runtime_dir().unwrap().to_path_buf();
    assert!(runtime_dir.exists());

    nex.destroy().unwrap();
    assert_eq!(nex.state(), NexusState::Stopped);
    assert!(nex.actors().is_empty());
    assert!(nex.data_queues().is_empty());
    assert!(!runtime_dir.exists());
    nex.destroy().unwrap();
}

#[test]
fn test_config_construction() {
    let cases = [
        ("good_config.yaml", vec!["Acquirer", "Analysis"], vec!["Acquirer_sig", "Analysis_sig"]),
        ("simple_graph.yaml", vec!["Acquirer", "Analysis"], vec!["Acquirer_sig", "Analysis_sig"]),
        (
            "complex_graph.yaml",
            vec!["Acquirer", "Analysis", "InputStim"],
            vec!["Acquirer_sig", "Analysis_sig", "InputStim_sig"],
        ),
    ];

    for (file, actors, links) in cases {
        let mut nex = nexus();
        nex.create_from_file(config(file), Some(1_000_000)).unwrap();
        assert_eq!(keys(nex.actors()), actors, "{file}");
        assert_eq!(keys(nex.sig_queues()), links, "{file}");
        nex.destroy().unwrap();
    }
}

#[test]
fn test_complex_graph_channels_are_bounded() {
    let mut nex = nexus();
    nex.create_from_file(config("complex_graph.yaml"), Some(1_000_000)).unwrap();
    assert_eq!(nex.data_queues()["Analysis.stim_in"].capacity(), Some(64));
    assert_eq!(nex.data_queues()["InputStim.q_out"].name(), "InputStim.q_out");
}

#[test]
fn test_single_actor_is_rejected() {
    let mut nex = nexus();
    let err = nex
        .create_from_file(config("single_actor.yaml"), None)
        .unwrap_err();
    assert!(matches!(
        err,
        NexusError::Topology(TopologyError::GraphTooSmall { .. })
    ));
    assert_eq!(nex.state(), NexusState::Uninitialized);
    nex.destroy().unwrap();
}

#[test]
fn test_cyclic_graph_is_accepted() {
    let mut nex = nexus();
    nex.create_from_file(config("cyclic_config.yaml"), Some(1_000_000)).unwrap();
    assert!(nex.graph().unwrap().has_cycle());
    nex.destroy().unwrap();
}

#[test]
fn test_blank_config() {
    let mut nex = nexus();
    let err = nex
        .create_from_file(config("blank_file.yaml"), None)
        .unwrap_err();
    assert!(err.to_string().contains("the config file is empty"));
    nex.destroy().unwrap();
}

#[test]
fn test_create_twice_is_invalid() {
    let mut nex = nexus();
    nex.create_from_file(config("simple_graph.yaml"), Some(1_000_000)).unwrap();
    let err = nex
        .create_from_file(config("simple_graph.yaml"), Some(1_000_000))
        .unwrap_err();
    assert!(matches!(err, NexusError::InvalidState { .. }));
}

#[test]
fn test_thread_pipeline_lifecycle() {
    let mut nex = nexus();
    nex.create_from_file(config("good_config.yaml"), Some(2_000_000)).unwrap();
    nex.start().unwrap();

    assert_eq!(nex.state(), NexusState::Running);
    assert!(nex.flags().load);
    assert!(nex.flags().run);
    assert_eq!(nex.actor_state("Acquirer"), Some(ActorState::Running));
    assert_eq!(nex.actor_state("Analysis"), Some(ActorState::Running));

    let link = nex.data_queues()["Acquirer.q_out"].clone();
    wait_for("20 frames", || link.num() >= 20 && link.is_empty());

    let store = nex.store().unwrap();
    assert!(store.get("Acquirer.q_out__0").is_ok());
    assert!(store.get("Acquirer.q_out__19").is_ok());

    let status = nex.command("status");
    assert!(status.contains("Acquirer=running"), "{status}");

    assert_eq!(nex.command("pause"), "pause sent to 2 actor(s)");
    assert!(!nex.flags().run);
    assert_eq!(nex.actor_state("Analysis"), Some(ActorState::Ready));
    assert_eq!(nex.command("resume"), "resume sent to 2 actor(s)");

    nex.command("stop");
    wait_for("stop acknowledgments", || {
        nex.poll();
        nex.actors().values().all(|a| a.state() == ActorState::Stopped)
    });

    assert_eq!(nex.command("bogus"), "Unknown command: bogus");
    assert_eq!(nex.command("quit"), QUIT_REPLY);
    assert_eq!(nex.state(), NexusState::Stopped);
    assert!(nex.flags().quit);
    assert!(nex.store().is_none());
}

struct Broken;

impl Actor for Broken {
    fn setup(&mut self, _ctx: &ActorContext) -> actors::Result<()> {
        Err(ActorError::setup("calibration file missing"))
    }

    fn run_step(&mut self, _ctx: &ActorContext) -> actors::Result<()> {
        Ok(())
    }
}

#[test]
fn test_setup_failure_is_isolated() {
    let mut registry = ActorRegistry::with_samples();
    registry.register_blocking("Broken", |_spec| Ok(Broken));
    let mut nex = Nexus::new("test", registry).with_launcher(ThreadLauncher::new());

    nex.create_from_str(
        r#"
settings:
  setup_timeout_ms: 5000
actors:
  Acquirer: {class: Generator, frames: 5, interval_ms: 1}
  Analysis: {class: Broken}
connections:
  Acquirer.q_out: [Analysis.q_in]
"#,
        Some(1_000_000),
    )
    .unwrap();
    nex.start().unwrap();

    assert_eq!(nex.actor_state("Acquirer"), Some(ActorState::Running));
    assert_eq!(nex.actor_state("Analysis"), Some(ActorState::Error));
    let error = nex.actors()["Analysis"].last_error().unwrap();
    assert!(error.contains("calibration file missing"), "{error}");

    // The producer keeps going without its consumer.
    let link = nex.data_queues()["Acquirer.q_out"].clone();
    wait_for("frames from the healthy actor", || link.num() >= 5);

    nex.destroy().unwrap();
}

#[test]
fn test_unknown_class_fails_before_launch() {
    let mut nex = nexus();
    let err = nex
        .create_from_str(
            "actors:\n  A: {class: Telescope}\n  B: {class: Sink}\nconnections:\n  A.q_out: B.q_in\n",
            None,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        NexusError::Topology(TopologyError::ConfigMalformed { .. })
    ));
}
