//! # Nexus Topology
//!
//! Turns a declarative pipeline configuration into a validated
//! [`ActorGraph`]: the actors to instantiate (name, implementation class,
//! constructor parameters) and the data channels wiring producer outputs to
//! consumer inputs.
//!
//! Loading happens in two steps. [`GraphLoader::parse`] rejects empty or
//! malformed documents and unknown implementation classes;
//! [`validate`] rejects graphs too small to form a pipeline.

pub mod error;
pub mod graph;
pub mod loader;
pub mod validation;

pub use error::{Result, TopologyError};
pub use graph::{ActorGraph, ActorSpec, ChannelKind, ChannelSpec, Endpoint, Settings, SUPERVISOR};
pub use loader::{validate, ClassResolver, GraphLoader};
pub use validation::{find_cycle, GraphValidator, ValidationReport};

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const KNOWN: [&str; 3] = ["Generator", "Averager", "Sink"];

    fn known(class: &str) -> bool {
        KNOWN.contains(&class)
    }

    fn load(source: &str) -> Result<ActorGraph> {
        GraphLoader::new(&known).load(source)
    }

    const GOOD: &str = r#"
actors:
  Acquirer:
    package: actors.sample
    class: Generator
    frames: 20
  Analysis:
    class: Averager

connections:
  Acquirer.q_out: [Analysis.q_in]
"#;

    #[test]
    fn test_parse_good_config() {
        let graph = load(GOOD).unwrap();

        let names: Vec<_> = graph.actors().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["Acquirer", "Analysis"]);

        let acquirer = graph.actor("Acquirer").unwrap();
        assert_eq!(acquirer.class, "Generator");
        assert_eq!(acquirer.package.as_deref(), Some("actors.sample"));
        assert_eq!(acquirer.param::<u64>("frames").unwrap(), Some(20));
        assert!(!acquirer.params.contains_key("class"));

        let channel = &graph.channels()[0];
        assert_eq!(channel.name, "Acquirer.q_out");
        assert_eq!(channel.alias(), "Analysis.q_in");
        assert_eq!(channel.kind, ChannelKind::Data);
        assert_eq!(graph.settings(), &Settings::default());
        assert!(!graph.has_cycle());
    }

    #[test]
    fn test_declaration_order_is_kept() {
        let graph = load(
            r#"
actors:
  Zeta: {class: Generator}
  Alpha: {class: Sink}
connections:
  Zeta.q_out: Alpha.q_in
"#,
        )
        .unwrap();
        let names: Vec<_> = graph.actors().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["Zeta", "Alpha"]);
    }

    #[test]
    fn test_empty_sources() {
        for source in ["", "   \n", "# only a comment\n", "actors:\n", "actors: {}\n"] {
            let err = load(source).unwrap_err();
            assert!(matches!(err, TopologyError::ConfigEmpty), "{source:?}");
            assert!(err.to_string().contains("the config file is empty"));
        }
    }

    #[test]
    fn test_unknown_class_is_malformed() {
        let err = load(
            r#"
actors:
  A: {class: Missing}
  B: {class: Sink}
connections:
  A.q_out: [B.q_in]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::ConfigMalformed { .. }));
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn test_duplicate_actor_is_malformed() {
        let err = load(
            r#"
actors:
  A: {class: Generator}
  A: {class: Sink}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::ConfigMalformed { .. }));
    }

    #[test]
    fn test_bad_connections_are_malformed() {
        let cases = [
            "A.q_out: [Nope.q_in]",
            "A.q_out: []",
            "A.q_out: [B.q_in, B.other]",
            "A: [B.q_in]",
            "A.q_out: 5",
            "A.q_out: [A.q_in]",
        ];
        for connection in cases {
            let source = format!(
                "actors:\n  A: {{class: Generator}}\n  B: {{class: Sink}}\nconnections:\n  {connection}\n"
            );
            let err = load(&source).unwrap_err();
            assert!(
                matches!(err, TopologyError::ConfigMalformed { .. }),
                "{connection}: {err}"
            );
        }
    }

    #[test]
    fn test_two_producers_into_one_input() {
        let err = load(
            r#"
actors:
  A: {class: Generator}
  B: {class: Generator}
  C: {class: Sink}
connections:
  A.q_out: [C.q_in]
  B.q_out: [C.q_in]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::ConfigMalformed { .. }));
    }

    #[test]
    fn test_single_actor_is_too_small() {
        let err = load("actors:\n  Solo: {class: Generator}\n").unwrap_err();
        assert!(matches!(err, TopologyError::GraphTooSmall { .. }));
    }

    #[test]
    fn test_unconnected_pair_is_too_small() {
        let err = load("actors:\n  A: {class: Generator}\n  B: {class: Sink}\n").unwrap_err();
        assert!(matches!(err, TopologyError::GraphTooSmall { .. }));
    }

    #[test]
    #[traced_test]
    fn test_cycle_is_accepted_with_warning() {
        let graph = load(
            r#"
actors:
  Controller: {class: Averager}
  Plant: {class: Averager}
connections:
  Controller.q_out: [Plant.q_in]
  Plant.q_out: [Controller.q_in]
"#,
        )
        .unwrap();
        assert!(graph.has_cycle());
        assert_eq!(
            find_cycle(&graph).unwrap(),
            ["Controller", "Plant", "Controller"]
        );
        assert!(logs_contain("Data channels form a cycle"));
    }

    #[test]
    fn test_settings_section() {
        let graph = load(
            r#"
settings:
  store_size: 2000000
  setup_timeout_ms: 500
  channel_capacity: 8
actors:
  A: {class: Generator}
  B: {class: Sink}
connections:
  A.q_out: [B.q_in]
"#,
        )
        .unwrap();
        let settings = graph.settings();
        assert_eq!(settings.store_size, 2_000_000);
        assert_eq!(settings.setup_timeout_ms, 500);
        assert_eq!(settings.channel_capacity, Some(8));
        assert!(settings.audit_data);
    }

    #[test]
    fn test_unknown_setting_is_malformed() {
        let err = load(
            "settings:\n  bogus: 1\nactors:\n  A: {class: Generator}\n  B: {class: Sink}\nconnections:\n  A.q_out: B.q_in\n",
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::ConfigMalformed { .. }));
    }

    #[test]
    fn test_control_channel_names() {
        assert_eq!(ChannelSpec::signal("Acquirer").name, "Acquirer_sig");
        assert_eq!(ChannelSpec::comm("Acquirer").name, "Acquirer_comm");
        assert_eq!(ChannelSpec::comm("Acquirer").kind, ChannelKind::Comm);
    }

    #[test]
    fn test_param_type_mismatch() {
        let spec = ActorSpec::new("A", "Generator").with_param("frames", "many");
        assert!(spec.param::<u64>("frames").is_err());
        assert_eq!(spec.param_or::<u64>("width", 16).unwrap(), 16);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, GOOD).unwrap();
        let graph = GraphLoader::new(&known).load_file(&path).unwrap();
        assert_eq!(graph.source(), GOOD);

        let err = GraphLoader::new(&known)
            .load_file(dir.path().join("missing.yaml"))
            .unwrap_err();
        assert!(matches!(err, TopologyError::Io(_)));
    }
}
