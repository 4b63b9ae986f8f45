//! Actor graph model

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Result, TopologyError};

/// Endpoint name used for the supervisor side of control channels.
pub const SUPERVISOR: &str = "Nexus";

/// Pipeline-wide settings from the optional `settings:` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Object store capacity in bytes
    pub store_size: u64,
    /// How long `start` waits for setup acknowledgments
    pub setup_timeout_ms: u64,
    /// How long `destroy` waits for actors to exit before terminating them
    pub shutdown_timeout_ms: u64,
    /// Signal poll interval for idle actors
    pub poll_interval_ms: u64,
    /// Log data channel traffic into the store
    pub audit_data: bool,
    /// Optional bound on data channel queues
    pub channel_capacity: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_size: 10_000_000,
            setup_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            poll_interval_ms: 10,
            audit_data: true,
            channel_capacity: None,
        }
    }
}

/// One declared actor
#[derive(Debug, Clone, PartialEq)]
pub struct ActorSpec {
    pub name: String,
    /// Implementation identifier resolved through the actor registry
    pub class: String,
    /// Informational origin of the implementation
    pub package: Option<String>,
    /// Constructor parameters
    pub params: BTreeMap<String, serde_yaml::Value>,
}

impl ActorSpec {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            package: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_yaml::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Typed constructor parameter, `None` when absent.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.params
            .get(key)
            .map(|value| {
                serde_yaml::from_value(value.clone()).map_err(|e| {
                    TopologyError::malformed(format!(
                        "actor '{}' parameter '{}': {}",
                        self.name, key, e
                    ))
                })
            })
            .transpose()
    }

    pub fn param_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.param(key)?.unwrap_or(default))
    }
}

/// `<actor>.<port>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub actor: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(actor: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            port: port.into(),
        }
    }

    /// Parse `Actor.port`.
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim().split_once('.') {
            Some((actor, port)) if !actor.is_empty() && !port.is_empty() && !port.contains('.') => {
                Ok(Self::new(actor, port))
            }
            _ => Err(TopologyError::malformed(format!(
                "endpoint '{text}' is not of the form Actor.port"
            ))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.actor, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Application payload references between actors
    Data,
    /// Lifecycle commands from the supervisor
    Signal,
    /// Acknowledgments and status back to the supervisor
    Comm,
}

/// One directed channel with exactly one source and one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub source: Endpoint,
    pub target: Endpoint,
    pub kind: ChannelKind,
}

impl ChannelSpec {
    /// Data channel, named after its producing endpoint.
    pub fn data(source: Endpoint, target: Endpoint) -> Self {
        Self {
            name: source.to_string(),
            source,
            target,
            kind: ChannelKind::Data,
        }
    }

    /// Supervisor to actor lifecycle channel, `<Actor>_sig`.
    pub fn signal(actor: &str) -> Self {
        Self {
            name: format!("{actor}_sig"),
            source: Endpoint::new(SUPERVISOR, "sig"),
            target: Endpoint::new(actor, "q_sig"),
            kind: ChannelKind::Signal,
        }
    }

    /// Actor to supervisor status channel, `<Actor>_comm`.
    pub fn comm(actor: &str) -> Self {
        Self {
            name: format!("{actor}_comm"),
            source: Endpoint::new(actor, "q_comm"),
            target: Endpoint::new(SUPERVISOR, "comm"),
            kind: ChannelKind::Comm,
        }
    }

    /// Name the consuming side refers to this channel by.
    pub fn alias(&self) -> String {
        self.target.to_string()
    }
}

/// Validated pipeline description
#[derive(Debug, Clone)]
pub struct ActorGraph {
    pub(crate) actors: Vec<ActorSpec>,
    pub(crate) channels: Vec<ChannelSpec>,
    pub(crate) settings: Settings,
    pub(crate) source: String,
}

impl ActorGraph {
    /// Actors in declaration order.
    pub fn actors(&self) -> &[ActorSpec] {
        &self.actors
    }

    pub fn actor(&self, name: &str) -> Option<&ActorSpec> {
        self.actors.iter().find(|actor| actor.name == name)
    }

    /// Data channels in declaration order.
    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Configuration text the graph was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn inputs_of<'a>(&'a self, actor: &'a str) -> impl Iterator<Item = &'a ChannelSpec> + 'a {
        self.channels.iter().filter(move |c| c.target.actor == actor)
    }

    pub fn outputs_of<'a>(&'a self, actor: &'a str) -> impl Iterator<Item = &'a ChannelSpec> + 'a {
        self.channels.iter().filter(move |c| c.source.actor == actor)
    }

    /// True when the data channels contain a directed cycle.
    pub fn has_cycle(&self) -> bool {
        crate::validation::find_cycle(self).is_some()
    }
}
