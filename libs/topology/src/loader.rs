//! Configuration Loading
//!
//! Parses the YAML pipeline description:
//!
//! ```yaml
//! settings:
//!   store_size: 20000000
//! actors:
//!   Acquirer:
//!     class: Generator
//!     package: actors.sample
//!     frames: 50
//!   Analysis:
//!     class: Averager
//! connections:
//!   Acquirer.q_out: [Analysis.q_in]
//! ```
//!
//! Every key of an actor entry other than `class` and `package` becomes a
//! constructor parameter. Actor order follows the document.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde_yaml::{Mapping, Value};

use crate::graph::{ActorGraph, ActorSpec, ChannelSpec, Endpoint, Settings, SUPERVISOR};
use crate::validation::GraphValidator;
use crate::{Result, TopologyError};

/// Decides whether an implementation identifier can be instantiated.
pub trait ClassResolver {
    fn resolve(&self, class: &str) -> bool;
}

impl<F> ClassResolver for F
where
    F: Fn(&str) -> bool,
{
    fn resolve(&self, class: &str) -> bool {
        self(class)
    }
}

/// Builds [`ActorGraph`]s from configuration text
pub struct GraphLoader<'a> {
    resolver: &'a dyn ClassResolver,
}

impl<'a> GraphLoader<'a> {
    pub fn new(resolver: &'a dyn ClassResolver) -> Self {
        Self { resolver }
    }

    /// Parse and validate a configuration file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<ActorGraph> {
        let content = std::fs::read_to_string(path.as_ref())?;
        self.load(&content)
    }

    /// Parse and validate configuration text.
    pub fn load(&self, source: &str) -> Result<ActorGraph> {
        let graph = self.parse(source)?;
        validate(&graph)?;
        Ok(graph)
    }

    /// Parse configuration text without structural validation.
    pub fn parse(&self, source: &str) -> Result<ActorGraph> {
        if is_blank(source) {
            return Err(TopologyError::ConfigEmpty);
        }

        let document: Value = serde_yaml::from_str(source)?;
        let root = match document {
            Value::Null => return Err(TopologyError::ConfigEmpty),
            Value::Mapping(root) => root,
            _ => return Err(TopologyError::malformed("top level must be a mapping")),
        };

        let settings = match root.get("settings") {
            None | Some(Value::Null) => Settings::default(),
            Some(value) => serde_yaml::from_value(value.clone())
                .map_err(|e| TopologyError::malformed(format!("settings: {e}")))?,
        };

        let actors = match root.get("actors") {
            None | Some(Value::Null) => return Err(TopologyError::ConfigEmpty),
            Some(Value::Mapping(entries)) if entries.is_empty() => {
                return Err(TopologyError::ConfigEmpty)
            }
            Some(Value::Mapping(entries)) => self.parse_actors(entries)?,
            Some(_) => return Err(TopologyError::malformed("'actors' must be a mapping")),
        };

        let channels = match root.get("connections") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Mapping(entries)) => parse_connections(entries, &actors)?,
            Some(_) => return Err(TopologyError::malformed("'connections' must be a mapping")),
        };

        for key in root.keys() {
            match key.as_str() {
                Some("settings" | "actors" | "connections") => {}
                _ => {
                    return Err(TopologyError::malformed(format!(
                        "unknown top-level section {key:?}"
                    )))
                }
            }
        }

        Ok(ActorGraph {
            actors,
            channels,
            settings,
            source: source.to_string(),
        })
    }

    fn parse_actors(&self, entries: &Mapping) -> Result<Vec<ActorSpec>> {
        let mut actors = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();

        for (key, body) in entries {
            let name = key
                .as_str()
                .ok_or_else(|| TopologyError::malformed(format!("actor name {key:?} is not a string")))?;
            check_name(name)?;
            if !seen.insert(name.to_string()) {
                return Err(TopologyError::malformed(format!("duplicate actor '{name}'")));
            }

            let body = body.as_mapping().ok_or_else(|| {
                TopologyError::malformed(format!("actor '{name}' must be a mapping"))
            })?;

            let class = body
                .get("class")
                .and_then(Value::as_str)
                .ok_or_else(|| TopologyError::malformed(format!("actor '{name}' has no class")))?;
            if !self.resolver.resolve(class) {
                return Err(TopologyError::malformed(format!(
                    "actor '{name}' references unknown class '{class}'"
                )));
            }

            let package = match body.get("package") {
                None | Some(Value::Null) => None,
                Some(Value::String(package)) => Some(package.clone()),
                Some(_) => {
                    return Err(TopologyError::malformed(format!(
                        "actor '{name}' package must be a string"
                    )))
                }
            };

            let mut params = BTreeMap::new();
            for (param, value) in body {
                let param = param.as_str().ok_or_else(|| {
                    TopologyError::malformed(format!("actor '{name}' has a non-string parameter key"))
                })?;
                if param != "class" && param != "package" {
                    params.insert(param.to_string(), value.clone());
                }
            }

            actors.push(ActorSpec {
                name: name.to_string(),
                class: class.to_string(),
                package,
                params,
            });
        }

        Ok(actors)
    }
}

/// Structural validation; see [`GraphValidator`].
pub fn validate(graph: &ActorGraph) -> Result<()> {
    GraphValidator::new(graph).validate_all().map(|_| ())
}

/// Nothing but whitespace, comments and document markers.
fn is_blank(source: &str) -> bool {
    source.lines().map(str::trim).all(|line| {
        line.is_empty() || line.starts_with('#') || line == "---" || line == "..."
    })
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != SUPERVISOR
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(TopologyError::malformed(format!(
            "invalid actor name '{name}': use letters, digits, '_' or '-'"
        )));
    }
    Ok(())
}

fn parse_connections(entries: &Mapping, actors: &[ActorSpec]) -> Result<Vec<ChannelSpec>> {
    let known: HashSet<&str> = actors.iter().map(|a| a.name.as_str()).collect();
    let check = |endpoint: &Endpoint| {
        if known.contains(endpoint.actor.as_str()) {
            Ok(())
        } else {
            Err(TopologyError::malformed(format!(
                "connection '{endpoint}' references unknown actor '{}'",
                endpoint.actor
            )))
        }
    };

    let mut channels = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let source = key
            .as_str()
            .ok_or_else(|| TopologyError::malformed(format!("connection key {key:?} is not a string")))
            .and_then(Endpoint::parse)?;
        check(&source)?;

        let targets: Vec<&str> = match value {
            Value::String(target) => vec![target.as_str()],
            Value::Sequence(items) => items
                .iter()
                .map(|item| {
                    item.as_str().ok_or_else(|| {
                        TopologyError::malformed(format!("target of '{source}' is not a string"))
                    })
                })
                .collect::<Result<_>>()?,
            _ => {
                return Err(TopologyError::malformed(format!(
                    "targets of '{source}' must be a string or a list"
                )))
            }
        };

        let target = match targets.as_slice() {
            [single] => Endpoint::parse(single)?,
            [] => {
                return Err(TopologyError::malformed(format!(
                    "connection '{source}' has no target"
                )))
            }
            _ => {
                return Err(TopologyError::malformed(format!(
                    "connection '{source}' fans out to {} targets; a channel has exactly one consumer",
                    targets.len()
                )))
            }
        };
        check(&target)?;
        if target.actor == source.actor {
            return Err(TopologyError::malformed(format!(
                "connection '{source}' -> '{target}' connects an actor to itself"
            )));
        }

        channels.push(ChannelSpec::data(source, target));
    }

    Ok(channels)
}
