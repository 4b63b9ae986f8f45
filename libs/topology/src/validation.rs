//! Structural validation of actor graphs
//!
//! A runnable pipeline needs at least two distinct actors joined by at least
//! one data channel. Cycles are allowed: actors run concurrently rather than
//! in topological order, so a feedback loop is a valid configuration. A cycle
//! is still reported as a warning because nothing throttles it unless the
//! channels involved are bounded.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::warn;

use crate::graph::ActorGraph;
use crate::{Result, TopologyError};

/// Structural checks over a parsed graph
pub struct GraphValidator<'a> {
    graph: &'a ActorGraph,
}

impl<'a> GraphValidator<'a> {
    pub fn new(graph: &'a ActorGraph) -> Self {
        Self { graph }
    }

    /// Run all validation checks
    pub fn validate_all(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::new();

        self.validate_size()?;
        self.validate_ports(&mut report);
        self.validate_reachability(&mut report);
        self.validate_cycles(&mut report);

        if report.has_errors() {
            return Err(TopologyError::malformed(report.errors().join("; ")));
        }
        for warning in report.warnings() {
            warn!("{}", warning);
        }
        Ok(report)
    }

    fn validate_size(&self) -> Result<()> {
        let actors = self.graph.actors().len();
        if actors < 2 || self.graph.channels().is_empty() {
            return Err(TopologyError::GraphTooSmall {
                message: format!(
                    "a pipeline needs at least two actors connected by a data channel, found {} actor(s) and {} connection(s)",
                    actors,
                    self.graph.channels().len()
                ),
            });
        }
        Ok(())
    }

    fn validate_ports(&self, report: &mut ValidationReport) {
        let mut outputs = HashSet::new();
        let mut inputs = HashSet::new();
        for channel in self.graph.channels() {
            if !outputs.insert(&channel.source) {
                report.add_error(format!("output '{}' is connected twice", channel.source));
            }
            if !inputs.insert(&channel.target) {
                report.add_error(format!(
                    "input '{}' has more than one producer",
                    channel.target
                ));
            }
        }
    }

    fn validate_reachability(&self, report: &mut ValidationReport) {
        let connected: BTreeSet<&str> = self
            .graph
            .channels()
            .iter()
            .flat_map(|c| [c.source.actor.as_str(), c.target.actor.as_str()])
            .collect();

        for actor in self.graph.actors() {
            if !connected.contains(actor.name.as_str()) {
                report.add_warning(format!("Actor '{}' has no data channels", actor.name));
            }
        }
    }

    fn validate_cycles(&self, report: &mut ValidationReport) {
        if let Some(cycle) = find_cycle(self.graph) {
            report.add_warning(format!(
                "Data channels form a cycle: {}",
                cycle.join(" -> ")
            ));
        }
    }
}

/// First directed cycle among data channels, as a closed path of actor names.
pub fn find_cycle(graph: &ActorGraph) -> Option<Vec<String>> {
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for channel in graph.channels() {
        edges
            .entry(channel.source.actor.as_str())
            .or_default()
            .push(channel.target.actor.as_str());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'g>(
        node: &'g str,
        edges: &BTreeMap<&'g str, Vec<&'g str>>,
        marks: &mut BTreeMap<&'g str, Mark>,
        path: &mut Vec<&'g str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::Visiting);
        path.push(node);

        for &next in edges.get(node).map(Vec::as_slice).unwrap_or_default() {
            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = visit(next, edges, marks, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    for actor in graph.actors() {
        let name = actor.name.as_str();
        if marks.contains_key(name) {
            continue;
        }
        let mut path = Vec::new();
        if let Some(cycle) = visit(name, &edges, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

/// Outcome of a validation pass
#[derive(Debug, Default)]
pub struct ValidationReport {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: String) {
        self.errors.push(message);
    }

    pub fn add_warning(&mut self, message: String) {
        self.warnings.push(message);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}
