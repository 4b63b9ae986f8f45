//! Actor Registry
//!
//! Maps implementation class names used in configuration files to factories
//! that build actors from their [`ActorSpec`]. The supervisor consults the
//! registry while loading a graph (unknown classes are configuration errors)
//! and again in each worker when instantiating its actor.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use topology::{ActorSpec, ClassResolver};
use tracing::debug;

use crate::actor::{Actor, ActorKind, AsyncActor};
use crate::{ActorError, Result};

/// Builds one actor from its declaration
pub type ActorFactory = Arc<dyn Fn(&ActorSpec) -> Result<ActorKind> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ActorRegistry {
    factories: HashMap<String, ActorFactory>,
}

impl fmt::Debug for ActorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the sample pipeline stages.
    pub fn with_samples() -> Self {
        let mut registry = Self::new();
        crate::samples::register(&mut registry);
        registry
    }

    /// Register `factory` under `class`, replacing any previous entry.
    pub fn register<F>(&mut self, class: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ActorSpec) -> Result<ActorKind> + Send + Sync + 'static,
    {
        let class = class.into();
        debug!(class = %class, "Registering actor class");
        self.factories.insert(class, Arc::new(factory));
        self
    }

    pub fn register_blocking<A, F>(&mut self, class: impl Into<String>, build: F) -> &mut Self
    where
        A: Actor + 'static,
        F: Fn(&ActorSpec) -> Result<A> + Send + Sync + 'static,
    {
        self.register(class, move |spec| build(spec).map(ActorKind::blocking))
    }

    pub fn register_async<A, F>(&mut self, class: impl Into<String>, build: F) -> &mut Self
    where
        A: AsyncActor + 'static,
        F: Fn(&ActorSpec) -> Result<A> + Send + Sync + 'static,
    {
        self.register(class, move |spec| build(spec).map(ActorKind::cooperative))
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }

    /// Instantiate the actor declared by `spec`.
    pub fn build(&self, spec: &ActorSpec) -> Result<ActorKind> {
        let factory = self
            .factories
            .get(&spec.class)
            .ok_or_else(|| ActorError::UnknownClass {
                class: spec.class.clone(),
            })?;
        factory(spec)
    }
}

impl ClassResolver for ActorRegistry {
    fn resolve(&self, class: &str) -> bool {
        self.contains(class)
    }
}
