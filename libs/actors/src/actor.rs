//! Actor capability
//!
//! Pipeline stages implement [`Actor`] when each unit of work may block the
//! thread, or [`AsyncActor`] when they run concurrent tasks and should only
//! suspend at channel and timer boundaries. Both follow the same lifecycle:
//!
//! 1. `setup` once, before the first step. An error here is fatal for the
//!    actor and is not retried.
//! 2. `run_step` repeatedly while running. Each step reads at most one message
//!    per input using a short timeout; finding no input is `Ok(())`.
//! 3. `stop` exactly once at teardown.

use async_trait::async_trait;

use crate::context::ActorContext;
use crate::Result;

/// Blocking pipeline stage
pub trait Actor: Send {
    fn setup(&mut self, _ctx: &ActorContext) -> Result<()> {
        Ok(())
    }

    fn run_step(&mut self, ctx: &ActorContext) -> Result<()>;

    fn stop(&mut self, _ctx: &ActorContext) -> Result<()> {
        Ok(())
    }
}

/// Cooperative pipeline stage driven by a single-threaded runtime
#[async_trait]
pub trait AsyncActor: Send {
    async fn setup(&mut self, _ctx: &ActorContext) -> Result<()> {
        Ok(())
    }

    async fn run_step(&mut self, ctx: &ActorContext) -> Result<()>;

    async fn stop(&mut self, _ctx: &ActorContext) -> Result<()> {
        Ok(())
    }
}

/// A constructed actor of either discipline
pub enum ActorKind {
    Blocking(Box<dyn Actor>),
    Async(Box<dyn AsyncActor>),
}

impl ActorKind {
    pub fn blocking(actor: impl Actor + 'static) -> Self {
        Self::Blocking(Box::new(actor))
    }

    pub fn cooperative(actor: impl AsyncActor + 'static) -> Self {
        Self::Async(Box::new(actor))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl std::fmt::Debug for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("ActorKind::Blocking"),
            Self::Async(_) => f.write_str("ActorKind::Async"),
        }
    }
}
