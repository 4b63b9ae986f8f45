//! Supervisor-side view of one actor

use std::fmt;

use topology::ActorSpec;

use crate::launcher::WorkerHandle;
use crate::state::ActorState;

pub struct ActorHandle {
    pub(crate) spec: ActorSpec,
    pub(crate) state: ActorState,
    pub(crate) worker: Option<Box<dyn WorkerHandle>>,
    pub(crate) last_error: Option<String>,
}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("name", &self.spec.name)
            .field("class", &self.spec.class)
            .field("state", &self.state)
            .field("worker", &self.worker_id())
            .finish()
    }
}

impl ActorHandle {
    pub fn new(spec: ActorSpec) -> Self {
        Self {
            spec,
            state: ActorState::Pending,
            worker: None,
            last_error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ActorSpec {
        &self.spec
    }

    pub fn state(&self) -> ActorState {
        self.state
    }

    /// Most recent error reported by or about this actor.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn worker_id(&self) -> Option<String> {
        self.worker.as_ref().map(|w| w.id())
    }

    /// Process id of an out-of-process worker.
    pub fn pid(&self) -> Option<u32> {
        self.worker.as_ref().and_then(|w| w.pid())
    }

    pub fn is_launched(&self) -> bool {
        self.worker.is_some()
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.state = ActorState::Error;
        self.last_error = Some(message.into());
    }
}
