//! # Nexus
//!
//! Supervisor for actor pipelines. A [`Nexus`] loads a pipeline
//! configuration, starts the shared object store, allocates the signal, comm
//! and data channels, launches one worker per actor and drives every actor
//! through `setup`, `run` and `quit`.
//!
//! ```text
//!             ┌──────── control / output / logging (TCP) ────────┐
//!             ▼                                                  │
//!   ┌──────────────────┐  <A>_sig   ┌─────────┐  A.q_out  ┌─────────┐
//!   │      Nexus       │──────────▶ │ worker A│─────────▶ │ worker B│
//!   │  (supervisor)    │ ◀──────────│         │           │         │
//!   └────────┬─────────┘  <A>_comm  └────┬────┘           └────┬────┘
//!            │                           │                     │
//!            └───────────── object store (shared memory) ──────┘
//! ```

pub mod client;
pub mod error;
pub mod handle;
pub mod launcher;
pub mod logging;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use error::{NexusError, Result};
pub use handle::ActorHandle;
pub use launcher::{LaunchContext, Launcher, ProcessLauncher, ThreadLauncher, WorkerHandle, WorkerManifest};
pub use logging::{init_logging, LogPublisher};
pub use server::{ControlServer, ServerPorts};
pub use state::{ActorState, Flags, NexusState};
pub use supervisor::{Nexus, QUIT_REPLY};
pub use worker::run_worker;
