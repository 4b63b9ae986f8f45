//! # Nexus Actors
//!
//! The contract between the supervisor and pipeline stages.
//!
//! ```text
//!   Nexus ──<A>_sig──▶ ┌──────────────────────┐ ──<A>.q_out──▶ next actor
//!         ◀─<A>_comm── │ RunManager           │
//!                      │   Actor / AsyncActor │ ◀─<P>.q_out─── previous actor
//!                      └──────────┬───────────┘
//!                                 │ StoreClient
//!                                 ▼
//!                           object store
//! ```
//!
//! An actor sees the world through its [`ActorContext`]. Its run manager
//! interprets [`Signal`]s, calls the actor's hooks and reports [`Comm`]
//! acknowledgments. The [`ActorRegistry`] maps class names from configuration
//! files to factories.

pub mod actor;
pub mod context;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod samples;

pub use actor::{Actor, ActorKind, AsyncActor};
pub use context::{ActorContext, Q_IN, Q_OUT, Q_WATCHOUT};
pub use error::{ActorError, Result};
pub use protocol::{Comm, Message, Signal, Stage};
pub use registry::{ActorFactory, ActorRegistry};
pub use runner::{AsyncRunManager, RunManager, RunOutcome};
pub use samples::{Averager, Generator, Sink};
