//! # Nexus Channels
//!
//! A [`Channel`] is a directed, named link between exactly two actors. It
//! offers three access disciplines over one FIFO queue:
//!
//! - blocking: [`Channel::put`], [`Channel::get`], [`Channel::get_timeout`]
//! - non-blocking: [`Channel::put_nowait`], [`Channel::get_nowait`]
//! - cooperative: [`Channel::put_async`], [`Channel::get_async`]
//!
//! Every put-family call also records the message in the object store under
//! `"<channel>__<seq>"` when a store client is attached, leaving a replayable
//! audit trail that outlives the live queue.
//!
//! Channels whose ends live in different processes are joined with a
//! [`Bridge`] over a Unix domain socket (see [`bridge`]).

pub mod bridge;
pub mod channel;
pub mod error;

pub use bridge::{Bridge, BridgeRole};
pub use channel::{Channel, Payload};
pub use error::{ChannelError, Result};

/// Socket path for a bridged channel inside `dir`.
pub fn socket_path(dir: &std::path::Path, channel: &str) -> std::path::PathBuf {
    dir.join(format!("{channel}.sock"))
}
