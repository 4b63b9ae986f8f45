//! Actor-facing handles
//!
//! An [`ActorContext`] is the entire surface an actor implementation
//! programs against: its data links, its signal and comm channels and a
//! store client.

use std::collections::BTreeMap;
use std::time::Duration;

use channel::Channel;
use store::{ObjectId, StoreClient};
use tracing::warn;

use crate::protocol::{Comm, Message, Signal};
use crate::{ActorError, Result};

/// Default port names for single-input and single-output actors.
pub const Q_IN: &str = "q_in";
pub const Q_OUT: &str = "q_out";
/// Output port that receives the objects an actor marks for saving.
pub const Q_WATCHOUT: &str = "q_watchout";

pub struct ActorContext {
    name: String,
    inputs: BTreeMap<String, Channel<Message>>,
    outputs: BTreeMap<String, Channel<Message>>,
    q_sig: Channel<Signal>,
    q_comm: Channel<Comm>,
    store: StoreClient,
    poll_interval: Duration,
}

impl std::fmt::Debug for ActorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorContext")
            .field("name", &self.name)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActorContext {
    pub fn new(
        name: impl Into<String>,
        q_sig: Channel<Signal>,
        q_comm: Channel<Comm>,
        store: StoreClient,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            q_sig,
            q_comm,
            store,
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn with_input(mut self, port: impl Into<String>, link: Channel<Message>) -> Self {
        self.inputs.insert(port.into(), link);
        self
    }

    pub fn with_output(mut self, port: impl Into<String>, link: Channel<Message>) -> Self {
        self.outputs.insert(port.into(), link);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn q_sig(&self) -> &Channel<Signal> {
        &self.q_sig
    }

    pub fn q_comm(&self) -> &Channel<Comm> {
        &self.q_comm
    }

    /// Timeout actors should use when waiting on input so they keep
    /// answering signals.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn input(&self, port: &str) -> Option<&Channel<Message>> {
        self.inputs.get(port)
    }

    pub fn output(&self, port: &str) -> Option<&Channel<Message>> {
        self.outputs.get(port)
    }

    /// Data link on `port`, input or output.
    pub fn link(&self, port: &str) -> Option<&Channel<Message>> {
        self.input(port).or_else(|| self.output(port))
    }

    pub fn inputs(&self) -> impl Iterator<Item = (&str, &Channel<Message>)> {
        self.inputs.iter().map(|(port, link)| (port.as_str(), link))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&str, &Channel<Message>)> {
        self.outputs.iter().map(|(port, link)| (port.as_str(), link))
    }

    /// The `q_in` link.
    pub fn q_in(&self) -> Result<&Channel<Message>> {
        self.input(Q_IN).ok_or_else(|| self.missing(Q_IN))
    }

    /// The `q_out` link.
    pub fn q_out(&self) -> Result<&Channel<Message>> {
        self.output(Q_OUT).ok_or_else(|| self.missing(Q_OUT))
    }

    /// The `q_watchout` link, if this actor is being watched.
    pub fn watch(&self) -> Option<&Channel<Message>> {
        self.output(Q_WATCHOUT)
    }

    /// Put `ids` on `q_out` as one message, then forward each id whose
    /// `save` flag is set to the watch link. Missing flags count as unset.
    /// Every id sent to the watch link gains a store reference of its own,
    /// so both consumers release independently.
    pub fn put_refs(&self, ids: Vec<ObjectId>, save: &[bool]) -> Result<()> {
        let saved: Vec<ObjectId> = match self.watch() {
            Some(_) => ids
                .iter()
                .zip(save.iter().chain(std::iter::repeat(&false)))
                .filter_map(|(id, keep)| keep.then_some(*id))
                .collect(),
            None => Vec::new(),
        };

        self.q_out()?.put(Message::Refs(ids))?;

        if let Some(watch) = self.watch() {
            for id in saved {
                self.store.retain(id)?;
                if let Err(e) = watch.put(Message::Refs(vec![id])) {
                    self.store.release(id)?;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn missing(&self, port: &str) -> ActorError {
        ActorError::MissingLink {
            actor: self.name.clone(),
            port: port.to_string(),
        }
    }

    /// Send `comm` to the supervisor. A closed comm channel means the
    /// supervisor is gone, which is only worth a warning here.
    pub fn report(&self, comm: Comm) {
        if let Err(e) = self.q_comm.put(comm) {
            warn!(actor = %self.name, error = %e, "Failed to report to supervisor");
        }
    }

    /// Close every channel this actor writes to.
    pub fn close_outputs(&self) {
        for link in self.outputs.values() {
            link.close();
        }
        self.q_comm.close();
    }
}
