//! Channel core
//!
//! One FIFO queue behind a `parking_lot` mutex. Blocking callers park on a
//! condition variable; async callers wait on a `tokio::sync::Notify`. Both
//! are woken on every push, so either discipline can be used on either end
//! of the same channel.
//!
//! Async waits never hold a message: the pop happens synchronously under the
//! lock once the task is woken, so dropping a `get_async` future (timeout or
//! task cancellation) leaves the queue exactly as it was.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use store::{ObjectId, StoreClient};
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::{ChannelError, Result};

/// Messages a channel can carry: encodable for audit logging and bridging.
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + 'static {}

struct State<M> {
    queue: VecDeque<M>,
    closed: bool,
}

struct Shared<M> {
    name: String,
    start: String,
    end: String,
    capacity: Option<usize>,
    state: Mutex<State<M>>,
    readable: Condvar,
    writable: Condvar,
    arrived: Notify,
    drained: Notify,
    num: AtomicU64,
    store: RwLock<Option<StoreClient>>,
}

/// Directed, named link between two actors
pub struct Channel<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M> fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.shared.name)
            .field("start", &self.shared.start)
            .field("end", &self.shared.end)
            .field("capacity", &self.shared.capacity)
            .field("num", &self.shared.num.load(Ordering::Acquire))
            .finish()
    }
}

impl<M: Payload> Channel<M> {
    /// Unbounded channel from `start` to `end`.
    pub fn new(name: impl Into<String>, start: impl Into<String>, end: impl Into<String>) -> Self {
        Self::build(name.into(), start.into(), end.into(), None)
    }

    /// Channel holding at most `capacity` queued messages.
    pub fn bounded(
        name: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self::build(name.into(), start.into(), end.into(), Some(capacity.max(1)))
    }

    fn build(name: String, start: String, end: String, capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                start,
                end,
                capacity,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    closed: false,
                }),
                readable: Condvar::new(),
                writable: Condvar::new(),
                arrived: Notify::new(),
                drained: Notify::new(),
                num: AtomicU64::new(0),
                store: RwLock::new(None),
            }),
        }
    }

    /// Enable audit logging of every put into `store`.
    pub fn with_store(self, store: StoreClient) -> Self {
        self.attach_store(store);
        self
    }

    pub fn attach_store(&self, store: StoreClient) {
        *self.shared.store.write() = Some(store);
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Producing actor
    pub fn start(&self) -> &str {
        &self.shared.start
    }

    /// Consuming actor
    pub fn end(&self) -> &str {
        &self.shared.end
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    /// Number of messages put so far; the next put is logged under this
    /// sequence number.
    pub fn num(&self) -> u64 {
        self.shared.num.load(Ordering::Acquire)
    }

    pub fn qsize(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.qsize() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Store key of the audit entry for sequence number `seq`.
    pub fn audit_key(&self, seq: u64) -> String {
        format!("{}__{}", self.shared.name, seq)
    }

    /// Write `msg` into the attached store under the next sequence key.
    ///
    /// The sequence number advances even without a store so `num` always
    /// counts puts. Returns the stored object id when a store is attached.
    pub fn log_to_store(&self, msg: &M) -> Result<Option<ObjectId>> {
        let seq = self.shared.num.fetch_add(1, Ordering::AcqRel);
        match self.encode_audit(msg)? {
            Some(bytes) => self.record(seq, &bytes),
            None => Ok(None),
        }
    }

    /// Encoded audit entry, `None` when no store is attached. Encoding
    /// happens before the queue takes ownership of the message.
    fn encode_audit(&self, msg: &M) -> Result<Option<Vec<u8>>> {
        if self.shared.store.read().is_none() {
            return Ok(None);
        }
        Ok(Some(bincode::serialize(msg)?))
    }

    fn record(&self, seq: u64, bytes: &[u8]) -> Result<Option<ObjectId>> {
        let guard = self.shared.store.read();
        let Some(store) = guard.as_ref() else {
            return Ok(None);
        };
        let key = self.audit_key(seq);
        let id = store.put(bytes, &key)?;
        trace!(channel = %self.shared.name, key = %key, "Message logged to store");
        Ok(Some(id))
    }

    fn prepare_audit(&self, msg: &M) -> Option<Vec<u8>> {
        self.encode_audit(msg)
            .inspect_err(|e| {
                warn!(channel = %self.shared.name, error = %e, "Failed to log message to store")
            })
            .ok()
            .flatten()
    }

    /// Audit a message that was accepted under sequence number `seq`.
    fn commit_audit(&self, seq: u64, bytes: Option<Vec<u8>>) {
        let Some(bytes) = bytes else {
            return;
        };
        if let Err(e) = self.record(seq, &bytes) {
            warn!(channel = %self.shared.name, error = %e, "Failed to log message to store");
        }
    }

    fn closed_error(&self) -> ChannelError {
        ChannelError::Closed {
            channel: self.shared.name.clone(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn wake_readers(&self) {
        self.shared.readable.notify_one();
        self.shared.arrived.notify_waiters();
    }

    fn wake_writers(&self) {
        if self.shared.capacity.is_some() {
            self.shared.writable.notify_one();
            self.shared.drained.notify_waiters();
        }
    }

    /// Enqueue under the lock. A counted push takes the next sequence number
    /// in queue order; uncounted pushes deliver messages already logged on
    /// the far side of a bridge.
    fn enqueue(&self, state: &mut State<M>, msg: M, counted: bool) -> u64 {
        state.queue.push_back(msg);
        if counted {
            self.shared.num.fetch_add(1, Ordering::AcqRel)
        } else {
            self.shared.num.load(Ordering::Acquire)
        }
    }

    fn push_blocking(&self, msg: M, counted: bool) -> Result<u64> {
        let mut state = self.shared.state.lock();
        if let Some(capacity) = self.shared.capacity {
            while state.queue.len() >= capacity && !state.closed {
                self.shared.writable.wait(&mut state);
            }
        }
        if state.closed {
            return Err(self.closed_error());
        }
        let seq = self.enqueue(&mut state, msg, counted);
        drop(state);

        self.wake_readers();
        Ok(seq)
    }

    fn try_push(&self, msg: M, counted: bool) -> std::result::Result<u64, (M, ChannelError)> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err((msg, self.closed_error()));
        }
        if let Some(capacity) = self.shared.capacity {
            if state.queue.len() >= capacity {
                return Err((
                    msg,
                    ChannelError::Full {
                        channel: self.shared.name.clone(),
                        capacity,
                    },
                ));
            }
        }
        let seq = self.enqueue(&mut state, msg, counted);
        drop(state);

        self.wake_readers();
        Ok(seq)
    }

    async fn push_cooperative(&self, mut msg: M, counted: bool) -> Result<u64> {
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            match self.try_push(msg, counted) {
                Ok(seq) => return Ok(seq),
                Err((returned, ChannelError::Full { .. })) => {
                    msg = returned;
                    drained.await;
                }
                Err((_, e)) => return Err(e),
            }
        }
    }

    /// Cooperative push without auditing, for bridge pumps.
    pub(crate) async fn deliver(&self, msg: M) -> Result<()> {
        self.push_cooperative(msg, false).await.map(|_| ())
    }

    /// Pop the head if present. `Ok(None)` means empty but still open.
    fn try_pop(&self) -> Result<Option<M>> {
        let mut state = self.shared.state.lock();
        match state.queue.pop_front() {
            Some(msg) => {
                drop(state);
                self.wake_writers();
                Ok(Some(msg))
            }
            None if state.closed => Err(self.closed_error()),
            None => Ok(None),
        }
    }

    /// Blocking put. Unbounded channels never wait; bounded ones wait for room.
    /// The message is audited once it is queued.
    pub fn put(&self, msg: M) -> Result<()> {
        self.ensure_open()?;
        let audit = self.prepare_audit(&msg);
        let seq = self.push_blocking(msg, true)?;
        self.commit_audit(seq, audit);
        Ok(())
    }

    /// Non-blocking put; fails with [`ChannelError::Full`] only when bounded.
    /// A rejected message is neither audited nor counted.
    pub fn put_nowait(&self, msg: M) -> Result<()> {
        self.ensure_open()?;
        let audit = self.prepare_audit(&msg);
        let seq = self.try_push(msg, true).map_err(|(_, e)| e)?;
        self.commit_audit(seq, audit);
        Ok(())
    }

    /// Cooperative put: suspends only the calling task while a bounded
    /// channel is full.
    pub async fn put_async(&self, msg: M) -> Result<()> {
        self.ensure_open()?;
        let audit = self.prepare_audit(&msg);
        let seq = self.push_cooperative(msg, true).await?;
        self.commit_audit(seq, audit);
        Ok(())
    }

    /// Blocking get: parks the thread until a message arrives.
    pub fn get(&self) -> Result<M> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(msg) = state.queue.pop_front() {
                drop(state);
                self.wake_writers();
                return Ok(msg);
            }
            if state.closed {
                return Err(self.closed_error());
            }
            self.shared.readable.wait(&mut state);
        }
    }

    /// Blocking get giving up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<M> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(msg) = state.queue.pop_front() {
                drop(state);
                self.wake_writers();
                return Ok(msg);
            }
            if state.closed {
                return Err(self.closed_error());
            }
            if self
                .shared
                .readable
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.queue.is_empty()
            {
                return Err(ChannelError::Timeout {
                    channel: self.shared.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Non-blocking get; fails with [`ChannelError::Empty`] when nothing is
    /// queued.
    pub fn get_nowait(&self) -> Result<M> {
        self.try_pop()?.ok_or_else(|| ChannelError::Empty {
            channel: self.shared.name.clone(),
        })
    }

    /// Cooperative get: suspends only the calling task until a message
    /// arrives or `timeout` elapses.
    pub async fn get_async(&self, timeout: Option<Duration>) -> Result<M> {
        let wait = async {
            loop {
                let arrived = self.shared.arrived.notified();
                tokio::pin!(arrived);
                arrived.as_mut().enable();

                match self.try_pop() {
                    Ok(Some(msg)) => return Ok(msg),
                    Ok(None) => arrived.await,
                    Err(e) => return Err(e),
                }
            }
        };

        match timeout {
            None => wait.await,
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                ChannelError::Timeout {
                    channel: self.shared.name.clone(),
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
        }
    }

    /// Close the channel. Queued messages can still be drained; once empty,
    /// getters fail with [`ChannelError::Closed`] and every put does.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);

        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
        self.shared.arrived.notify_waiters();
        self.shared.drained.notify_waiters();
        trace!(channel = %self.shared.name, "Channel closed");
    }
}
