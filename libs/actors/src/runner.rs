//! Run managers
//!
//! A run manager owns one actor for its whole life. It announces itself with
//! [`Comm::Started`], then interprets signals until told to quit:
//!
//! | signal          | effect                                                 |
//! |-----------------|--------------------------------------------------------|
//! | `setup`         | run `setup` once, answer `ready` or an error           |
//! | `run`/`resume`  | start stepping (only after a successful setup)         |
//! | `pause`         | stop stepping                                          |
//! | `stop`          | stop stepping, answer `stop success`                   |
//! | `quit`          | leave the loop                                         |
//!
//! While stepping, signals are polled without blocking between steps. While
//! idle, the manager waits on the signal channel for one poll interval at a
//! time. A failed step is reported and halts stepping; the actor stays
//! responsive to signals. `stop` runs exactly once when the loop ends,
//! including when the signal channel closes underneath it.

use channel::ChannelError;
use tracing::{debug, error, info, warn};

use crate::actor::{Actor, ActorKind, AsyncActor};
use crate::context::ActorContext;
use crate::protocol::{Comm, Signal, Stage};
use crate::{ActorError, Result};

/// Summary of a finished run loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Completed `run_step` calls
    pub steps: u64,
    /// Setup or a step failed at some point
    pub failed: bool,
}

/// State shared by both managers
#[derive(Debug, Default)]
struct Lifecycle {
    set_up: bool,
    running: bool,
    failed: bool,
    steps: u64,
}

enum Directive {
    Setup,
    Quit,
    Continue,
}

impl Lifecycle {
    fn apply(&mut self, signal: Signal, ctx: &ActorContext) -> Directive {
        debug!(actor = %ctx.name(), %signal, "Signal received");
        match signal {
            Signal::Setup if self.set_up => {
                ctx.report(Comm::Ready);
                Directive::Continue
            }
            Signal::Setup if self.failed => {
                warn!(actor = %ctx.name(), "Ignoring setup after a failed setup");
                Directive::Continue
            }
            Signal::Setup => Directive::Setup,
            Signal::Run | Signal::Resume => {
                if self.set_up && !self.failed {
                    self.running = true;
                } else {
                    warn!(actor = %ctx.name(), %signal, "Ignoring signal: actor is not ready");
                }
                Directive::Continue
            }
            Signal::Pause => {
                self.running = false;
                Directive::Continue
            }
            Signal::Stop => {
                self.running = false;
                ctx.report(Comm::StopSuccess);
                Directive::Continue
            }
            Signal::Quit => Directive::Quit,
        }
    }

    fn setup_done(&mut self, result: Result<()>, ctx: &ActorContext) {
        match result {
            Ok(()) => {
                self.set_up = true;
                info!(actor = %ctx.name(), "Actor setup complete");
                ctx.report(Comm::Ready);
            }
            Err(e) => {
                self.failed = true;
                error!(actor = %ctx.name(), error = %e, "Actor setup failed");
                ctx.report(Comm::Error {
                    stage: Stage::Setup,
                    message: e.to_string(),
                });
            }
        }
    }

    fn step_done(&mut self, result: Result<()>, ctx: &ActorContext) {
        match result {
            Ok(()) => self.steps += 1,
            Err(e) => {
                self.failed = true;
                self.running = false;
                error!(actor = %ctx.name(), error = %e, steps = self.steps, "Actor step failed");
                ctx.report(Comm::Error {
                    stage: Stage::Step,
                    message: e.to_string(),
                });
            }
        }
    }

    fn stop_done(&self, result: Result<()>, ctx: &ActorContext) {
        if let Err(e) = result {
            error!(actor = %ctx.name(), error = %e, "Actor stop failed");
            ctx.report(Comm::Error {
                stage: Stage::Stop,
                message: e.to_string(),
            });
        }
    }

    fn outcome(&self) -> RunOutcome {
        RunOutcome {
            steps: self.steps,
            failed: self.failed,
        }
    }
}

/// Translate a signal read into the next signal to apply, if any. A closed
/// signal channel means the supervisor is gone and is treated as `quit`.
fn next_signal(read: std::result::Result<Signal, ChannelError>, ctx: &ActorContext) -> Option<Signal> {
    match read {
        Ok(signal) => Some(signal),
        Err(e) if e.is_empty() || e.is_timeout() => None,
        Err(e) if e.is_closed() => {
            debug!(actor = %ctx.name(), "Signal channel closed");
            Some(Signal::Quit)
        }
        Err(e) => {
            warn!(actor = %ctx.name(), error = %e, "Failed to read signal");
            None
        }
    }
}

/// Drives a blocking [`Actor`] on the calling thread
pub struct RunManager<'a> {
    actor: &'a mut dyn Actor,
    ctx: &'a ActorContext,
}

impl<'a> RunManager<'a> {
    pub fn new(actor: &'a mut dyn Actor, ctx: &'a ActorContext) -> Self {
        Self { actor, ctx }
    }

    pub fn run(self) -> RunOutcome {
        let ctx = self.ctx;
        let mut lifecycle = Lifecycle::default();
        ctx.report(Comm::Started);

        loop {
            let read = if lifecycle.running {
                ctx.q_sig().get_nowait()
            } else {
                ctx.q_sig().get_timeout(ctx.poll_interval())
            };

            if let Some(signal) = next_signal(read, ctx) {
                match lifecycle.apply(signal, ctx) {
                    Directive::Quit => break,
                    Directive::Setup => {
                        let result = self.actor.setup(ctx);
                        lifecycle.setup_done(result, ctx);
                    }
                    Directive::Continue => {}
                }
                continue;
            }

            if lifecycle.running {
                let result = self.actor.run_step(ctx);
                lifecycle.step_done(result, ctx);
            }
        }

        let result = self.actor.stop(ctx);
        lifecycle.stop_done(result, ctx);
        info!(actor = %ctx.name(), steps = lifecycle.steps, "Actor run loop finished");
        lifecycle.outcome()
    }
}

/// Drives an [`AsyncActor`] on the current task
pub struct AsyncRunManager<'a> {
    actor: &'a mut dyn AsyncActor,
    ctx: &'a ActorContext,
}

impl<'a> AsyncRunManager<'a> {
    pub fn new(actor: &'a mut dyn AsyncActor, ctx: &'a ActorContext) -> Self {
        Self { actor, ctx }
    }

    pub async fn run(self) -> RunOutcome {
        let ctx = self.ctx;
        let mut lifecycle = Lifecycle::default();
        ctx.report(Comm::Started);

        loop {
            let read = if lifecycle.running {
                ctx.q_sig().get_nowait()
            } else {
                ctx.q_sig().get_async(Some(ctx.poll_interval())).await
            };

            if let Some(signal) = next_signal(read, ctx) {
                match lifecycle.apply(signal, ctx) {
                    Directive::Quit => break,
                    Directive::Setup => {
                        let result = self.actor.setup(ctx).await;
                        lifecycle.setup_done(result, ctx);
                    }
                    Directive::Continue => {}
                }
                continue;
            }

            if lifecycle.running {
                let result = self.actor.run_step(ctx).await;
                lifecycle.step_done(result, ctx);
                tokio::task::yield_now().await;
            }
        }

        let result = self.actor.stop(ctx).await;
        lifecycle.stop_done(result, ctx);
        info!(actor = %ctx.name(), steps = lifecycle.steps, "Actor run loop finished");
        lifecycle.outcome()
    }
}

impl ActorKind {
    /// Run the actor to completion on the calling thread. Async actors get a
    /// dedicated current-thread runtime.
    pub fn run(self, ctx: &ActorContext) -> Result<RunOutcome> {
        match self {
            ActorKind::Blocking(mut actor) => Ok(RunManager::new(actor.as_mut(), ctx).run()),
            ActorKind::Async(mut actor) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| ActorError::Runtime {
                        message: format!("failed to build runtime: {e}"),
                    })?;
                Ok(runtime.block_on(AsyncRunManager::new(actor.as_mut(), ctx).run()))
            }
        }
    }
}
