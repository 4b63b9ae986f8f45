//! Sample pipeline stages
//!
//! Small actors that exercise every part of the runtime: a blocking
//! producer that writes frames into the store, a blocking transformer that
//! reads them back, and a cooperative consumer.

use std::time::Duration;

use async_trait::async_trait;
use store::{ObjectId, StoreError};
use topology::ActorSpec;
use tracing::{debug, info, warn};

use crate::actor::{Actor, AsyncActor};
use crate::context::ActorContext;
use crate::protocol::Message;
use crate::registry::ActorRegistry;
use crate::{ActorError, Result};

pub fn register(registry: &mut ActorRegistry) {
    registry
        .register_blocking("Generator", Generator::from_spec)
        .register_blocking("Averager", Averager::from_spec)
        .register_async("Sink", Sink::from_spec);
}

/// Emits `frames` vectors of `width` samples, one per step.
///
/// Parameters: `frames` (default 100), `width` (64), `interval_ms` (10)
/// and `save_every` (0, never). Every `save_every`-th frame is also sent to
/// the `q_watchout` link when one is connected.
#[derive(Debug)]
pub struct Generator {
    frames: u64,
    width: usize,
    interval: Duration,
    save_every: u64,
    sent: u64,
}

impl Generator {
    pub fn from_spec(spec: &ActorSpec) -> Result<Self> {
        let width: usize = spec.param_or("width", 64)?;
        if width == 0 {
            return Err(ActorError::params(&spec.name, "width must be positive"));
        }
        Ok(Self {
            frames: spec.param_or("frames", 100)?,
            width,
            interval: Duration::from_millis(spec.param_or("interval_ms", 10)?),
            save_every: spec.param_or("save_every", 0)?,
            sent: 0,
        })
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    fn frame(&self) -> Vec<f64> {
        let base = self.sent as f64;
        (0..self.width).map(|i| base + i as f64).collect()
    }
}

impl Actor for Generator {
    fn setup(&mut self, ctx: &ActorContext) -> Result<()> {
        ctx.q_out()?;
        Ok(())
    }

    fn run_step(&mut self, ctx: &ActorContext) -> Result<()> {
        if self.sent >= self.frames {
            std::thread::sleep(ctx.poll_interval());
            return Ok(());
        }

        let label = format!("{}.frame.{}", ctx.name(), self.sent);
        match ctx.store().put_value(&self.frame(), &label) {
            Ok(id) => {
                let save = self.save_every > 0 && self.sent % self.save_every == 0;
                ctx.put_refs(vec![id], &[save])?;
            }
            Err(e @ StoreError::Full { .. }) => {
                warn!(actor = %ctx.name(), frame = self.sent, error = %e, "Dropping frame");
            }
            Err(e) => return Err(e.into()),
        }
        self.sent += 1;

        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &ActorContext) -> Result<()> {
        info!(actor = %ctx.name(), frames = self.sent, "Generator stopped");
        Ok(())
    }
}

/// Replaces each incoming frame with its mean.
///
/// With a `q_out` link the mean is forwarded as a new object; otherwise the
/// latest mean is kept in the store under `<name>.mean`.
#[derive(Debug, Default)]
pub struct Averager {
    processed: u64,
    last: Option<ObjectId>,
}

impl Averager {
    pub fn from_spec(_spec: &ActorSpec) -> Result<Self> {
        Ok(Self::default())
    }

    fn consume(&mut self, ctx: &ActorContext, id: ObjectId) -> Result<()> {
        let frame: Vec<f64> = ctx.store().get_value_id(id)?;
        ctx.store().release(id)?;

        let mean = if frame.is_empty() {
            0.0
        } else {
            frame.iter().sum::<f64>() / frame.len() as f64
        };
        self.processed += 1;

        match ctx.output(crate::context::Q_OUT) {
            Some(out) => {
                let label = format!("{}.mean.{}", ctx.name(), self.processed);
                let mean_id = ctx.store().put_value(&mean, &label)?;
                out.put(Message::Refs(vec![mean_id]))?;
            }
            None => {
                let mean_id = ctx.store().put_value(&mean, &format!("{}.mean", ctx.name()))?;
                if let Some(previous) = self.last.replace(mean_id) {
                    ctx.store().release(previous)?;
                }
            }
        }
        debug!(actor = %ctx.name(), %id, mean, "Frame averaged");
        Ok(())
    }
}

impl Actor for Averager {
    fn setup(&mut self, ctx: &ActorContext) -> Result<()> {
        ctx.q_in()?;
        Ok(())
    }

    fn run_step(&mut self, ctx: &ActorContext) -> Result<()> {
        let msg = match ctx.q_in()?.get_timeout(ctx.poll_interval()) {
            Ok(msg) => msg,
            Err(e) if e.is_timeout() || e.is_closed() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match msg {
            Message::Refs(ids) => ids.into_iter().try_for_each(|id| self.consume(ctx, id)),
            other => {
                warn!(actor = %ctx.name(), message = ?other, "Ignoring non-reference message");
                Ok(())
            }
        }
    }

    fn stop(&mut self, ctx: &ActorContext) -> Result<()> {
        info!(actor = %ctx.name(), frames = self.processed, "Averager stopped");
        Ok(())
    }
}

/// Counts and releases whatever arrives on `q_in`.
#[derive(Debug, Default)]
pub struct Sink {
    received: u64,
}

impl Sink {
    pub fn from_spec(_spec: &ActorSpec) -> Result<Self> {
        Ok(Self::default())
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

#[async_trait]
impl AsyncActor for Sink {
    async fn setup(&mut self, ctx: &ActorContext) -> Result<()> {
        ctx.q_in()?;
        Ok(())
    }

    async fn run_step(&mut self, ctx: &ActorContext) -> Result<()> {
        let msg = match ctx.q_in()?.get_async(Some(ctx.poll_interval())).await {
            Ok(msg) => msg,
            Err(e) if e.is_timeout() || e.is_closed() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        self.received += 1;
        if let Message::Refs(ids) = msg {
            for id in ids {
                match ctx.store().release(id) {
                    Ok(_) | Err(StoreError::NotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    async fn stop(&mut self, ctx: &ActorContext) -> Result<()> {
        info!(actor = %ctx.name(), received = self.received, "Sink stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Comm, Signal};
    use channel::Channel;
    use store::Store;

    struct Fixture {
        store: Store,
        input: Channel<Message>,
        output: Channel<Message>,
    }

    fn fixture() -> Fixture {
        Fixture {
            store: Store::start(1 << 20).unwrap(),
            input: Channel::new("Src.q_out", "Src", "Test"),
            output: Channel::new("Test.q_out", "Test", "Dst"),
        }
    }

    fn context(f: &Fixture, with_output: bool) -> ActorContext {
        let ctx = ActorContext::new(
            "Test",
            Channel::<Signal>::new("Test_sig", "Nexus", "Test"),
            Channel::<Comm>::new("Test_comm", "Test", "Nexus"),
            f.store.client(),
        )
        .with_input("q_in", f.input.clone())
        .with_poll_interval(Duration::from_millis(5));
        if with_output {
            ctx.with_output("q_out", f.output.clone())
        } else {
            ctx
        }
    }

    #[test]
    fn test_generator_params() {
        let spec = ActorSpec::new("Gen", "Generator")
            .with_param("frames", 3)
            .with_param("width", 4)
            .with_param("interval_ms", 0);
        let generator = Generator::from_spec(&spec).unwrap();
        assert_eq!(generator.frames, 3);
        assert_eq!(generator.width, 4);
        assert!(generator.interval.is_zero());

        let zero = ActorSpec::new("Gen", "Generator").with_param("width", 0);
        assert!(matches!(
            Generator::from_spec(&zero).unwrap_err(),
            ActorError::Params { .. }
        ));
    }

    #[test]
    fn test_generator_requires_output() {
        let f = fixture();
        let ctx = context(&f, false);
        let mut generator = Generator::from_spec(&ActorSpec::new("Gen", "Generator")).unwrap();
        assert!(matches!(
            generator.setup(&ctx).unwrap_err(),
            ActorError::MissingLink { .. }
        ));
    }

    #[test]
    fn test_generator_stops_after_frames() {
        let f = fixture();
        let ctx = context(&f, true);
        let spec = ActorSpec::new("Gen", "Generator")
            .with_param("frames", 2)
            .with_param("width", 3)
            .with_param("interval_ms", 0);
        let mut generator = Generator::from_spec(&spec).unwrap();

        for _ in 0..4 {
            generator.run_step(&ctx).unwrap();
        }
        assert_eq!(generator.sent(), 2);
        assert_eq!(f.output.qsize(), 2);

        let Message::Refs(ids) = f.output.get_nowait().unwrap() else {
            panic!("expected references");
        };
        let frame: Vec<f64> = f.store.client().get_value_id(ids[0]).unwrap();
        assert_eq!(frame, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_generator_saves_every_nth_frame_to_watch() {
        let f = fixture();
        let watch = Channel::new("Test.q_watchout", "Test", "Watcher");
        let ctx = context(&f, true).with_output(crate::context::Q_WATCHOUT, watch.clone());
        let spec = ActorSpec::new("Gen", "Generator")
            .with_param("frames", 5)
            .with_param("width", 2)
            .with_param("interval_ms", 0)
            .with_param("save_every", 2);
        let mut generator = Generator::from_spec(&spec).unwrap();

        for _ in 0..5 {
            generator.run_step(&ctx).unwrap();
        }
        assert_eq!(f.output.qsize(), 5);
        assert_eq!(watch.qsize(), 3);

        let Message::Refs(saved) = watch.get_nowait().unwrap() else {
            panic!("expected references");
        };
        let frame: Vec<f64> = f.store.client().get_value_id(saved[0]).unwrap();
        assert_eq!(frame, vec![0.0, 1.0]);
    }

    #[test]
    fn test_averager_forwards_mean() {
        let f = fixture();
        let ctx = context(&f, true);
        let client = f.store.client();
        let id = client.put_value(&vec![1.0f64, 2.0, 3.0, 6.0], "frame").unwrap();
        f.input.put(Message::Refs(vec![id])).unwrap();

        let mut averager = Averager::default();
        averager.run_step(&ctx).unwrap();

        let Message::Refs(ids) = f.output.get_nowait().unwrap() else {
            panic!("expected references");
        };
        let mean: f64 = client.get_value_id(ids[0]).unwrap();
        assert_eq!(mean, 3.0);
        // The input frame was released once consumed.
        assert!(client.get_id(id).is_err());
    }

    #[test]
    fn test_averager_keeps_latest_mean_without_output() {
        let f = fixture();
        let ctx = context(&f, false);
        let client = f.store.client();
        let mut averager = Averager::default();

        for frame in [vec![2.0f64, 4.0], vec![10.0, 20.0]] {
            let id = client.put_value(&frame, "frame").unwrap();
            f.input.put(Message::Refs(vec![id])).unwrap();
            averager.run_step(&ctx).unwrap();
        }

        let mean: f64 = client.get_value("Test.mean").unwrap();
        assert_eq!(mean, 15.0);
        assert_eq!(client.stats().unwrap().live_objects, 1);
    }

    #[test]
    fn test_averager_idle_step_is_ok() {
        let f = fixture();
        let ctx = context(&f, true);
        Averager::default().run_step(&ctx).unwrap();
    }

    #[tokio::test]
    async fn test_sink_counts_and_releases() {
        let f = fixture();
        let ctx = context(&f, false);
        let client = f.store.client();
        let id = client.put(b"payload", "frame").unwrap();
        f.input.put(Message::Refs(vec![id])).unwrap();
        f.input.put(Message::Text("hello".into())).unwrap();

        let mut sink = Sink::default();
        for _ in 0..3 {
            sink.run_step(&ctx).await.unwrap();
        }
        assert_eq!(sink.received(), 2);
        assert!(client.get_id(id).is_err());
    }
}
