//! Three sample actors wired in-process, driven through their signal channels.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use actors::{ActorContext, ActorRegistry, Comm, Message, RunOutcome, Signal};
use channel::Channel;
use store::Store;
use topology::ActorSpec;

struct Running {
    sig: Channel<Signal>,
    comm: Channel<Comm>,
    thread: JoinHandle<RunOutcome>,
}

fn spawn(registry: &ActorRegistry, spec: ActorSpec, ctx: ActorContext) -> Running {
    let sig = ctx.q_sig().clone();
    let comm = ctx.q_comm().clone();
    let kind = registry.build(&spec).unwrap();
    let thread = std::thread::spawn(move || kind.run(&ctx).unwrap());
    Running { sig, comm, thread }
}

fn control(name: &str, store: &Store) -> ActorContext {
    ActorContext::new(
        name,
        Channel::new(format!("{name}_sig"), "Nexus", name),
        Channel::new(format!("{name}_comm"), name, "Nexus"),
        store.client(),
    )
    .with_poll_interval(Duration::from_millis(5))
}

fn expect(comm: &Channel<Comm>, wanted: Comm) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match comm.get_timeout(remaining) {
            Ok(got) if got == wanted => return,
            Ok(_) => continue,
            Err(e) => panic!("waiting for {wanted}: {e}"),
        }
    }
}

#[test]
fn test_generator_averager_sink() {
    let store = Store::start(4 << 20).unwrap();
    let registry = ActorRegistry::with_samples();

    let raw: Channel<Message> =
        Channel::new("Acquirer.q_out", "Acquirer", "Analysis").with_store(store.client());
    let means: Channel<Message> =
        Channel::new("Analysis.q_out", "Analysis", "Display").with_store(store.client());

    let actors = [
        spawn(
            &registry,
            ActorSpec::new("Acquirer", "Generator")
                .with_param("frames", 20)
                .with_param("width", 8)
                .with_param("interval_ms", 0),
            control("Acquirer", &store).with_output("q_out", raw.clone()),
        ),
        spawn(
            &registry,
            ActorSpec::new("Analysis", "Averager"),
            control("Analysis", &store)
                .with_input("q_in", raw.clone())
                .with_output("q_out", means.clone()),
        ),
        spawn(
            &registry,
            ActorSpec::new("Display", "Sink"),
            control("Display", &store).with_input("q_in", means.clone()),
        ),
    ];

    for actor in &actors {
        actor.sig.put(Signal::Setup).unwrap();
    }
    for actor in &actors {
        expect(&actor.comm, Comm::Ready);
    }
    for actor in &actors {
        actor.sig.put(Signal::Run).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while means.num() < 20 || !means.is_empty() {
        assert!(Instant::now() < deadline, "pipeline stalled at {} means", means.num());
        std::thread::sleep(Duration::from_millis(10));
    }

    for actor in &actors {
        actor.sig.put(Signal::Quit).unwrap();
    }
    let outcomes: Vec<RunOutcome> = actors
        .into_iter()
        .map(|actor| actor.thread.join().unwrap())
        .collect();
    assert!(outcomes.iter().all(|o| !o.failed));

    assert_eq!(raw.num(), 20);
    // Every message on both channels left an audit entry.
    let first: Message = store.client().get_value("Acquirer.q_out__0").unwrap();
    assert!(matches!(first, Message::Refs(ref ids) if ids.len() == 1));
    assert!(store.get("Analysis.q_out__19").is_ok());
}
