//! Socket bridge integration tests
//!
//! Both ends run in this process but share nothing except the socket, the
//! same way two actor processes would.

use std::time::Duration;

use channel::{socket_path, Channel, ChannelError};
use serde::{Deserialize, Serialize};
use store::Store;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Frame {
    Ref(u64),
    Text(String),
}

fn pair(name: &str) -> (Channel<Frame>, Channel<Frame>) {
    (
        Channel::new(name, "Producer", "Consumer"),
        Channel::new(name, "Producer", "Consumer"),
    )
}

#[test]
fn test_messages_cross_the_socket_in_order() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(dir.path(), "Producer.q_out");
    let (producer, consumer) = pair("Producer.q_out");

    let pump = consumer.receive_from(&path).unwrap();
    let forwarder = producer.forward_to(&path).unwrap();

    for i in 0..20 {
        producer.put(Frame::Ref(i)).unwrap();
    }
    producer.put(Frame::Text("done".into())).unwrap();

    for i in 0..20 {
        let frame = consumer.get_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame, Frame::Ref(i));
    }
    assert_eq!(
        consumer.get_timeout(Duration::from_secs(5)).unwrap(),
        Frame::Text("done".into())
    );

    producer.close();
    forwarder.shutdown(Duration::from_secs(1));
    pump.shutdown(Duration::from_secs(1));
    assert!(!path.exists());
}

#[test]
fn test_forwarder_waits_for_late_listener() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(dir.path(), "late");
    let (producer, consumer) = pair("late");

    let forwarder = producer.forward_to(&path).unwrap();
    producer.put(Frame::Ref(7)).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let pump = consumer.receive_from(&path).unwrap();
    assert_eq!(
        consumer.get_timeout(Duration::from_secs(5)).unwrap(),
        Frame::Ref(7)
    );

    forwarder.shutdown(Duration::ZERO);
    pump.shutdown(Duration::ZERO);
}

#[tokio::test]
async fn test_async_consumer_on_bridged_channel() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(dir.path(), "async");
    let (producer, consumer) = pair("async");

    let pump = consumer.receive_from(&path).unwrap();
    let forwarder = producer.forward_to(&path).unwrap();

    producer.put(Frame::Text("hi".into())).unwrap();
    let frame = consumer
        .get_async(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(frame, Frame::Text("hi".into()));

    let err = consumer
        .get_async(Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Timeout { .. }));

    forwarder.shutdown(Duration::ZERO);
    pump.shutdown(Duration::ZERO);
}

#[test]
fn test_only_producer_side_is_audited() {
    let dir = TempDir::new().unwrap();
    let store = Store::start_at(dir.path().join("seg"), 1 << 16).unwrap();
    let path = socket_path(dir.path(), "audited");

    let producer: Channel<Frame> =
        Channel::new("audited", "Producer", "Consumer").with_store(store.client());
    let consumer: Channel<Frame> =
        Channel::new("audited", "Producer", "Consumer").with_store(store.client());

    let pump = consumer.receive_from(&path).unwrap();
    let forwarder = producer.forward_to(&path).unwrap();

    producer.put(Frame::Ref(1)).unwrap();
    consumer.get_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(producer.num(), 1);
    assert_eq!(consumer.num(), 0);
    let logged: Frame = store.client().get_value("audited__0").unwrap();
    assert_eq!(logged, Frame::Ref(1));
    assert!(store.get("audited__1").is_err());

    forwarder.shutdown(Duration::ZERO);
    pump.shutdown(Duration::ZERO);
}

#[test]
fn test_pump_ends_when_producer_goes_away() {
    let dir = TempDir::new().unwrap();
    let path = socket_path(dir.path(), "eof");
    let (producer, consumer) = pair("eof");

    let pump = consumer.receive_from(&path).unwrap();
    let forwarder = producer.forward_to(&path).unwrap();
    producer.put(Frame::Ref(1)).unwrap();
    consumer.get_timeout(Duration::from_secs(5)).unwrap();

    producer.close();
    forwarder.shutdown(Duration::from_secs(1));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !pump.is_finished() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(pump.is_finished());
}
