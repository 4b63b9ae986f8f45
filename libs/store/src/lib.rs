//! # Nexus Object Store
//!
//! Shared-memory key/value segment that lets pipeline actors exchange large
//! payloads (frames, matrices) by reference. A payload is copied into the
//! segment once with [`StoreClient::put`]; only the returned [`ObjectId`]
//! travels over channels, and any process attached to the segment can copy it
//! back out with [`StoreClient::get_id`] or by label with [`StoreClient::get`].
//!
//! ## Lifetime
//!
//! Objects are reference counted. `put` starts the count at one,
//! [`StoreClient::retain`] and [`StoreClient::release`] adjust it and the
//! object is freed when it reaches zero. There is no other collection: a
//! store that runs out of slots or contiguous space rejects further puts with
//! [`StoreError::Full`] until something is released. Everything is reclaimed
//! when the owning [`Store`] is closed.
//!
//! ## Synchronisation
//!
//! The segment is the only resource shared by all actor processes. A spin lock
//! word inside the segment guards the slot table and data region, so every
//! operation is atomic across processes without any outside coordination.

pub mod client;
pub mod error;
pub mod layout;
pub mod store;

pub use client::{ObjectId, StoreClient, StoreStats};
pub use error::{Result, StoreError};
pub use store::{default_segment_path, Store};

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn start(dir: &TempDir, capacity: u64) -> Store {
        Store::start_at(dir.path().join("segment"), capacity).unwrap()
    }

    #[test]
    #[traced_test]
    fn test_start_and_close_are_logged() {
        let dir = TempDir::new().unwrap();
        let mut store = start(&dir, 4096);
        assert!(logs_contain("Store started successfully"));

        store.close().unwrap();
        assert!(logs_contain("Store closed successfully"));
        assert!(!dir.path().join("segment").exists());
    }

    #[test]
    fn test_put_get_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let mut store = start(&dir, 4096);
        let client = store.client();
        let id = store.put(b"frame", "frame").unwrap();

        store.close().unwrap();

        assert!(matches!(store.put(b"x", "x"), Err(StoreError::Closed)));
        assert!(matches!(store.get("frame"), Err(StoreError::Closed)));
        assert!(matches!(client.get_id(id), Err(StoreError::Closed)));
        assert!(matches!(client.put(b"x", "x"), Err(StoreError::Closed)));
    }

    #[test]
    #[traced_test]
    fn test_allocation_failure() {
        let dir = TempDir::new().unwrap();
        let err = Store::start_at(dir.path().join("zero"), 0).unwrap_err();
        assert!(matches!(err, StoreError::Allocation { .. }));
        assert!(logs_contain("Store failed to start"));

        let err = Store::start_at(dir.path().join("huge"), 1 << 60).unwrap_err();
        assert!(matches!(err, StoreError::Allocation { .. }));
        assert!(!dir.path().join("huge").exists());
    }

    #[test]
    fn test_put_returns_fresh_ids_without_dedup() {
        let dir = TempDir::new().unwrap();
        let store = start(&dir, 4096);

        let a = store.put(b"same", "a").unwrap();
        let b = store.put(b"same", "a").unwrap();
        assert_ne!(a, b);

        let stats = store.client().stats().unwrap();
        assert_eq!(stats.live_objects, 2);
    }

    #[test]
    fn test_get_by_label_and_id() {
        let dir = TempDir::new().unwrap();
        let store = start(&dir, 4096);

        let first = store.put(b"one", "key").unwrap();
        store.put(b"two", "key").unwrap();

        assert_eq!(store.get("key").unwrap(), b"two");
        assert_eq!(store.get_id(first).unwrap(), b"one");
        assert_eq!(store.client().label_of(first).unwrap(), "key");
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = start(&dir, 4096);

        assert!(matches!(store.get("nope"), Err(StoreError::NotFound { .. })));
        assert!(matches!(
            store.get_id(ObjectId::new(42)),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_full_store_rejects_then_recovers_after_release() {
        let dir = TempDir::new().unwrap();
        let store = start(&dir, 1024);
        let client = store.client();

        let big = vec![7u8; 600];
        let id = client.put(&big, "big").unwrap();

        let err = client.put(&big, "big2").unwrap_err();
        assert!(matches!(err, StoreError::Full { .. }));
        assert!(err.is_recoverable());

        assert_eq!(client.release(id).unwrap(), 0);
        assert!(matches!(client.get_id(id), Err(StoreError::NotFound { .. })));

        let again = client.put(&big, "big2").unwrap();
        assert_ne!(again, id);
        assert_eq!(client.get("big2").unwrap(), big);
    }

    #[test]
    fn test_refcount_keeps_object_alive() {
        let dir = TempDir::new().unwrap();
        let store = start(&dir, 4096);
        let client = store.client();

        let id = client.put(b"shared", "shared").unwrap();
        assert_eq!(client.retain(id).unwrap(), 2);
        assert_eq!(client.release(id).unwrap(), 1);
        assert_eq!(client.get_id(id).unwrap(), b"shared");
        assert_eq!(client.release(id).unwrap(), 0);

        let stats = client.stats().unwrap();
        assert_eq!(stats.live_objects, 0);
        assert_eq!(stats.used, 0);
    }

    #[test]
    fn test_attached_client_sees_objects() {
        let dir = TempDir::new().unwrap();
        let store = start(&dir, 4096);

        let other = StoreClient::attach(store.path(), "other").unwrap();
        let id = other.put_value(&vec![1.5f64, 2.5], "frame").unwrap();

        let frame: Vec<f64> = store.client().get_value_id(id).unwrap();
        assert_eq!(frame, vec![1.5, 2.5]);
        let by_label: Vec<f64> = store.client().get_value("frame").unwrap();
        assert_eq!(by_label, frame);
    }

    #[test]
    fn test_concurrent_puts_from_threads() {
        let dir = TempDir::new().unwrap();
        let store = start(&dir, 1 << 20);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let client = StoreClient::attach(store.path(), "worker").unwrap();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| client.put_value(&(t, i), &format!("t{t}-{i}")).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<ObjectId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 400);

        let value: (i32, i32) = store.client().get_value("t3-99").unwrap();
        assert_eq!(value, (3, 99));
    }

    #[test]
    fn test_attach_to_missing_segment_fails() {
        let dir = TempDir::new().unwrap();
        let err = StoreClient::attach(dir.path().join("missing"), "x").unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
