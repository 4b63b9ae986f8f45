//! Store lifecycle owner
//!
//! [`Store`] creates the segment, hands out clients and finally closes it.
//! Exactly one `Store` exists per segment; everything else attaches with
//! [`StoreClient::attach`].

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::posix_fallocate;
use tracing::{error, info, warn};

use crate::client::{ObjectId, Segment, StoreClient};
use crate::layout::{self, SegmentHeader};
use crate::{Result, StoreError};

/// Owner of a shared-memory object segment
#[derive(Debug)]
pub struct Store {
    client: StoreClient,
    path: PathBuf,
    closed: bool,
}

impl Store {
    /// Start a store with `capacity` bytes of payload space at the default
    /// shared-memory location.
    pub fn start(capacity: u64) -> Result<Self> {
        Self::start_at(default_segment_path(), capacity)
    }

    /// Start a store backed by a new segment file at `path`.
    pub fn start_at(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let path = path.as_ref();
        match Self::create(path, capacity) {
            Ok(store) => {
                info!(path = ?path, capacity, "Store started successfully");
                Ok(store)
            }
            Err(e) => {
                error!(path = ?path, capacity, error = %e, "Store failed to start");
                Err(e)
            }
        }
    }

    fn create(path: &Path, capacity: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(StoreError::allocation("capacity must be non-zero"));
        }

        let header = SegmentHeader::new(layout::slot_count_for(capacity), capacity);
        let len = header.segment_len();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| StoreError::allocation(format!("cannot create {path:?}: {e}")))?;

        if let Err(e) = reserve(&file, len) {
            drop(file);
            let _ = std::fs::remove_file(path);
            return Err(StoreError::allocation(format!(
                "cannot reserve {len} bytes: {e}"
            )));
        }
        drop(file);

        let segment = match Segment::format(path, header) {
            Ok(segment) => segment,
            Err(e) => {
                let _ = std::fs::remove_file(path);
                return Err(e);
            }
        };

        Ok(Self {
            client: StoreClient::from_segment(segment, "store"),
            path: path.to_path_buf(),
            closed: false,
        })
    }

    /// A new client sharing this store's mapping.
    pub fn client(&self) -> StoreClient {
        self.client.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn put(&self, payload: &[u8], label: &str) -> Result<ObjectId> {
        self.client.put(payload, label)
    }

    pub fn get(&self, label: &str) -> Result<Vec<u8>> {
        self.client.get(label)
    }

    pub fn get_id(&self, id: ObjectId) -> Result<Vec<u8>> {
        self.client.get_id(id)
    }

    /// Mark the segment closed for every attached client and unlink it.
    ///
    /// Memory is returned to the system once the last process unmaps.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        self.client.segment().mark_closed();
        self.closed = true;

        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = ?self.path, "Store segment already removed");
            }
            Err(e) => return Err(e.into()),
        }

        info!(path = ?self.path, "Store closed successfully");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!(error = %e, "Failed to close store on drop");
            }
        }
    }
}

/// Segment file under `/dev/shm` when available, the temp dir otherwise.
pub fn default_segment_path() -> PathBuf {
    let shm = Path::new("/dev/shm");
    let dir = if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    };
    dir.join(format!("nexus-store-{}", uuid::Uuid::new_v4().simple()))
}

/// Back the whole file with real blocks so exhaustion shows up here rather
/// than as SIGBUS on first touch.
fn reserve(file: &File, len: u64) -> std::io::Result<()> {
    let len = nix::libc::off_t::try_from(len)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "segment too large"))?;
    posix_fallocate(file.as_raw_fd(), 0, len).map_err(std::io::Error::from)
}
