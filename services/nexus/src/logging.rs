//! Logging setup
//!
//! Every process logs through `tracing`. The supervisor can additionally
//! publish each formatted event to the remote logging socket through a
//! [`LogPublisher`], and mirror everything to a log file.

use std::io::{self, Write};
use std::path::Path;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const PUBLISH_BACKLOG: usize = 1024;

/// Fans formatted log lines out to logging socket subscribers
#[derive(Clone)]
pub struct LogPublisher {
    tx: broadcast::Sender<String>,
}

impl Default for LogPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl LogPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(PUBLISH_BACKLOG);
        Self { tx }
    }

    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl<'a> MakeWriter<'a> for LogPublisher {
    type Writer = PublishWriter;

    fn make_writer(&'a self) -> Self::Writer {
        PublishWriter {
            tx: self.tx.clone(),
            buf: Vec::with_capacity(256),
        }
    }
}

/// Buffers one event and publishes it on drop.
pub struct PublishWriter {
    tx: broadcast::Sender<String>,
    buf: Vec<u8>,
}

impl Write for PublishWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PublishWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf).trim_end().to_string();
        // No subscribers is not an error.
        let _ = self.tx.send(line);
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber: stderr, plus an optional log file and an
/// optional publisher. `RUST_LOG` takes precedence over `level`.
///
/// The log file is written from a background thread; keep the returned guard
/// alive until exit so buffered lines are flushed.
pub fn init_logging(
    level: &str,
    log_file: Option<&Path>,
    publisher: Option<LogPublisher>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let mut layers = Vec::new();

    layers.push(
        fmt::layer()
            .with_writer(io::stderr)
            .with_filter(filter(level))
            .boxed(),
    );

    let mut guard = None;
    if let Some(path) = log_file {
        let (writer, file_guard) = tracing_appender::non_blocking(file_appender(path)?);
        guard = Some(file_guard);
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter(level))
                .boxed(),
        );
    }

    if let Some(publisher) = publisher {
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(publisher)
                .with_filter(filter(level))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(guard)
}

/// Append-only appender for `path`.
fn file_appender(path: &Path) -> anyhow::Result<RollingFileAppender> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid log file name {path:?}"))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
        .with_context(|| format!("cannot open log file {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_publishes_one_line_per_event() {
        let publisher = LogPublisher::new();
        let mut rx = publisher.subscribe();

        {
            let mut writer = publisher.make_writer();
            write!(writer, "INFO nexus: ").unwrap();
            writeln!(writer, "Pipeline running").unwrap();
        }
        {
            // Nothing written, nothing published.
            let _writer = publisher.make_writer();
        }

        assert_eq!(rx.try_recv().unwrap(), "INFO nexus: Pipeline running");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_file_appender_writes_to_named_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nexus.log");

        let mut appender = file_appender(&path).unwrap();
        appender.write_all(b"Pipeline running\n").unwrap();
        appender.flush().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "Pipeline running\n");
    }

    #[test]
    fn test_file_appender_rejects_directory_path() {
        assert!(file_appender(Path::new("/")).is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = LogPublisher::new();
        let mut writer = publisher.make_writer();
        writer.write_all(b"dropped").unwrap();
        drop(writer);
    }
}
