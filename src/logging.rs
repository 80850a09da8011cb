//! Logging setup: a non-blocking rolling file writer layered under the
//! usual stdout `fmt` subscriber, plus a broadcast tap so `/api/logs/stream`
//! can republish new lines as they're written.

use std::path::Path;
use tokio::sync::broadcast;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const BROADCAST_CAPACITY: usize = 1024;

/// Handle kept alive for the process lifetime; dropping it stops the
/// non-blocking file writer's background flush thread.
pub struct LoggingHandle {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
    tap: broadcast::Sender<String>,
}

impl LoggingHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tap.subscribe()
    }

    /// Test-only: a handle backed by no real file, for assembling an
    /// `AppState` in tests without installing a global tracing subscriber.
    #[cfg(test)]
    pub fn test_handle() -> Self {
        let (_non_blocking, guard) = tracing_appender::non_blocking(std::io::sink());
        let (tap, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            _file_guard: guard,
            tap,
        }
    }
}

/// A `MakeWriter` that republishes every write as a line on a broadcast
/// channel in addition to handing the bytes to the wrapped writer. Lines
/// with no active subscriber are simply dropped, same as the writer queue's
/// treatment of a saturated channel elsewhere in this codebase.
#[derive(Clone)]
struct TappedWriter<W> {
    inner: W,
    tap: broadcast::Sender<String>,
}

impl<W: std::io::Write> std::io::Write for TappedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(line) = std::str::from_utf8(buf) {
            let _ = self.tap.send(line.trim_end().to_string());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct TappedMakeWriter<M> {
    inner: M,
    tap: broadcast::Sender<String>,
}

impl<'a, M> MakeWriter<'a> for TappedMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = TappedWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        TappedWriter {
            inner: self.inner.make_writer(),
            tap: self.tap.clone(),
        }
    }
}

/// Initializes the global `tracing` subscriber: stdout plus a daily-rolling
/// file under `log_dir`, both filtered by `log_level` (or `RUST_LOG` if
/// set). Returns a handle whose `subscribe()` feeds the admin log-tail
/// endpoint.
pub fn init(log_dir: &Path, log_level: &str) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "relay-gateway.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (tap, _rx) = broadcast::channel(BROADCAST_CAPACITY);
    let tapped = TappedMakeWriter {
        inner: non_blocking,
        tap: tap.clone(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_writer(tapped).with_ansi(false))
        .try_init()?;

    Ok(LoggingHandle {
        _file_guard: guard,
        tap,
    })
}
