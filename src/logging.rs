//! Tracing initialisation with a bounded, non-blocking log queue.
//!
//! Formatted log lines are handed to a writer thread through a bounded
//! channel so slow terminals can never stall the data path. When the queue
//! is full the line is dropped and counted; crossing the configured halt
//! threshold is treated as fatal misconfiguration and exits the process.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender, TrySendError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Shared view of the logger's drop counter.
#[derive(Debug, Clone, Default)]
pub struct LoggerStats {
    dropped: Arc<AtomicU64>,
}

impl LoggerStats {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Queue-backed [`MakeWriter`]. Lines that do not fit are dropped, never
/// awaited.
#[derive(Clone)]
pub struct BoundedLogWriter {
    tx: Sender<Vec<u8>>,
    stats: LoggerStats,
    /// 0 disables the halt.
    halt_threshold: u64,
}

impl BoundedLogWriter {
    /// Create a writer plus the receiving end for the drain thread.
    pub fn new(
        queue_limit: usize,
        halt_threshold: u64,
    ) -> (Self, crossbeam_channel::Receiver<Vec<u8>>) {
        let (tx, rx) = bounded(queue_limit.max(1));
        (
            Self {
                tx,
                stats: LoggerStats::default(),
                halt_threshold,
            },
            rx,
        )
    }

    pub fn stats(&self) -> LoggerStats {
        self.stats.clone()
    }
}

impl Write for BoundedLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.tx.try_send(buf.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if self.halt_threshold > 0 && dropped > self.halt_threshold {
                    // The queue has been saturated for long enough that the
                    // process is effectively unobservable.
                    eprintln!(
                        "logger drop threshold exceeded ({dropped} lines lost), halting"
                    );
                    std::process::exit(1);
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for BoundedLogWriter {
    type Writer = BoundedLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber and spawn the drain thread.
pub fn init(queue_limit: usize, halt_threshold: u64) -> LoggerStats {
    let (writer, rx) = BoundedLogWriter::new(queue_limit, halt_threshold);
    let stats = writer.stats();

    std::thread::Builder::new()
        .name("log-drain".to_string())
        .spawn(move || {
            let stdout = io::stdout();
            for line in rx {
                let mut handle = stdout.lock();
                let _ = handle.write_all(&line);
            }
        })
        .expect("failed to spawn log drain thread");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .init();

    stats
}
