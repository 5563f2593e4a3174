use std::io::Write;
use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Lines kept for slow `/api/logs` subscribers before they see a lag marker.
const LOG_CHANNEL_CAPACITY: usize = 500;

/// Tees every formatted log line into the broadcast channel behind the SSE
/// log endpoint, and to stdout unless the daemon runs quiet.
#[derive(Clone)]
pub(crate) struct SseMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for SseMakeWriter {
    type Writer = SseWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SseWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct SseWriter {
    sender: broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl Write for SseWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let msg = String::from_utf8_lossy(buf).trim_end().to_string();
        let _ = self.sender.send(msg); // no receivers is fine
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Parses a `[logging] level` value; unknown names fall back to info.
pub(crate) fn parse_level(level: &str) -> Level {
    level.trim().parse().unwrap_or(Level::INFO)
}

/// Installs the global subscriber and hands back the sender the API server
/// streams from.
pub(crate) fn init_logging(level: &str, quiet: bool) -> broadcast::Sender<String> {
    let (log_tx, _) = broadcast::channel::<String>(LOG_CHANNEL_CAPACITY);
    let make_writer = SseMakeWriter {
        sender: log_tx.clone(),
        suppress_stdout: quiet,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_ansi(!quiet)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // already set in tests

    log_tx
}
