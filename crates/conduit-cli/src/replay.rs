//! Event source and logging watcher for the replay daemon.

use conduit_middleware::{EventSender, decode_line};
use conduit_runtime::{GlobalView, Watcher, WatcherContext};
use conduit_types::{ActivationError, ConduitError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Logs every callback of one `[[watch]]` entry.
pub struct LogWatcher {
    name: String,
}

impl LogWatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Watcher for LogWatcher {
    fn on_added(&mut self, _cx: &mut WatcherContext, global: &GlobalView<'_>) {
        info!(
            watch = %self.name,
            id = global.id(),
            kind = %global.kind(),
            permissions = %global.permissions().to_rwxm(),
            "object added"
        );
    }

    fn on_removed(&mut self, _cx: &mut WatcherContext, id: u32) {
        info!(watch = %self.name, id, "object removed");
    }

    fn on_updated(&mut self, _cx: &mut WatcherContext, global: &GlobalView<'_>) {
        info!(watch = %self.name, id = global.id(), "object updated");
    }

    fn on_ready(&mut self, _cx: &mut WatcherContext, id: u32, result: Result<&GlobalView<'_>, ActivationError>) {
        match result {
            Ok(global) => info!(watch = %self.name, id, features = ?global.features(), "object ready"),
            Err(e) => warn!(watch = %self.name, id, error = %e, "activation failed"),
        }
    }
}

/// Send every event read from `reader`, one JSON document per line.
///
/// Malformed lines are logged and skipped. Returns how many events were
/// sent; stops early if the queue is closed.
pub async fn feed<R>(reader: R, tx: EventSender) -> Result<usize, ConduitError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut sent = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ConduitError::Transport(format!("failed to read events: {e}")))?
    {
        line_no += 1;
        let event = match decode_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping event line");
                continue;
            }
        };
        if tx.send(event).await.is_err() {
            warn!(line = line_no, "event queue closed, stopping replay");
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

/// Feed from the file at `path`, or from stdin when `None`.
pub async fn feed_source(path: Option<String>, tx: EventSender) -> Result<usize, ConduitError> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| ConduitError::Transport(format!("failed to open {path}: {e}")))?;
            info!(source = %path, "replaying events");
            feed(BufReader::new(file), tx).await
        }
        None => {
            info!(source = "stdin", "replaying events");
            feed(BufReader::new(tokio::io::stdin()), tx).await
        }
    }
}
