//! Broadcast + history log of environment output.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// History size limit (4 MB of message text).
const HISTORY_BYTES: usize = 4 * 1024 * 1024;

/// Stream an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One logged output message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub source: OutputSource,
    pub message: String,
}

struct Inner {
    history: VecDeque<OutputEntry>,
    total_bytes: usize,
}

/// Output log with live listeners and bounded history.
///
/// A listener attached late gets the history first and then live
/// entries, so nothing logged before it subscribed is lost.
pub struct OutputLog {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<OutputEntry>,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OutputLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLog")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl OutputLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
        }
    }

    /// Append a message tagged with its source.
    pub fn log(&self, message: impl Into<String>, source: OutputSource) {
        let entry = OutputEntry {
            source,
            message: message.into(),
        };
        let _ = self.sender.send(entry.clone());
        let bytes = entry.message.len();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.message.len());
            } else {
                break;
            }
        }
        inner.history.push_back(entry);
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Number of entries currently held in history.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all history. Live listeners stay attached.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.history.clear();
        inner.total_bytes = 0;
    }

    /// Receiver for live entries only.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<OutputEntry> {
        self.sender.subscribe()
    }

    /// Snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<OutputEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live entries.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, OutputEntry> {
        let (history, rx) = (self.history(), self.get_receiver());
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });
        futures::stream::iter(history).chain(live).boxed()
    }

    /// Like [`history_plus_stream`](Self::history_plus_stream), one source only.
    #[must_use]
    pub fn source_stream(
        &self,
        source: OutputSource,
    ) -> futures::stream::BoxStream<'static, String> {
        self.history_plus_stream()
            .filter_map(move |entry| async move {
                (entry.source == source).then_some(entry.message)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_order_and_source() {
        let log = OutputLog::new();
        log.log("one", OutputSource::Stdout);
        log.log("two", OutputSource::Stderr);

        let history = log.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].source, OutputSource::Stdout);
        assert_eq!(history[1].message, "two");
    }

    #[test]
    fn test_clear_empties_history() {
        let log = OutputLog::new();
        log.log("x", OutputSource::Stdout);
        log.clear();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_stream_replays_history_then_live() {
        let log = OutputLog::new();
        log.log("early", OutputSource::Stdout);
        let mut stream = log.source_stream(OutputSource::Stdout);
        log.log("ignored", OutputSource::Stderr);
        log.log("late", OutputSource::Stdout);

        assert_eq!(stream.next().await.as_deref(), Some("early"));
        assert_eq!(stream.next().await.as_deref(), Some("late"));
    }
}
