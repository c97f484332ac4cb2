//! Download lifecycle events for a single install attempt.
//!
//! The producer side is typestated: [`DownloadEventSender::started`]
//! consumes the sender and returns a [`ProgressSender`], and
//! [`ProgressSender::finished`] consumes that. `started` therefore happens
//! exactly once before any progress, and nothing can follow `finished`.
//! An attempt that aborts simply drops its sender; the consumer sees the
//! stream end without `finished` and must take the outcome from the
//! installer's result.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Identifies one install attempt. Each attempt opens a fresh channel.
pub type AttemptId = u64;

/// Wire name of the event channel used by host integrations.
pub const INSTALL_EVENT_CHANNEL: &str = "install_update";

/// One step in the download lifecycle.
///
/// Serializes as `{"event": "started", "data": {"contentLength": 1000}}`,
/// `{"event": "progress", "data": {"chunkLength": 200}}` or
/// `{"event": "finished"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum DownloadEvent {
    /// Emitted once, before any bytes are transferred.
    #[serde(rename_all = "camelCase")]
    Started { content_length: Option<u64> },
    /// Incremental byte count for one chunk (never cumulative).
    #[serde(rename_all = "camelCase")]
    Progress { chunk_length: u64 },
    /// Emitted once, after the payload is fully written and verified.
    Finished,
}

/// A download event stamped with the attempt that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttemptEvent {
    pub attempt: AttemptId,
    pub event: DownloadEvent,
}

/// Open the event channel for one attempt.
#[must_use]
pub fn download_channel(attempt: AttemptId) -> (DownloadEventSender, DownloadEventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        DownloadEventSender {
            inner: Emitter { attempt, tx },
        },
        DownloadEventReceiver {
            attempt,
            rx,
            finished: false,
        },
    )
}

struct Emitter {
    attempt: AttemptId,
    tx: mpsc::UnboundedSender<AttemptEvent>,
}

impl Emitter {
    fn emit(&self, event: DownloadEvent) {
        let stamped = AttemptEvent {
            attempt: self.attempt,
            event,
        };
        // A consumer that went away must not fail the download.
        if self.tx.send(stamped).is_err() {
            debug!(attempt = self.attempt, ?event, "download event dropped; no consumer");
        }
    }
}

/// Producer half before the download has started.
pub struct DownloadEventSender {
    inner: Emitter,
}

impl DownloadEventSender {
    #[must_use]
    pub fn attempt(&self) -> AttemptId {
        self.inner.attempt
    }

    /// Announce the transfer. Must precede any progress.
    #[must_use]
    pub fn started(self, content_length: Option<u64>) -> ProgressSender {
        self.inner.emit(DownloadEvent::Started { content_length });
        ProgressSender {
            inner: self.inner,
            transferred: 0,
        }
    }
}

/// Producer half while bytes are flowing.
pub struct ProgressSender {
    inner: Emitter,
    transferred: u64,
}

impl ProgressSender {
    #[must_use]
    pub fn attempt(&self) -> AttemptId {
        self.inner.attempt
    }

    /// Report one chunk. Empty chunks are not reported.
    pub fn progress(&mut self, chunk_length: u64) {
        if chunk_length == 0 {
            return;
        }
        self.transferred = self.transferred.saturating_add(chunk_length);
        self.inner.emit(DownloadEvent::Progress { chunk_length });
    }

    /// Sum of all reported chunks.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Close the stream after a fully written and verified payload.
    pub fn finished(self) {
        self.inner.emit(DownloadEvent::Finished);
    }
}

/// Consumer half for one attempt.
pub struct DownloadEventReceiver {
    attempt: AttemptId,
    rx: mpsc::UnboundedReceiver<AttemptEvent>,
    finished: bool,
}

impl DownloadEventReceiver {
    #[must_use]
    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    /// Next event in emission order.
    ///
    /// Returns `None` once `finished` has been delivered or the producer
    /// has gone away.
    pub async fn recv(&mut self) -> Option<DownloadEvent> {
        if self.finished {
            return None;
        }
        let stamped = self.rx.recv().await?;
        if stamped.event == DownloadEvent::Finished {
            self.finished = true;
            self.rx.close();
        }
        Some(stamped.event)
    }
}
