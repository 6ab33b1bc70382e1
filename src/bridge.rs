//! Event channel between background tasks and the controller loop.
//!
//! Every notification a task makes crosses threads through one of these
//! bounded channels; the controller consumes events on its own single loop and
//! never touches task-owned state directly. Ordering is per-source FIFO, which
//! the channel itself guarantees. No ordering is promised across independent
//! tasks.

use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

/// Queue depth for task event channels. A full queue applies backpressure to
/// the emitting task rather than dropping events.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Events emitted by a transcription batch run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The engine had no resident model and a load was started
    ModelLoading,
    /// The model finished loading and the per-file loop is about to start
    ModelLoaded,
    /// A segment was produced for the file at `file_index`
    Progress {
        /// 0-based index into the batch file list
        file_index: usize,
        /// End time of the latest segment, seconds
        segment_end: f64,
        /// Total media duration of the file, seconds
        total_duration: f64,
        /// Human-readable status line
        status: String,
    },
    /// A file completed and its transcript was written
    FileDone {
        /// 0-based index into the batch file list
        file_index: usize,
        /// Path the transcript was written to
        output_path: PathBuf,
    },
    /// A file (or, with `file_index: None`, the whole batch) failed
    FileError {
        /// Index of the failed file; `None` for batch-level failures such as
        /// a model load error
        file_index: Option<usize>,
        /// Failure description
        message: String,
    },
    /// Terminal event of the run; emitted exactly once, always last
    AllDone,
}

/// Events emitted by a model download run.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// Periodic progress sample from the directory-size poller
    Progress {
        /// Completed fraction in `[0.0, clamp]`; clamped below 1.0 until
        /// `Done` is emitted
        fraction: f64,
        /// Human-readable status line
        status: String,
    },
    /// The bundle finished downloading into `path`
    Done {
        /// Destination directory holding the complete bundle
        path: PathBuf,
    },
    /// The download failed for a reason other than cancellation
    Error {
        /// Failure description
        message: String,
    },
}

/// Sending half of a task event channel.
///
/// Cloned into the background task; emitting never panics. Once the receiver
/// is gone (controller shut down mid-task) further events are dropped.
#[derive(Debug, Clone)]
pub struct EventTx<T> {
    tx: SyncSender<T>,
}

impl<T> EventTx<T> {
    /// Sends an event to the controller, blocking if the queue is full.
    pub fn emit(&self, event: T) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event dropped: controller receiver disconnected");
        }
    }
}

/// Creates a bounded event channel for one task run.
#[must_use]
pub fn event_channel<T>() -> (EventTx<T>, Receiver<T>) {
    let (tx, rx) = sync_channel(EVENT_QUEUE_DEPTH);
    (EventTx { tx }, rx)
}
