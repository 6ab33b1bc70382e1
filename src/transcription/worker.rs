//! Background transcription task.
//!
//! One worker thread per batch: loads the model if needed, then transcribes
//! the files sequentially, streaming progress through the event bridge. A
//! single file's failure does not abort the batch; cancellation stops at the
//! next segment or file boundary. `AllDone` is emitted exactly once, last, on
//! every path out of the run.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::bridge::{EventTx, WorkerEvent};
use crate::cancel::CancelToken;
use crate::output::{self, OutputFormat};
use crate::transcription::engine::{EngineError, Segment, SegmentSink, SpeechEngine};

/// A configured batch run, ready to be spawned.
pub struct TranscribeWorker<E: SpeechEngine + 'static> {
    engine: Arc<Mutex<E>>,
    files: Vec<PathBuf>,
    language: Option<String>,
    format: OutputFormat,
    events: EventTx<WorkerEvent>,
    cancel: CancelToken,
}

/// Controller-side handle for a running batch.
pub struct WorkerHandle {
    cancel: CancelToken,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Requests cooperative cancellation; the worker stops at the next
    /// segment or file boundary
    pub fn cancel(&self) {
        self.cancel.set();
    }

    /// Whether the worker thread is still alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Waits for the worker thread to finish
    ///
    /// # Errors
    /// Returns the worker thread's panic payload, if it panicked
    pub fn join(self) -> std::thread::Result<()> {
        self.thread.join()
    }
}

enum FileOutcome {
    Done(PathBuf),
    Cancelled,
    Failed(String),
}

impl<E: SpeechEngine + 'static> TranscribeWorker<E> {
    /// Creates a batch run over `files` in order
    #[must_use]
    pub fn new(
        engine: Arc<Mutex<E>>,
        files: Vec<PathBuf>,
        language: Option<String>,
        format: OutputFormat,
        events: EventTx<WorkerEvent>,
    ) -> Self {
        Self {
            engine,
            files,
            language,
            format,
            events,
            cancel: CancelToken::new(),
        }
    }

    /// Token observed by this run. Exposed so a caller can request
    /// cancellation even before the thread is spawned.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Spawns the worker thread and returns its handle
    #[must_use]
    pub fn start(self) -> WorkerHandle {
        let cancel = self.cancel.clone();
        let thread = std::thread::spawn(move || self.run());
        WorkerHandle { cancel, thread }
    }

    fn run(self) {
        self.process_batch();
        self.events.emit(WorkerEvent::AllDone);
    }

    fn process_batch(&self) {
        let mut engine = match self.engine.lock() {
            Ok(guard) => guard,
            Err(e) => {
                self.events.emit(WorkerEvent::FileError {
                    file_index: None,
                    message: format!("engine unavailable: {e}"),
                });
                return;
            }
        };

        if !engine.is_loaded() {
            self.events.emit(WorkerEvent::ModelLoading);
            if let Err(e) = engine.load() {
                tracing::error!("model loading failed: {e}");
                self.events.emit(WorkerEvent::FileError {
                    file_index: None,
                    message: format!("model loading failed: {e}"),
                });
                return;
            }
            self.events.emit(WorkerEvent::ModelLoaded);
        }

        if self.cancel.is_set() {
            tracing::info!("batch cancelled before any file started");
            return;
        }

        for (index, path) in self.files.iter().enumerate() {
            if self.cancel.is_set() {
                tracing::info!(remaining = self.files.len() - index, "batch cancelled");
                break;
            }

            match self.process_file(&mut *engine, index, path) {
                FileOutcome::Done(output_path) => {
                    tracing::info!(
                        file = %path.display(),
                        output = %output_path.display(),
                        "file transcribed"
                    );
                    self.events.emit(WorkerEvent::FileDone {
                        file_index: index,
                        output_path,
                    });
                }
                FileOutcome::Cancelled => {
                    // No terminal event for the in-flight file, none for the rest
                    tracing::info!(file = %path.display(), "cancelled mid-file");
                    break;
                }
                FileOutcome::Failed(message) => {
                    tracing::warn!(file = %path.display(), "file failed: {message}");
                    self.events.emit(WorkerEvent::FileError {
                        file_index: Some(index),
                        message,
                    });
                }
            }
        }
    }

    fn process_file(&self, engine: &mut E, index: usize, path: &Path) -> FileOutcome {
        let output_path = self.format.output_path(path);

        let events = self.events.clone();
        let total = self.files.len();
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        let sink: SegmentSink = Arc::new(move |segment: &Segment, total_duration: f64| {
            let status = format!(
                "[{}/{}] {}  [{} / {}]",
                index + 1,
                total,
                name,
                output::format_clock(segment.end),
                output::format_clock(total_duration)
            );
            events.emit(WorkerEvent::Progress {
                file_index: index,
                segment_end: segment.end,
                total_duration,
                status,
            });
        });

        let transcript =
            match engine.transcribe_file(path, self.language.as_deref(), &self.cancel, sink) {
                Ok(transcript) => transcript,
                Err(EngineError::Cancelled) => return FileOutcome::Cancelled,
                Err(e) => return FileOutcome::Failed(e.to_string()),
            };

        match output::write_transcript(self.format, &transcript.segments, &output_path) {
            Ok(()) => FileOutcome::Done(output_path),
            Err(e) => FileOutcome::Failed(format!("failed to write {}: {e}", output_path.display())),
        }
    }
}
