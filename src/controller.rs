//! Task orchestration: one engine, at most one live task of each kind.
//!
//! The controller owns the engine handle and an explicit slot per task type.
//! Starting a task while its slot holds a live one is refused, which is what
//! makes the engine's single-writer assumption hold. All task output arrives
//! through the event receivers returned at start; the controller's consumer
//! applies them to its [`Batch`] job table on its own single loop.

use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::bridge::{event_channel, DownloadEvent, WorkerEvent};
use crate::config::Config;
use crate::output::OutputFormat;
use crate::transcription::download::{DownloadHandle, ModelDownloader};
use crate::transcription::engine::SpeechEngine;
use crate::transcription::worker::{TranscribeWorker, WorkerHandle};

/// Lifecycle state of one file in a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileStatus {
    /// Queued, not yet reached
    Pending,
    /// Segments are being produced
    Processing,
    /// Transcript written; terminal
    Done,
    /// Failed; terminal
    Error,
}

impl FileStatus {
    /// Whether this status admits no further transitions
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// One input file of a batch. The index is stable and unique for the batch's
/// lifetime; every event for this file carries it.
#[derive(Clone, Debug)]
pub struct FileJob {
    /// Input path
    pub path: PathBuf,
    /// 0-based position in the batch
    pub index: usize,
    /// Current lifecycle state
    pub status: FileStatus,
}

/// Controller-side job table for one batch, mutated only by applying consumed
/// worker events. Discarded when a new batch starts.
#[derive(Debug, Default)]
pub struct Batch {
    jobs: Vec<FileJob>,
}

impl Batch {
    /// Creates a job table with every file `Pending`
    #[must_use]
    pub fn new(paths: &[PathBuf]) -> Self {
        Self {
            jobs: paths
                .iter()
                .enumerate()
                .map(|(index, path)| FileJob {
                    path: path.clone(),
                    index,
                    status: FileStatus::Pending,
                })
                .collect(),
        }
    }

    /// Applies one consumed worker event. Status transitions are monotonic;
    /// events arriving for a terminal job are ignored.
    pub fn apply(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::Progress { file_index, .. } => {
                self.advance(*file_index, FileStatus::Processing);
            }
            WorkerEvent::FileDone { file_index, .. } => {
                self.advance(*file_index, FileStatus::Done);
            }
            WorkerEvent::FileError {
                file_index: Some(index),
                ..
            } => {
                self.advance(*index, FileStatus::Error);
            }
            _ => {}
        }
    }

    fn advance(&mut self, index: usize, status: FileStatus) {
        if let Some(job) = self.jobs.get_mut(index) {
            if !job.status.is_terminal() {
                job.status = status;
            }
        }
    }

    /// The jobs in batch order
    #[must_use]
    pub fn jobs(&self) -> &[FileJob] {
        &self.jobs
    }

    /// Looks up a job by its batch index
    #[must_use]
    pub fn job(&self, index: usize) -> Option<&FileJob> {
        self.jobs.get(index)
    }
}

/// Errors from the controller's start/refuse logic
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A transcription batch is already running
    #[error("a transcription batch is already running")]
    TranscriptionBusy,

    /// A model download is already running
    #[error("a model download is already running")]
    DownloadBusy,

    /// The engine mutex was poisoned by a panicked worker
    #[error("engine unavailable: lock poisoned")]
    EnginePoisoned,
}

/// Owns the engine and the two task slots.
pub struct Controller<E: SpeechEngine + 'static> {
    engine: Arc<Mutex<E>>,
    config: Config,
    transcribe_slot: Option<WorkerHandle>,
    download_slot: Option<DownloadHandle>,
}

impl<E: SpeechEngine + 'static> Controller<E> {
    /// Creates a controller owning `engine`
    #[must_use]
    pub fn new(engine: E, config: Config) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            config,
            transcribe_slot: None,
            download_slot: None,
        }
    }

    /// Points the engine at a model file (e.g. after a download completes)
    ///
    /// # Errors
    /// `EnginePoisoned` if a worker panicked while holding the engine
    pub fn set_model_path(&self, path: PathBuf) -> Result<(), ControllerError> {
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| ControllerError::EnginePoisoned)?;
        engine.set_model_path(path);
        Ok(())
    }

    /// Starts a batch over `files`, returning the event receiver for the run
    ///
    /// # Errors
    /// `TranscriptionBusy` while a previous batch is still live
    pub fn start_batch(
        &mut self,
        files: Vec<PathBuf>,
        language: Option<String>,
        format: OutputFormat,
    ) -> Result<Receiver<WorkerEvent>, ControllerError> {
        if self
            .transcribe_slot
            .as_ref()
            .is_some_and(WorkerHandle::is_running)
        {
            return Err(ControllerError::TranscriptionBusy);
        }

        let (tx, rx) = event_channel();
        let worker =
            TranscribeWorker::new(Arc::clone(&self.engine), files, language, format, tx);
        self.transcribe_slot = Some(worker.start());
        Ok(rx)
    }

    /// Requests cancellation of the live batch, if any
    pub fn cancel_batch(&self) {
        if let Some(handle) = &self.transcribe_slot {
            handle.cancel();
        }
    }

    /// Whether a batch is currently live
    #[must_use]
    pub fn is_transcribing(&self) -> bool {
        self.transcribe_slot
            .as_ref()
            .is_some_and(WorkerHandle::is_running)
    }

    /// Starts the model bundle download, returning the event receiver
    ///
    /// # Errors
    /// `DownloadBusy` while a previous download is still live
    pub fn start_download(&mut self) -> Result<Receiver<DownloadEvent>, anyhow::Error> {
        if self
            .download_slot
            .as_ref()
            .is_some_and(DownloadHandle::is_running)
        {
            return Err(ControllerError::DownloadBusy.into());
        }

        let dest_dir = self.config.model_dir()?;
        let (tx, rx) = event_channel();
        let downloader = ModelDownloader::new(
            self.config.model.clone(),
            self.config.download.clone(),
            dest_dir,
            tx,
        );
        self.download_slot = Some(downloader.start());
        Ok(rx)
    }

    /// Requests cancellation of the live download, if any
    pub fn cancel_download(&self) {
        if let Some(handle) = &self.download_slot {
            handle.cancel();
        }
    }

    /// Whether a download transfer is currently live
    #[must_use]
    pub fn is_downloading(&self) -> bool {
        self.download_slot
            .as_ref()
            .is_some_and(DownloadHandle::is_running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::transcription::engine::{EngineError, SegmentSink, Transcript};
    use std::path::Path;
    use std::time::Duration;

    fn progress_event(file_index: usize) -> WorkerEvent {
        WorkerEvent::Progress {
            file_index,
            segment_end: 1.0,
            total_duration: 10.0,
            status: String::new(),
        }
    }

    #[test]
    fn batch_statuses_follow_events() {
        let paths = vec![PathBuf::from("a.wav"), PathBuf::from("b.wav")];
        let mut batch = Batch::new(&paths);
        assert!(batch.jobs().iter().all(|j| j.status == FileStatus::Pending));

        batch.apply(&progress_event(0));
        assert_eq!(batch.job(0).unwrap().status, FileStatus::Processing);
        assert_eq!(batch.job(1).unwrap().status, FileStatus::Pending);

        batch.apply(&WorkerEvent::FileDone {
            file_index: 0,
            output_path: PathBuf::from("a.txt"),
        });
        assert_eq!(batch.job(0).unwrap().status, FileStatus::Done);
    }

    #[test]
    fn terminal_statuses_are_sticky() {
        let mut batch = Batch::new(&[PathBuf::from("a.wav")]);
        batch.apply(&WorkerEvent::FileError {
            file_index: Some(0),
            message: "boom".to_owned(),
        });
        assert_eq!(batch.job(0).unwrap().status, FileStatus::Error);

        // Late progress for a terminal job must not regress it
        batch.apply(&progress_event(0));
        assert_eq!(batch.job(0).unwrap().status, FileStatus::Error);
    }

    #[test]
    fn batch_level_errors_touch_no_job() {
        let mut batch = Batch::new(&[PathBuf::from("a.wav")]);
        batch.apply(&WorkerEvent::FileError {
            file_index: None,
            message: "model loading failed".to_owned(),
        });
        assert_eq!(batch.job(0).unwrap().status, FileStatus::Pending);
    }

    /// Engine whose load blocks long enough to observe slot exclusivity
    struct SlowEngine;

    impl SpeechEngine for SlowEngine {
        fn is_loaded(&self) -> bool {
            false
        }
        fn set_model_path(&mut self, _path: PathBuf) {}
        fn load(&mut self) -> Result<(), EngineError> {
            std::thread::sleep(Duration::from_millis(300));
            Err(EngineError::NotLoaded)
        }
        fn transcribe_file(
            &mut self,
            _path: &Path,
            _language: Option<&str>,
            _cancel: &CancelToken,
            _on_segment: SegmentSink,
        ) -> Result<Transcript, EngineError> {
            Err(EngineError::NotLoaded)
        }
    }

    fn test_config() -> Config {
        toml::from_str(
            r#"[model]
name = "test"
repo_url = "http://127.0.0.1:9"
dir = "/tmp/whisper_batch_controller_test"
expected_size_bytes = 1
artifacts = []

[transcription]
threads = 1
beam_size = 1
language = "auto"

[download]
poll_interval_secs = 1
progress_clamp = 0.99

[output]
format = "txt"

[telemetry]
enabled = false
log_path = ""
"#,
        )
        .unwrap()
    }

    #[test]
    fn second_batch_is_refused_while_first_is_live() {
        let mut controller = Controller::new(SlowEngine, test_config());
        let rx = controller
            .start_batch(vec![PathBuf::from("a.wav")], None, OutputFormat::Txt)
            .unwrap();
        assert!(controller.is_transcribing());

        let second = controller.start_batch(Vec::new(), None, OutputFormat::Txt);
        assert!(matches!(second, Err(ControllerError::TranscriptionBusy)));

        // Drain the first run; the slot is then reusable
        while rx.recv_timeout(Duration::from_secs(5)).is_ok() {}
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while controller.is_transcribing() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(controller
            .start_batch(Vec::new(), None, OutputFormat::Txt)
            .is_ok());
    }

    #[test]
    fn cancel_without_live_task_is_a_no_op() {
        let controller = Controller::new(SlowEngine, test_config());
        controller.cancel_batch();
        controller.cancel_download();
        assert!(!controller.is_transcribing());
        assert!(!controller.is_downloading());
    }
}
