/// Model bundle download task
pub mod download;
/// Speech engine boundary and whisper implementation
pub mod engine;
/// Batch transcription task
pub mod worker;

pub use engine::{EngineError, Segment, SpeechEngine, Transcript, WhisperEngine};
pub use worker::{TranscribeWorker, WorkerHandle};
