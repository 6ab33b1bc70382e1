use anyhow::anyhow;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use whisper_rs::{
    FullParams, SamplingStrategy, SegmentCallbackData, WhisperContext, WhisperContextParameters,
};

use crate::cancel::CancelToken;
use crate::config::TranscriptionConfig;

/// A timestamped span of recognized text. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    /// Start time in seconds, >= 0
    pub start: f64,
    /// End time in seconds, >= start
    pub end: f64,
    /// Recognized text
    pub text: String,
}

/// Result of transcribing one file.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    /// Segments in increasing time order
    pub segments: Vec<Segment>,
    /// Total media duration in seconds
    pub duration: f64,
}

/// Callback invoked for each segment as it is produced, together with the
/// file's total duration. Owned so the engine can hand it to inference-layer
/// callbacks that require `'static`.
pub type SegmentSink = Arc<dyn Fn(&Segment, f64) + Send + Sync>;

/// Errors that can occur at the engine boundary
#[derive(Debug, Error)]
pub enum EngineError {
    /// Failed to load the whisper model
    #[error("failed to load whisper model from {path}: {source}")]
    ModelLoad {
        /// Path to model file (or "<unset>" when no path was configured)
        path: String,
        /// Underlying error
        source: anyhow::Error,
    },

    /// `transcribe_file` was called before a successful `load`
    #[error("model not loaded; call load() first")]
    NotLoaded,

    /// Transcription was aborted by a cancellation request
    #[error("transcription cancelled")]
    Cancelled,

    /// Failed to decode the input audio
    #[error("failed to decode audio from {path}: {source}")]
    Audio {
        /// Input file path
        path: String,
        /// Underlying error
        source: anyhow::Error,
    },

    /// Inference failed
    #[error("transcription failed")]
    Transcription(#[from] anyhow::Error),
}

/// Speech recognition boundary consumed by the transcription worker.
///
/// Exactly one task may drive an engine at a time; the controller enforces
/// this by handing the engine to at most one live worker. `mockall` provides
/// `MockSpeechEngine` for tests.
#[cfg_attr(test, mockall::automock)]
pub trait SpeechEngine: Send {
    /// Whether a model is resident and ready for `transcribe_file`
    fn is_loaded(&self) -> bool;

    /// Points the engine at a model file. Invalidates any loaded model; the
    /// next `load` (or `transcribe_file`, which will fail `NotLoaded` until
    /// then) must reload.
    fn set_model_path(&mut self, path: PathBuf);

    /// Loads the model. Blocking, typically several seconds.
    ///
    /// # Errors
    /// `ModelLoad` when the path is unset or the artifact is missing/corrupt
    fn load(&mut self) -> Result<(), EngineError>;

    /// Transcribes one file, streaming segments through `on_segment` as they
    /// are produced. `cancel` is checked between segments; an observed
    /// cancellation aborts with `Cancelled` without corrupting engine state
    /// for subsequent calls. `language` of `None` means auto-detect.
    ///
    /// # Errors
    /// `NotLoaded` before a successful `load`; `Cancelled` on cooperative
    /// abort; `Audio`/`Transcription` otherwise
    fn transcribe_file<'a>(
        &mut self,
        path: &Path,
        language: Option<&'a str>,
        cancel: &CancelToken,
        on_segment: SegmentSink,
    ) -> Result<Transcript, EngineError>;
}

/// Whisper implementation of [`SpeechEngine`] over `whisper-rs`.
pub struct WhisperEngine {
    model_path: Option<PathBuf>,
    ctx: Option<WhisperContext>,
    /// Number of CPU threads for inference
    threads: i32,
    /// Beam search width
    beam_size: i32,
}

impl WhisperEngine {
    /// Creates an engine with no model loaded.
    ///
    /// # Errors
    /// Returns error if `threads` or `beam_size` are zero or exceed `i32::MAX`
    pub fn new(config: &TranscriptionConfig) -> Result<Self, EngineError> {
        if config.threads == 0 {
            return Err(EngineError::Transcription(anyhow!("threads must be > 0")));
        }
        if config.beam_size == 0 {
            return Err(EngineError::Transcription(anyhow!("beam_size must be > 0")));
        }

        let threads = i32::try_from(config.threads).map_err(|_| {
            EngineError::Transcription(anyhow!("threads value too large (max: {})", i32::MAX))
        })?;
        let beam_size = i32::try_from(config.beam_size).map_err(|_| {
            EngineError::Transcription(anyhow!("beam_size value too large (max: {})", i32::MAX))
        })?;

        Ok(Self {
            model_path: None,
            ctx: None,
            threads,
            beam_size,
        })
    }

    /// Determines sampling strategy based on beam size (pure, testable)
    const fn sampling_strategy(beam_size: i32) -> SamplingStrategy {
        if beam_size > 1 {
            SamplingStrategy::BeamSearch {
                beam_size,
                patience: -1.0,
            }
        } else {
            SamplingStrategy::Greedy { best_of: 1 }
        }
    }

}

impl SpeechEngine for WhisperEngine {
    fn is_loaded(&self) -> bool {
        self.ctx.is_some()
    }

    fn set_model_path(&mut self, path: PathBuf) {
        if self.ctx.take().is_some() {
            tracing::info!(
                path = %path.display(),
                "model path changed, loaded model invalidated"
            );
        }
        self.model_path = Some(path);
    }

    fn load(&mut self) -> Result<(), EngineError> {
        let path = self
            .model_path
            .clone()
            .ok_or_else(|| EngineError::ModelLoad {
                path: "<unset>".to_owned(),
                source: anyhow!("no model path configured"),
            })?;

        tracing::info!(
            path = %path.display(),
            threads = self.threads,
            beam_size = self.beam_size,
            "loading whisper model"
        );

        let path_str = path.to_str().ok_or_else(|| EngineError::ModelLoad {
            path: path.display().to_string(),
            source: anyhow!("model path contains invalid UTF-8"),
        })?;

        let params = WhisperContextParameters::default();
        let ctx = WhisperContext::new_with_params(path_str, params).map_err(|e| {
            EngineError::ModelLoad {
                path: path.display().to_string(),
                source: anyhow!("{e:?}"),
            }
        })?;

        tracing::info!("whisper model loaded successfully");

        self.ctx = Some(ctx);
        Ok(())
    }

    fn transcribe_file(
        &mut self,
        path: &Path,
        language: Option<&str>,
        cancel: &CancelToken,
        on_segment: SegmentSink,
    ) -> Result<Transcript, EngineError> {
        let ctx = self.ctx.as_ref().ok_or(EngineError::NotLoaded)?;

        let _span = tracing::debug_span!("transcription", path = %path.display()).entered();

        let (samples, duration) = read_wav_mono(path)?;
        tracing::debug!(samples = samples.len(), duration, "audio decoded");

        let mut state = ctx
            .create_state()
            .map_err(|e| EngineError::Transcription(anyhow!("failed to create state: {e:?}")))?;

        let strategy = Self::sampling_strategy(self.beam_size);
        let mut params = FullParams::new(strategy);
        params.set_n_threads(self.threads);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_language(language); // None = auto-detect
        params.set_translate(false);

        // Segments stream out through the new-segment callback as inference
        // advances; a copy is kept for the formatter.
        let collected: Arc<Mutex<Vec<Segment>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let collected = Arc::clone(&collected);
            params.set_segment_callback_safe(move |data: SegmentCallbackData| {
                let segment = Segment {
                    start: data.start_timestamp as f64 / 100.0,
                    end: data.end_timestamp as f64 / 100.0,
                    text: data.text,
                };
                on_segment(&segment, duration);
                if let Ok(mut segments) = collected.lock() {
                    segments.push(segment);
                }
            });
        }
        {
            let cancel = cancel.clone();
            params.set_abort_callback_safe(move || cancel.is_set());
        }

        let start = std::time::Instant::now();
        if let Err(e) = state.full(params, &samples) {
            if cancel.is_set() {
                tracing::info!(path = %path.display(), "transcription aborted by cancellation");
                return Err(EngineError::Cancelled);
            }
            return Err(EngineError::Transcription(anyhow!(
                "whisper inference failed: {e:?}"
            )));
        }
        let inference_duration = start.elapsed();

        let segments = collected
            .lock()
            .map_err(|e| EngineError::Transcription(anyhow!("mutex poisoned: {e}")))?
            .clone();

        tracing::info!(
            segments = segments.len(),
            inference_ms = inference_duration.as_millis(),
            "transcription completed"
        );

        Ok(Transcript { segments, duration })
    }
}

// SAFETY: WhisperEngine is only ever driven by one thread at a time: the
// controller hands it to at most one live worker behind a Mutex, and
// WhisperState instances are created per call and never escape it.
#[allow(unsafe_code)]
unsafe impl Send for WhisperEngine {}

/// Decodes a 16 kHz WAV file to mono f32 samples plus its duration in seconds
fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, f64), EngineError> {
    let audio_err = |source: anyhow::Error| EngineError::Audio {
        path: path.display().to_string(),
        source,
    };

    let mut reader =
        hound::WavReader::open(path).map_err(|e| audio_err(anyhow!("open failed: {e}")))?;
    let spec = reader.spec();

    if spec.sample_rate != 16_000 {
        return Err(audio_err(anyhow!(
            "expected 16 kHz input, got {} Hz",
            spec.sample_rate
        )));
    }

    let channels = usize::from(spec.channels.max(1));
    let duration = f64::from(reader.duration()) / f64::from(spec.sample_rate);

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| audio_err(anyhow!("sample read failed: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = f32::from(i16::MAX);
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| audio_err(anyhow!("sample read failed: {e}")))?
        }
    };

    if channels == 1 {
        return Ok((interleaved, duration));
    }

    // Downmix by averaging channels
    let mono: Vec<f32> = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, duration))
}
