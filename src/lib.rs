//! Whisper Batch - batch media transcription
//!
//! Core library: cancellable background tasks (model download, multi-file
//! transcription) streaming ordered progress events to a single controller
//! loop.

/// Event channel between tasks and the controller
pub mod bridge;
/// Cooperative cancellation token
pub mod cancel;
/// Configuration management
pub mod config;
/// Engine ownership and task slots
pub mod controller;
/// Transcript output formats
pub mod output;
/// Telemetry and logging
pub mod telemetry;
/// Transcription engine, worker and model download
pub mod transcription;
