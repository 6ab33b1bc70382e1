use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use whisper_batch::bridge::{DownloadEvent, WorkerEvent};
use whisper_batch::config::Config;
use whisper_batch::controller::{Batch, Controller, FileStatus};
use whisper_batch::output::OutputFormat;
use whisper_batch::telemetry;
use whisper_batch::transcription::WhisperEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    telemetry::init(&config.telemetry)?;
    tracing::info!("whisper-batch starting");

    let files: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if files.is_empty() {
        println!("usage: whisper-batch <file.wav> [more files...]");
        println!("Transcribes each file next to its input, format per ~/.whisper-batch.toml");
        return Ok(());
    }

    let format: OutputFormat = config
        .output
        .format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let language = config.transcription.language_option().map(str::to_owned);

    let engine = WhisperEngine::new(&config.transcription).map_err(anyhow::Error::new)?;
    let mut controller = Controller::new(engine, config.clone());

    // Make sure the model bundle is present before starting the batch
    let model_path = match config.find_model_path() {
        Some(path) => path,
        None => {
            let gb = config.model.expected_size_bytes as f64 / (1024_f64 * 1024.0 * 1024.0);
            println!(
                "Model not found. Downloading {} (~{gb:.1} GB)...",
                config.model.name
            );
            let rx = controller.start_download()?;
            let bundle_dir = run_download(&controller, &rx).await?;
            let primary = config
                .model
                .artifacts
                .first()
                .map_or_else(|| "model.bin".to_owned(), Clone::clone);
            bundle_dir.join(primary)
        }
    };
    controller.set_model_path(model_path)?;

    let rx = controller.start_batch(files.clone(), language, format)?;
    run_batch(&controller, &rx, &files).await
}

/// Consumes download events until the run ends; ctrl-c cancels.
async fn run_download(
    controller: &Controller<WhisperEngine>,
    rx: &Receiver<DownloadEvent>,
) -> Result<PathBuf> {
    let handle_event = |event: DownloadEvent| -> Option<Result<PathBuf>> {
        match event {
            DownloadEvent::Progress { fraction, status } => {
                println!("{status}  ({:.0}%)", fraction * 100.0);
                None
            }
            DownloadEvent::Done { path } => {
                println!("Download complete: {}", path.display());
                Some(Ok(path))
            }
            DownloadEvent::Error { message } => {
                Some(Err(anyhow::anyhow!("download failed: {message}")))
            }
        }
    };

    loop {
        while let Ok(event) = rx.try_recv() {
            if let Some(outcome) = handle_event(event) {
                return outcome;
            }
        }

        if !controller.is_downloading() {
            // Transfer ended; drain any terminal event emitted just before
            // the thread exited. Nothing terminal means it was cancelled.
            while let Ok(event) = rx.recv_timeout(Duration::from_secs(2)) {
                if let Some(outcome) = handle_event(event) {
                    return outcome;
                }
            }
            bail!("download cancelled");
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("cancelling download");
                println!("\nCancelling download...");
                controller.cancel_download();
            }
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

/// Consumes batch events until `AllDone`; ctrl-c cancels.
async fn run_batch(
    controller: &Controller<WhisperEngine>,
    rx: &Receiver<WorkerEvent>,
    files: &[PathBuf],
) -> Result<()> {
    let mut batch = Batch::new(files);

    loop {
        while let Ok(event) = rx.try_recv() {
            batch.apply(&event);
            match &event {
                WorkerEvent::ModelLoading => {
                    println!("Loading model... (first time takes a while)");
                }
                WorkerEvent::ModelLoaded => println!("Model loaded. Starting transcription..."),
                WorkerEvent::Progress { status, .. } => println!("{status}"),
                WorkerEvent::FileDone {
                    file_index,
                    output_path,
                } => {
                    println!("[{}] done -> {}", file_index + 1, output_path.display());
                }
                WorkerEvent::FileError {
                    file_index: Some(index),
                    message,
                } => println!("[{}] error: {message}", index + 1),
                WorkerEvent::FileError {
                    file_index: None,
                    message,
                } => println!("error: {message}"),
                WorkerEvent::AllDone => {
                    let done = batch
                        .jobs()
                        .iter()
                        .filter(|j| j.status == FileStatus::Done)
                        .count();
                    println!("Finished: {done}/{} file(s) transcribed", files.len());
                    return Ok(());
                }
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("cancelling batch");
                println!("\nCancelling...");
                controller.cancel_batch();
            }
            () = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
    }
}
