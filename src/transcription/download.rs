//! Background model bundle download with directory-size progress polling.
//!
//! The transfer primitive has no incremental progress callback, so a second
//! thread samples the destination directory's cumulative size once per poll
//! interval and reports an approximate fraction, clamped below 1.0 until the
//! transfer itself completes. Cancellation is cooperative: the transfer
//! checks the token between chunks, and a cancelled run deletes the partial
//! bundle directory.

use anyhow::{Context, Result};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use crate::bridge::{DownloadEvent, EventTx};
use crate::cancel::CancelToken;
use crate::config::{DownloadConfig, ModelConfig};

const CHUNK_SIZE: usize = 64 * 1024;
const BYTES_PER_GB: f64 = (1024_u64 * 1024 * 1024) as f64;

/// A configured model download, ready to be spawned.
pub struct ModelDownloader {
    model: ModelConfig,
    download: DownloadConfig,
    dest_dir: PathBuf,
    events: EventTx<DownloadEvent>,
    cancel: CancelToken,
}

/// Controller-side handle for a running download.
pub struct DownloadHandle {
    cancel: CancelToken,
    transfer: JoinHandle<()>,
    poller: JoinHandle<()>,
}

impl DownloadHandle {
    /// Requests cancellation; the partial bundle directory will be deleted
    pub fn cancel(&self) {
        self.cancel.set();
    }

    /// Liveness of the transfer thread (the poller is not considered)
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.transfer.is_finished()
    }

    /// Waits for both threads to finish
    ///
    /// # Errors
    /// Returns a thread's panic payload, if one panicked
    pub fn join(self) -> std::thread::Result<()> {
        self.transfer.join()?;
        self.poller.join()
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("download cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ModelDownloader {
    /// Creates a download of the configured bundle into `dest_dir`
    #[must_use]
    pub fn new(
        model: ModelConfig,
        download: DownloadConfig,
        dest_dir: PathBuf,
        events: EventTx<DownloadEvent>,
    ) -> Self {
        Self {
            model,
            download,
            dest_dir,
            events,
            cancel: CancelToken::new(),
        }
    }

    /// Spawns the transfer and poller threads and returns their handle
    #[must_use]
    pub fn start(self) -> DownloadHandle {
        let cancel = self.cancel.clone();
        let transfer_finished = Arc::new(AtomicBool::new(false));

        let poller = {
            let dest_dir = self.dest_dir.clone();
            let expected = self.model.expected_size_bytes;
            let clamp = self.download.progress_clamp;
            let interval = Duration::from_secs(self.download.poll_interval_secs.max(1));
            let events = self.events.clone();
            let cancel = self.cancel.clone();
            let transfer_finished = Arc::clone(&transfer_finished);
            std::thread::spawn(move || {
                poll_progress(
                    &dest_dir,
                    expected,
                    clamp,
                    interval,
                    &events,
                    &cancel,
                    &transfer_finished,
                );
            })
        };

        let transfer = std::thread::spawn(move || {
            self.transfer();
            transfer_finished.store(true, Ordering::SeqCst);
        });

        DownloadHandle {
            cancel,
            transfer,
            poller,
        }
    }

    /// Runs the blocking transfer. Exactly one of three outcomes occurs:
    /// `Done` emitted, cancelled with the partial directory cleaned up, or
    /// `Error` emitted.
    fn transfer(&self) {
        match fetch_bundle(&self.model, &self.dest_dir, &self.cancel) {
            Ok(()) => {
                if self.cancel.is_set() {
                    cleanup(&self.dest_dir);
                    return;
                }
                tracing::info!(path = %self.dest_dir.display(), "model bundle downloaded");
                self.events.emit(DownloadEvent::Done {
                    path: self.dest_dir.clone(),
                });
            }
            Err(FetchError::Cancelled) => {
                tracing::info!("download cancelled, removing partial bundle");
                cleanup(&self.dest_dir);
            }
            Err(FetchError::Other(e)) => {
                if self.cancel.is_set() {
                    cleanup(&self.dest_dir);
                    return;
                }
                tracing::error!("download failed: {e:#}");
                self.events.emit(DownloadEvent::Error {
                    message: format!("{e:#}"),
                });
            }
        }
    }
}

fn fetch_bundle(model: &ModelConfig, dest_dir: &Path, cancel: &CancelToken) -> Result<(), FetchError> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("failed to create {}", dest_dir.display()))?;

    for artifact in &model.artifacts {
        if cancel.is_set() {
            return Err(FetchError::Cancelled);
        }
        fetch_artifact(&model.repo_url, artifact, dest_dir, cancel)?;
    }

    Ok(())
}

fn fetch_artifact(
    repo_url: &str,
    artifact: &str,
    dest_dir: &Path,
    cancel: &CancelToken,
) -> Result<(), FetchError> {
    let url = format!("{repo_url}/{artifact}");
    let final_path = dest_dir.join(artifact);

    tracing::info!(url = %url, "downloading artifact");

    let mut response = reqwest::blocking::get(&url)
        .with_context(|| format!("failed to download {url}"))?;

    if !response.status().is_success() {
        return Err(FetchError::Other(anyhow::anyhow!(
            "download failed with status {}: {}",
            response.status(),
            url
        )));
    }

    // Stream to a temp file first for atomic placement; cancellation is
    // best-effort, observed between chunks
    let temp_path = final_path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("failed to create temp file at {}", temp_path.display()))?;

    let mut buf = [0_u8; CHUNK_SIZE];
    loop {
        if cancel.is_set() {
            return Err(FetchError::Cancelled);
        }
        let n = response
            .read(&mut buf)
            .context("failed to read response bytes")?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .context("failed to write artifact to temp file")?;
    }

    // Drop file handle before rename
    drop(file);

    fs::rename(&temp_path, &final_path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            temp_path.display(),
            final_path.display()
        )
    })?;

    tracing::info!(path = %final_path.display(), "artifact downloaded");

    Ok(())
}

fn poll_progress(
    dest_dir: &Path,
    expected_size_bytes: u64,
    clamp: f64,
    interval: Duration,
    events: &EventTx<DownloadEvent>,
    cancel: &CancelToken,
    transfer_finished: &AtomicBool,
) {
    while !cancel.is_set() && !transfer_finished.load(Ordering::SeqCst) {
        let downloaded = dir_size(dest_dir);
        let fraction = progress_fraction(downloaded, expected_size_bytes, clamp);
        let status = format!(
            "Downloading model... {:.1} / {:.1} GB",
            downloaded as f64 / BYTES_PER_GB,
            expected_size_bytes as f64 / BYTES_PER_GB
        );
        events.emit(DownloadEvent::Progress { fraction, status });
        std::thread::sleep(interval);
    }
}

/// Approximate completed fraction, clamped so the UI never shows done before
/// the transfer itself confirms completion
fn progress_fraction(downloaded: u64, expected: u64, clamp: f64) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    (downloaded as f64 / expected as f64).min(clamp)
}

/// Total size of all files in the directory, recursive. Unreadable entries
/// are skipped.
fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(std::result::Result::ok)
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                fs::metadata(&path).map_or(0, |m| m.len())
            }
        })
        .sum()
}

/// Remove partially downloaded files on cancel, swallowing errors
fn cleanup(dest_dir: &Path) {
    if dest_dir.is_dir() {
        if let Err(e) = fs::remove_dir_all(dest_dir) {
            tracing::warn!("failed to remove partial bundle: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::event_channel;

    fn test_model(dir_name: &str) -> (ModelConfig, DownloadConfig, PathBuf) {
        let model = ModelConfig {
            name: "test".to_owned(),
            repo_url: "http://127.0.0.1:9/missing".to_owned(),
            dir: String::new(),
            expected_size_bytes: 100,
            artifacts: Vec::new(),
        };
        let download = DownloadConfig {
            poll_interval_secs: 1,
            progress_clamp: 0.99,
        };
        let dest = std::env::temp_dir().join(dir_name);
        (model, download, dest)
    }

    #[test]
    fn progress_fraction_clamps_below_one() {
        assert!((progress_fraction(50, 100, 0.99) - 0.5).abs() < f64::EPSILON);
        assert!((progress_fraction(100, 100, 0.99) - 0.99).abs() < f64::EPSILON);
        // Even when the measured size overshoots the estimate
        assert!((progress_fraction(250, 100, 0.99) - 0.99).abs() < f64::EPSILON);
        assert!((progress_fraction(10, 0, 0.99) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn dir_size_is_recursive_and_tolerant() {
        let root = std::env::temp_dir().join("whisper_batch_dir_size_test");
        let nested = root.join("nested");
        fs::create_dir_all(&nested).unwrap();
        fs::write(root.join("a.bin"), vec![0_u8; 10]).unwrap();
        fs::write(nested.join("b.bin"), vec![0_u8; 7]).unwrap();

        assert_eq!(dir_size(&root), 17);
        assert_eq!(dir_size(Path::new("/nonexistent/whisper-batch")), 0);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn empty_bundle_completes_with_done_event() {
        let (model, download, dest) = test_model("whisper_batch_dl_empty_test");
        let _ = fs::remove_dir_all(&dest);

        let (tx, rx) = event_channel();
        let handle = ModelDownloader::new(model, download, dest.clone(), tx).start();
        handle.join().unwrap();

        let events: Vec<DownloadEvent> = rx.iter().collect();
        assert!(events.contains(&DownloadEvent::Done { path: dest.clone() }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, DownloadEvent::Done { .. } | DownloadEvent::Error { .. }))
                .count(),
            1
        );
        assert!(dest.is_dir());

        fs::remove_dir_all(&dest).unwrap();
    }

    #[test]
    fn cancelled_download_cleans_up_and_stays_silent() {
        let (mut model, download, dest) = test_model("whisper_batch_dl_cancel_test");
        model.artifacts = vec!["ggml-test.bin".to_owned()];
        let _ = fs::remove_dir_all(&dest);

        let (tx, rx) = event_channel();
        let downloader = ModelDownloader::new(model, download, dest.clone(), tx);
        // Cancel before the transfer starts; it observes the token at the
        // first artifact boundary
        downloader.cancel.set();
        let handle = downloader.start();
        handle.join().unwrap();

        let events: Vec<DownloadEvent> = rx.iter().collect();
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, DownloadEvent::Done { .. } | DownloadEvent::Error { .. })),
            "cancelled run must not report done or error, got {events:?}"
        );
        assert!(!dest.exists(), "partial bundle must be removed");
    }

    #[test]
    fn unreachable_host_reports_error_once() {
        let (mut model, download, dest) = test_model("whisper_batch_dl_error_test");
        model.artifacts = vec!["ggml-test.bin".to_owned()];
        let _ = fs::remove_dir_all(&dest);

        let (tx, rx) = event_channel();
        let handle = ModelDownloader::new(model, download, dest.clone(), tx).start();
        handle.join().unwrap();

        let events: Vec<DownloadEvent> = rx.iter().collect();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, DownloadEvent::Error { .. }))
                .count(),
            1
        );
        assert!(!events.iter().any(|e| matches!(e, DownloadEvent::Done { .. })));

        let _ = fs::remove_dir_all(&dest);
    }
}
