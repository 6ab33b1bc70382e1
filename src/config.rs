use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub model: ModelConfig,
    pub transcription: TranscriptionConfig,
    pub download: DownloadConfig,
    pub output: OutputConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Model name; the bundle lands in `<dir>/<name>/`
    pub name: String,
    /// Base URL the artifact files are fetched from
    pub repo_url: String,
    /// Root directory for downloaded model bundles
    pub dir: String,
    /// Fixed size estimate of the complete bundle, used for download progress
    pub expected_size_bytes: u64,
    /// Artifact filenames making up the bundle; the first entry is the model
    /// file itself and must exist for the bundle to count as present
    pub artifacts: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranscriptionConfig {
    pub threads: usize,
    pub beam_size: usize,
    /// Language code, or "auto" for auto-detection
    pub language: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    /// Seconds between directory-size samples
    pub poll_interval_secs: u64,
    /// Upper bound reported before the transfer itself completes
    pub progress_clamp: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Default output format: txt, srt, json or markdown
    pub format: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub log_path: String,
}

impl Config {
    /// Load config from ~/.whisper-batch.toml, creating it with defaults on
    /// first run
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            Self::create_default(&config_path).context("failed to create default config")?;
        }

        let contents = fs::read_to_string(&config_path).context("failed to read config file")?;

        let config: Self = toml::from_str(&contents).context("failed to parse config TOML")?;

        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        Ok(PathBuf::from(home).join(".whisper-batch.toml"))
    }

    fn create_default(path: &PathBuf) -> Result<()> {
        fs::write(path, DEFAULT_CONFIG).context("failed to write default config")?;
        Ok(())
    }

    /// Directory the model bundle is (or will be) downloaded into
    pub fn model_dir(&self) -> Result<PathBuf> {
        Ok(Self::expand_path(&self.model.dir)?.join(&self.model.name))
    }

    /// Locates the model file inside the bundle directory, if present
    #[must_use]
    pub fn find_model_path(&self) -> Option<PathBuf> {
        let dir = self.model_dir().ok()?;
        let primary = self.model.artifacts.first()?;
        let path = dir.join(primary);
        path.is_file().then_some(path)
    }

    /// Expand ~ in paths to home directory
    pub fn expand_path(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix("~/") {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            Ok(PathBuf::from(home).join(stripped))
        } else {
            Ok(PathBuf::from(path))
        }
    }
}

impl TranscriptionConfig {
    /// Maps the "auto" sentinel (or an empty string) to `None`, which the
    /// engine treats as language auto-detection
    #[must_use]
    pub fn language_option(&self) -> Option<&str> {
        match self.language.as_str() {
            "" | "auto" => None,
            code => Some(code),
        }
    }
}

const DEFAULT_CONFIG: &str = r#"[model]
name = "large-v3"
repo_url = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main"
dir = "~/.whisper-batch/models"
expected_size_bytes = 3087284224
artifacts = ["ggml-large-v3.bin"]

[transcription]
threads = 4
beam_size = 5
language = "auto"

[download]
poll_interval_secs = 1
progress_clamp = 0.99

[output]
format = "txt"

[telemetry]
enabled = true
log_path = "~/.whisper-batch/whisper-batch.log"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.model.name, "large-v3");
        assert_eq!(config.model.artifacts, vec!["ggml-large-v3.bin"]);
        assert_eq!(config.transcription.beam_size, 5);
        assert_eq!(config.download.poll_interval_secs, 1);
        assert!((config.download.progress_clamp - 0.99).abs() < f64::EPSILON);
        assert_eq!(config.output.format, "txt");
    }

    #[test]
    fn language_auto_maps_to_none() {
        let mut config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.transcription.language_option(), None);

        config.transcription.language = String::new();
        assert_eq!(config.transcription.language_option(), None);

        config.transcription.language = "ru".to_owned();
        assert_eq!(config.transcription.language_option(), Some("ru"));
    }

    #[test]
    fn expand_path_with_tilde() {
        let home = std::env::var("HOME").unwrap();
        let result = Config::expand_path("~/models/whisper").unwrap();
        assert_eq!(result, PathBuf::from(home).join("models/whisper"));
    }

    #[test]
    fn expand_path_absolute_passthrough() {
        let result = Config::expand_path("/opt/models").unwrap();
        assert_eq!(result, PathBuf::from("/opt/models"));
    }

    #[test]
    fn find_model_path_missing_bundle() {
        let mut config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.model.dir = "/nonexistent/whisper-batch-test".to_owned();
        assert!(config.find_model_path().is_none());
    }

    #[test]
    fn find_model_path_present_bundle() {
        let mut config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        let root = std::env::temp_dir().join("whisper_batch_config_test");
        let bundle = root.join(&config.model.name);
        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join("ggml-large-v3.bin"), b"stub").unwrap();
        config.model.dir = root.to_string_lossy().into_owned();

        let found = config.find_model_path().unwrap();
        assert_eq!(found, bundle.join("ggml-large-v3.bin"));

        fs::remove_dir_all(&root).unwrap();
    }
}
