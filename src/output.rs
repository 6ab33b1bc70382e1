//! Output format writers for transcription segments.
//!
//! Each writer is deterministic for a given segment sequence. Files are
//! written to a temp path and renamed into place so a failed or cancelled run
//! never leaves a partial transcript behind.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::transcription::engine::Segment;

/// Supported transcript output formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// `[MM:SS] text` lines
    Txt,
    /// SubRip subtitles
    Srt,
    /// JSON array of `{start, end, text}`
    Json,
    /// Markdown with bold timestamps
    Markdown,
}

impl OutputFormat {
    /// File extension for this format, without the dot
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Txt => "txt",
            Self::Srt => "srt",
            Self::Json => "json",
            Self::Markdown => "md",
        }
    }

    /// Derives the transcript destination for an input file: same directory
    /// and base name, extension swapped
    #[must_use]
    pub fn output_path(self, input: &Path) -> PathBuf {
        input.with_extension(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "txt" => Ok(Self::Txt),
            "srt" => Ok(Self::Srt),
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Txt => "txt",
            Self::Srt => "srt",
            Self::Json => "json",
            Self::Markdown => "markdown",
        })
    }
}

/// Renders `segments` in the given format and writes the result to `path`
/// atomically (temp file, then rename).
pub fn write_transcript(format: OutputFormat, segments: &[Segment], path: &Path) -> Result<()> {
    let contents = render(format, segments)?;

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &contents)
        .with_context(|| format!("failed to write temp file at {}", temp_path.display()))?;
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    tracing::debug!(
        path = %path.display(),
        format = %format,
        segments = segments.len(),
        "transcript written"
    );

    Ok(())
}

fn render(format: OutputFormat, segments: &[Segment]) -> Result<String> {
    match format {
        OutputFormat::Txt => Ok(render_txt(segments)),
        OutputFormat::Srt => Ok(render_srt(segments)),
        OutputFormat::Json => render_json(segments),
        OutputFormat::Markdown => Ok(render_markdown(segments)),
    }
}

fn render_txt(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments {
        out.push_str(&format!("[{}] {}\n", format_clock(seg.start), seg.text.trim()));
    }
    out
}

fn render_srt(segments: &[Segment]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            srt_time(seg.start),
            srt_time(seg.end),
            seg.text.trim()
        ));
    }
    out
}

fn render_json(segments: &[Segment]) -> Result<String> {
    #[derive(Serialize)]
    struct JsonSegment<'a> {
        start: f64,
        end: f64,
        text: &'a str,
    }

    let rows: Vec<JsonSegment<'_>> = segments
        .iter()
        .map(|seg| JsonSegment {
            start: round3(seg.start),
            end: round3(seg.end),
            text: seg.text.trim(),
        })
        .collect();

    let mut out = serde_json::to_string_pretty(&rows).context("failed to serialize segments")?;
    out.push('\n');
    Ok(out)
}

fn render_markdown(segments: &[Segment]) -> String {
    let mut out = String::from("# Transcription\n\n");
    for seg in segments {
        out.push_str(&format!(
            "**[{}]** {}\n\n",
            format_clock(seg.start),
            seg.text.trim()
        ));
    }
    out
}

/// `MM:SS` for status lines and the txt/markdown formats
#[must_use]
pub fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// `HH:MM:SS,mmm` SubRip timestamp
fn srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0) as u64;
    let h = total_ms / 3_600_000;
    let m = (total_ms % 3_600_000) / 60_000;
    let s = (total_ms % 60_000) / 1000;
    let ms = total_ms % 1000;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Vec<Segment> {
        vec![
            Segment {
                start: 0.0,
                end: 1.5,
                text: "a".to_owned(),
            },
            Segment {
                start: 1.5,
                end: 3.25,
                text: "b".to_owned(),
            },
        ]
    }

    #[test]
    fn extension_round_trip() {
        for name in ["txt", "srt", "json", "markdown"] {
            let format: OutputFormat = name.parse().unwrap();
            assert_eq!(format.to_string(), name);
        }
        assert_eq!("md".parse::<OutputFormat>().unwrap(), OutputFormat::Markdown);
        assert_eq!("SRT".parse::<OutputFormat>().unwrap(), OutputFormat::Srt);
        assert!("docx".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn output_path_swaps_extension() {
        let format = OutputFormat::Srt;
        assert_eq!(
            format.output_path(Path::new("/media/talk.mp4")),
            PathBuf::from("/media/talk.srt")
        );
        assert_eq!(
            format.output_path(Path::new("noext")),
            PathBuf::from("noext.srt")
        );
    }

    #[test]
    fn txt_format() {
        assert_eq!(render_txt(&fixture()), "[00:00] a\n[00:01] b\n");
    }

    #[test]
    fn srt_format() {
        assert_eq!(
            render_srt(&fixture()),
            "1\n00:00:00,000 --> 00:00:01,500\na\n\n2\n00:00:01,500 --> 00:00:03,250\nb\n\n"
        );
    }

    #[test]
    fn json_format() {
        let rendered = render_json(&fixture()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed[0]["start"], 0.0);
        assert_eq!(parsed[1]["end"], 3.25);
        assert_eq!(parsed[1]["text"], "b");
    }

    #[test]
    fn markdown_format() {
        assert_eq!(
            render_markdown(&fixture()),
            "# Transcription\n\n**[00:00]** a\n\n**[00:01]** b\n\n"
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let segments = fixture();
        for format in [
            OutputFormat::Txt,
            OutputFormat::Srt,
            OutputFormat::Json,
            OutputFormat::Markdown,
        ] {
            let first = render(format, &segments).unwrap();
            for _ in 0..3 {
                assert_eq!(render(format, &segments).unwrap(), first);
            }
        }
    }

    #[test]
    fn write_is_atomic_and_leaves_no_temp() {
        let dir = std::env::temp_dir().join("whisper_batch_output_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.txt");

        write_transcript(OutputFormat::Txt, &fixture(), &path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "[00:00] a\n[00:01] b\n");
        assert!(!dir.join("out.tmp").exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn clock_formatting() {
        assert_eq!(format_clock(0.0), "00:00");
        assert_eq!(format_clock(59.9), "00:59");
        assert_eq!(format_clock(61.0), "01:01");
        assert_eq!(format_clock(3599.0), "59:59");
        assert_eq!(format_clock(-1.0), "00:00");
    }

    #[test]
    fn srt_time_formatting() {
        assert_eq!(srt_time(0.0), "00:00:00,000");
        assert_eq!(srt_time(1.5), "00:00:01,500");
        assert_eq!(srt_time(3661.042), "01:01:01,042");
    }
}
