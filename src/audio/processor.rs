// Media collaborator: wraps ffmpeg/ffprobe for analysis, conversion to the
// 16 kHz mono WAV whisper expects, window extraction for chunked
// transcription, and binary concatenation of recorder chunks.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioAnalysis {
    pub file_path: String,
    pub file_size_bytes: u64,
    pub duration_seconds: f64,
    pub format: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub analysis_timestamp: String,
}

/// ffprobe JSON output, only the fields we read.
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AudioProcessor;

impl AudioProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Probe duration, format, sample rate and channel count.
    pub async fn analyze(&self, path: &Path) -> Result<AudioAnalysis> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("ffprobe not found or failed to start")?;

        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let probe: ProbeOutput =
            serde_json::from_slice(&output.stdout).context("unparseable ffprobe output")?;

        let audio_stream = probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"))
            .ok_or_else(|| anyhow!("no audio stream found in {}", path.display()))?;

        let format = probe.format.as_ref();

        Ok(AudioAnalysis {
            file_path: path.display().to_string(),
            file_size_bytes: format
                .and_then(|f| f.size.as_deref())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            duration_seconds: format
                .and_then(|f| f.duration.as_deref())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
            format: format
                .and_then(|f| f.format_name.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            audio_codec: audio_stream
                .codec_name
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            sample_rate: audio_stream
                .sample_rate
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            channels: audio_stream.channels.unwrap_or(0),
            analysis_timestamp: Utc::now().to_rfc3339(),
        })
    }

    /// Convert any input to 16 kHz mono WAV at `output`.
    pub async fn convert_to_wav(&self, input: &Path, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let status = Command::new("ffmpeg")
            .args(["-y", "-v", "error"])
            .arg("-i")
            .arg(input)
            .args(["-ar", "16000", "-ac", "1", "-f", "wav"])
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("ffmpeg not found or failed to start")?;

        if !status.status.success() {
            return Err(anyhow!(
                "ffmpeg conversion failed for {}: {}",
                input.display(),
                String::from_utf8_lossy(&status.stderr).trim()
            ));
        }
        Ok(())
    }

    /// Extract a `[start, start + length)` window as 16 kHz mono WAV.
    pub async fn extract_window(
        &self,
        input: &Path,
        start_sec: f64,
        length_sec: f64,
        output: &Path,
    ) -> Result<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let status = Command::new("ffmpeg")
            .args(["-y", "-v", "error"])
            .arg("-ss")
            .arg(format!("{start_sec:.3}"))
            .arg("-t")
            .arg(format!("{length_sec:.3}"))
            .arg("-i")
            .arg(input)
            .args(["-ar", "16000", "-ac", "1", "-f", "wav"])
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("ffmpeg not found or failed to start")?;

        if !status.status.success() {
            return Err(anyhow!(
                "window extraction failed at {:.1}s for {}: {}",
                start_sec,
                input.display(),
                String::from_utf8_lossy(&status.stderr).trim()
            ));
        }
        Ok(())
    }

    /// Byte-level concatenation of recorder chunks into one container file.
    ///
    /// Chunk 0 carries the container header, so plain appending yields a
    /// decodable stream for WebM/Ogg recorder output.
    pub async fn concat_chunks(&self, chunks: &[PathBuf], output: &Path) -> Result<()> {
        if chunks.is_empty() {
            return Err(anyhow!("no chunks to concatenate"));
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(output).await?;
        for chunk in chunks {
            let bytes = tokio::fs::read(chunk)
                .await
                .with_context(|| format!("failed to read chunk {}", chunk.display()))?;
            out.write_all(&bytes).await?;
        }
        out.flush().await?;
        Ok(())
    }
}

impl Default for AudioProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concat_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("chunk_0");
        let b = dir.path().join("chunk_1");
        tokio::fs::write(&a, b"header").await.unwrap();
        tokio::fs::write(&b, b"-cluster").await.unwrap();

        let out = dir.path().join("combined.webm");
        AudioProcessor::new()
            .concat_chunks(&[a, b], &out)
            .await
            .unwrap();

        let combined = tokio::fs::read(&out).await.unwrap();
        assert_eq!(combined, b"header-cluster");
    }

    #[tokio::test]
    async fn concat_rejects_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("combined.webm");
        let err = AudioProcessor::new().concat_chunks(&[], &out).await;
        assert!(err.is_err());
    }

    #[test]
    fn probe_output_parses_expected_shape() {
        let raw = r#"{
            "format": {"format_name": "wav", "duration": "5.000000", "size": "160078"},
            "streams": [
                {"codec_type": "video"},
                {"codec_type": "audio", "codec_name": "pcm_s16le", "sample_rate": "16000", "channels": 1}
            ]
        }"#;
        let probe: ProbeOutput = serde_json::from_str(raw).unwrap();
        let audio = probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"))
            .unwrap();
        assert_eq!(audio.sample_rate.as_deref(), Some("16000"));
        assert_eq!(probe.format.unwrap().duration.as_deref(), Some("5.000000"));
    }
}
