// Streamed upload handling: validation plus chunked writes to the organized
// uploads tree. Files never sit in memory whole.

use std::path::PathBuf;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::config::{Settings, ALLOWED_AUDIO_EXTENSIONS, UPLOAD_CHUNK_SIZE};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct SavedUpload {
    pub file_path: PathBuf,
    pub original_filename: String,
    pub size_bytes: u64,
    pub extension: String,
}

pub struct UploadHandler {
    settings: std::sync::Arc<Settings>,
}

impl UploadHandler {
    pub fn new(settings: std::sync::Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Reject traversal characters and unsupported extensions up front.
    pub fn validate_filename(&self, filename: &str) -> AppResult<String> {
        if filename.trim().is_empty() {
            return Err(AppError::Validation("Missing filename".into()));
        }
        if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
            return Err(AppError::Validation(
                "Filename contains path traversal characters".into(),
            ));
        }

        let extension = filename
            .rfind('.')
            .map(|i| filename[i..].to_ascii_lowercase())
            .unwrap_or_default();
        if !ALLOWED_AUDIO_EXTENSIONS.contains(&extension.as_str()) {
            return Err(AppError::Validation(format!(
                "Unsupported file type '{extension}'. Allowed: {}",
                ALLOWED_AUDIO_EXTENSIONS.join(", ")
            )));
        }
        Ok(extension)
    }

    /// Stream the upload to `uploads/YYYY/MM/DD/<call_id><ext>`.
    ///
    /// The size cap is enforced while writing; a partial file left by any
    /// failure is removed before the error propagates.
    pub async fn save_stream<S, E>(
        &self,
        call_id: &str,
        filename: &str,
        mut stream: S,
    ) -> AppResult<SavedUpload>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let extension = self.validate_filename(filename)?;

        let dated = Utc::now().format("%Y/%m/%d").to_string();
        let target_dir = self.settings.upload_dir().join(dated);
        tokio::fs::create_dir_all(&target_dir).await?;
        let file_path = target_dir.join(format!("{call_id}{extension}"));

        let file = tokio::fs::File::create(&file_path).await?;
        let mut writer = tokio::io::BufWriter::with_capacity(UPLOAD_CHUNK_SIZE, file);
        let mut written: u64 = 0;

        let result: AppResult<()> = loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    written += chunk.len() as u64;
                    if written > self.settings.max_upload_bytes {
                        break Err(AppError::Validation(format!(
                            "File exceeds the {} MB upload limit",
                            self.settings.max_upload_bytes / (1024 * 1024)
                        )));
                    }
                    if let Err(e) = writer.write_all(&chunk).await {
                        break Err(AppError::Internal(format!("failed writing upload: {e}")));
                    }
                }
                Some(Err(e)) => {
                    break Err(AppError::Internal(format!("upload stream failed: {e}")))
                }
                None => break Ok(()),
            }
        };

        if let Err(err) = result {
            drop(writer);
            if let Err(cleanup) = tokio::fs::remove_file(&file_path).await {
                log::warn!(
                    "failed to remove partial upload {}: {cleanup}",
                    file_path.display()
                );
            }
            return Err(err);
        }

        writer
            .flush()
            .await
            .map_err(|e| AppError::Internal(format!("failed flushing upload: {e}")))?;

        if written == 0 {
            let _ = tokio::fs::remove_file(&file_path).await;
            return Err(AppError::Validation("Uploaded file is empty".into()));
        }

        log::info!(
            "saved upload {} ({:.2} MB)",
            file_path.display(),
            written as f64 / (1024.0 * 1024.0)
        );

        Ok(SavedUpload {
            file_path,
            original_filename: filename.to_string(),
            size_bytes: written,
            extension,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::Arc;

    fn handler(dir: &std::path::Path, cap: u64) -> UploadHandler {
        UploadHandler::new(Arc::new(Settings {
            data_dir: dir.to_path_buf(),
            desktop_mode: false,
            bundled_models_dir: None,
            live_transcription: true,
            live_mic: true,
            live_batch_only: false,
            live_chunk_sec: 3600.0,
            live_stride_sec: 60.0,
            force_language: None,
            max_upload_bytes: cap,
            host: "127.0.0.1".into(),
            port: 8000,
        }))
    }

    fn byte_stream(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
        futures_util::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn traversal_and_bad_extensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path(), 1024);
        assert!(handler.validate_filename("../../etc/passwd.wav").is_err());
        assert!(handler.validate_filename("a/b.wav").is_err());
        assert!(handler.validate_filename("script.exe").is_err());
        assert!(handler.validate_filename("").is_err());
        assert_eq!(handler.validate_filename("Call.WAV").unwrap(), ".wav");
    }

    #[tokio::test]
    async fn upload_streams_to_dated_directory() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path(), 1024);

        let saved = handler
            .save_stream("call-1", "meeting.wav", byte_stream(vec![b"RIFF", b"data"]))
            .await
            .unwrap();
        assert_eq!(saved.size_bytes, 8);
        assert!(saved.file_path.exists());
        let dated = Utc::now().format("%Y/%m/%d").to_string();
        assert!(saved
            .file_path
            .starts_with(dir.path().join("uploads").join(dated)));
    }

    #[tokio::test]
    async fn oversize_upload_is_rejected_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path(), 6);

        let err = handler
            .save_stream("call-2", "big.wav", byte_stream(vec![b"RIFF", b"data"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // No partial file may remain anywhere under uploads/.
        let mut stack = vec![dir.path().join("uploads")];
        while let Some(p) = stack.pop() {
            if !p.exists() {
                continue;
            }
            for entry in std::fs::read_dir(&p).unwrap() {
                let entry = entry.unwrap();
                assert!(entry.file_type().unwrap().is_dir(), "leftover file found");
                stack.push(entry.path());
            }
        }
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path(), 1024);
        let err = handler
            .save_stream("call-3", "empty.wav", byte_stream(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
