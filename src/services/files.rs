use std::sync::Arc;

use thiserror::Error;

use crate::config;
use crate::models::PendingFile;
use crate::providers::types::{CacheHandle, FileState, Part, TransportError, UploadHandle};
use crate::providers::Transport;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("{0}")]
    Processing(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-batch validation result. Rejection is per file; valid files in the
/// same batch still proceed.
pub struct Validation {
    pub valid: Vec<PendingFile>,
    pub errors: Vec<String>,
}

/// What a batch of attachments turned into.
pub enum PreparedAttachments {
    /// Parts to send alongside the text in one message payload.
    Parts(Vec<Part>),
    /// The single oversized document was bound into a context cache; only
    /// the text is sent, the document is already server-side.
    Cached(CacheHandle),
}

/// Validates attachments and stages them for sending: small files inline,
/// large files through upload-and-poll, a single large document into a
/// server-side context cache.
pub struct FileIntake {
    transport: Arc<dyn Transport>,
}

impl FileIntake {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Reject oversized files and unsupported types with a readable
    /// message per file.
    pub fn validate(files: Vec<PendingFile>) -> Validation {
        let mut valid = Vec::new();
        let mut errors = Vec::new();

        for file in files {
            if file.data.len() > config::MAX_ATTACHMENT_BYTES {
                errors.push(format!(
                    "{}: larger than the {} MB limit",
                    file.name,
                    config::MAX_ATTACHMENT_BYTES / (1024 * 1024)
                ));
                continue;
            }
            if !Self::is_supported(&file.mime_type) {
                errors.push(format!(
                    "{}: unsupported file type \"{}\" (images and PDF only)",
                    file.name, file.mime_type
                ));
                continue;
            }
            valid.push(file);
        }

        Validation { valid, errors }
    }

    fn is_supported(mime_type: &str) -> bool {
        mime_type.starts_with("image/") || mime_type == config::CACHEABLE_DOCUMENT_MIME
    }

    fn is_cacheable(file: &PendingFile) -> bool {
        file.mime_type == config::CACHEABLE_DOCUMENT_MIME
            && file.data.len() > config::CACHEABLE_DOCUMENT_BYTES
    }

    /// Stage validated files for one send. `backend_model` is the model
    /// the turn resolved to; a context cache is bound to it.
    pub async fn prepare(
        &self,
        api_key: &str,
        mut files: Vec<PendingFile>,
        backend_model: &str,
    ) -> Result<PreparedAttachments, FileError> {
        if files.len() == 1 && Self::is_cacheable(&files[0]) {
            let file = files.swap_remove(0);
            let handle = self.upload_and_wait(api_key, &file).await?;
            let cache = self
                .transport
                .create_cache(
                    api_key,
                    backend_model,
                    None,
                    vec![Part::FileRef {
                        uri: handle.uri,
                        mime_type: handle.mime_type,
                    }],
                )
                .await?;
            return Ok(PreparedAttachments::Cached(cache));
        }

        let mut parts = Vec::with_capacity(files.len());
        for file in files {
            if file.data.len() <= config::INLINE_ATTACHMENT_BYTES {
                let data = file.to_file_data();
                parts.push(Part::Inline {
                    mime_type: data.mime_type,
                    data: data.data,
                });
            } else {
                let handle = self.upload_and_wait(api_key, &file).await?;
                parts.push(Part::FileRef {
                    uri: handle.uri,
                    mime_type: handle.mime_type,
                });
            }
        }
        Ok(PreparedAttachments::Parts(parts))
    }

    /// Upload one file and poll on a fixed interval until the backend
    /// reports it ready or failed.
    async fn upload_and_wait(
        &self,
        api_key: &str,
        file: &PendingFile,
    ) -> Result<UploadHandle, FileError> {
        let handle = self
            .transport
            .upload_file(api_key, &file.name, &file.mime_type, file.data.clone())
            .await?;

        loop {
            match self.transport.poll_file(api_key, &handle).await? {
                FileState::Ready => return Ok(handle),
                FileState::Failed => {
                    return Err(FileError::Processing(format!(
                        "{}: server-side processing failed",
                        file.name
                    )))
                }
                FileState::Processing => tokio::time::sleep(config::FILE_POLL_INTERVAL).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fake::FakeTransport;

    fn intake() -> (Arc<FakeTransport>, FileIntake) {
        let transport = Arc::new(FakeTransport::new());
        let intake = FileIntake::new(transport.clone());
        (transport, intake)
    }

    fn png(name: &str, len: usize) -> PendingFile {
        PendingFile::new(name, "image/png", vec![0u8; len])
    }

    fn pdf(name: &str, len: usize) -> PendingFile {
        PendingFile::new(name, "application/pdf", vec![0u8; len])
    }

    #[test]
    fn validation_is_per_file_not_per_batch() {
        let result = FileIntake::validate(vec![
            png("ok.png", 128),
            PendingFile::new("notes.txt", "text/plain", vec![0u8; 16]),
            png("huge.png", config::MAX_ATTACHMENT_BYTES + 1),
        ]);

        assert_eq!(result.valid.len(), 1);
        assert_eq!(result.valid[0].name, "ok.png");
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].contains("notes.txt"));
        assert!(result.errors[1].contains("huge.png"));
    }

    #[tokio::test]
    async fn small_files_ride_inline() {
        let (transport, intake) = intake();

        let prepared = intake
            .prepare("k", vec![png("a.png", 64), png("b.png", 64)], "gemini-2.5-pro")
            .await
            .unwrap();

        match prepared {
            PreparedAttachments::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[0], Part::Inline { .. }));
            }
            PreparedAttachments::Cached(_) => panic!("small images must not create a cache"),
        }
        assert!(transport.calls_named("upload_file").is_empty());
    }

    #[tokio::test]
    async fn oversized_files_upload_and_reference() {
        let (transport, intake) = intake();

        let prepared = intake
            .prepare(
                "k",
                vec![png("big.png", config::INLINE_ATTACHMENT_BYTES + 1)],
                "gemini-2.5-pro",
            )
            .await
            .unwrap();

        match prepared {
            PreparedAttachments::Parts(parts) => {
                assert!(matches!(parts[0], Part::FileRef { .. }));
            }
            PreparedAttachments::Cached(_) => panic!("images must not create a cache"),
        }
        assert_eq!(transport.calls_named("upload_file").len(), 1);
    }

    #[tokio::test]
    async fn single_large_document_becomes_a_cache() {
        let (transport, intake) = intake();

        let prepared = intake
            .prepare(
                "k",
                vec![pdf("paper.pdf", config::CACHEABLE_DOCUMENT_BYTES + 1)],
                "gemini-2.5-pro",
            )
            .await
            .unwrap();

        assert!(matches!(prepared, PreparedAttachments::Cached(_)));
        assert_eq!(transport.calls_named("upload_file").len(), 1);
        assert_eq!(transport.calls_named("create_cache").len(), 1);
    }

    #[tokio::test]
    async fn two_large_documents_do_not_cache() {
        let (transport, intake) = intake();

        let prepared = intake
            .prepare(
                "k",
                vec![
                    pdf("a.pdf", config::CACHEABLE_DOCUMENT_BYTES + 1),
                    pdf("b.pdf", config::CACHEABLE_DOCUMENT_BYTES + 1),
                ],
                "gemini-2.5-pro",
            )
            .await
            .unwrap();

        assert!(matches!(prepared, PreparedAttachments::Parts(_)));
        assert!(transport.calls_named("create_cache").is_empty());
    }

    #[tokio::test]
    async fn failed_processing_aborts_the_attempt() {
        let (transport, intake) = intake();
        transport
            .file_states
            .lock()
            .unwrap()
            .push_back(FileState::Failed);

        let result = intake
            .prepare(
                "k",
                vec![png("big.png", config::INLINE_ATTACHMENT_BYTES + 1)],
                "gemini-2.5-pro",
            )
            .await;

        assert!(matches!(result, Err(FileError::Processing(_))));
    }
}
