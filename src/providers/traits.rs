use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{
    CacheHandle, Content, FileState, Generated, ImageBatch, Part, SessionConfig, SessionHandle,
    StreamEvent, TransportError, UploadHandle,
};

/// Everything the coordination layer needs from the AI backend. The
/// concrete implementation lives in `gemini`; tests substitute a fake.
#[async_trait]
pub trait Transport: Send + Sync {
    /// One round-trip that tells whether the credential is usable.
    async fn verify_credential(&self, api_key: &str) -> Result<bool, TransportError>;

    async fn create_session(
        &self,
        api_key: &str,
        model: &str,
        config: SessionConfig,
        history: Vec<Content>,
    ) -> Result<SessionHandle, TransportError>;

    /// Send one message payload on the session, delivering chunks through
    /// `tx` until the stream ends.
    async fn send_streaming(
        &self,
        api_key: &str,
        session: &mut SessionHandle,
        parts: Vec<Part>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), TransportError>;

    async fn upload_file(
        &self,
        api_key: &str,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<UploadHandle, TransportError>;

    async fn poll_file(
        &self,
        api_key: &str,
        handle: &UploadHandle,
    ) -> Result<FileState, TransportError>;

    async fn create_cache(
        &self,
        api_key: &str,
        model: &str,
        system_instruction: Option<&str>,
        content: Vec<Part>,
    ) -> Result<CacheHandle, TransportError>;

    async fn delete_cache(
        &self,
        api_key: &str,
        cache: &CacheHandle,
    ) -> Result<(), TransportError>;

    /// Single-shot text generation (titles, prompt rewriting).
    async fn generate_once(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<Generated, TransportError>;

    /// Single-shot image generation.
    async fn generate_image(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
        images: Vec<Part>,
        aspect_ratio: Option<&str>,
    ) -> Result<ImageBatch, TransportError>;
}
