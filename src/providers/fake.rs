//! Scriptable in-process transport for service tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::traits::Transport;
use super::types::{
    CacheHandle, Content, FileState, Generated, ImageBatch, Part, SessionConfig, SessionHandle,
    StreamEvent, TransportError, UploadHandle,
};
use crate::models::GeneratedImage;

#[derive(Default)]
pub struct FakeTransport {
    /// Ordered log of every call, with enough detail for order assertions.
    pub calls: Mutex<Vec<String>>,
    /// One script per upcoming `send_streaming` call. An exhausted queue
    /// yields an immediate `Done`.
    pub stream_scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    /// Scripted `poll_file` answers; defaults to `Ready`.
    pub file_states: Mutex<VecDeque<FileState>>,
    pub fail_delete_cache: Mutex<bool>,
    pub fail_send: Mutex<Option<String>>,
    pub fail_generate_once: Mutex<bool>,
    pub reject_credential: Mutex<bool>,
    pub generated_images: Mutex<Vec<GeneratedImage>>,
    cache_counter: Mutex<u32>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_stream(&self, events: Vec<StreamEvent>) {
        self.stream_scripts.lock().unwrap().push_back(events);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_named(&self, name: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(name))
            .collect()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn verify_credential(&self, _api_key: &str) -> Result<bool, TransportError> {
        self.record("verify_credential");
        Ok(!*self.reject_credential.lock().unwrap())
    }

    async fn create_session(
        &self,
        _api_key: &str,
        model: &str,
        config: SessionConfig,
        history: Vec<Content>,
    ) -> Result<SessionHandle, TransportError> {
        self.record(format!("create_session:{}", model));
        Ok(SessionHandle {
            model: model.to_string(),
            config,
            history,
        })
    }

    async fn send_streaming(
        &self,
        _api_key: &str,
        session: &mut SessionHandle,
        parts: Vec<Part>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), TransportError> {
        self.record(format!("send_streaming:{}", session.model));
        let fail_send = self.fail_send.lock().unwrap().clone();
        if let Some(message) = fail_send {
            let _ = tx.send(StreamEvent::Error(message)).await;
            return Ok(());
        }

        session.history.push(Content::user(parts));
        let script = self
            .stream_scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let mut saw_done = false;
        for event in script {
            saw_done = matches!(event, StreamEvent::Done { .. });
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }
        if !saw_done {
            let _ = tx.send(StreamEvent::Done { usage: None }).await;
        }
        Ok(())
    }

    async fn upload_file(
        &self,
        _api_key: &str,
        name: &str,
        mime_type: &str,
        _data: Vec<u8>,
    ) -> Result<UploadHandle, TransportError> {
        self.record(format!("upload_file:{}", name));
        Ok(UploadHandle {
            name: format!("files/{}", name),
            uri: format!("https://files.fake/{}", name),
            mime_type: mime_type.to_string(),
        })
    }

    async fn poll_file(
        &self,
        _api_key: &str,
        handle: &UploadHandle,
    ) -> Result<FileState, TransportError> {
        self.record(format!("poll_file:{}", handle.name));
        Ok(self
            .file_states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FileState::Ready))
    }

    async fn create_cache(
        &self,
        _api_key: &str,
        model: &str,
        _system_instruction: Option<&str>,
        _content: Vec<Part>,
    ) -> Result<CacheHandle, TransportError> {
        let mut counter = self.cache_counter.lock().unwrap();
        *counter += 1;
        let name = format!("cachedContents/{}", counter);
        self.record(format!("create_cache:{}", name));
        Ok(CacheHandle {
            name,
            model: model.to_string(),
        })
    }

    async fn delete_cache(
        &self,
        _api_key: &str,
        cache: &CacheHandle,
    ) -> Result<(), TransportError> {
        self.record(format!("delete_cache:{}", cache.name));
        if *self.fail_delete_cache.lock().unwrap() {
            return Err(TransportError::RequestFailed(
                "cache already gone".to_string(),
            ));
        }
        Ok(())
    }

    async fn generate_once(
        &self,
        _api_key: &str,
        model: &str,
        _prompt: &str,
    ) -> Result<Generated, TransportError> {
        self.record(format!("generate_once:{}", model));
        if *self.fail_generate_once.lock().unwrap() {
            return Err(TransportError::RequestFailed("generation failed".to_string()));
        }
        Ok(Generated {
            text: "Generated title".to_string(),
            usage: None,
        })
    }

    async fn generate_image(
        &self,
        _api_key: &str,
        model: &str,
        _prompt: &str,
        _images: Vec<Part>,
        _aspect_ratio: Option<&str>,
    ) -> Result<ImageBatch, TransportError> {
        self.record(format!("generate_image:{}", model));
        Ok(ImageBatch {
            images: self.generated_images.lock().unwrap().clone(),
            usage: None,
        })
    }
}
