use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::models::{LogicalModel, Message, MessageDelta, PendingFile, TokenUsage};
use crate::providers::types::{Content, Part, StreamEvent, TransportError};
use crate::providers::Transport;
use crate::services::files::{FileError, FileIntake, PreparedAttachments};
use crate::services::repository::ConversationRepository;
use crate::services::session::SessionManager;
use crate::services::store::{ConversationStore, StoreError};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("No API key is configured")]
    CredentialMissing,

    #[error("Your API key was rejected. Enter a valid key and try again.")]
    CredentialRejected,

    #[error("Another conversation is still generating a response. Please wait for it to finish.")]
    Busy,

    #[error("Conversation not found: {0}")]
    UnknownConversation(String),

    #[error("File processing failed: {0}")]
    File(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Generation failed: {0}")]
    Upstream(String),
}

impl From<TransportError> for ChatError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Auth(_) => ChatError::CredentialRejected,
            other => ChatError::Upstream(other.to_string()),
        }
    }
}

impl From<FileError> for ChatError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Transport(t) => t.into(),
            FileError::Processing(msg) => ChatError::File(msg),
        }
    }
}

/// Notifications delivered through the `send_message` callback while a
/// turn runs. All state lives in the repository; these only say when to
/// re-read it.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Delta { conversation_id: String },
    Completed { conversation_id: String },
    Failed {
        conversation_id: String,
        message: String,
    },
    FileRejected { message: String },
    PersistFailed { message: String },
}

/// The single application-wide streaming token: the id of the one
/// conversation allowed to stream right now, or empty.
#[derive(Default)]
struct StreamSlot(Mutex<Option<String>>);

impl StreamSlot {
    fn try_claim(&self, conversation_id: &str) -> bool {
        let mut slot = self.0.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(conversation_id.to_string());
        true
    }

    fn holds(&self, conversation_id: &str) -> bool {
        self.0.lock().unwrap().as_deref() == Some(conversation_id)
    }

    /// Clears the slot only if it still names this conversation.
    fn release(&self, conversation_id: &str) {
        let mut slot = self.0.lock().unwrap();
        if slot.as_deref() == Some(conversation_id) {
            *slot = None;
        }
    }
}

/// Orchestrates one outbound generation per turn: guards against
/// concurrent generations, folds arriving chunks into the placeholder
/// message, and finalizes or rolls back on completion or failure.
pub struct ChatService {
    transport: Arc<dyn Transport>,
    repository: Arc<ConversationRepository>,
    store: Arc<ConversationStore>,
    session: Arc<SessionManager>,
    intake: FileIntake,
    credential: Mutex<Option<String>>,
    slot: StreamSlot,
    active_cancel: Mutex<Option<CancellationToken>>,
}

impl ChatService {
    pub fn new(
        transport: Arc<dyn Transport>,
        repository: Arc<ConversationRepository>,
        store: Arc<ConversationStore>,
        session: Arc<SessionManager>,
    ) -> Self {
        Self {
            intake: FileIntake::new(transport.clone()),
            transport,
            repository,
            store,
            session,
            credential: Mutex::new(None),
            slot: StreamSlot::default(),
            active_cancel: Mutex::new(None),
        }
    }

    pub fn set_credential(&self, api_key: impl Into<String>) {
        *self.credential.lock().unwrap() = Some(api_key.into());
    }

    pub fn clear_credential(&self) {
        *self.credential.lock().unwrap() = None;
    }

    pub fn has_credential(&self) -> bool {
        self.credential.lock().unwrap().is_some()
    }

    fn credential(&self) -> Option<String> {
        self.credential.lock().unwrap().clone()
    }

    /// Stop applying chunks for an in-flight turn. The backend call is not
    /// aborted; its remaining output is discarded and whatever already
    /// arrived is finalized as the response.
    pub fn stop(&self, conversation_id: &str) {
        if self.slot.holds(conversation_id) {
            if let Some(token) = self.active_cancel.lock().unwrap().as_ref() {
                token.cancel();
            }
        }
    }

    /// Send one user turn and stream the response into the conversation's
    /// placeholder message. Rejected immediately when no credential is set
    /// or another conversation is streaming.
    pub async fn send_message<F>(
        &self,
        conversation_id: &str,
        text: &str,
        files: Vec<PendingFile>,
        mut on_event: F,
    ) -> Result<(), ChatError>
    where
        F: FnMut(ChatEvent) + Send,
    {
        let api_key = self.credential().ok_or(ChatError::CredentialMissing)?;
        if !self.slot.try_claim(conversation_id) {
            return Err(ChatError::Busy);
        }
        let cancel = CancellationToken::new();
        *self.active_cancel.lock().unwrap() = Some(cancel.clone());

        let result = self
            .run_turn(&api_key, conversation_id, text, files, cancel, &mut on_event)
            .await;

        *self.active_cancel.lock().unwrap() = None;
        self.slot.release(conversation_id);
        result
    }

    async fn run_turn<F>(
        &self,
        api_key: &str,
        conversation_id: &str,
        text: &str,
        files: Vec<PendingFile>,
        cancel: CancellationToken,
        on_event: &mut F,
    ) -> Result<(), ChatError>
    where
        F: FnMut(ChatEvent) + Send,
    {
        let started = Instant::now();

        let validation = FileIntake::validate(files);
        for message in validation.errors {
            on_event(ChatEvent::FileRejected { message });
        }
        let files = validation.valid;

        // Optimistic append of the user turn and the streaming placeholder
        let mut conversations = self.repository.read();
        let conv = conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| ChatError::UnknownConversation(conversation_id.to_string()))?;

        // A turn carrying a file or URL escalates the conversation to the
        // high-capability model, permanently.
        if !files.is_empty() || contains_url(text) {
            conv.escalated = true;
        }
        let escalated = conv.escalated;
        let selected = conv.model;
        let history = map_history(&conv.messages);

        let user_message = Message::user(text, files.iter().map(|f| f.to_file_data()).collect());
        conv.messages.push(user_message.clone());
        conv.messages.push(Message::placeholder());
        conv.updated_at = Utc::now();
        let snapshot = self.repository.optimistic_set(conversations);
        on_event(ChatEvent::Delta {
            conversation_id: conversation_id.to_string(),
        });

        let resolved = resolve_model(selected, escalated);
        let outcome = self
            .generate(
                api_key,
                conversation_id,
                resolved,
                history,
                text,
                files,
                &cancel,
                on_event,
            )
            .await;

        match outcome {
            Ok(usage) => {
                self.finalize(conversation_id, usage, started.elapsed().as_secs_f64());
                on_event(ChatEvent::Completed {
                    conversation_id: conversation_id.to_string(),
                });
                self.persist(on_event).await;
                Ok(())
            }
            Err(err) => {
                self.repository.rollback(snapshot);
                let message = user_facing_message(&err);
                self.resolve_error(conversation_id, user_message, &message, escalated);
                on_event(ChatEvent::Failed {
                    conversation_id: conversation_id.to_string(),
                    message,
                });
                self.persist(on_event).await;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate<F>(
        &self,
        api_key: &str,
        conversation_id: &str,
        model: LogicalModel,
        history: Vec<Content>,
        text: &str,
        files: Vec<PendingFile>,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> Result<Option<TokenUsage>, ChatError>
    where
        F: FnMut(ChatEvent) + Send,
    {
        let profile = model.profile();

        // Stage attachments. A single large document reshapes the session
        // around a context cache; everything else rides in the payload.
        let mut file_parts: Vec<Part> = Vec::new();
        if files.is_empty() {
            self.session.ensure_session(api_key, model, history).await?;
        } else {
            match self.intake.prepare(api_key, files, profile.backend).await? {
                PreparedAttachments::Cached(cache) => {
                    self.session
                        .rebind_with_cache(api_key, model, history, cache)
                        .await?;
                }
                PreparedAttachments::Parts(parts) => {
                    self.session.ensure_session(api_key, model, history).await?;
                    file_parts = parts;
                }
            }
        }

        if model == LogicalModel::Sketch {
            return self
                .generate_images(api_key, conversation_id, profile.backend, text, file_parts, on_event)
                .await;
        }

        let mut parts = file_parts;
        if !text.is_empty() {
            parts.push(Part::Text(text.to_string()));
        }

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
        let session = Arc::clone(&self.session);
        let key = api_key.to_string();
        tokio::spawn(async move {
            if let Err(e) = session.send_streaming(&key, parts, tx.clone()).await {
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
            }
        });

        let mut final_usage: Option<TokenUsage> = None;
        let mut collected_code_images = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Chunks that are still in flight get dropped; the
                    // partial message is finalized as-is.
                    return Ok(final_usage);
                }
                event = rx.recv() => match event {
                    Some(StreamEvent::Chunk(mut delta)) => {
                        if let Some(usage) = delta.usage {
                            final_usage = Some(usage);
                        }
                        // Images from code execution accumulate over the
                        // turn; the message always carries the full set
                        if !delta.code_images.is_empty() {
                            collected_code_images.append(&mut delta.code_images);
                            delta.code_images = collected_code_images.clone();
                        }
                        // Apply only while this conversation still holds
                        // the stream token; a superseded turn may have
                        // buffered chunks left
                        if self.slot.holds(conversation_id) {
                            self.repository.patch_streaming_message(conversation_id, &delta);
                            on_event(ChatEvent::Delta {
                                conversation_id: conversation_id.to_string(),
                            });
                        }
                    }
                    Some(StreamEvent::Done { usage }) => {
                        if usage.is_some() {
                            final_usage = usage;
                        }
                        return Ok(final_usage);
                    }
                    Some(StreamEvent::Error(message)) => {
                        return Err(classify_stream_error(&message));
                    }
                    None => return Ok(final_usage),
                }
            }
        }
    }

    /// Image generation is one shot; the whole batch folds into the
    /// placeholder as a single update.
    async fn generate_images<F>(
        &self,
        api_key: &str,
        conversation_id: &str,
        backend_model: &str,
        prompt: &str,
        input_images: Vec<Part>,
        on_event: &mut F,
    ) -> Result<Option<TokenUsage>, ChatError>
    where
        F: FnMut(ChatEvent) + Send,
    {
        let batch = self
            .transport
            .generate_image(api_key, backend_model, prompt, input_images, None)
            .await?;

        let usage = batch.usage;
        let count = batch.images.len();
        let text = if count == 1 {
            "Generated 1 image.".to_string()
        } else {
            format!("Generated {} images.", count)
        };
        let delta = MessageDelta {
            text: Some(text),
            images: batch.images,
            usage,
            ..Default::default()
        };
        if self.slot.holds(conversation_id) {
            self.repository.patch_streaming_message(conversation_id, &delta);
            on_event(ChatEvent::Delta {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(usage)
    }

    /// Stamp usage, elapsed time and the completion timestamp on the
    /// placeholder. Setting the timestamp is what flips the message from
    /// streaming to final.
    fn finalize(&self, conversation_id: &str, usage: Option<TokenUsage>, elapsed_secs: f64) {
        let mut conversations = self.repository.read();
        if let Some(conv) = conversations.iter_mut().find(|c| c.id == conversation_id) {
            if let Some(message) = conv.streaming_message_mut() {
                if usage.is_some() {
                    message.usage = usage;
                }
                message.elapsed_secs = Some(elapsed_secs);
                message.completed_at = Some(Utc::now());
            }
            conv.updated_at = Utc::now();
        }
        let _ = self.repository.optimistic_set(conversations);
    }

    /// After rolling back to the pre-send snapshot, resolve the turn as a
    /// final error message so the user keeps what they typed.
    fn resolve_error(
        &self,
        conversation_id: &str,
        user_message: Message,
        error_text: &str,
        escalated: bool,
    ) {
        let mut conversations = self.repository.read();
        if let Some(conv) = conversations.iter_mut().find(|c| c.id == conversation_id) {
            conv.escalated = conv.escalated || escalated;
            conv.messages.push(user_message);
            conv.messages.push(Message::error(error_text));
            conv.updated_at = Utc::now();
        }
        let _ = self.repository.optimistic_set(conversations);
    }

    /// Commit the repository to durable storage. Persistence failures are
    /// reported but never undo the in-memory state.
    async fn persist<F>(&self, on_event: &mut F)
    where
        F: FnMut(ChatEvent) + Send,
    {
        if let Err(e) = self.store.save(&self.repository.read()).await {
            let message = match &e {
                StoreError::QuotaExceeded(_) => {
                    "Local storage is full. Clear saved chat data to keep your history."
                        .to_string()
                }
                other => format!("Failed to save conversations: {}", other),
            };
            tracing::error!("{}", message);
            on_event(ChatEvent::PersistFailed { message });
        }
    }
}

/// The image model always answers for its own conversations; anything
/// else escalates to the high-capability model once the conversation is
/// marked.
fn resolve_model(selected: LogicalModel, escalated: bool) -> LogicalModel {
    if selected == LogicalModel::Sketch {
        LogicalModel::Sketch
    } else if escalated {
        LogicalModel::Pro
    } else {
        selected
    }
}

fn contains_url(text: &str) -> bool {
    text.split_whitespace().any(|token| {
        if token.starts_with("www.") {
            return true;
        }
        match Url::parse(token) {
            Ok(url) => matches!(url.scheme(), "http" | "https"),
            Err(_) => false,
        }
    })
}

fn classify_stream_error(message: &str) -> ChatError {
    if is_credential_rejection(message) {
        ChatError::CredentialRejected
    } else {
        ChatError::Upstream(message.to_string())
    }
}

fn is_credential_rejection(message: &str) -> bool {
    message.contains("API_KEY_INVALID")
        || message.contains("API key not valid")
        || message.contains("Authentication failed")
}

fn user_facing_message(err: &ChatError) -> String {
    match err {
        ChatError::CredentialRejected | ChatError::File(_) => err.to_string(),
        _ => "Something went wrong while generating a response. Please try again.".to_string(),
    }
}

/// Replay a transcript as transport history. The in-progress placeholder
/// (if any) and empty turns are skipped.
fn map_history(messages: &[Message]) -> Vec<Content> {
    messages
        .iter()
        .filter(|m| !m.is_streaming())
        .filter_map(|m| {
            let mut parts: Vec<Part> = Vec::new();
            for file in &m.files {
                parts.push(Part::Inline {
                    mime_type: file.mime_type.clone(),
                    data: file.data.clone(),
                });
            }
            if !m.content.is_empty() {
                parts.push(Part::Text(m.content.clone()));
            }
            if parts.is_empty() {
                return None;
            }
            Some(Content {
                role: m.role,
                parts,
            })
        })
        .collect()
}
