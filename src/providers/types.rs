use thiserror::Error;

use crate::models::{GeneratedImage, MessageDelta, Role, TokenUsage, ToolSet};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No active session")]
    NoSession,
}

// --- Session types ---

/// One turn of replayed history.
#[derive(Debug, Clone)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn model(text: String) -> Self {
        Self {
            role: Role::Ai,
            parts: vec![Part::Text(text)],
        }
    }
}

/// One piece of a message payload.
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    /// Small file carried inline, payload base64-encoded.
    Inline { mime_type: String, data: String },
    /// Large file referenced by its uploaded-file URI.
    FileRef { uri: String, mime_type: String },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tools: ToolSet,
    pub system_instruction: Option<String>,
    /// Server-side context cache the session is bound to, by resource name.
    pub cached_content: Option<String>,
}

/// Backend conversation context for one model. Owned by the session
/// manager; the transport replays `history` on every send.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub model: String,
    pub config: SessionConfig,
    pub history: Vec<Content>,
}

// --- File upload types ---

#[derive(Debug, Clone)]
pub struct UploadHandle {
    pub name: String,
    pub uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Processing,
    Ready,
    Failed,
}

/// Server-side cached-content resource. At most one is active at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    pub name: String,
    /// Backend model the cache was created for; caches are model-bound.
    pub model: String,
}

// --- Call results ---

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(MessageDelta),
    Done { usage: Option<TokenUsage> },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct Generated {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub images: Vec<GeneratedImage>,
    pub usage: Option<TokenUsage>,
}
