use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::Message;
use super::model::LogicalModel;

pub const DEFAULT_TITLE: &str = "New chat";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub model: LogicalModel,
    /// Once a turn in this conversation carried a file or a URL, every
    /// later turn keeps using the high-capability model.
    #[serde(default)]
    pub escalated: bool,
    /// Oldest first.
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(model: LogicalModel) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            model,
            escalated: false,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The unique in-progress AI message, if a stream is being folded into
    /// this conversation right now.
    pub fn streaming_message_mut(&mut self) -> Option<&mut Message> {
        self.messages.iter_mut().rev().find(|m| m.is_streaming())
    }

    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.is_streaming())
    }
}
