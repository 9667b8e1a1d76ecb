use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attachment::FileData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Ai,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Ai => "ai",
        }
    }
}

/// A source reference attached to an AI message. De-duplicated by `uri`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub uri: String,
    pub title: String,
    /// Set when the citation came from location grounding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
}

/// An image produced by the backend, held as a base64 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub thoughts_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

/// One entry in a conversation transcript.
///
/// `completed_at` is the authoritative in-progress flag: it is `None` for
/// exactly as long as the message is being streamed and is set once on
/// finalization. There is no separate boolean.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Long-form variant of `content`, when the backend returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_content: Option<String>,
    /// Reasoning trace, appended to while streaming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    /// Generated images are never persisted.
    #[serde(skip)]
    pub images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn user(content: impl Into<String>, files: Vec<FileData>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            extended_content: None,
            thought: None,
            elapsed_secs: None,
            files,
            citations: Vec::new(),
            images: Vec::new(),
            executable_code: None,
            code_output: None,
            code_images: Vec::new(),
            usage: None,
            completed_at: Some(Utc::now()),
        }
    }

    /// An empty AI message that streamed chunks are folded into.
    pub fn placeholder() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Ai,
            content: String::new(),
            extended_content: None,
            thought: None,
            elapsed_secs: None,
            files: Vec::new(),
            citations: Vec::new(),
            images: Vec::new(),
            executable_code: None,
            code_output: None,
            code_images: Vec::new(),
            usage: None,
            completed_at: None,
        }
    }

    /// A finalized AI message carrying an error text in place of content.
    pub fn error(content: impl Into<String>) -> Self {
        let mut msg = Self::placeholder();
        msg.content = content.into();
        msg.completed_at = Some(Utc::now());
        msg
    }

    pub fn is_streaming(&self) -> bool {
        self.role == Role::Ai && self.completed_at.is_none()
    }

    /// Additive merge of one streamed chunk. Text-like fields concatenate,
    /// citations union by URI, image lists and usage take the latest value.
    pub fn merge(&mut self, delta: &MessageDelta) {
        if let Some(text) = &delta.text {
            self.content.push_str(text);
        }
        if let Some(thought) = &delta.thought {
            self.thought.get_or_insert_with(String::new).push_str(thought);
        }
        if let Some(code) = &delta.executable_code {
            self.executable_code
                .get_or_insert_with(String::new)
                .push_str(code);
        }
        if let Some(output) = &delta.code_output {
            self.code_output
                .get_or_insert_with(String::new)
                .push_str(output);
        }
        for citation in &delta.citations {
            if !self.citations.iter().any(|c| c.uri == citation.uri) {
                self.citations.push(citation.clone());
            }
        }
        if !delta.images.is_empty() {
            self.images = delta.images.clone();
        }
        if !delta.code_images.is_empty() {
            self.code_images = delta.code_images.clone();
        }
        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
        }
    }
}

/// One streamed fragment of an AI response, already normalized out of the
/// transport's wire shape.
#[derive(Debug, Clone, Default)]
pub struct MessageDelta {
    pub text: Option<String>,
    pub thought: Option<String>,
    pub executable_code: Option<String>,
    pub code_output: Option<String>,
    pub citations: Vec<Citation>,
    pub images: Vec<GeneratedImage>,
    pub code_images: Vec<GeneratedImage>,
    pub usage: Option<TokenUsage>,
}

impl MessageDelta {
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.thought.is_none()
            && self.executable_code.is_none()
            && self.code_output.is_none()
            && self.citations.is_empty()
            && self.images.is_empty()
            && self.code_images.is_empty()
            && self.usage.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_delta(s: &str) -> MessageDelta {
        MessageDelta {
            text: Some(s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn merge_concatenates_text_and_thought() {
        let mut msg = Message::placeholder();
        msg.merge(&text_delta("Hel"));
        msg.merge(&text_delta("lo"));
        msg.merge(&MessageDelta {
            thought: Some("thinking".to_string()),
            ..Default::default()
        });
        msg.merge(&text_delta("!"));

        assert_eq!(msg.content, "Hello!");
        assert_eq!(msg.thought.as_deref(), Some("thinking"));
    }

    #[test]
    fn merge_unions_citations_by_uri() {
        let mut msg = Message::placeholder();
        let citation = Citation {
            uri: "https://example.org/a".to_string(),
            title: "Example".to_string(),
            place_id: None,
        };
        msg.merge(&MessageDelta {
            citations: vec![citation.clone()],
            ..Default::default()
        });
        msg.merge(&MessageDelta {
            citations: vec![
                citation,
                Citation {
                    uri: "https://example.org/b".to_string(),
                    title: "Other".to_string(),
                    place_id: None,
                },
            ],
            ..Default::default()
        });

        assert_eq!(msg.citations.len(), 2);
    }

    #[test]
    fn merge_replaces_images_and_usage_wholesale() {
        let mut msg = Message::placeholder();
        let first = GeneratedImage {
            mime_type: "image/png".to_string(),
            data: "aaaa".to_string(),
        };
        let second = GeneratedImage {
            mime_type: "image/png".to_string(),
            data: "bbbb".to_string(),
        };
        msg.merge(&MessageDelta {
            images: vec![first],
            usage: Some(TokenUsage {
                prompt_tokens: Some(1),
                output_tokens: Some(2),
                thoughts_tokens: None,
                total_tokens: Some(3),
            }),
            ..Default::default()
        });
        msg.merge(&MessageDelta {
            images: vec![second.clone()],
            usage: Some(TokenUsage {
                prompt_tokens: Some(10),
                output_tokens: Some(20),
                thoughts_tokens: None,
                total_tokens: Some(30),
            }),
            ..Default::default()
        });

        assert_eq!(msg.images, vec![second]);
        assert_eq!(msg.usage.unwrap().total_tokens, Some(30));
    }

    #[test]
    fn generated_images_do_not_survive_serialization() {
        let mut msg = Message::error("done");
        msg.images.push(GeneratedImage {
            mime_type: "image/png".to_string(),
            data: "cGl4ZWxz".to_string(),
        });

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();

        assert!(back.images.is_empty());
        assert_eq!(back.content, "done");
        assert_eq!(back.completed_at, msg.completed_at);
    }
}
