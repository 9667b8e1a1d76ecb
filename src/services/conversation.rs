use std::sync::Arc;

use chrono::Utc;

use crate::config;
use crate::models::conversation::DEFAULT_TITLE;
use crate::models::{Conversation, LogicalModel, Role};
use crate::providers::Transport;
use crate::services::chat::ChatError;
use crate::services::repository::{ConversationRepository, Snapshot};
use crate::services::store::ConversationStore;

/// The non-streaming conversation verbs: create, delete, rename, model
/// switch, title generation, prompt rewriting. Every mutation goes
/// optimistic-set first and rolls back if the durable write fails.
pub struct ConversationService {
    repository: Arc<ConversationRepository>,
    store: Arc<ConversationStore>,
    transport: Arc<dyn Transport>,
}

impl ConversationService {
    pub fn new(
        repository: Arc<ConversationRepository>,
        store: Arc<ConversationStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            repository,
            store,
            transport,
        }
    }

    pub async fn create(&self, model: LogicalModel) -> Result<Conversation, ChatError> {
        let conversation = Conversation::new(model);
        let mut conversations = self.repository.read();
        conversations.insert(0, conversation.clone());
        let snapshot = self.repository.optimistic_set(conversations);
        self.commit(snapshot).await?;
        Ok(conversation)
    }

    pub async fn delete(&self, conversation_id: &str) -> Result<(), ChatError> {
        let mut conversations = self.repository.read();
        conversations.retain(|c| c.id != conversation_id);
        let snapshot = self.repository.optimistic_set(conversations);
        self.commit(snapshot).await
    }

    pub async fn rename(&self, conversation_id: &str, title: &str) -> Result<(), ChatError> {
        self.update(conversation_id, |conv| {
            conv.title = title.to_string();
        })
        .await
    }

    /// Only the record changes here; the next send re-ensures the backend
    /// session against the new model.
    pub async fn switch_model(
        &self,
        conversation_id: &str,
        model: LogicalModel,
    ) -> Result<(), ChatError> {
        self.update(conversation_id, |conv| {
            conv.model = model;
        })
        .await
    }

    /// Derive a display title from the first exchange. Falls back to a
    /// truncation of the first user line when the backend call fails.
    pub async fn generate_title(
        &self,
        api_key: &str,
        conversation_id: &str,
    ) -> Result<String, ChatError> {
        let conversation = self
            .repository
            .get(conversation_id)
            .ok_or_else(|| ChatError::UnknownConversation(conversation_id.to_string()))?;

        let Some(first_user) = conversation
            .messages
            .iter()
            .find(|m| m.role == Role::User && !m.content.is_empty())
        else {
            return Ok(conversation.title);
        };

        let prompt = format!(
            "Write a title of at most five words for a chat that starts with \
             the following message. Reply with the title only.\n\n{}",
            first_user.content
        );
        let title = match self
            .transport
            .generate_once(api_key, LogicalModel::Flash.profile().backend, &prompt)
            .await
        {
            Ok(generated) => clean_title(&generated.text),
            Err(e) => {
                tracing::warn!("Title generation failed, falling back: {}", e);
                truncate_title(&first_user.content)
            }
        };

        self.rename(conversation_id, &title).await?;
        Ok(title)
    }

    /// Single-shot polish of a draft prompt before sending.
    pub async fn rewrite_prompt(&self, api_key: &str, text: &str) -> Result<String, ChatError> {
        let prompt = format!(
            "Rewrite the following chat prompt to be clearer and more \
             specific without changing its intent. Reply with the rewritten \
             prompt only.\n\n{}",
            text
        );
        let generated = self
            .transport
            .generate_once(api_key, LogicalModel::Flash.profile().backend, &prompt)
            .await
            .map_err(ChatError::from)?;
        Ok(generated.text.trim().to_string())
    }

    async fn update(
        &self,
        conversation_id: &str,
        apply: impl FnOnce(&mut Conversation),
    ) -> Result<(), ChatError> {
        let mut conversations = self.repository.read();
        let conv = conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| ChatError::UnknownConversation(conversation_id.to_string()))?;
        apply(conv);
        conv.updated_at = Utc::now();
        let snapshot = self.repository.optimistic_set(conversations);
        self.commit(snapshot).await
    }

    async fn commit(&self, snapshot: Snapshot) -> Result<(), ChatError> {
        match self.store.save(&self.repository.read()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.repository.rollback(snapshot);
                Err(e.into())
            }
        }
    }
}

fn clean_title(raw: &str) -> String {
    let cleaned = raw
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    if cleaned.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        truncate_title(cleaned)
    }
}

fn truncate_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default().trim();
    if first_line.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    let mut title: String = first_line.chars().take(config::TITLE_MAX_CHARS).collect();
    if first_line.chars().count() > config::TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use crate::providers::fake::FakeTransport;

    struct Fixture {
        transport: Arc<FakeTransport>,
        repository: Arc<ConversationRepository>,
        store: Arc<ConversationStore>,
        service: ConversationService,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(FakeTransport::new());
        let repository = Arc::new(ConversationRepository::new());
        let store = Arc::new(ConversationStore::open_in_memory().unwrap());
        let service =
            ConversationService::new(repository.clone(), store.clone(), transport.clone());
        Fixture {
            transport,
            repository,
            store,
            service,
        }
    }

    #[tokio::test]
    async fn create_inserts_at_the_front() {
        let f = fixture();
        f.service.create(LogicalModel::Flash).await.unwrap();
        let newest = f.service.create(LogicalModel::Pro).await.unwrap();

        let conversations = f.repository.read();
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].id, newest.id);
    }

    #[tokio::test]
    async fn delete_removes_only_the_target() {
        let f = fixture();
        let keep = f.service.create(LogicalModel::Flash).await.unwrap();
        let gone = f.service.create(LogicalModel::Flash).await.unwrap();

        f.service.delete(&gone.id).await.unwrap();

        let conversations = f.repository.read();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].id, keep.id);
    }

    #[tokio::test]
    async fn switch_model_updates_the_record() {
        let f = fixture();
        let conv = f.service.create(LogicalModel::Flash).await.unwrap();

        f.service
            .switch_model(&conv.id, LogicalModel::Atlas)
            .await
            .unwrap();

        assert_eq!(
            f.repository.get(&conv.id).unwrap().model,
            LogicalModel::Atlas
        );
    }

    #[tokio::test]
    async fn generated_title_is_cleaned_and_applied() {
        let f = fixture();
        let conv = f.service.create(LogicalModel::Flash).await.unwrap();
        {
            let mut conversations = f.repository.read();
            conversations[0]
                .messages
                .push(Message::user("what is borrow checking?", Vec::new()));
            f.repository.optimistic_set(conversations);
        }

        let title = f.service.generate_title("k", &conv.id).await.unwrap();

        assert_eq!(title, "Generated title");
        assert_eq!(f.repository.get(&conv.id).unwrap().title, "Generated title");
    }

    #[tokio::test]
    async fn title_falls_back_to_truncation_when_generation_fails() {
        let f = fixture();
        *f.transport.fail_generate_once.lock().unwrap() = true;
        let conv = f.service.create(LogicalModel::Flash).await.unwrap();
        {
            let mut conversations = f.repository.read();
            conversations[0].messages.push(Message::user(
                "a very long first message that goes on and well past any \
                 reasonable title length limit",
                Vec::new(),
            ));
            f.repository.optimistic_set(conversations);
        }

        let title = f.service.generate_title("k", &conv.id).await.unwrap();

        assert!(title.chars().count() <= config::TITLE_MAX_CHARS + 1);
        assert!(title.ends_with('…'));
    }

    #[tokio::test]
    async fn failed_durable_write_rolls_back_the_optimistic_update() {
        let f = fixture();
        let conv = f.service.create(LogicalModel::Flash).await.unwrap();
        let before = f.repository.read();

        f.store.poison();
        let result = f.service.rename(&conv.id, "new title").await;

        assert!(result.is_err());
        let after = f.repository.read();
        assert_eq!(
            serde_json::to_value(&after).unwrap(),
            serde_json::to_value(&before).unwrap()
        );
    }

    #[test]
    fn truncate_title_keeps_short_lines_intact() {
        assert_eq!(truncate_title("Hello there"), "Hello there");
        assert_eq!(truncate_title("first line\nsecond"), "first line");
        assert_eq!(truncate_title("   "), DEFAULT_TITLE);
    }
}
