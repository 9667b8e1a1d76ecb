use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::models::LogicalModel;
use crate::providers::types::{
    CacheHandle, Content, Part, SessionConfig, SessionHandle, StreamEvent, TransportError,
};
use crate::providers::Transport;

#[derive(Default)]
struct SessionState {
    session: Option<SessionHandle>,
    cache: Option<CacheHandle>,
}

/// Exclusive owner of the backend session handle and the server-side
/// context cache for the conversation in focus. The streaming coordinator
/// reaches the transport session only through the operations here.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Make the current session match the requested model, recreating it
    /// with the given history when the mapped backend model (or the cache
    /// binding) changed. A no-op when everything already matches.
    pub async fn ensure_session(
        &self,
        api_key: &str,
        model: LogicalModel,
        history: Vec<Content>,
    ) -> Result<(), TransportError> {
        let profile = model.profile();
        let mut state = self.state.lock().await;

        // A cache is bound to the backend model it was created for; a
        // model switch supersedes it.
        if state
            .cache
            .as_ref()
            .is_some_and(|c| c.model != profile.backend)
        {
            let stale = state.cache.take();
            state.session = None;
            if let Some(cache) = stale {
                self.delete_cache_best_effort(api_key, cache).await;
            }
        }

        let cache_name = state.cache.as_ref().map(|c| c.name.clone());
        let matches = state
            .session
            .as_ref()
            .is_some_and(|s| s.model == profile.backend && s.config.cached_content == cache_name);
        if matches {
            return Ok(());
        }

        // The behavior prompt rides along only on a genuinely blank
        // session; replayed history and cached context already carry it.
        let system_instruction = (history.is_empty() && cache_name.is_none())
            .then(|| model.system_instruction().to_string());

        let config = SessionConfig {
            tools: profile.tools,
            system_instruction,
            cached_content: cache_name,
        };
        let session = self
            .transport
            .create_session(api_key, profile.backend, config, history)
            .await?;
        state.session = Some(session);
        Ok(())
    }

    /// Supersede whatever cache is active with a freshly created one and
    /// bind a new session to it. The old cache is deleted best-effort; its
    /// local handle is gone no matter how the deletion went.
    pub async fn rebind_with_cache(
        &self,
        api_key: &str,
        model: LogicalModel,
        history: Vec<Content>,
        cache: CacheHandle,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock().await;
            let old = state.cache.take();
            state.session = None;
            state.cache = Some(cache);
            if let Some(old) = old {
                self.delete_cache_best_effort(api_key, old).await;
            }
        }
        self.ensure_session(api_key, model, history).await
    }

    /// Idempotent cache teardown. The local handle is cleared before the
    /// remote call, so it cannot leak even if deletion fails.
    pub async fn teardown_cache(&self, api_key: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            let cache = state.cache.take();
            if cache.is_some()
                && state
                    .session
                    .as_ref()
                    .is_some_and(|s| s.config.cached_content.is_some())
            {
                state.session = None;
            }
            cache
        };
        if let Some(cache) = removed {
            self.delete_cache_best_effort(api_key, cache).await;
        }
    }

    /// Route one streaming payload through the current session.
    pub async fn send_streaming(
        &self,
        api_key: &str,
        parts: Vec<Part>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let session = state.session.as_mut().ok_or(TransportError::NoSession)?;
        self.transport
            .send_streaming(api_key, session, parts, tx)
            .await
    }

    pub async fn current_model(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.model.clone())
    }

    pub async fn active_cache(&self) -> Option<CacheHandle> {
        self.state.lock().await.cache.clone()
    }

    async fn delete_cache_best_effort(&self, api_key: &str, cache: CacheHandle) {
        if let Err(e) = self.transport.delete_cache(api_key, &cache).await {
            tracing::warn!("Failed to delete context cache {}: {}", cache.name, e);
        }
    }
}
