use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;

use super::models::*;
use super::stream::{delta_from_response, parse_sse_stream};
use crate::config;
use crate::models::{GeneratedImage, Role, ToolSet};
use crate::providers::traits::Transport;
use crate::providers::types::{
    CacheHandle, Content, FileState, Generated, ImageBatch, Part, SessionConfig, SessionHandle,
    StreamEvent, TransportError, UploadHandle,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_UPLOAD_URL: &str = "https://generativelanguage.googleapis.com/upload/v1beta";

pub struct GeminiTransport {
    client: Client,
    base_url: String,
    upload_url: String,
}

impl Default for GeminiTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiTransport {
    pub fn new() -> Self {
        Self::with_base_urls(DEFAULT_BASE_URL, DEFAULT_UPLOAD_URL)
    }

    pub fn with_base_urls(base_url: impl Into<String>, upload_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            upload_url: upload_url.into(),
        }
    }

    /// Parse an API error response body into a user-friendly message.
    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
            if let Some(msg) = parsed["error"]["message"].as_str() {
                return format!("HTTP {}: {}", status.as_u16(), msg);
            }
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    /// Shared status handling for every call.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::Auth("Invalid API key".to_string()));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited {
                retry_after_secs: None,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }
        Ok(response)
    }

    fn translate_role(role: Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Ai => "model",
        }
    }

    fn wire_part(part: &Part) -> GeminiPart {
        match part {
            Part::Text(text) => GeminiPart {
                text: Some(text.clone()),
                ..Default::default()
            },
            Part::Inline { mime_type, data } => GeminiPart {
                inline_data: Some(GeminiInlineData {
                    mime_type: mime_type.clone(),
                    data: data.clone(),
                }),
                ..Default::default()
            },
            Part::FileRef { uri, mime_type } => GeminiPart {
                file_data: Some(GeminiFileData {
                    file_uri: uri.clone(),
                    mime_type: Some(mime_type.clone()),
                }),
                ..Default::default()
            },
        }
    }

    fn wire_content(content: &Content) -> GeminiContent {
        GeminiContent {
            role: Self::translate_role(content.role).to_string(),
            parts: content.parts.iter().map(Self::wire_part).collect(),
        }
    }

    fn wire_system_instruction(text: &str) -> GeminiContent {
        GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart {
                text: Some(text.to_string()),
                ..Default::default()
            }],
        }
    }

    fn tools_for(set: ToolSet) -> Option<Vec<GeminiTool>> {
        match set {
            ToolSet::Research => Some(vec![GeminiTool {
                google_search: Some(EmptyConfig {}),
                url_context: Some(EmptyConfig {}),
                code_execution: Some(EmptyConfig {}),
                google_maps: None,
            }]),
            ToolSet::Maps => Some(vec![GeminiTool {
                google_search: None,
                url_context: None,
                code_execution: None,
                google_maps: Some(EmptyConfig {}),
            }]),
            ToolSet::None => None,
        }
    }

    fn map_usage(usage: &GeminiUsageMetadata) -> crate::models::TokenUsage {
        crate::models::TokenUsage {
            prompt_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            thoughts_tokens: usage.thoughts_token_count,
            total_tokens: usage.total_token_count,
        }
    }
}

#[async_trait]
impl Transport for GeminiTransport {
    async fn verify_credential(&self, api_key: &str) -> Result<bool, TransportError> {
        let url = format!("{}/models", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", api_key)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        // A rejected key surfaces as 400 (API_KEY_INVALID) or 401/403
        if matches!(
            response.status(),
            reqwest::StatusCode::BAD_REQUEST
                | reqwest::StatusCode::UNAUTHORIZED
                | reqwest::StatusCode::FORBIDDEN
        ) {
            return Ok(false);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        Ok(true)
    }

    async fn create_session(
        &self,
        _api_key: &str,
        model: &str,
        config: SessionConfig,
        history: Vec<Content>,
    ) -> Result<SessionHandle, TransportError> {
        // Sessions are client-side: the full history is replayed on every
        // send, so creation never touches the network.
        Ok(SessionHandle {
            model: model.to_string(),
            config,
            history,
        })
    }

    async fn send_streaming(
        &self,
        api_key: &str,
        session: &mut SessionHandle,
        parts: Vec<Part>,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), TransportError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, session.model
        );

        let user_turn = Content::user(parts);
        let mut contents: Vec<GeminiContent> =
            session.history.iter().map(Self::wire_content).collect();
        contents.push(Self::wire_content(&user_turn));

        let request = GeminiRequest {
            contents,
            system_instruction: session
                .config
                .system_instruction
                .as_deref()
                .map(Self::wire_system_instruction),
            generation_config: None,
            tools: Self::tools_for(session.config.tools),
            cached_content: session.config.cached_content.clone(),
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let response = Self::check_status(response).await?;

        session.history.push(user_turn);
        let outcome = parse_sse_stream(response, tx).await;
        if !outcome.text.is_empty() {
            session.history.push(Content::model(outcome.text));
        }

        Ok(())
    }

    async fn upload_file(
        &self,
        api_key: &str,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<UploadHandle, TransportError> {
        let url = format!("{}/files", self.upload_url);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .header("x-goog-upload-protocol", "raw")
            .header("x-goog-file-name", name)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(data)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let uploaded: GeminiFileUploadResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        Ok(UploadHandle {
            uri: uploaded
                .file
                .uri
                .ok_or_else(|| TransportError::InvalidResponse("File has no URI".to_string()))?,
            name: uploaded.file.name,
            mime_type: uploaded
                .file
                .mime_type
                .unwrap_or_else(|| mime_type.to_string()),
        })
    }

    async fn poll_file(
        &self,
        api_key: &str,
        handle: &UploadHandle,
    ) -> Result<FileState, TransportError> {
        let url = format!("{}/{}", self.base_url, handle.name);

        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", api_key)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let resource: GeminiFileResource = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        Ok(match resource.state.as_deref() {
            Some("ACTIVE") => FileState::Ready,
            Some("FAILED") => FileState::Failed,
            _ => FileState::Processing,
        })
    }

    async fn create_cache(
        &self,
        api_key: &str,
        model: &str,
        system_instruction: Option<&str>,
        content: Vec<Part>,
    ) -> Result<CacheHandle, TransportError> {
        let url = format!("{}/cachedContents", self.base_url);

        let request = GeminiCachedContentRequest {
            model: format!("models/{}", model),
            contents: vec![Self::wire_content(&Content::user(content))],
            system_instruction: system_instruction.map(Self::wire_system_instruction),
            ttl: format!("{}s", config::CACHE_TTL_SECS),
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let cached: GeminiCachedContent = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        Ok(CacheHandle {
            name: cached.name,
            model: model.to_string(),
        })
    }

    async fn delete_cache(
        &self,
        api_key: &str,
        cache: &CacheHandle,
    ) -> Result<(), TransportError> {
        let url = format!("{}/{}", self.base_url, cache.name);

        let response = self
            .client
            .delete(&url)
            .header("x-goog-api-key", api_key)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::check_status(response).await?;

        Ok(())
    }

    async fn generate_once(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<Generated, TransportError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        let request = GeminiRequest {
            contents: vec![Self::wire_content(&Content::user(vec![Part::Text(
                prompt.to_string(),
            )]))],
            system_instruction: None,
            generation_config: None,
            tools: None,
            cached_content: None,
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(TransportError::RequestFailed(
                error.message.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        let delta = delta_from_response(&parsed);
        let text = delta
            .text
            .ok_or_else(|| TransportError::InvalidResponse("No content in response".to_string()))?;

        Ok(Generated {
            text,
            usage: delta.usage,
        })
    }

    async fn generate_image(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
        images: Vec<Part>,
        aspect_ratio: Option<&str>,
    ) -> Result<ImageBatch, TransportError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        let mut parts = images;
        parts.push(Part::Text(prompt.to_string()));

        let request = GeminiRequest {
            contents: vec![Self::wire_content(&Content::user(parts))],
            system_instruction: None,
            generation_config: Some(GeminiGenerationConfig {
                response_modalities: Some(vec!["TEXT".to_string(), "IMAGE".to_string()]),
                image_config: aspect_ratio.map(|ratio| GeminiImageConfig {
                    aspect_ratio: ratio.to_string(),
                }),
            }),
            tools: None,
            cached_content: None,
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(TransportError::RequestFailed(
                error.message.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        let mut batch = ImageBatch {
            images: Vec::new(),
            usage: parsed.usage_metadata.as_ref().map(Self::map_usage),
        };
        if let Some(candidate) = parsed.candidates.as_ref().and_then(|c| c.first()) {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(inline) = &part.inline_data {
                        batch.images.push(GeneratedImage {
                            mime_type: inline.mime_type.clone(),
                            data: inline.data.clone(),
                        });
                    }
                }
            }
        }

        Ok(batch)
    }
}
