use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::models::{GeminiCandidate, GeminiResponse};
use crate::models::{Citation, GeneratedImage, MessageDelta, TokenUsage};
use crate::providers::types::StreamEvent;

/// Outcome of draining one SSE response: the concatenated plain text (for
/// session history replay) and the last usage totals the backend reported.
pub struct StreamOutcome {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Parse an `alt=sse` streaming response, sending one `StreamEvent::Chunk`
/// per SSE event and a final `Done`. Errors reported by the backend
/// mid-stream are forwarded as `StreamEvent::Error`.
pub async fn parse_sse_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
) -> StreamOutcome {
    let mut stream = response.bytes_stream();
    let mut byte_buf: Vec<u8> = Vec::new();
    let mut buffer = String::new();
    let mut outcome = StreamOutcome {
        text: String::new(),
        usage: None,
    };

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Stream error: {}", e)))
                    .await;
                return outcome;
            }
        };

        let Some(decoded) = take_valid_utf8(&mut byte_buf, bytes) else {
            continue;
        };

        // Normalize CRLF to LF (the API uses \r\n line endings)
        buffer.push_str(&decoded.replace("\r\n", "\n"));

        // Process complete SSE events from the buffer
        while let Some(event_end) = buffer.find("\n\n") {
            let event_text = buffer[..event_end].to_string();
            buffer.drain(..event_end + 2);

            let data = sse_event_data(&event_text);
            if data.is_empty() {
                continue;
            }

            match serde_json::from_str::<GeminiResponse>(&data) {
                Ok(response) => {
                    if let Some(error) = &response.error {
                        let msg = error
                            .message
                            .clone()
                            .unwrap_or_else(|| "Unknown error".to_string());
                        let _ = tx.send(StreamEvent::Error(msg)).await;
                        return outcome;
                    }

                    let delta = delta_from_response(&response);
                    if let Some(text) = &delta.text {
                        outcome.text.push_str(text);
                    }
                    if delta.usage.is_some() {
                        outcome.usage = delta.usage;
                    }
                    if !delta.is_empty() && tx.send(StreamEvent::Chunk(delta)).await.is_err() {
                        return outcome; // receiver dropped
                    }
                }
                Err(e) => {
                    // Partial events occur; don't abort on parse errors
                    tracing::warn!("Failed to parse SSE data: {}", e);
                }
            }
        }
    }

    let _ = tx
        .send(StreamEvent::Done {
            usage: outcome.usage,
        })
        .await;
    outcome
}

/// Decode as much valid UTF-8 as possible, keeping any trailing partial
/// code point buffered for the next network chunk.
fn take_valid_utf8(byte_buf: &mut Vec<u8>, bytes: Bytes) -> Option<String> {
    byte_buf.extend_from_slice(&bytes);
    match std::str::from_utf8(byte_buf) {
        Ok(s) => {
            let decoded = s.to_string();
            byte_buf.clear();
            Some(decoded)
        }
        Err(e) => {
            let valid_up_to = e.valid_up_to();
            if valid_up_to == 0 {
                return None;
            }
            let decoded = String::from_utf8_lossy(&byte_buf[..valid_up_to]).into_owned();
            byte_buf.drain(..valid_up_to);
            Some(decoded)
        }
    }
}

fn sse_event_data(event_text: &str) -> String {
    let mut data = String::new();
    for line in event_text.lines() {
        if let Some(payload) = line.strip_prefix("data: ") {
            data.push_str(payload);
        } else if let Some(payload) = line.strip_prefix("data:") {
            data.push_str(payload);
        }
    }
    data
}

/// Fold one wire response into a normalized delta. Reasoning-trace text is
/// kept apart from answer text, code execution parts land in their own
/// fields, and both citation channels are merged by URI.
pub fn delta_from_response(response: &GeminiResponse) -> MessageDelta {
    let mut delta = MessageDelta::default();

    if let Some(candidate) = response.candidates.as_ref().and_then(|c| c.first()) {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(text) = &part.text {
                    if part.thought.unwrap_or(false) {
                        append(&mut delta.thought, text);
                    } else {
                        append(&mut delta.text, text);
                    }
                }
                if let Some(code) = &part.executable_code {
                    append(&mut delta.executable_code, &code.code);
                }
                if let Some(result) = &part.code_execution_result {
                    if let Some(output) = &result.output {
                        append(&mut delta.code_output, output);
                    }
                }
                if let Some(inline) = &part.inline_data {
                    // Inline images in a general stream come from code
                    // execution (charts, renders)
                    delta.code_images.push(GeneratedImage {
                        mime_type: inline.mime_type.clone(),
                        data: inline.data.clone(),
                    });
                }
            }
        }
        for citation in citations_from_candidate(candidate) {
            if !delta.citations.iter().any(|c| c.uri == citation.uri) {
                delta.citations.push(citation);
            }
        }
    }

    if let Some(usage) = &response.usage_metadata {
        delta.usage = Some(TokenUsage {
            prompt_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            thoughts_tokens: usage.thoughts_token_count,
            total_tokens: usage.total_token_count,
        });
    }

    delta
}

/// Citations arrive on two channels: grounding results (web and maps, the
/// latter carrying a place id) and URL-context resolution.
fn citations_from_candidate(candidate: &GeminiCandidate) -> Vec<Citation> {
    let mut citations = Vec::new();

    if let Some(chunks) = candidate
        .grounding_metadata
        .as_ref()
        .and_then(|g| g.grounding_chunks.as_ref())
    {
        for chunk in chunks {
            if let Some(web) = &chunk.web {
                if let Some(uri) = &web.uri {
                    citations.push(Citation {
                        uri: uri.clone(),
                        title: web.title.clone().unwrap_or_else(|| uri.clone()),
                        place_id: None,
                    });
                }
            }
            if let Some(maps) = &chunk.maps {
                if let Some(uri) = &maps.uri {
                    citations.push(Citation {
                        uri: uri.clone(),
                        title: maps.title.clone().unwrap_or_else(|| uri.clone()),
                        place_id: maps.place_id.clone(),
                    });
                }
            }
        }
    }

    if let Some(urls) = candidate
        .url_context_metadata
        .as_ref()
        .and_then(|u| u.url_metadata.as_ref())
    {
        for meta in urls {
            // Failed retrievals are not sources
            let failed = meta
                .url_retrieval_status
                .as_deref()
                .is_some_and(|s| s != "URL_RETRIEVAL_STATUS_SUCCESS");
            if failed {
                continue;
            }
            if let Some(url) = &meta.retrieved_url {
                citations.push(Citation {
                    uri: url.clone(),
                    title: url.clone(),
                    place_id: None,
                });
            }
        }
    }

    citations
}

fn append(slot: &mut Option<String>, text: &str) {
    slot.get_or_insert_with(String::new).push_str(text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separates_thought_from_answer_text() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[
                {"text":"mulling it over","thought":true},
                {"text":"Hello"}
            ]}}]}"#,
        )
        .unwrap();

        let delta = delta_from_response(&response);
        assert_eq!(delta.text.as_deref(), Some("Hello"));
        assert_eq!(delta.thought.as_deref(), Some("mulling it over"));
    }

    #[test]
    fn extracts_code_execution_parts() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[
                {"executableCode":{"language":"PYTHON","code":"print(1)"}},
                {"codeExecutionResult":{"outcome":"OUTCOME_OK","output":"1\n"}},
                {"inlineData":{"mimeType":"image/png","data":"cGxvdA=="}}
            ]}}]}"#,
        )
        .unwrap();

        let delta = delta_from_response(&response);
        assert_eq!(delta.executable_code.as_deref(), Some("print(1)"));
        assert_eq!(delta.code_output.as_deref(), Some("1\n"));
        assert_eq!(delta.code_images.len(), 1);
    }

    #[test]
    fn merges_both_citation_channels() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{
                "content":{"role":"model","parts":[{"text":"see sources"}]},
                "groundingMetadata":{"groundingChunks":[
                    {"web":{"uri":"https://a.example","title":"A"}},
                    {"maps":{"uri":"https://maps.example/p","title":"Cafe","placeId":"pid-1"}}
                ]},
                "urlContextMetadata":{"urlMetadata":[
                    {"retrievedUrl":"https://b.example","urlRetrievalStatus":"URL_RETRIEVAL_STATUS_SUCCESS"}
                ]}
            }]}"#,
        )
        .unwrap();

        let delta = delta_from_response(&response);
        assert_eq!(delta.citations.len(), 3);
        let maps = delta
            .citations
            .iter()
            .find(|c| c.uri == "https://maps.example/p")
            .unwrap();
        assert_eq!(maps.place_id.as_deref(), Some("pid-1"));
    }

    #[test]
    fn duplicate_uris_within_one_chunk_collapse() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{
                "content":{"role":"model","parts":[{"text":"x"}]},
                "groundingMetadata":{"groundingChunks":[
                    {"web":{"uri":"https://a.example","title":"A"}},
                    {"web":{"uri":"https://a.example","title":"A again"}}
                ]}
            }]}"#,
        )
        .unwrap();

        assert_eq!(delta_from_response(&response).citations.len(), 1);
    }

    #[test]
    fn maps_usage_totals() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":20,
                "thoughtsTokenCount":5,"totalTokenCount":35}}"#,
        )
        .unwrap();

        let usage = delta_from_response(&response).usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(10));
        assert_eq!(usage.total_tokens, Some(35));
    }
}
