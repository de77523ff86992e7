//! HTTP implementation of the speech backend
//!
//! Sends a `generateContent` request with `responseModalities: ["AUDIO"]`
//! and a prebuilt voice config, then decodes the base64 audio payload from
//! the first candidate. Error responses are returned with their body text
//! intact so the caller can classify quota violations.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

use crate::{AudioResult, SpeechBackend, SpeechRequest, UpstreamError};

/// Reqwest-backed speech client for the upstream generative API.
///
/// The client's timeout is the only wall-clock bound on a single call;
/// callers configure it at construction.
pub struct HttpSpeechBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSpeechBackend {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn request_url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }
}

impl SpeechBackend for HttpSpeechBackend {
    fn synthesize<'a>(
        &'a self,
        api_key: &'a str,
        request: &'a SpeechRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AudioResult, UpstreamError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.request_url(&request.model);
            let body = build_request_body(request);

            debug!(model = %request.model, voice = %request.voice, "sending speech request");

            let response = self
                .client
                .post(&url)
                .header("x-goog-api-key", api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| UpstreamError::transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(UpstreamError::status(status.as_u16(), text));
            }

            let envelope: GenerateResponse = response
                .json()
                .await
                .map_err(|e| UpstreamError::transport(format!("decoding response: {e}")))?;

            extract_audio(envelope)
        })
    }
}

/// Build the upstream JSON body for a speech request.
///
/// Voice names are capitalized on the wire ("kore" -> "Kore") while the
/// public API accepts lowercase.
fn build_request_body(request: &SpeechRequest) -> serde_json::Value {
    serde_json::json!({
        "contents": [{ "parts": [{ "text": request.text }] }],
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": capitalize_voice(&request.voice) }
                }
            }
        }
    })
}

fn capitalize_voice(voice: &str) -> String {
    let mut chars = voice.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: Option<u64>,
}

/// Pull the first inline audio payload out of a successful response.
fn extract_audio(envelope: GenerateResponse) -> Result<AudioResult, UpstreamError> {
    let tokens_used = envelope
        .usage_metadata
        .and_then(|u| u.total_token_count);

    let inline = envelope
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .find_map(|p| p.inline_data)
        .ok_or_else(|| UpstreamError::transport("response contained no audio data"))?;

    let data = STANDARD
        .decode(inline.data.as_bytes())
        .map_err(|e| UpstreamError::transport(format!("invalid base64 audio payload: {e}")))?;

    Ok(AudioResult {
        data,
        mime_type: inline.mime_type,
        tokens_used,
    })
}
