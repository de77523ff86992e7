//! Backend abstraction for the upstream generative speech API
//!
//! Defines the `SpeechBackend` trait that decouples the retry orchestrator
//! from the concrete upstream client. `HttpSpeechBackend` talks to a
//! Gemini-style `generateContent` endpoint with audio response modality;
//! tests substitute a scripted mock implementing the same trait.
//!
//! The `UpstreamError` shape is deliberately minimal: an optional HTTP
//! status plus the raw response text. The pool's error classifier inspects
//! that text for quota signatures, so this crate stays free of retry policy.

pub mod http;

pub use http::HttpSpeechBackend;

use std::future::Future;
use std::pin::Pin;

/// Parameters for one speech generation request.
#[derive(Debug, Clone)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
    pub model: String,
}

/// Synthesized audio returned by the upstream.
#[derive(Debug, Clone)]
pub struct AudioResult {
    /// Decoded audio bytes
    pub data: Vec<u8>,
    /// MIME type reported by the upstream (e.g. "audio/L16;codec=pcm;rate=24000")
    pub mime_type: String,
    /// Token count from upstream usage metadata, when reported
    pub tokens_used: Option<u64>,
}

/// Error from an upstream speech call.
///
/// `message` carries the raw response body text when one was received, so
/// structured error envelopes survive intact for classification downstream.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    /// HTTP status code, absent for transport-level failures
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream speech error ({status}): {}", self.message),
            None => write!(f, "upstream speech error: {}", self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl UpstreamError {
    /// Transport-level failure with no HTTP response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Failure with an HTTP status and response body.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Abstraction over the upstream speech synthesis call.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn SpeechBackend>` in the orchestrator).
pub trait SpeechBackend: Send + Sync {
    /// Invoke the upstream API with the given raw credential.
    ///
    /// The implementation must honor whatever timeout its HTTP client
    /// carries; the orchestrator imposes no wall-clock budget of its own.
    fn synthesize<'a>(
        &'a self,
        api_key: &'a str,
        request: &'a SpeechRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AudioResult, UpstreamError>> + Send + 'a>>;
}
