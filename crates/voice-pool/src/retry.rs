//! Retry orchestration: key rotation for quota errors, backoff for the rest
//!
//! Drives one logical generation request to completion or exhaustion. The
//! central policy split: quota exhaustion on one key says nothing about the
//! system, so the next key is tried immediately; a transient error says the
//! call itself is failing, so the same request backs off exponentially
//! before the next attempt. Callers see either the result or the final
//! unwrapped upstream error — never a synthetic retry wrapper.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use voice_backend::{AudioResult, SpeechBackend, SpeechRequest};

use crate::classify::{Classification, classify};
use crate::error::{Error, Result};
use crate::pool::KeyPool;

/// Token charge assumed when the upstream omits usage metadata.
const DEFAULT_TOKENS_PER_REQUEST: u64 = 100;

/// Bounded retry policy for one generation request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_retries: 3,
        }
    }
}

/// Public entry point for speech generation with pooled keys.
///
/// Composes the key pool and the upstream backend behind one operation;
/// the surrounding application never sees which key served a request or
/// how many rotations happened.
pub struct SpeechService {
    pool: Arc<KeyPool>,
    backend: Arc<dyn SpeechBackend>,
    policy: RetryPolicy,
}

impl SpeechService {
    pub fn new(pool: Arc<KeyPool>, backend: Arc<dyn SpeechBackend>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            backend,
            policy,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// Generate speech for the given text, voice, and model.
    pub async fn generate_speech(&self, text: &str, voice: &str, model: &str) -> Result<AudioResult> {
        self.generate(&SpeechRequest {
            text: text.to_string(),
            voice: voice.to_string(),
            model: model.to_string(),
        })
        .await
    }

    /// Run the attempt loop for one request.
    ///
    /// An empty key pool is fatal and never retried — no attempt can
    /// succeed without a key. Exhausting `max_retries` surfaces the last
    /// real upstream error.
    pub async fn generate(&self, request: &SpeechRequest) -> Result<AudioResult> {
        let mut delay = self.policy.initial_delay;
        let mut last_error = None;

        for attempt in 1..=self.policy.max_retries {
            let Some(key) = self.pool.select_best().await? else {
                warn!(attempt, "speech pool has no keys configured");
                metrics::counter!("speech_pool_exhausted_total").increment(1);
                return Err(Error::PoolExhausted);
            };

            info!(attempt, key_id = %key.id, model = %request.model, "attempting speech generation");

            match self.backend.synthesize(&key.secret, request).await {
                Ok(audio) => {
                    let tokens = audio.tokens_used.unwrap_or(DEFAULT_TOKENS_PER_REQUEST);
                    self.pool.record_success(&key.id, tokens).await?;
                    metrics::counter!("speech_attempts_total", "outcome" => "success")
                        .increment(1);
                    info!(attempt, key_id = %key.id, tokens, "speech generation succeeded");
                    return Ok(audio);
                }
                Err(err) => {
                    warn!(attempt, key_id = %key.id, error = %err, "speech generation attempt failed");

                    match classify(&err) {
                        Classification::Quota(failure) => {
                            metrics::counter!("speech_attempts_total", "outcome" => "quota")
                                .increment(1);
                            self.pool
                                .record_failure(&key.id, &err.message, Some(&failure))
                                .await?;
                            last_error = Some(err);
                            // Another key likely has headroom; rotating
                            // beats waiting.
                            info!(attempt, key_id = %key.id, "quota error, rotating to next key without delay");
                            continue;
                        }
                        Classification::Transient => {
                            metrics::counter!("speech_attempts_total", "outcome" => "transient")
                                .increment(1);
                            self.pool.record_failure(&key.id, &err.message, None).await?;
                            last_error = Some(err);

                            if attempt < self.policy.max_retries {
                                info!(
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    "transient error, backing off before retry"
                                );
                                tokio::time::sleep(delay).await;
                                delay = (delay * 2).min(self.policy.max_delay);
                            }
                        }
                    }
                }
            }
        }

        warn!(
            max_retries = self.policy.max_retries,
            "speech generation retries exhausted"
        );
        // Surface the real upstream error so callers can tell root causes
        // apart. last_error is always set here: every loop iteration either
        // returned or stored an error.
        match last_error {
            Some(err) => Err(Error::Upstream(err)),
            None => Err(Error::PoolExhausted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use tokio::sync::Mutex;

    use voice_backend::UpstreamError;
    use voice_keys::{JsonFileStore, KeyLimits, KeyMetrics, KeyStore, now_millis};

    /// Backend that replays a scripted sequence of results and records
    /// which api key served each call.
    struct ScriptedBackend {
        responses: Mutex<VecDeque<std::result::Result<AudioResult, UpstreamError>>>,
        keys_used: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<std::result::Result<AudioResult, UpstreamError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                keys_used: Mutex::new(Vec::new()),
            }
        }

        async fn keys_used(&self) -> Vec<String> {
            self.keys_used.lock().await.clone()
        }
    }

    impl SpeechBackend for ScriptedBackend {
        fn synthesize<'a>(
            &'a self,
            api_key: &'a str,
            _request: &'a SpeechRequest,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<AudioResult, UpstreamError>> + Send + 'a>>
        {
            Box::pin(async move {
                self.keys_used.lock().await.push(api_key.to_string());
                self.responses
                    .lock()
                    .await
                    .pop_front()
                    .expect("scripted backend ran out of responses")
            })
        }
    }

    fn audio() -> AudioResult {
        AudioResult {
            data: b"pcm".to_vec(),
            mime_type: "audio/wav".into(),
            tokens_used: Some(200),
        }
    }

    fn request() -> SpeechRequest {
        SpeechRequest {
            text: "hello world".into(),
            voice: "kore".into(),
            model: "speech-1".into(),
        }
    }

    fn policy_ms(initial: u64, max: u64, retries: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(initial),
            max_delay: Duration::from_millis(max),
            max_retries: retries,
        }
    }

    fn day_quota_error() -> UpstreamError {
        let body = serde_json::json!({
            "error": {
                "code": 429,
                "message": "Quota exceeded",
                "status": "RESOURCE_EXHAUSTED",
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                    "violations": [{ "quotaMetric": "generate_requests_per_day" }]
                }]
            }
        })
        .to_string();
        UpstreamError::status(429, body)
    }

    async fn store_with_keys(
        dir: &tempfile::TempDir,
        secrets: &[&str],
    ) -> Arc<JsonFileStore> {
        let store = Arc::new(
            JsonFileStore::load(dir.path().join("keys.json"))
                .await
                .unwrap(),
        );
        for secret in secrets {
            let record = KeyMetrics::new(secret.to_string(), KeyLimits::default(), now_millis());
            store.set(&record).await.unwrap();
        }
        store
    }

    fn service(
        store: Arc<JsonFileStore>,
        backend: Arc<ScriptedBackend>,
        policy: RetryPolicy,
    ) -> SpeechService {
        SpeechService::new(Arc::new(KeyPool::new(store)), backend, policy)
    }

    #[tokio::test]
    async fn success_on_first_attempt_records_usage() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["sk-a"]).await;
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(audio())]));
        let service = service(store.clone(), backend.clone(), RetryPolicy::default());

        let result = service.generate(&request()).await.unwrap();
        assert_eq!(result.data, b"pcm");

        let id = voice_keys::derive_key_id("sk-a");
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.requests_today, 1);
        assert_eq!(stored.tokens_this_minute, 200);
        assert_eq!(backend.keys_used().await, vec!["sk-a"]);
    }

    #[tokio::test]
    async fn missing_usage_metadata_charges_default_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["sk-a"]).await;
        let mut no_usage = audio();
        no_usage.tokens_used = None;
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(no_usage)]));
        let service = service(store.clone(), backend, RetryPolicy::default());

        service.generate(&request()).await.unwrap();

        let id = voice_keys::derive_key_id("sk-a");
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.tokens_this_minute, DEFAULT_TOKENS_PER_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_exponentially() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["sk-a"]).await;
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(UpstreamError::status(503, "unavailable")),
            Err(UpstreamError::status(503, "unavailable")),
            Ok(audio()),
        ]));
        let service = service(store, backend, policy_ms(100, 1000, 3));

        let start = tokio::time::Instant::now();
        service.generate(&request()).await.unwrap();
        let elapsed = start.elapsed();

        // 100ms before attempt 2, 200ms before attempt 3
        assert_eq!(elapsed, Duration::from_millis(300), "got {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delay_caps_at_max_delay() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["sk-a"]).await;
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(UpstreamError::status(502, "bad gateway")),
            Err(UpstreamError::status(502, "bad gateway")),
            Ok(audio()),
        ]));
        let service = service(store, backend, policy_ms(100, 150, 3));

        let start = tokio::time::Instant::now();
        service.generate(&request()).await.unwrap();

        // 100ms, then capped 150ms instead of 200ms
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn quota_errors_rotate_without_any_delay() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["sk-a"]).await;
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(day_quota_error()),
            Ok(audio()),
        ]));
        let service = service(store, backend, policy_ms(100, 1000, 3));

        let start = tokio::time::Instant::now();
        service.generate(&request()).await.unwrap();

        assert_eq!(
            start.elapsed(),
            Duration::ZERO,
            "quota rotation must not sleep"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn day_quota_error_fails_over_to_second_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["sk-a", "sk-b"]).await;

        // Load sk-b so sk-a is the clear first choice
        let id_b = voice_keys::derive_key_id("sk-b");
        let mut b = store.get(&id_b).await.unwrap().unwrap();
        b.requests_today = 100;
        store.set(&b).await.unwrap();

        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(day_quota_error()),
            Ok(audio()),
        ]));
        let service = service(store.clone(), backend.clone(), policy_ms(100, 1000, 3));

        let start = tokio::time::Instant::now();
        service.generate(&request()).await.unwrap();

        assert_eq!(backend.keys_used().await, vec!["sk-a", "sk-b"]);
        assert_eq!(start.elapsed(), Duration::ZERO);

        // sk-a's day counter is saturated so it stays out of rotation
        let id_a = voice_keys::derive_key_id("sk-a");
        let a = store.get(&id_a).await.unwrap().unwrap();
        assert_eq!(a.requests_today, a.max_requests_per_day);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pool_fails_immediately_without_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &[]).await;
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let service = service(store, backend.clone(), RetryPolicy::default());

        let start = tokio::time::Instant::now();
        let err = service.generate(&request()).await.unwrap_err();

        assert!(matches!(err, Error::PoolExhausted), "got {err:?}");
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(backend.keys_used().await.is_empty(), "no attempt expected");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_last_upstream_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["sk-a"]).await;
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(UpstreamError::status(500, "error one")),
            Err(UpstreamError::status(500, "error two")),
            Err(UpstreamError::status(500, "error three")),
        ]));
        let service = service(store.clone(), backend, policy_ms(10, 100, 3));

        let err = service.generate(&request()).await.unwrap_err();
        match err {
            Error::Upstream(upstream) => assert_eq!(upstream.message, "error three"),
            other => panic!("expected upstream error, got {other:?}"),
        }

        let id = voice_keys::derive_key_id("sk-a");
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_quota_errors_exhaust_without_sleeping() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["sk-a", "sk-b"]).await;
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(day_quota_error()),
            Err(day_quota_error()),
            Err(day_quota_error()),
        ]));
        let service = service(store, backend, policy_ms(100, 1000, 3));

        let start = tokio::time::Instant::now();
        let err = service.generate(&request()).await.unwrap_err();

        assert!(matches!(err, Error::Upstream(_)), "got {err:?}");
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn generate_speech_builds_request_from_parts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_keys(&dir, &["sk-a"]).await;
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(audio())]));
        let service = service(store, backend, RetryPolicy::default());

        let result = service
            .generate_speech("hello", "kore", "speech-1")
            .await
            .unwrap();
        assert_eq!(result.mime_type, "audio/wav");
    }
}
