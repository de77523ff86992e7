//! Quota detection for upstream speech API errors
//!
//! Distinguishes quota/rate-limit exhaustion (rotate to the next key
//! immediately) from transient failures (back off and retry). All string
//! and JSON sniffing of upstream error shapes lives here, so upstream
//! format changes touch only this module.

use serde::Deserialize;
use voice_backend::UpstreamError;

/// A recognized quota violation extracted from an upstream error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaFailure {
    /// Which limit was hit (e.g. "generate_requests_per_day"), when the
    /// error carried a structured violation; absent for bare 429s
    pub dimension: Option<String>,
    pub raw_message: String,
}

/// Tagged classification of an upstream failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A key-level quota was exhausted; rotate without delay
    Quota(QuotaFailure),
    /// Network blip, 5xx, or anything unrecognized; back off and retry
    Transient,
}

/// Quota signatures in upstream error text.
///
/// The upstream reports resource exhaustion either as a bare HTTP 429 or
/// with "RESOURCE_EXHAUSTED" / "quota" in the error message.
pub fn is_quota_error(err: &UpstreamError) -> bool {
    if err.status == Some(429) {
        return true;
    }
    err.message.contains("429")
        || err.message.contains("quota")
        || err.message.contains("RESOURCE_EXHAUSTED")
}

/// Structured error envelope the upstream returns for quota violations.
///
/// `{"error":{"code":429,"message":"...","status":"RESOURCE_EXHAUSTED",
///   "details":[{"@type":"...","violations":[{"quotaMetric":"..."}]}]}}`
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    violations: Vec<Violation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Violation {
    quota_metric: Option<String>,
}

/// Extract a quota failure from an upstream error, if there is one.
///
/// Tries the structured JSON envelope first; the first violation's quota
/// metric becomes the dimension. Errors that look like quota exhaustion
/// but aren't structured JSON get a generic record with no dimension.
/// Returns `None` for everything else.
pub fn parse_quota_failure(err: &UpstreamError) -> Option<QuotaFailure> {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&err.message) {
        let dimension = envelope
            .error
            .details
            .iter()
            .flat_map(|d| d.violations.iter())
            .find_map(|v| v.quota_metric.clone());
        if dimension.is_some() || is_quota_error(err) {
            return Some(QuotaFailure {
                dimension,
                raw_message: envelope.error.message.unwrap_or_else(|| err.message.clone()),
            });
        }
        return None;
    }

    if is_quota_error(err) {
        return Some(QuotaFailure {
            dimension: None,
            raw_message: err.message.clone(),
        });
    }

    None
}

/// Classify an upstream failure for the retry orchestrator.
pub fn classify(err: &UpstreamError) -> Classification {
    match parse_quota_failure(err) {
        Some(failure) => Classification::Quota(failure),
        None => Classification::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota_envelope(metric: &str) -> String {
        serde_json::json!({
            "error": {
                "code": 429,
                "message": "Quota exceeded for metric",
                "status": "RESOURCE_EXHAUSTED",
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.QuotaFailure",
                    "violations": [{
                        "quotaMetric": metric,
                        "quotaId": "GenerateRequestsPerDayPerProject"
                    }]
                }]
            }
        })
        .to_string()
    }

    #[test]
    fn status_429_is_quota() {
        let err = UpstreamError::status(429, "rate limited");
        assert!(is_quota_error(&err));
    }

    #[test]
    fn message_429_is_quota() {
        let err = UpstreamError::transport("got 429 from upstream");
        assert!(is_quota_error(&err));
    }

    #[test]
    fn message_quota_is_quota() {
        let err = UpstreamError::transport("quota exceeded for project");
        assert!(is_quota_error(&err));
    }

    #[test]
    fn message_resource_exhausted_is_quota() {
        let err = UpstreamError::transport("status RESOURCE_EXHAUSTED");
        assert!(is_quota_error(&err));
    }

    #[test]
    fn plain_network_error_is_not_quota() {
        let err = UpstreamError::transport("connection reset by peer");
        assert!(!is_quota_error(&err));
    }

    #[test]
    fn structured_envelope_yields_dimension() {
        let err = UpstreamError::status(
            429,
            quota_envelope("generatelanguage.googleapis.com/generate_requests_per_day"),
        );
        let failure = parse_quota_failure(&err).unwrap();
        assert_eq!(
            failure.dimension.as_deref(),
            Some("generatelanguage.googleapis.com/generate_requests_per_day")
        );
        assert_eq!(failure.raw_message, "Quota exceeded for metric");
    }

    #[test]
    fn unstructured_quota_error_yields_generic_failure() {
        let err = UpstreamError::status(429, "too many requests, quota exhausted");
        let failure = parse_quota_failure(&err).unwrap();
        assert!(failure.dimension.is_none());
        assert_eq!(failure.raw_message, "too many requests, quota exhausted");
    }

    #[test]
    fn transient_error_yields_none() {
        let err = UpstreamError::status(503, "service unavailable");
        assert!(parse_quota_failure(&err).is_none());
        assert_eq!(classify(&err), Classification::Transient);
    }

    #[test]
    fn structured_non_quota_envelope_is_transient() {
        let body = serde_json::json!({
            "error": { "code": 500, "message": "internal error", "status": "INTERNAL" }
        })
        .to_string();
        let err = UpstreamError::status(500, body);
        assert_eq!(classify(&err), Classification::Transient);
    }

    #[test]
    fn classify_wraps_quota_failure() {
        let err = UpstreamError::status(429, quota_envelope("x/generate_requests_per_minute"));
        match classify(&err) {
            Classification::Quota(failure) => {
                assert_eq!(
                    failure.dimension.as_deref(),
                    Some("x/generate_requests_per_minute")
                );
            }
            other => panic!("expected quota classification, got {other:?}"),
        }
    }

    #[test]
    fn envelope_without_violations_still_quota_when_signatures_match() {
        let body = serde_json::json!({
            "error": { "code": 429, "message": "quota exceeded", "status": "RESOURCE_EXHAUSTED" }
        })
        .to_string();
        let err = UpstreamError::status(429, body);
        let failure = parse_quota_failure(&err).unwrap();
        assert!(failure.dimension.is_none());
        assert_eq!(failure.raw_message, "quota exceeded");
    }
}
