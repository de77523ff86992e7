//! Key pool: window rollover, usage/failure bookkeeping, and selection
//!
//! The pool owns all mutation of key records and reads/writes them through
//! the shared `KeyStore`. Mutations are lock-free read-modify-write cycles:
//! under concurrent instances a write can be lost (last-writer-wins),
//! which is an accepted tradeoff. The rate limit is advisory self-throttle,
//! not an atomic reservation.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use voice_keys::{KeyLimits, KeyMetrics, KeyStore, derive_key_id, now_millis};

use crate::classify::QuotaFailure;
use crate::error::Result;

const MINUTE_WINDOW_MS: u64 = 60 * 1000;
const DAY_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Keys that failed within this window are passed over during selection.
const RECENT_FAILURE_MS: u64 = 5 * 60 * 1000;

/// Consecutive failures before a key is deactivated.
const DEACTIVATION_THRESHOLD: u32 = 5;

/// Pool-wide usage summary for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_keys: usize,
    pub active_keys: usize,
    pub recently_failed_keys: usize,
    pub requests_today: u64,
}

/// Manages the set of upstream API keys and selects the best one for the
/// next attempt.
pub struct KeyPool {
    store: Arc<dyn KeyStore>,
}

impl KeyPool {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    /// Seed the store from configured secrets.
    ///
    /// `secrets` is a single raw key or a comma-delimited list. Each secret
    /// gets a record with the given limits unless one already exists for
    /// its derived id, so re-initialization never resets live counters.
    pub async fn initialize(&self, secrets: &str, limits: KeyLimits) -> Result<()> {
        let now = now_millis();
        let mut added = 0usize;
        let mut total = 0usize;

        for secret in secrets.split(',') {
            let secret = secret.trim();
            if secret.is_empty() {
                continue;
            }
            total += 1;
            let id = derive_key_id(secret);
            if self.store.get(&id).await?.is_none() {
                let record = KeyMetrics::new(secret.to_string(), limits, now);
                self.store.set(&record).await?;
                info!(key_id = %id, "added speech api key");
                added += 1;
            }
        }

        info!(keys = total, new = added, "key pool initialized");
        Ok(())
    }

    /// Select the best available key for the next attempt.
    ///
    /// Returns `None` only when no keys are configured at all — callers
    /// must treat that as fatal. When every key is rate-limited or
    /// recently failed, falls back to the least-recently-failed key
    /// rather than refusing: a likely error beats guaranteed unavailability.
    pub async fn select_best(&self) -> Result<Option<KeyMetrics>> {
        let now = now_millis();
        let mut all = self.load_all(now).await?;

        if all.is_empty() {
            warn!("no speech api keys configured");
            return Ok(None);
        }

        let mut available: Vec<&KeyMetrics> = all
            .iter()
            .filter(|k| {
                k.is_active
                    && !recently_failed(k, now)
                    && k.requests_today < k.max_requests_per_day
                    && k.requests_this_minute < k.max_requests_per_minute
            })
            .collect();

        if available.is_empty() {
            warn!("all speech api keys rate-limited or failed, using least recently failed");
            metrics::counter!("speech_pool_fallback_total").increment(1);
            all.sort_by_key(|k| k.last_failure_at.unwrap_or(0));
            return Ok(all.into_iter().next());
        }

        available.sort_by(|a, b| {
            usage_score(a)
                .partial_cmp(&usage_score(b))
                .unwrap_or(Ordering::Equal)
        });
        let best = available[0].clone();
        debug!(key_id = %best.id, score = usage_score(&best), "selected key");
        Ok(Some(best))
    }

    /// Record a successful upstream call against a key.
    ///
    /// Any success fully clears failure state: one good response is
    /// treated as recovery for that key.
    pub async fn record_success(&self, id: &str, tokens_used: u64) -> Result<()> {
        let Some(mut record) = self.store.get(id).await? else {
            warn!(key_id = %id, "success recorded for unknown key");
            return Ok(());
        };

        let now = now_millis();
        apply_rollover(&mut record, now);

        record.requests_this_minute += 1;
        record.tokens_this_minute += tokens_used;
        record.requests_today += 1;

        record.last_failure_at = None;
        record.last_failure_message = None;
        record.last_failure_dimension = None;
        record.consecutive_failures = 0;

        self.store.set(&record).await?;
        debug!(key_id = %id, tokens_used, requests_today = record.requests_today, "recorded usage");
        Ok(())
    }

    /// Record a failed upstream call against a key.
    ///
    /// A recognized quota dimension saturates the matching counter to its
    /// limit, excluding the key from selection for the rest of that window
    /// without waiting for further real errors. Repeated failures
    /// deactivate the key until an operator intervenes.
    pub async fn record_failure(
        &self,
        id: &str,
        message: &str,
        quota: Option<&QuotaFailure>,
    ) -> Result<()> {
        let Some(mut record) = self.store.get(id).await? else {
            warn!(key_id = %id, "failure recorded for unknown key");
            return Ok(());
        };

        let now = now_millis();
        record.last_failure_at = Some(now);
        record.last_failure_message = Some(message.to_string());
        record.consecutive_failures += 1;

        if let Some(failure) = quota {
            if let Some(dimension) = &failure.dimension {
                record.last_failure_dimension = Some(dimension.clone());
                let normalized = dimension.replace('-', "_");
                if normalized.contains("per_day") {
                    record.requests_today = record.max_requests_per_day;
                } else if normalized.contains("per_minute") {
                    record.requests_this_minute = record.max_requests_per_minute;
                }
            }
        }

        if record.consecutive_failures >= DEACTIVATION_THRESHOLD && record.is_active {
            record.is_active = false;
            metrics::counter!("speech_key_deactivated_total").increment(1);
            warn!(
                key_id = %id,
                failures = record.consecutive_failures,
                "deactivated speech api key after repeated failures"
            );
        }

        self.store.set(&record).await?;
        warn!(
            key_id = %id,
            failures = record.consecutive_failures,
            dimension = record.last_failure_dimension.as_deref().unwrap_or("none"),
            "recorded key failure"
        );
        Ok(())
    }

    /// Pool-wide usage summary for monitoring.
    pub async fn usage_stats(&self) -> Result<PoolStats> {
        let now = now_millis();
        let all = self.load_all(now).await?;
        Ok(PoolStats {
            total_keys: all.len(),
            active_keys: all.iter().filter(|k| k.is_active).count(),
            recently_failed_keys: all.iter().filter(|k| recently_failed(k, now)).count(),
            requests_today: all.iter().map(|k| u64::from(k.requests_today)).sum(),
        })
    }

    /// Load every record, applying and persisting any due window rollover.
    ///
    /// Rollover is applied before filtering so a key whose minute window
    /// just elapsed is immediately selectable again. Concurrent readers
    /// may persist the same reset; both writes land on identical state.
    async fn load_all(&self, now: u64) -> Result<Vec<KeyMetrics>> {
        let ids = self.store.ids().await?;
        let mut all = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(mut record) = self.store.get(id).await? {
                if apply_rollover(&mut record, now) {
                    self.store.set(&record).await?;
                }
                all.push(record);
            }
        }
        Ok(all)
    }
}

/// Reset counters whose window has elapsed. Returns true if anything changed.
fn apply_rollover(record: &mut KeyMetrics, now: u64) -> bool {
    let mut changed = false;

    if now.saturating_sub(record.minute_window_started_at) >= MINUTE_WINDOW_MS {
        record.requests_this_minute = 0;
        record.tokens_this_minute = 0;
        record.minute_window_started_at = now;
        changed = true;
    }

    if now.saturating_sub(record.day_window_started_at) >= DAY_WINDOW_MS {
        record.requests_today = 0;
        record.day_window_started_at = now;
        changed = true;
    }

    changed
}

fn recently_failed(record: &KeyMetrics, now: u64) -> bool {
    record
        .last_failure_at
        .is_some_and(|at| now.saturating_sub(at) < RECENT_FAILURE_MS)
}

/// Composite load score: lower means more headroom on both quota windows.
fn usage_score(record: &KeyMetrics) -> f64 {
    f64::from(record.requests_today) / f64::from(record.max_requests_per_day.max(1))
        + f64::from(record.requests_this_minute) / f64::from(record.max_requests_per_minute.max(1))
}
