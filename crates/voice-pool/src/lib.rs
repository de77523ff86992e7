//! Pooled key selection and retry orchestration for the speech API
//!
//! Balances a shared pool of upstream API keys, each with independent
//! per-minute and per-day quotas, across concurrent generation requests.
//! Usage and failure state persist through a `KeyStore` shared by all
//! process instances.
//!
//! Request lifecycle:
//! 1. Orchestrator asks the pool for the least-loaded usable key
//! 2. Pool applies window rollovers, filters out inactive / recently
//!    failed / over-quota keys, ranks the rest by usage score
//! 3. Upstream call succeeds → usage recorded, failure state cleared
//! 4. Quota error → counters saturated for that window, next key tried
//!    immediately with no delay
//! 5. Transient error → failure recorded, exponential backoff, retry
//! 6. Five consecutive failures → key deactivated until operator action

pub mod classify;
pub mod error;
pub mod pool;
pub mod retry;

pub use classify::{Classification, QuotaFailure, classify, is_quota_error, parse_quota_failure};
pub use error::{Error, Result};
pub use pool::{KeyPool, PoolStats};
pub use retry::{RetryPolicy, SpeechService};
