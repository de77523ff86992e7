//! Key metrics records and shared persistence for the speech key pool
//!
//! One `KeyMetrics` record exists per upstream API key: usage counters,
//! configured limits, window anchors, and failure state. Records live in a
//! `KeyStore` shared by every process instance; the store is a passive
//! key-value adapter with no knowledge of selection or retry policy.
//!
//! Record lifecycle:
//! 1. Pool initialization derives an id from each configured secret and
//!    persists a fresh record unless one already exists
//! 2. The pool mutates counters and failure state through get/set
//! 3. Records are never deleted by this code (key rotation is operational)

pub mod error;
pub mod record;
pub mod store;

pub use error::{Error, Result};
pub use record::{KeyLimits, KeyMetrics, derive_key_id, now_millis};
pub use store::{JsonFileStore, KeyStore};
