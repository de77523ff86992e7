//! Shared key-value persistence for key metrics
//!
//! The `KeyStore` trait is deliberately narrow (get/set/ids) so it can be
//! backed by any store with per-key atomic writes. No cross-record
//! transactionality is ever required: every pool mutation is a full-record
//! read-then-write, and concurrent writers race with last-writer-wins.
//!
//! `JsonFileStore` is the bundled adapter: a JSON file mapping key ids to
//! records. All writes use atomic temp-file + rename to prevent corruption
//! on crash; a tokio Mutex serializes writes within one process.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::KeyMetrics;

/// Durable, shared persistence for key metrics records.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn KeyStore>` in the pool).
pub trait KeyStore: Send + Sync {
    /// Fetch one record by key id.
    fn get<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<KeyMetrics>>> + Send + 'a>>;

    /// Write one record, keyed by `record.id`, replacing any previous value.
    fn set<'a>(
        &'a self,
        record: &'a KeyMetrics,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// List all stored key ids.
    fn ids(&self) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>>;
}

/// File-backed key store.
///
/// Reads clone the in-memory state under a brief lock, so request-path
/// reads don't block on concurrent persistence.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<HashMap<String, KeyMetrics>>,
}

impl JsonFileStore {
    /// Load records from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// keys). The pool reports an empty pool until keys are configured.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading key store file: {e}")))?;
            let records: HashMap<String, KeyMetrics> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing key store file: {e}")))?;
            info!(path = %path.display(), keys = records.len(), "loaded key store");
            records
        } else {
            info!(path = %path.display(), "key store file not found, starting empty");
            let records = HashMap::new();
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl KeyStore for JsonFileStore {
    fn get<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<KeyMetrics>>> + Send + 'a>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(id).cloned())
        })
    }

    fn set<'a>(
        &'a self,
        record: &'a KeyMetrics,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(record.id.clone(), record.clone());
            write_atomic(&self.path, &state).await
        })
    }

    fn ids(&self) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.keys().cloned().collect())
        })
    }
}

/// Write records to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. File permissions are set to 0600 since records contain raw
/// API keys.
async fn write_atomic(path: &Path, data: &HashMap<String, KeyMetrics>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing key records: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("key store path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Io("key store path has no file name".into()))?;

    // Temp name carries the target file name so two stores sharing a
    // directory never rename over each other's in-flight write.
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp key store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting key store permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp key store file: {e}")))?;

    debug!(path = %path.display(), "persisted key store");
    Ok(())
}
