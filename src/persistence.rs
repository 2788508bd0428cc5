//! State snapshot persistence
//!
//! The whole process state is one JSON document: a map of instance name to
//! snapshot record. Coordinators forward a fresh snapshot after every applied
//! event; the persistence task keeps the latest per instance and writes the
//! document on an autosave interval, plus a final flush on shutdown. Writes
//! go through a temp file and rename so a crash mid-write never leaves a
//! half-written document behind.

use {
    crate::aggregate::{current_timestamp, InstanceSnapshot},
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
    std::error::Error,
    std::fs,
    std::path::PathBuf,
    std::sync::Arc,
    std::time::Duration,
    tokio::sync::mpsc,
    tokio::time::interval,
};

type StoreError = Box<dyn Error + Send + Sync>;

/// On-disk layout of the state file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub saved_at: i64,
    pub instances: HashMap<String, InstanceSnapshot>,
}

/// Writer/loader seam for the persisted state document
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, instances: &HashMap<String, InstanceSnapshot>) -> Result<(), StoreError>;

    /// Load the persisted map. A missing or unparsable file is a fresh start
    /// (empty map), not an error.
    async fn load(&self) -> Result<HashMap<String, InstanceSnapshot>, StoreError>;
}

/// JSON-file implementation of [`SnapshotStore`]
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for JsonSnapshotStore {
    async fn save(&self, instances: &HashMap<String, InstanceSnapshot>) -> Result<(), StoreError> {
        let document = StateDocument {
            saved_at: current_timestamp(),
            instances: instances.clone(),
        };
        let json = serde_json::to_string_pretty(&document)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // temp file + rename keeps the document atomic on the same filesystem
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        log::debug!(
            "Saved {} instance snapshots to {}",
            document.instances.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> Result<HashMap<String, InstanceSnapshot>, StoreError> {
        if !self.path.exists() {
            log::info!("No existing state file found: {}", self.path.display());
            return Ok(HashMap::new());
        }

        let json = fs::read_to_string(&self.path)?;
        match serde_json::from_str::<StateDocument>(&json) {
            Ok(document) => {
                log::info!(
                    "Loaded {} instance snapshots from {}",
                    document.instances.len(),
                    self.path.display()
                );
                Ok(document.instances)
            }
            Err(e) => {
                log::warn!(
                    "State file {} is not readable ({}), starting fresh",
                    self.path.display(),
                    e
                );
                Ok(HashMap::new())
            }
        }
    }
}

/// Background task that buffers the latest snapshot per instance and
/// autosaves the document on an interval. Performs a final flush when the
/// snapshot channel closes.
pub async fn persistence_task(
    mut rx: mpsc::Receiver<(String, InstanceSnapshot)>,
    store: Arc<dyn SnapshotStore>,
    autosave_interval: Duration,
) {
    let mut timer = interval(autosave_interval);
    let mut latest: HashMap<String, InstanceSnapshot> = HashMap::new();
    let mut dirty = false;

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some((name, snapshot)) => {
                    latest.insert(name, snapshot);
                    dirty = true;
                }
                None => break,
            },
            _ = timer.tick() => {
                if dirty {
                    match store.save(&latest).await {
                        Ok(()) => dirty = false,
                        Err(e) => log::warn!("Failed to save state snapshot: {}", e),
                    }
                }
            }
        }
    }

    if dirty {
        if let Err(e) = store.save(&latest).await {
            log::error!("Final state flush failed: {}", e);
        } else {
            log::info!("Final state flush complete ({} instances)", latest.len());
        }
    }
}
