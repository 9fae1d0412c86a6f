//! Persistence seam for parsed patient batches.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use labrisk_core::{LabRiskError, LabRiskResult, PatientBatch};
use serde::{Deserialize, Serialize};

/// Identifier handed out by a [`BatchStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait BatchStore: Send + Sync {
    /// Persist every batch, returning one id per batch in the same order.
    fn store(&self, batches: &[PatientBatch]) -> LabRiskResult<Vec<BatchId>>;

    /// Fetch a stored batch. Unknown ids yield `Ok(None)`.
    fn load(&self, id: &BatchId) -> LabRiskResult<Option<PatientBatch>>;
}

/// Process-local store; ids are insertion indices.
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    batches: Mutex<Vec<PatientBatch>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored batches. A poisoned lock still reports the data it guards.
    pub fn len(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BatchStore for MemoryBatchStore {
    fn store(&self, batches: &[PatientBatch]) -> LabRiskResult<Vec<BatchId>> {
        let mut stored = self
            .batches
            .lock()
            .map_err(|err| LabRiskError::Persistence(err.to_string()))?;

        let first = stored.len();
        stored.extend_from_slice(batches);
        Ok((first..stored.len())
            .map(|index| BatchId(index.to_string()))
            .collect())
    }

    fn load(&self, id: &BatchId) -> LabRiskResult<Option<PatientBatch>> {
        let stored = self
            .batches
            .lock()
            .map_err(|err| LabRiskError::Persistence(err.to_string()))?;

        Ok(id
            .as_str()
            .parse::<usize>()
            .ok()
            .and_then(|index| stored.get(index).cloned()))
    }
}

/// One pretty-printed JSON file per batch under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryBatchStore {
    root: PathBuf,
}

impl DirectoryBatchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &BatchId) -> Option<PathBuf> {
        let valid = !id.as_str().is_empty()
            && id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !id.as_str().starts_with('.');
        valid.then(|| self.root.join(format!("{id}.json")))
    }

    fn store_stamped(
        &self,
        batches: &[PatientBatch],
        stamp: &str,
    ) -> LabRiskResult<Vec<BatchId>> {
        let mut written: Vec<BatchId> = Vec::with_capacity(batches.len());
        for (index, batch) in batches.iter().enumerate() {
            let id = BatchId(format!("oru-{stamp}-{index:04}"));
            if let Err(err) = self.write_batch(&id, batch) {
                self.remove_all(&written);
                return Err(err);
            }
            written.push(id);
        }
        Ok(written)
    }

    fn write_batch(&self, id: &BatchId, batch: &PatientBatch) -> LabRiskResult<()> {
        let path = self.root.join(format!("{id}.json"));
        let json = serde_json::to_vec_pretty(batch)
            .map_err(|err| LabRiskError::Persistence(err.to_string()))?;
        std::fs::write(&path, json)
            .map_err(|err| LabRiskError::Persistence(format!("{}: {err}", path.display())))
    }

    /// A failed `store` leaves no partial files behind.
    fn remove_all(&self, ids: &[BatchId]) {
        for id in ids {
            let path = self.root.join(format!("{id}.json"));
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to remove partial batch"
                );
            }
        }
    }
}

impl BatchStore for DirectoryBatchStore {
    fn store(&self, batches: &[PatientBatch]) -> LabRiskResult<Vec<BatchId>> {
        std::fs::create_dir_all(&self.root).map_err(|err| {
            LabRiskError::Persistence(format!("{}: {err}", self.root.display()))
        })?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string();
        self.store_stamped(batches, &stamp)
    }

    fn load(&self, id: &BatchId) -> LabRiskResult<Option<PatientBatch>> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path).map_err(|err| {
            LabRiskError::Persistence(format!("{}: {err}", path.display()))
        })?;
        let batch = serde_json::from_str(&json).map_err(|err| {
            LabRiskError::Parse(format!("{}: {err}", path.display()))
        })?;
        Ok(Some(batch))
    }
}
