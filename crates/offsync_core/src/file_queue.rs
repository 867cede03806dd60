//! File-backed sync queue.

use crate::error::{DataStoreError, DataStoreResult};
use crate::sync_queue::{coalesce, PendingOperation, SyncQueue};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A sync queue persisted as a JSON file.
///
/// Pending operations survive process restarts. Every mutation rewrites
/// the whole file (temporary file, then rename) while the queue lock is
/// held, so the on-disk state always matches a state the queue has been in.
#[derive(Debug)]
pub struct FileSyncQueue {
    path: PathBuf,
    operations: Mutex<Vec<PendingOperation>>,
}

impl FileSyncQueue {
    /// Opens the queue stored at `path`, creating an empty one if missing.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the file cannot be read and `Serialization` if
    /// its contents are not a queue.
    pub fn open(path: impl AsRef<Path>) -> DataStoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let operations = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        tracing::debug!(path = %path.display(), pending = operations.len(), "opened sync queue");

        Ok(Self {
            path,
            operations: Mutex::new(operations),
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, operations: &[PendingOperation]) -> DataStoreResult<()> {
        let bytes = serde_json::to_vec(operations)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path).map_err(|err| {
            DataStoreError::Storage(format!(
                "failed to replace {}: {err}",
                self.path.display()
            ))
        })
    }
}

impl SyncQueue for FileSyncQueue {
    fn enqueue(&self, operation: PendingOperation) -> DataStoreResult<()> {
        let mut operations = self.operations.lock();
        let mut next = operations.clone();
        coalesce(&mut next, operation);
        self.persist(&next)?;
        *operations = next;
        Ok(())
    }

    fn pending_operations(&self, collection: &str) -> DataStoreResult<Vec<PendingOperation>> {
        Ok(self
            .operations
            .lock()
            .iter()
            .filter(|op| op.collection == collection)
            .cloned()
            .collect())
    }

    fn remove(&self, operation: &PendingOperation) -> DataStoreResult<bool> {
        let mut operations = self.operations.lock();
        let next: Vec<PendingOperation> = operations
            .iter()
            .filter(|op| op.id != operation.id)
            .cloned()
            .collect();
        if next.len() == operations.len() {
            return Ok(false);
        }
        self.persist(&next)?;
        *operations = next;
        Ok(true)
    }

    fn remove_all(&self, collection: &str) -> DataStoreResult<Vec<PendingOperation>> {
        let mut operations = self.operations.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = operations
            .iter()
            .cloned()
            .partition(|op| op.collection == collection);
        if !removed.is_empty() {
            self.persist(&kept)?;
            *operations = kept;
        }
        Ok(removed)
    }

    fn replace(
        &self,
        operation: &PendingOperation,
        replacement: PendingOperation,
    ) -> DataStoreResult<bool> {
        let mut operations = self.operations.lock();
        let Some(index) = operations.iter().position(|op| op.id == operation.id) else {
            return Ok(false);
        };
        let mut next = operations.clone();
        next[index] = replacement;
        self.persist(&next)?;
        *operations = next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{HttpMethod, RequestSpec};
    use serde_json::json;
    use tempfile::TempDir;

    fn op(object_id: &str) -> PendingOperation {
        PendingOperation::new(
            "books",
            Some(object_id.to_string()),
            RequestSpec::new(HttpMethod::Put, format!("/appdata/kid/books/{object_id}"))
                .with_body(json!({"_id": object_id})),
        )
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue").join("pending.json");

        {
            let queue = FileSyncQueue::open(&path).unwrap();
            queue.enqueue(op("1")).unwrap();
            queue.enqueue(op("2")).unwrap();
        }

        let queue = FileSyncQueue::open(&path).unwrap();
        let pending = queue.pending_operations("books").unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].object_id.as_deref(), Some("1"));

        assert!(queue.remove(&pending[0]).unwrap());
        drop(queue);

        let queue = FileSyncQueue::open(&path).unwrap();
        assert_eq!(queue.count("books").unwrap(), 1);
    }

    #[test]
    fn corrupt_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending.json");
        fs::write(&path, b"not json").unwrap();

        let result = FileSyncQueue::open(&path);
        assert!(matches!(result, Err(DataStoreError::Serialization(_))));
    }

    #[test]
    fn remove_all_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending.json");

        let queue = FileSyncQueue::open(&path).unwrap();
        queue.enqueue(op("1")).unwrap();
        assert_eq!(queue.remove_all("books").unwrap().len(), 1);
        drop(queue);

        let queue = FileSyncQueue::open(&path).unwrap();
        assert_eq!(queue.count("books").unwrap(), 0);
    }

    #[test]
    fn replace_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending.json");

        let queue = FileSyncQueue::open(&path).unwrap();
        let first = op("1");
        queue.enqueue(first.clone()).unwrap();
        assert!(queue.replace(&first, op("9")).unwrap());
        drop(queue);

        let queue = FileSyncQueue::open(&path).unwrap();
        let pending = queue.pending_operations("books").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].object_id.as_deref(), Some("9"));
    }
}
