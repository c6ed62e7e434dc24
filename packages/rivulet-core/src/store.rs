//! Persistence seam for file and queue records

use crate::error::{DownloadError, Result};
use crate::model::{DownloadFile, DownloadQueue, FileId, QueueId};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Update-and-reload contract of the persistence collaborator
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn load_files(&self) -> Result<Vec<DownloadFile>>;

    async fn load_queues(&self) -> Result<Vec<DownloadQueue>>;

    /// Insert or replace a batch of file records
    async fn update_files(&self, files: &[DownloadFile]) -> Result<()>;

    async fn update_queues(&self, queues: &[DownloadQueue]) -> Result<()>;

    async fn delete_file(&self, id: FileId) -> Result<()>;

    async fn delete_queue(&self, id: QueueId) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    files: BTreeMap<FileId, DownloadFile>,
    #[serde(default)]
    queues: BTreeMap<QueueId, DownloadQueue>,
}

impl Snapshot {
    fn apply_files(&mut self, files: &[DownloadFile]) {
        for file in files {
            self.files.insert(file.id, file.clone());
        }
    }

    fn apply_queues(&mut self, queues: &[DownloadQueue]) {
        for queue in queues {
            self.queues.insert(queue.id, queue.clone());
        }
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: RwLock<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(files: Vec<DownloadFile>, queues: Vec<DownloadQueue>) -> Self {
        let mut snapshot = Snapshot::default();
        snapshot.apply_files(&files);
        snapshot.apply_queues(&queues);
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub fn file(&self, id: FileId) -> Option<DownloadFile> {
        self.snapshot.read().files.get(&id).cloned()
    }

    pub fn queue(&self, id: QueueId) -> Option<DownloadQueue> {
        self.snapshot.read().queues.get(&id).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.snapshot.read().files.len()
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn load_files(&self) -> Result<Vec<DownloadFile>> {
        Ok(self.snapshot.read().files.values().cloned().collect())
    }

    async fn load_queues(&self) -> Result<Vec<DownloadQueue>> {
        Ok(self.snapshot.read().queues.values().cloned().collect())
    }

    async fn update_files(&self, files: &[DownloadFile]) -> Result<()> {
        self.snapshot.write().apply_files(files);
        Ok(())
    }

    async fn update_queues(&self, queues: &[DownloadQueue]) -> Result<()> {
        self.snapshot.write().apply_queues(queues);
        Ok(())
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        self.snapshot.write().files.remove(&id);
        Ok(())
    }

    async fn delete_queue(&self, id: QueueId) -> Result<()> {
        self.snapshot.write().queues.remove(&id);
        Ok(())
    }
}

/// Store keeping all records in one pretty-printed JSON file
pub struct JsonStore {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl JsonStore {
    /// Open the store, starting empty when the file does not exist yet
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| DownloadError::storage(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| DownloadError::storage(e.to_string()))?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl FileStore for JsonStore {
    async fn load_files(&self) -> Result<Vec<DownloadFile>> {
        Ok(self.snapshot.lock().await.files.values().cloned().collect())
    }

    async fn load_queues(&self) -> Result<Vec<DownloadQueue>> {
        Ok(self.snapshot.lock().await.queues.values().cloned().collect())
    }

    async fn update_files(&self, files: &[DownloadFile]) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.apply_files(files);
        self.write(&snapshot).await
    }

    async fn update_queues(&self, queues: &[DownloadQueue]) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.apply_queues(queues);
        self.write(&snapshot).await
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.files.remove(&id).is_some() {
            self.write(&snapshot).await?;
        }
        Ok(())
    }

    async fn delete_queue(&self, id: QueueId) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.queues.remove(&id).is_some() {
            self.write(&snapshot).await?;
        }
        Ok(())
    }
}

enum PersistOp {
    Files(Vec<DownloadFile>),
    Queues(Vec<DownloadQueue>),
    DeleteFile(FileId),
    DeleteQueue(QueueId),
    Flush(oneshot::Sender<()>),
}

/// Single consumer applying store updates in submission order
///
/// Submitting never blocks; failures are logged since the in-memory records
/// stay authoritative.
#[derive(Clone)]
pub(crate) struct PersistWriter {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl PersistWriter {
    pub(crate) fn spawn(store: Arc<dyn FileStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let result = match op {
                    PersistOp::Files(files) => store.update_files(&files).await,
                    PersistOp::Queues(queues) => store.update_queues(&queues).await,
                    PersistOp::DeleteFile(id) => store.delete_file(id).await,
                    PersistOp::DeleteQueue(id) => store.delete_queue(id).await,
                    PersistOp::Flush(done) => {
                        let _ = done.send(());
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    tracing::error!("failed to persist download records: {}", e);
                }
            }
        });
        Self { tx }
    }

    fn submit(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            tracing::error!("persistence writer is closed");
        }
    }

    pub(crate) fn update_files(&self, files: Vec<DownloadFile>) {
        if !files.is_empty() {
            self.submit(PersistOp::Files(files));
        }
    }

    pub(crate) fn update_queues(&self, queues: Vec<DownloadQueue>) {
        if !queues.is_empty() {
            self.submit(PersistOp::Queues(queues));
        }
    }

    pub(crate) fn delete_file(&self, id: FileId) {
        self.submit(PersistOp::DeleteFile(id));
    }

    pub(crate) fn delete_queue(&self, id: QueueId) {
        self.submit(PersistOp::DeleteQueue(id));
    }

    /// Wait until everything submitted so far reached the store
    pub(crate) async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(PersistOp::Flush(done_tx));
        let _ = done_rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DownloadStatus;
    use tempfile::TempDir;

    fn file(id: u64, name: &str) -> DownloadFile {
        DownloadFile::new(FileId(id), format!("http://example.com/{}", name), "/downloads", name)
    }

    #[tokio::test]
    async fn test_json_store_reloads_records() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("downloads.json");

        let store = JsonStore::open(&path).await.unwrap();
        assert!(store.load_files().await.unwrap().is_empty());

        let mut paused = file(1, "a.iso");
        paused.status = DownloadStatus::Paused;
        paused.download_package = Some("{\"chunks\":[]}".to_string());
        store
            .update_files(&[paused.clone(), file(2, "b.iso")])
            .await
            .unwrap();
        store
            .update_queues(&[DownloadQueue::new(QueueId(1), "Main Queue")])
            .await
            .unwrap();
        store.delete_file(FileId(2)).await.unwrap();

        let reopened = JsonStore::open(&path).await.unwrap();
        let files = reopened.load_files().await.unwrap();
        assert_eq!(files, vec![paused]);
        let queues = reopened.load_queues().await.unwrap();
        assert_eq!(queues[0].title, "Main Queue");
    }

    #[tokio::test]
    async fn test_json_store_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("downloads.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let result = JsonStore::open(&path).await;
        assert!(matches!(result, Err(DownloadError::Storage(_))));
    }

    #[tokio::test]
    async fn test_writer_applies_updates_in_order() {
        let store = Arc::new(MemoryStore::new());
        let writer = PersistWriter::spawn(store.clone());

        let mut record = file(7, "c.zip");
        writer.update_files(vec![record.clone()]);
        record.status = DownloadStatus::Completed;
        writer.update_files(vec![record.clone()]);
        writer.flush().await;

        assert_eq!(store.file(FileId(7)).unwrap().status, DownloadStatus::Completed);

        writer.delete_file(FileId(7));
        writer.flush().await;
        assert_eq!(store.file_count(), 0);
    }
}
