//! Download file state machine
//!
//! [`DownloadService`] owns every file record and applies all transitions:
//! user requests (start, pause, resume, stop, re-download, delete) and
//! transport events. Each transition happens inside the file arena lock
//! without awaiting; long-running work runs on spawned tasks and comes back
//! through [`DownloadService::apply_event`] or the finish queue.

mod control;
mod events;
mod runtime;

pub(crate) use runtime::StopWait;

use crate::error::{DownloadError, Result};
use crate::finish::FinishQueue;
use crate::hooks::{CompletionHookRegistry, PauseCallback, PauseSubscriptions, SubscriptionId};
use crate::model::{Credentials, DownloadFile, DownloadStatus, FileId, QueueId};
use crate::store::{FileStore, MemoryStore, PersistWriter};
use crate::system::{DiskSpace, Fs2DiskSpace, Notifier, SoundKind, TracingNotifier};
use crate::telemetry::{percent_of, TransferSnapshot};
use crate::transport::{EventSink, PumpMessage, Transport, TransportConfig, TransportEvent};
use parking_lot::RwLock;
use rivulet_config::{DuplicateAction, Settings};
use runtime::FileEntry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};

const EVENT_CAPACITY: usize = 256;

/// Typed outcome published after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum FileEvent {
    Added(FileId),
    StatusChanged {
        id: FileId,
        from: DownloadStatus,
        to: DownloadStatus,
    },
    Paused(FileId),
    /// The finish queue is done with the file
    Finished {
        id: FileId,
        status: DownloadStatus,
    },
    Warning {
        id: FileId,
        message: String,
    },
    Removed(FileId),
}

/// A URL submitted for download
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub url: String,
    pub save_location: PathBuf,
    pub file_name: String,
    pub referer: Option<String>,
    pub page_address: Option<String>,
    pub credentials: Option<Credentials>,
    pub category_id: Option<u64>,
    pub size: Option<u64>,
    pub is_size_unknown: bool,
    pub queue: Option<QueueId>,
    /// Overrides the configured duplicate-link action
    pub duplicate_action: Option<DuplicateAction>,
}

impl NewDownload {
    pub fn new(
        url: impl Into<String>,
        save_location: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            save_location: save_location.into(),
            file_name: file_name.into(),
            referer: None,
            page_address: None,
            credentials: None,
            category_id: None,
            size: None,
            is_size_unknown: false,
            queue: None,
            duplicate_action: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self.is_size_unknown = false;
        self
    }

    pub fn with_unknown_size(mut self) -> Self {
        self.size = None;
        self.is_size_unknown = true;
        self
    }

    pub fn with_queue(mut self, queue: QueueId) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_duplicate_action(mut self, action: DuplicateAction) -> Self {
        self.duplicate_action = Some(action);
        self
    }
}

/// What `add_file` did with the submitted URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added(FileId),
    /// The URL is already downloaded; its completion was surfaced instead
    ShowComplete(FileId),
    Resumed(FileId),
    Started(FileId),
    /// The existing record is already being downloaded
    AlreadyActive(FileId),
}

impl AddOutcome {
    pub fn file_id(&self) -> FileId {
        match *self {
            AddOutcome::Added(id)
            | AddOutcome::ShowComplete(id)
            | AddOutcome::Resumed(id)
            | AddOutcome::Started(id)
            | AddOutcome::AlreadyActive(id) => id,
        }
    }
}

struct Inner {
    files: RwLock<BTreeMap<FileId, FileEntry>>,
    next_id: AtomicU64,
    settings: RwLock<Settings>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn FileStore>,
    notifier: Arc<dyn Notifier>,
    disk: Arc<dyn DiskSpace>,
    hooks: CompletionHookRegistry,
    pause_subscriptions: PauseSubscriptions,
    events: broadcast::Sender<FileEvent>,
    pump: mpsc::UnboundedSender<PumpMessage>,
    finish: FinishQueue,
    persist: PersistWriter,
    /// Bumped for every pumped event and finished file
    activity: AtomicU64,
}

/// Builder for [`DownloadService`]
pub struct DownloadServiceBuilder {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn FileStore>>,
    settings: Settings,
    notifier: Option<Arc<dyn Notifier>>,
    disk: Option<Arc<dyn DiskSpace>>,
}

impl DownloadServiceBuilder {
    pub fn store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn disk_space(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Build the service and spawn its background tasks
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> DownloadService {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn FileStore>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn Notifier>);
        let disk = self
            .disk
            .unwrap_or_else(|| Arc::new(Fs2DiskSpace) as Arc<dyn DiskSpace>);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let persist = PersistWriter::spawn(Arc::clone(&store));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let (pump, pump_rx) = mpsc::unbounded_channel();
            spawn_event_pump(weak.clone(), pump_rx);

            let finish_owner = weak.clone();
            let finish = FinishQueue::spawn(move |file_id| {
                let service = DownloadService::upgrade(&finish_owner)?;
                Some(async move { service.finish_file(file_id).await })
            });

            Inner {
                files: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                settings: RwLock::new(self.settings),
                transport: self.transport,
                store,
                notifier,
                disk,
                hooks: CompletionHookRegistry::new(),
                pause_subscriptions: PauseSubscriptions::new(),
                events,
                pump,
                finish,
                persist,
                activity: AtomicU64::new(0),
            }
        });

        DownloadService { inner }
    }
}

/// Marshals transport events onto the transition path, in arrival order
fn spawn_event_pump(owner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<PumpMessage>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                PumpMessage::Event(file_id, event) => {
                    let Some(service) = DownloadService::upgrade(&owner) else {
                        break;
                    };
                    service.apply_event(file_id, event);
                    service.inner.activity.fetch_add(1, Ordering::SeqCst);
                }
                PumpMessage::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
    });
}

/// Owner of all download files and their transitions
#[derive(Clone)]
pub struct DownloadService {
    inner: Arc<Inner>,
}

impl DownloadService {
    pub fn builder(transport: Arc<dyn Transport>) -> DownloadServiceBuilder {
        DownloadServiceBuilder {
            transport,
            store: None,
            settings: Settings::default(),
            notifier: None,
            disk: None,
        }
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    /// Load records from the store
    ///
    /// Files that were transferring when the process went away come back as
    /// Stopped; paused files keep their package and chunk table.
    pub async fn restore(&self) -> Result<usize> {
        let records = self.inner.store.load_files().await?;
        let mut files = self.inner.files.write();
        let mut max_id = 0;
        for mut record in records {
            max_id = max_id.max(record.id.0);
            if matches!(
                record.status,
                DownloadStatus::Downloading | DownloadStatus::Merging | DownloadStatus::Stopping
            ) {
                record.status = DownloadStatus::Stopped;
            }
            let mut entry = FileEntry::new(record);
            if entry.record.status == DownloadStatus::Paused {
                restore_chunks(&mut entry);
            }
            files.insert(entry.record.id, entry);
        }
        self.inner.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
        tracing::debug!("restored {} download files", files.len());
        Ok(files.len())
    }

    pub fn settings(&self) -> Settings {
        self.inner.settings.read().clone()
    }

    /// Re-inject settings; the next transport start picks them up
    pub fn apply_settings(&self, settings: Settings) {
        *self.inner.settings.write() = settings;
        tracing::debug!("download settings changed");
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::from_settings(&self.inner.settings.read())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.inner.events.subscribe()
    }

    pub fn hooks(&self) -> &CompletionHookRegistry {
        &self.inner.hooks
    }

    pub fn on_paused(&self, file_id: FileId, callback: PauseCallback) -> SubscriptionId {
        self.inner.pause_subscriptions.subscribe(file_id, callback)
    }

    pub fn unsubscribe_paused(&self, file_id: FileId, subscription: SubscriptionId) -> bool {
        self.inner
            .pause_subscriptions
            .unsubscribe(file_id, subscription)
    }

    pub fn file(&self, file_id: FileId) -> Option<DownloadFile> {
        self.inner
            .files
            .read()
            .get(&file_id)
            .map(|entry| entry.record.clone())
    }

    pub fn files(&self) -> Vec<DownloadFile> {
        self.inner
            .files
            .read()
            .values()
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn status(&self, file_id: FileId) -> Option<DownloadStatus> {
        self.inner
            .files
            .read()
            .get(&file_id)
            .map(|entry| entry.record.status)
    }

    /// Telemetry view of a file
    pub fn transfer(&self, file_id: FileId) -> Option<TransferSnapshot> {
        let files = self.inner.files.read();
        let entry = files.get(&file_id)?;
        let record = &entry.record;
        Some(TransferSnapshot {
            status: record.status,
            received: record.downloaded_size,
            total: record.size,
            percent: record.download_progress,
            transfer_rate: record.transfer_rate,
            time_left: record.time_left,
            elapsed: record.elapsed_time,
            merge_percent: entry.runtime.telemetry.merge_percent,
            chunks: entry.runtime.telemetry.chunks.views(),
        })
    }

    /// Result of the resume-support probe of the current run
    pub fn supports_resume(&self, file_id: FileId) -> Option<bool> {
        self.inner
            .files
            .read()
            .get(&file_id)
            .and_then(|entry| entry.runtime.supports_resume)
    }

    /// Wait until every queued transport event and finished file is handled
    /// and the resulting records reached the store
    pub async fn settle(&self) {
        loop {
            let before = self.inner.activity.load(Ordering::SeqCst);
            let (done_tx, done_rx) = oneshot::channel();
            if self.inner.pump.send(PumpMessage::Barrier(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
            self.inner.finish.drain().await;
            if self.inner.activity.load(Ordering::SeqCst) == before {
                break;
            }
        }
        self.inner.persist.flush().await;
    }

    fn event_sink(&self) -> EventSink {
        EventSink::new(self.inner.pump.clone())
    }

    fn publish(&self, event: FileEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn publish_status(&self, id: FileId, from: DownloadStatus, to: DownloadStatus) {
        if from != to {
            tracing::debug!("file {}: {} -> {}", id, from, to);
            self.publish(FileEvent::StatusChanged { id, from, to });
        }
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.inner.notifier
    }

    pub(crate) fn store(&self) -> &Arc<dyn FileStore> {
        &self.inner.store
    }

    pub(crate) fn persist(&self) -> &PersistWriter {
        &self.inner.persist
    }

    /// Request a sound if it is enabled in the settings
    pub(crate) fn play_sound(&self, kind: SoundKind) {
        let enabled = kind.is_enabled(&self.inner.settings.read().sounds);
        if enabled {
            self.inner.notifier.play_sound(kind);
        }
    }

    pub(crate) fn persist_file(&self, file_id: FileId) {
        if let Some(record) = self.file(file_id) {
            self.inner.persist.update_files(vec![record]);
        }
    }

    /// Members of a queue in scheduling order: priority, then insertion
    pub(crate) fn queue_members(&self, queue: QueueId) -> Vec<DownloadFile> {
        let mut members: Vec<DownloadFile> = self
            .inner
            .files
            .read()
            .values()
            .filter(|entry| entry.record.is_in_queue(queue))
            .map(|entry| entry.record.clone())
            .collect();
        members.sort_by_key(|file| (file.download_queue_priority.unwrap_or(i64::MAX), file.id));
        members
    }

    pub(crate) fn member_count(&self, queue: QueueId) -> usize {
        self.inner
            .files
            .read()
            .values()
            .filter(|entry| entry.record.is_in_queue(queue))
            .count()
    }

    pub(crate) fn supervisor(&self, file_id: FileId) -> Option<QueueId> {
        self.inner
            .files
            .read()
            .get(&file_id)
            .and_then(|entry| entry.runtime.supervised_by)
    }

    pub(crate) fn set_supervised(&self, file_id: FileId, queue: Option<QueueId>) {
        if let Some(entry) = self.inner.files.write().get_mut(&file_id) {
            entry.runtime.supervised_by = queue;
        }
    }

    /// Move a file behind every other member of its queue
    pub(crate) fn demote_in_queue(&self, file_id: FileId, queue: QueueId, count_error: bool) {
        let record = {
            let mut files = self.inner.files.write();
            let next = max_priority(&files, queue).map_or(0, |max| max + 1);
            let Some(entry) = files.get_mut(&file_id) else {
                return;
            };
            if !entry.record.is_in_queue(queue) {
                return;
            }
            entry.record.assign_queue(queue, next);
            if count_error {
                entry.record.count_of_error += 1;
            }
            entry.record.clone()
        };
        tracing::debug!(
            "file {} moved to priority {:?} in queue {} (errors: {})",
            file_id,
            record.download_queue_priority,
            queue,
            record.count_of_error
        );
        self.inner.persist.update_files(vec![record]);
    }

    pub(crate) fn reset_error_count(&self, file_id: FileId) {
        if let Some(entry) = self.inner.files.write().get_mut(&file_id) {
            entry.record.count_of_error = 0;
        }
    }

    /// Append files to a queue; Completed files are rejected
    pub(crate) fn assign_to_queue(&self, queue: QueueId, ids: &[FileId]) -> Result<()> {
        let changed = {
            let mut files = self.inner.files.write();
            for id in ids {
                let entry = files.get(id).ok_or(DownloadError::FileNotFound(*id))?;
                if entry.record.status == DownloadStatus::Completed {
                    return Err(DownloadError::invalid_state(
                        *id,
                        "queue",
                        DownloadStatus::Completed,
                    ));
                }
            }
            let mut next = max_priority(&files, queue).map_or(0, |max| max + 1);
            let mut changed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(entry) = files.get_mut(id) {
                    if entry.record.is_in_queue(queue) {
                        continue;
                    }
                    entry.record.assign_queue(queue, next);
                    next += 1;
                    changed.push(entry.record.clone());
                }
            }
            changed
        };
        self.inner.persist.update_files(changed);
        Ok(())
    }

    /// Remove queue membership; `None` detaches every member
    pub(crate) fn detach_from_queue(&self, queue: QueueId, ids: Option<&[FileId]>) -> Vec<FileId> {
        let changed: Vec<DownloadFile> = {
            let mut files = self.inner.files.write();
            files
                .values_mut()
                .filter(|entry| entry.record.is_in_queue(queue))
                .filter(|entry| ids.map_or(true, |ids| ids.contains(&entry.record.id)))
                .map(|entry| {
                    entry.record.detach_queue();
                    entry.record.clone()
                })
                .collect()
        };
        let detached = changed.iter().map(|file| file.id).collect();
        self.inner.persist.update_files(changed);
        detached
    }

    /// Renumber the given members in order, starting at 0; other members follow
    pub(crate) fn reorder_queue(&self, queue: QueueId, ordered: &[FileId]) -> Result<()> {
        let changed = {
            let mut files = self.inner.files.write();
            for id in ordered {
                let entry = files.get(id).ok_or(DownloadError::FileNotFound(*id))?;
                if !entry.record.is_in_queue(queue) {
                    return Err(DownloadError::invalid_state(
                        *id,
                        "reorder",
                        entry.record.status,
                    ));
                }
            }
            let mut rest: Vec<(i64, FileId)> = files
                .values()
                .filter(|entry| entry.record.is_in_queue(queue))
                .filter(|entry| !ordered.contains(&entry.record.id))
                .map(|entry| (entry.record.download_queue_priority.unwrap_or(i64::MAX), entry.record.id))
                .collect();
            rest.sort();

            let order = ordered
                .iter()
                .copied()
                .chain(rest.into_iter().map(|(_, id)| id));
            let mut changed = Vec::new();
            for (priority, id) in order.enumerate() {
                if let Some(entry) = files.get_mut(&id) {
                    entry.record.assign_queue(queue, priority as i64);
                    changed.push(entry.record.clone());
                }
            }
            changed
        };
        self.inner.persist.update_files(changed);
        Ok(())
    }
}

fn max_priority(files: &BTreeMap<FileId, FileEntry>, queue: QueueId) -> Option<i64> {
    files
        .values()
        .filter(|entry| entry.record.is_in_queue(queue))
        .filter_map(|entry| entry.record.download_queue_priority)
        .max()
}

/// Rebuild the chunk table of a paused file from its stored package
fn restore_chunks(entry: &mut FileEntry) {
    let Some(blob) = entry.record.download_package.as_deref() else {
        return;
    };
    match crate::transport::DownloadPackage::from_blob(blob) {
        Ok(package) => entry.runtime.telemetry.chunks.restore(&package),
        // Packages are opaque; transports may use their own format
        Err(e) => tracing::debug!("package of file {} not readable: {}", entry.record.id, e),
    }
}
