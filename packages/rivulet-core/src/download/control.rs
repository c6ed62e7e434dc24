//! User-initiated transitions

use super::runtime::{FileEntry, StopTracker, StopWait};
use super::{restore_chunks, AddOutcome, DownloadService, FileEvent, NewDownload};
use crate::duplicate::{self, DuplicateResolution};
use crate::error::{DownloadError, Result};
use crate::model::{DownloadFile, DownloadStatus, FileId};
use crate::telemetry::{FileTelemetry, TICK_INTERVAL};
use crate::transport::{FinishOutcome, StartRequest, TransportEvent};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

impl DownloadService {
    /// Add a submitted URL, resolving duplicates first
    pub async fn add_file(&self, new: NewDownload) -> Result<AddOutcome> {
        let action = new
            .duplicate_action
            .unwrap_or_else(|| self.inner.settings.read().duplicate_action);
        let same_url: Vec<DownloadFile> = self
            .files()
            .into_iter()
            .filter(|file| file.url == new.url)
            .collect();

        let mut file_name = new.file_name.clone();
        if !same_url.is_empty() {
            let taken = self.names_in(&new.save_location);
            let resolution =
                duplicate::resolve(action, &new.url, &same_url, &new.save_location, &file_name, &taken)?;
            tracing::debug!("duplicate link {}: {:?}", new.url, resolution);
            match resolution {
                DuplicateResolution::AddWithName(name) => file_name = name,
                DuplicateResolution::ReplaceExisting { remove } => {
                    for id in remove {
                        self.delete_file(id, true).await?;
                    }
                }
                DuplicateResolution::ShowComplete(id) => {
                    if let Some(file) = self.file(id) {
                        self.inner.notifier.show_completion(&file);
                    }
                    return Ok(AddOutcome::ShowComplete(id));
                }
                DuplicateResolution::Resume(id) => {
                    self.resume(id)?;
                    return Ok(AddOutcome::Resumed(id));
                }
                DuplicateResolution::Start(id) => {
                    self.start(id)?;
                    return Ok(AddOutcome::Started(id));
                }
                DuplicateResolution::AlreadyActive(id) => return Ok(AddOutcome::AlreadyActive(id)),
            }
        }

        // Two records never share a target path
        let taken = self.names_in(&new.save_location);
        file_name = duplicate::unique_file_name(&new.save_location, &file_name, &taken);

        let id = FileId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let mut record = DownloadFile::new(id, new.url, new.save_location, file_name);
        record.referer = new.referer;
        record.page_address = new.page_address;
        record.credentials = new.credentials;
        record.category_id = new.category_id;
        record.size = new.size;
        record.is_size_unknown = new.is_size_unknown;

        {
            let mut files = self.inner.files.write();
            if let Some(queue) = new.queue {
                let next = super::max_priority(&files, queue).map_or(0, |max| max + 1);
                record.assign_queue(queue, next);
            }
            files.insert(id, FileEntry::new(record.clone()));
        }
        tracing::debug!("added file {}: {}", id, record.full_path().display());
        self.inner.persist.update_files(vec![record]);
        self.publish(FileEvent::Added(id));
        Ok(AddOutcome::Added(id))
    }

    fn names_in(&self, dir: &std::path::Path) -> HashSet<String> {
        self.inner
            .files
            .read()
            .values()
            .filter(|entry| entry.record.save_location == dir)
            .map(|entry| entry.record.file_name.clone())
            .collect()
    }

    /// Start a file that is None, Stopped or Error
    ///
    /// Returns once the transport accepted the request; progress arrives as
    /// transport events. A refusal leaves the status unchanged and is also
    /// reported to the notifier.
    pub fn start(&self, file_id: FileId) -> Result<()> {
        self.start_run(file_id, false)
    }

    /// Continue a paused file
    ///
    /// A live transport run is resumed in place. When the run is gone (after a
    /// restart of the process) a new one is started with the stored package.
    pub fn resume(&self, file_id: FileId) -> Result<()> {
        let live = {
            let files = self.inner.files.read();
            let entry = files
                .get(&file_id)
                .ok_or(DownloadError::FileNotFound(file_id))?;
            if entry.record.status != DownloadStatus::Paused {
                return Err(DownloadError::invalid_state(
                    file_id,
                    "resume",
                    entry.record.status,
                ));
            }
            entry.runtime.live_session
        };
        if !live {
            return self.start_run(file_id, true);
        }

        let token = {
            let mut files = self.inner.files.write();
            let entry = files
                .get_mut(&file_id)
                .ok_or(DownloadError::FileNotFound(file_id))?;
            if entry.record.status != DownloadStatus::Paused {
                return Err(DownloadError::invalid_state(
                    file_id,
                    "resume",
                    entry.record.status,
                ));
            }
            entry.record.status = DownloadStatus::Downloading;
            entry.record.last_try_date = Some(Utc::now());
            let token = CancellationToken::new();
            entry.runtime.ticker = Some(token.clone());
            token
        };
        self.publish_status(file_id, DownloadStatus::Paused, DownloadStatus::Downloading);
        self.spawn_ticker(file_id, token);

        if let Err(e) = self.inner.transport.resume(file_id) {
            tracing::warn!("transport refused to resume file {}: {}", file_id, e);
            self.apply_event(
                file_id,
                TransportEvent::Finished(FinishOutcome::Failed(e.to_string())),
            );
            return Err(e);
        }
        self.persist_file(file_id);
        Ok(())
    }

    /// Start or resume, whichever the status calls for
    pub fn request_start(&self, file_id: FileId) -> Result<()> {
        match self.status(file_id) {
            Some(DownloadStatus::Paused) => self.resume(file_id),
            Some(_) => self.start(file_id),
            None => Err(DownloadError::FileNotFound(file_id)),
        }
    }

    fn start_run(&self, file_id: FileId, from_paused: bool) -> Result<()> {
        let prepared = {
            let mut files = self.inner.files.write();
            let entry = files
                .get_mut(&file_id)
                .ok_or(DownloadError::FileNotFound(file_id))?;
            let status = entry.record.status;
            let allowed = if from_paused {
                status == DownloadStatus::Paused
            } else {
                status.can_start()
            };
            if !allowed {
                Err(DownloadError::invalid_state(file_id, "start", status))
            } else {
                self.check_disk_space(&entry.record).map(|()| {
                    entry.record.status = DownloadStatus::Downloading;
                    entry.record.last_try_date = Some(Utc::now());
                    entry.runtime.telemetry = FileTelemetry::resuming_from(entry.record.elapsed_time);
                    if from_paused {
                        restore_chunks(entry);
                    }
                    entry.runtime.last_error = None;
                    entry.runtime.live_session = true;
                    entry.runtime.supports_resume = None;
                    let ticker = CancellationToken::new();
                    let probe = CancellationToken::new();
                    entry.runtime.ticker = Some(ticker.clone());
                    entry.runtime.probe = Some(probe.clone());
                    let request = StartRequest::for_file(
                        &entry.record,
                        crate::transport::TransportConfig::from_settings(&self.inner.settings.read()),
                    );
                    (status, request, ticker, probe)
                })
            }
        };

        let (previous, request, ticker, probe) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.inner.notifier.start_refused(file_id, &e);
                return Err(e);
            }
        };

        self.publish_status(file_id, previous, DownloadStatus::Downloading);
        self.persist_file(file_id);
        self.spawn_ticker(file_id, ticker);
        self.spawn_probe(file_id, request.url.clone(), probe);

        if let Err(e) = self.inner.transport.start(request, self.event_sink()) {
            tracing::warn!("transport refused to start file {}: {}", file_id, e);
            self.apply_event(
                file_id,
                TransportEvent::Finished(FinishOutcome::Failed(e.to_string())),
            );
            return Err(e);
        }
        Ok(())
    }

    /// Free space must cover the bytes that are not on disk yet
    fn check_disk_space(&self, file: &DownloadFile) -> Result<()> {
        let size = match file.size {
            Some(size) => size,
            None if file.is_size_unknown => return Ok(()),
            None => return Err(DownloadError::UnknownSize(file.id)),
        };
        let on_disk = std::fs::metadata(file.full_path())
            .map(|meta| meta.len())
            .unwrap_or(0)
            .max(file.downloaded_size);
        let required = size.saturating_sub(on_disk);
        let available = self.inner.disk.available_space(&file.save_location)?;
        if available < required {
            return Err(DownloadError::InsufficientDiskSpace {
                path: file.save_location.clone(),
                required,
                available,
            });
        }
        Ok(())
    }

    /// Pause a downloading file and store the transport's package
    pub async fn pause(&self, file_id: FileId) -> Result<()> {
        {
            let mut files = self.inner.files.write();
            let entry = files
                .get_mut(&file_id)
                .ok_or(DownloadError::FileNotFound(file_id))?;
            if entry.record.status != DownloadStatus::Downloading {
                return Err(DownloadError::invalid_state(
                    file_id,
                    "pause",
                    entry.record.status,
                ));
            }
            entry.record.status = DownloadStatus::Paused;
            entry.record.transfer_rate = 0.0;
            entry.record.time_left = None;
            entry.runtime.stop_ticker();
            entry.runtime.telemetry.chunks.pause_all();
        }
        self.publish_status(file_id, DownloadStatus::Downloading, DownloadStatus::Paused);

        match self.inner.transport.pause(file_id).await {
            Ok(package) => {
                let mut files = self.inner.files.write();
                if let Some(entry) = files.get_mut(&file_id) {
                    if entry.record.status == DownloadStatus::Paused && package.is_some() {
                        entry.record.download_package = package;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("transport failed to pause file {}: {}", file_id, e);
                self.inner.notifier.warn(file_id, &e.to_string());
            }
        }

        self.persist_file(file_id);
        self.publish(FileEvent::Paused(file_id));
        self.inner.pause_subscriptions.notify(file_id);
        Ok(())
    }

    /// Stop a file; idempotent for Stopping and Stopped files
    ///
    /// With `ensure_stopped` the call returns once the transport confirmed
    /// the cancellation and the finish queue handled the file, or after the
    /// configured stop timeout.
    pub async fn stop(&self, file_id: FileId, ensure_stopped: bool) -> Result<()> {
        let wait = self.begin_stop(file_id, ensure_stopped)?;
        if ensure_stopped {
            if let Some(wait) = wait {
                self.wait_stopped(wait).await;
            }
        }
        Ok(())
    }

    /// Move the file to Stopping and request cancellation without waiting
    ///
    /// Returns a handle for the confirmation when there is something to wait
    /// for. `controlled` keeps the stop tracker until the waiter observed it.
    pub(crate) fn begin_stop(&self, file_id: FileId, controlled: bool) -> Result<Option<StopWait>> {
        let (previous, live, done) = {
            let mut files = self.inner.files.write();
            let entry = files
                .get_mut(&file_id)
                .ok_or(DownloadError::FileNotFound(file_id))?;
            let status = entry.record.status;
            if !status.can_stop() {
                // Stopping, or terminal but still inside the finish queue
                if status == DownloadStatus::Stopping || entry.runtime.in_finish {
                    let tracker = entry
                        .runtime
                        .stop
                        .get_or_insert_with(|| StopTracker::new(controlled));
                    tracker.controlled |= controlled;
                    return Ok(Some(StopWait {
                        file_id,
                        done: tracker.subscribe(),
                    }));
                }
                return Ok(None);
            }

            entry.record.status = DownloadStatus::Stopping;
            entry.record.transfer_rate = 0.0;
            entry.runtime.stop_ticker();
            entry.runtime.cancel_probe();
            let tracker = StopTracker::new(controlled);
            let done = tracker.subscribe();
            entry.runtime.stop = Some(tracker);
            (status, entry.runtime.live_session, done)
        };
        self.publish_status(file_id, previous, DownloadStatus::Stopping);

        let confirmed_locally = if live {
            match self.inner.transport.cancel(file_id) {
                Ok(()) => false,
                Err(e) => {
                    tracing::warn!("transport failed to cancel file {}: {}", file_id, e);
                    true
                }
            }
        } else {
            // Nothing is running that could confirm
            true
        };
        if confirmed_locally {
            self.apply_event(file_id, TransportEvent::Finished(FinishOutcome::Cancelled));
        }

        Ok(Some(StopWait { file_id, done }))
    }

    /// Await a stop confirmation, bounded by the stop timeout
    pub(crate) async fn wait_stopped(&self, wait: StopWait) {
        let file_id = wait.file_id;
        let timeout = Duration::from_secs(self.inner.settings.read().stop_timeout_secs);
        if tokio::time::timeout(timeout, wait.confirmed()).await.is_err() {
            tracing::warn!("file {} did not confirm the stop within {:?}", file_id, timeout);
        }

        let mut files = self.inner.files.write();
        if let Some(entry) = files.get_mut(&file_id) {
            if entry.record.status != DownloadStatus::Stopping && !entry.runtime.in_finish {
                entry.runtime.stop = None;
            }
        }
    }

    /// Reset a finished file so it can be downloaded from scratch
    pub async fn redownload(&self, file_id: FileId) -> Result<()> {
        let (previous, path) = {
            let mut files = self.inner.files.write();
            let entry = files
                .get_mut(&file_id)
                .ok_or(DownloadError::FileNotFound(file_id))?;
            let status = entry.record.status;
            if !status.is_finished() {
                return Err(DownloadError::invalid_state(file_id, "re-download", status));
            }
            entry.record.reset_progress();
            entry.record.status = DownloadStatus::None;
            entry.runtime.telemetry = FileTelemetry::default();
            entry.runtime.last_error = None;
            (status, entry.record.full_path())
        };

        remove_if_exists(&path).await?;
        self.publish_status(file_id, previous, DownloadStatus::None);
        self.persist_file(file_id);
        Ok(())
    }

    /// Remove a file record, stopping it first when it is active
    pub async fn delete_file(&self, file_id: FileId, delete_on_disk: bool) -> Result<()> {
        match self.status(file_id) {
            None => return Err(DownloadError::FileNotFound(file_id)),
            Some(status) if status.can_stop() || status == DownloadStatus::Stopping => {
                self.stop(file_id, true).await?;
            }
            Some(_) => {}
        }

        let removed = {
            let mut files = self.inner.files.write();
            files.remove(&file_id).map(|mut entry| {
                entry.runtime.teardown();
                entry.record
            })
        };
        let Some(record) = removed else {
            return Ok(());
        };
        self.inner.hooks.clear(file_id);
        self.inner.pause_subscriptions.clear(file_id);
        self.inner.persist.delete_file(file_id);
        if delete_on_disk {
            remove_if_exists(&record.full_path()).await?;
        }
        tracing::debug!("deleted file {}", file_id);
        self.publish(FileEvent::Removed(file_id));
        Ok(())
    }

    /// 250 ms telemetry timer: elapsed seconds and chunk states
    fn spawn_ticker(&self, file_id: FileId, token: CancellationToken) {
        let owner = self.downgrade();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(service) = DownloadService::upgrade(&owner) else {
                    break;
                };
                let mut files = service.inner.files.write();
                let Some(entry) = files.get_mut(&file_id) else {
                    break;
                };
                if entry.runtime.telemetry.elapsed.tick() {
                    entry.record.elapsed_time = entry.runtime.telemetry.elapsed.elapsed();
                }
                entry.runtime.telemetry.chunks.tick();
            }
        });
    }

    /// Ask the transport whether the server supports resuming
    ///
    /// Failures and cancellation both leave the file marked as not resumable.
    fn spawn_probe(&self, file_id: FileId, url: String, token: CancellationToken) {
        let owner = self.downgrade();
        let transport = std::sync::Arc::clone(&self.inner.transport);
        tokio::spawn(async move {
            let supported = tokio::select! {
                _ = token.cancelled() => return,
                result = transport.probe_resume_support(&url, token.clone()) => match result {
                    Ok(supported) => supported,
                    Err(e) => {
                        tracing::debug!("resume probe for file {} failed: {}", file_id, e);
                        false
                    }
                },
            };
            if token.is_cancelled() {
                return;
            }
            if let Some(service) = DownloadService::upgrade(&owner) {
                if let Some(entry) = service.inner.files.write().get_mut(&file_id) {
                    entry.runtime.supports_resume = Some(supported);
                }
            }
        });
    }
}

async fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
