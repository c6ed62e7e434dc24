//! Download queue scheduler
//!
//! Decides which queue members download right now. A queue is self-driving
//! once started: every supervised file carries a one-shot completion hook
//! that feeds back into [`QueueScheduler::continue_queue`], so no polling is
//! needed apart from the schedule timer.
//!
//! Scheduling decisions for all queues happen under one arena lock. The
//! scheduler lock is always taken before the download service's locks and is
//! never held across an `.await`.

use crate::download::{DownloadService, StopWait};
use crate::error::{DownloadError, Result};
use crate::hooks::{FinishedFile, HookOutcome, HookResult, SubscriptionId};
use crate::model::{DownloadFile, DownloadQueue, DownloadStatus, FileId, QueueId, TurnOffComputerMode};
use crate::system::{SoundKind, SystemActions};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 64;

/// Title of the queue created on first run
pub const DEFAULT_QUEUE_TITLE: &str = "Main Queue";

/// Why a queue stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Nothing eligible is left and nothing is downloading
    Finished,
    /// Eligible files exist but none could be started
    Idle,
    User,
    Schedule,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Started(QueueId),
    Stopped { id: QueueId, reason: StopReason },
    FileStarted { queue: QueueId, file: FileId },
    Updated(QueueId),
    Deleted(QueueId),
}

/// Read-only view of a queue and its runtime state
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub queue: DownloadQueue,
    pub is_running: bool,
    pub is_schedule_enabled: bool,
    pub is_start_sound_played: bool,
    pub downloading_files: Vec<FileId>,
}

/// A file started by a queue; the ticket identifies its completion hook
#[derive(Debug, Clone, Copy)]
struct Supervision {
    ticket: u64,
    pause: Option<SubscriptionId>,
}

/// Runtime-only queue state
#[derive(Debug, Default)]
struct QueueRuntime {
    is_running: bool,
    is_schedule_enabled: bool,
    is_start_sound_played: bool,
    /// Active set in start order
    downloading_files: Vec<FileId>,
    supervision: HashMap<FileId, Supervision>,
}

#[derive(Debug)]
struct QueueEntry {
    record: DownloadQueue,
    runtime: QueueRuntime,
}

impl QueueEntry {
    fn new(record: DownloadQueue) -> Self {
        Self {
            record,
            runtime: QueueRuntime::default(),
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queue: self.record.clone(),
            is_running: self.runtime.is_running,
            is_schedule_enabled: self.runtime.is_schedule_enabled,
            is_start_sound_played: self.runtime.is_start_sound_played,
            downloading_files: self.runtime.downloading_files.clone(),
        }
    }
}

enum Continuation {
    Running(Vec<FileId>),
    Finished { alarm: bool },
    Idle,
}

#[derive(Debug, Clone, Copy)]
struct EndActions {
    turn_off: Option<TurnOffComputerMode>,
    exit: bool,
}

/// First half of a queue stop, performed without awaiting
struct StopPlan {
    queue: QueueId,
    reason: StopReason,
    play_sound: bool,
    run_end_actions: bool,
    stopped: Vec<FileId>,
    waits: Vec<StopWait>,
    end: EndActions,
}

struct SchedulerInner {
    queues: RwLock<BTreeMap<QueueId, QueueEntry>>,
    next_id: AtomicU64,
    next_ticket: AtomicU64,
    service: DownloadService,
    system: Arc<dyn SystemActions>,
    events: broadcast::Sender<QueueEvent>,
    /// Stops started from hook callbacks that are still waiting for files
    pending_stops: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Weak<SchedulerInner>,
}

/// Owner of all download queues
#[derive(Clone)]
pub struct QueueScheduler {
    inner: Arc<SchedulerInner>,
}

impl QueueScheduler {
    pub fn new(service: DownloadService, system: Arc<dyn SystemActions>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new_cyclic(|weak| SchedulerInner {
            queues: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
            service,
            system,
            events,
            pending_stops: Mutex::new(Vec::new()),
            weak_self: weak.clone(),
        });
        Self { inner }
    }

    fn upgrade(weak: &Weak<SchedulerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn service(&self) -> &DownloadService {
        &self.inner.service
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, event: QueueEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Load queue records from the store; none of them is running
    pub async fn restore(&self) -> Result<usize> {
        let records = self.inner.service.store().load_queues().await?;
        let mut queues = self.inner.queues.write();
        let mut max_id = 0;
        for record in records {
            max_id = max_id.max(record.id.0);
            queues.insert(record.id, QueueEntry::new(record));
        }
        self.inner.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
        tracing::debug!("restored {} download queues", queues.len());
        Ok(queues.len())
    }

    pub fn queues(&self) -> Vec<QueueSnapshot> {
        self.inner
            .queues
            .read()
            .values()
            .map(QueueEntry::snapshot)
            .collect()
    }

    pub fn queue(&self, id: QueueId) -> Option<QueueSnapshot> {
        self.inner.queues.read().get(&id).map(QueueEntry::snapshot)
    }

    /// Member files in scheduling order
    pub fn members(&self, id: QueueId) -> Vec<DownloadFile> {
        self.inner.service.queue_members(id)
    }

    /// A fresh queue record carrying the service-wide defaults from settings
    pub fn queue_template(&self, title: &str) -> DownloadQueue {
        let mut queue = DownloadQueue::new(QueueId(0), title);
        queue.include_paused_files = self.inner.service.settings().include_paused_files;
        queue
    }

    /// Add a queue; the id of `queue` is replaced by a fresh one
    pub fn create_queue(&self, mut queue: DownloadQueue) -> QueueId {
        let id = QueueId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        queue.id = id;
        let batch = {
            let mut queues = self.inner.queues.write();
            let mut batch = clear_exclusive_flags(&mut queues, &queue);
            queues.insert(id, QueueEntry::new(queue.clone()));
            batch.push(queue);
            batch
        };
        self.inner.service.persist().update_queues(batch);
        tracing::info!("created queue {}", id);
        self.publish(QueueEvent::Updated(id));
        id
    }

    /// The default queue, creating "Main Queue" when there are no queues yet
    pub fn ensure_default_queue(&self) -> QueueId {
        {
            let queues = self.inner.queues.read();
            if let Some(entry) = queues.values().find(|entry| entry.record.is_default) {
                return entry.record.id;
            }
            if let Some(id) = queues.keys().next() {
                return *id;
            }
        }
        let mut queue = self.queue_template(DEFAULT_QUEUE_TITLE);
        queue.is_default = true;
        self.create_queue(queue)
    }

    /// Replace a queue record
    ///
    /// Setting the default or last-choice flag clears it on every other queue
    /// in the same batch. A running queue adapts to a changed concurrency
    /// limit right away: excess files are stopped, free slots are filled.
    pub fn update_queue(&self, queue: DownloadQueue) -> Result<()> {
        let id = queue.id;
        let (batch, excess, running) = {
            let mut queues = self.inner.queues.write();
            if !queues.contains_key(&id) {
                return Err(DownloadError::QueueNotFound(id));
            }
            let mut batch = clear_exclusive_flags(&mut queues, &queue);
            let entry = queues
                .get_mut(&id)
                .ok_or(DownloadError::QueueNotFound(id))?;
            entry.record = queue.clone();

            let limit = queue.download_count_at_same_time.max(1);
            let mut excess = Vec::new();
            while entry.runtime.downloading_files.len() > limit {
                let Some(file_id) = entry.runtime.downloading_files.pop() else {
                    break;
                };
                if let Some(supervision) = entry.runtime.supervision.remove(&file_id) {
                    self.drop_pause_subscription(file_id, supervision);
                }
                excess.push(file_id);
            }
            batch.push(queue);
            (batch, excess, entry.runtime.is_running)
        };

        self.inner.service.persist().update_queues(batch);
        for file_id in excess {
            tracing::debug!("queue {} over its limit, stopping file {}", id, file_id);
            if let Err(e) = self.inner.service.begin_stop(file_id, false) {
                tracing::warn!("failed to stop file {}: {}", file_id, e);
            }
        }
        self.publish(QueueEvent::Updated(id));
        if running {
            self.continue_queue(id)?;
        }
        Ok(())
    }

    /// Stop a queue, detach its members and remove it
    pub async fn delete_queue(&self, id: QueueId) -> Result<()> {
        let running = self
            .queue(id)
            .ok_or(DownloadError::QueueNotFound(id))?
            .is_running;
        if running {
            self.stop_without_end_actions(id).await?;
        }
        let detached = self.inner.service.detach_from_queue(id, None);
        self.inner.queues.write().remove(&id);
        self.inner.service.persist().delete_queue(id);
        tracing::info!("deleted queue {} ({} files detached)", id, detached.len());
        self.publish(QueueEvent::Deleted(id));
        Ok(())
    }

    /// Append files to a queue behind its current members
    pub fn add_files_to_queue(&self, id: QueueId, files: &[FileId]) -> Result<()> {
        let running = self
            .queue(id)
            .ok_or(DownloadError::QueueNotFound(id))?
            .is_running;
        self.inner.service.assign_to_queue(id, files)?;
        self.publish(QueueEvent::Updated(id));
        if running {
            self.continue_queue(id)?;
        }
        Ok(())
    }

    /// Detach files from a queue; running downloads keep going unsupervised
    pub fn remove_files_from_queue(&self, id: QueueId, files: &[FileId]) -> Result<Vec<FileId>> {
        if self.queue(id).is_none() {
            return Err(DownloadError::QueueNotFound(id));
        }
        let detached = self.inner.service.detach_from_queue(id, Some(files));
        let freed = {
            let mut queues = self.inner.queues.write();
            let entry = queues
                .get_mut(&id)
                .ok_or(DownloadError::QueueNotFound(id))?;
            let before = entry.runtime.downloading_files.len();
            for file_id in &detached {
                entry.runtime.downloading_files.retain(|active| active != file_id);
                if let Some(supervision) = entry.runtime.supervision.remove(file_id) {
                    self.drop_pause_subscription(*file_id, supervision);
                }
                self.release(*file_id, id);
            }
            entry.runtime.is_running && entry.runtime.downloading_files.len() < before
        };
        self.publish(QueueEvent::Updated(id));
        if freed {
            self.continue_queue(id)?;
        }
        Ok(detached)
    }

    /// Put the given members first, in this order
    pub fn change_priorities(&self, id: QueueId, ordered: &[FileId]) -> Result<()> {
        if self.queue(id).is_none() {
            return Err(DownloadError::QueueNotFound(id));
        }
        self.inner.service.reorder_queue(id, ordered)?;
        self.publish(QueueEvent::Updated(id));
        Ok(())
    }

    pub fn set_schedule_enabled(&self, id: QueueId, enabled: bool) -> Result<()> {
        let mut queues = self.inner.queues.write();
        let entry = queues
            .get_mut(&id)
            .ok_or(DownloadError::QueueNotFound(id))?;
        entry.runtime.is_schedule_enabled = enabled;
        Ok(())
    }

    /// Start a queue and fill its download slots
    pub fn start_queue(&self, id: QueueId) -> Result<()> {
        let play_start_sound = {
            let mut queues = self.inner.queues.write();
            let entry = queues
                .get_mut(&id)
                .ok_or(DownloadError::QueueNotFound(id))?;
            entry.runtime.is_running = true;
            !std::mem::replace(&mut entry.runtime.is_start_sound_played, true)
        };
        tracing::info!("starting queue {}", id);
        if play_start_sound {
            self.inner.service.play_sound(SoundKind::QueueStarted);
        }
        self.publish(QueueEvent::Started(id));
        self.continue_queue(id)
    }

    /// One scheduling pass over a queue
    ///
    /// Starts eligible members in priority order until the concurrency limit
    /// is reached. A queue with nothing eligible and nothing downloading is
    /// finished; a queue that could not start anything is stopped.
    pub fn continue_queue(&self, id: QueueId) -> Result<()> {
        let continuation = {
            let mut queues = self.inner.queues.write();
            let entry = queues
                .get_mut(&id)
                .ok_or(DownloadError::QueueNotFound(id))?;
            let members = self.inner.service.queue_members(id);
            let eligible = eligible_files(&entry.record, &members, &entry.runtime.downloading_files);

            if eligible.is_empty() && entry.runtime.downloading_files.is_empty() {
                Continuation::Finished {
                    alarm: entry.record.show_alarm_when_done || entry.runtime.is_start_sound_played,
                }
            } else {
                entry.runtime.is_running = true;
                let limit = entry.record.download_count_at_same_time.max(1);
                let mut started = Vec::new();
                for file_id in eligible {
                    if entry.runtime.downloading_files.len() >= limit {
                        break;
                    }
                    if matches!(self.inner.service.supervisor(file_id), Some(other) if other != id) {
                        continue;
                    }
                    let supervision = self.supervise(entry, file_id);
                    match self.inner.service.request_start(file_id) {
                        Ok(()) => {
                            entry.runtime.supervision.insert(file_id, supervision);
                            entry.runtime.downloading_files.push(file_id);
                            started.push(file_id);
                        }
                        // The run failed at once; its finish hook takes it out again
                        Err(e) if e.kind() == crate::error::ErrorKind::Transport => {
                            entry.runtime.supervision.insert(file_id, supervision);
                            entry.runtime.downloading_files.push(file_id);
                        }
                        Err(e) => {
                            tracing::debug!("queue {} could not start file {}: {}", id, file_id, e);
                            self.drop_pause_subscription(file_id, supervision);
                            self.release(file_id, id);
                        }
                    }
                }
                if entry.runtime.downloading_files.is_empty() {
                    Continuation::Idle
                } else {
                    Continuation::Running(started)
                }
            }
        };

        match continuation {
            Continuation::Running(started) => {
                for file in started {
                    tracing::debug!("queue {} started file {}", id, file);
                    self.publish(QueueEvent::FileStarted { queue: id, file });
                }
            }
            Continuation::Finished { alarm } => {
                tracing::info!("queue {} finished", id);
                if alarm {
                    self.inner.service.play_sound(SoundKind::QueueFinished);
                }
                self.spawn_stop(id, StopReason::Finished, !alarm);
            }
            Continuation::Idle => {
                tracing::info!("queue {} could not start any file", id);
                self.spawn_stop(id, StopReason::Idle, true);
            }
        }
        Ok(())
    }

    /// Mark a file as supervised and hook its completion and pause
    fn supervise(&self, entry: &QueueEntry, file_id: FileId) -> Supervision {
        let queue_id = entry.record.id;
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::SeqCst);
        let service = &self.inner.service;
        service.set_supervised(file_id, Some(queue_id));

        let owner = self.inner.weak_self.clone();
        service.hooks().register_sync(
            file_id,
            Box::new(move |finished: &FinishedFile| match QueueScheduler::upgrade(&owner) {
                Some(scheduler) => scheduler.on_file_finished(queue_id, ticket, finished),
                None => Ok(HookOutcome {
                    update_required: true,
                }),
            }),
        );

        let pause = if entry.record.include_paused_files {
            None
        } else {
            let owner = self.inner.weak_self.clone();
            Some(service.on_paused(
                file_id,
                Arc::new(move |paused: FileId| {
                    if let Some(scheduler) = QueueScheduler::upgrade(&owner) {
                        scheduler.on_file_paused(queue_id, ticket, paused);
                    }
                }),
            ))
        };
        Supervision { ticket, pause }
    }

    fn drop_pause_subscription(&self, file_id: FileId, supervision: Supervision) {
        if let Some(subscription) = supervision.pause {
            self.inner.service.unsubscribe_paused(file_id, subscription);
        }
    }

    /// Clear the supervision marker if this queue holds it
    fn release(&self, file_id: FileId, queue_id: QueueId) {
        if self.inner.service.supervisor(file_id) == Some(queue_id) {
            self.inner.service.set_supervised(file_id, None);
        }
    }

    /// Completion feedback of a supervised file
    fn on_file_finished(&self, queue_id: QueueId, ticket: u64, finished: &FinishedFile) -> HookResult {
        let file_id = finished.file.id;
        let status = finished.file.status;
        let running = {
            let mut queues = self.inner.queues.write();
            let Some(entry) = queues.get_mut(&queue_id) else {
                self.release(file_id, queue_id);
                return Ok(HookOutcome {
                    update_required: true,
                });
            };
            let current = entry.runtime.supervision.get(&file_id).map(|s| s.ticket);
            if current != Some(ticket) {
                // Hook of an earlier run that the queue already let go
                if current.is_none() {
                    self.release(file_id, queue_id);
                }
                return Ok(HookOutcome {
                    update_required: true,
                });
            }
            if let Some(supervision) = entry.runtime.supervision.remove(&file_id) {
                self.drop_pause_subscription(file_id, supervision);
            }

            let running = entry.runtime.is_running;
            if running && matches!(status, DownloadStatus::Error | DownloadStatus::Stopped) {
                self.inner
                    .service
                    .demote_in_queue(file_id, queue_id, status == DownloadStatus::Error);
            }
            if status.is_finished() {
                entry.runtime.downloading_files.retain(|active| *active != file_id);
            }
            self.release(file_id, queue_id);
            running
        };

        tracing::debug!("queue {}: file {} finished as {}", queue_id, file_id, status);
        self.inner.service.persist_file(file_id);
        if running {
            if let Err(e) = self.continue_queue(queue_id) {
                tracing::warn!("failed to continue queue {}: {}", queue_id, e);
            }
        }
        Ok(HookOutcome::default())
    }

    /// A supervised file was paused in a queue that excludes paused files
    fn on_file_paused(&self, queue_id: QueueId, ticket: u64, file_id: FileId) {
        let running = {
            let mut queues = self.inner.queues.write();
            let Some(entry) = queues.get_mut(&queue_id) else {
                return;
            };
            match entry.runtime.supervision.get(&file_id) {
                Some(supervision) if supervision.ticket == ticket => {}
                _ => return,
            }
            if let Some(supervision) = entry.runtime.supervision.remove(&file_id) {
                self.drop_pause_subscription(file_id, supervision);
            }
            entry.runtime.downloading_files.retain(|active| *active != file_id);
            self.release(file_id, queue_id);
            entry.runtime.is_running
        };
        tracing::debug!("queue {}: file {} paused, moving on", queue_id, file_id);
        if running {
            if let Err(e) = self.continue_queue(queue_id) {
                tracing::warn!("failed to continue queue {}: {}", queue_id, e);
            }
        }
    }

    /// Stop a queue at the user's request
    pub async fn stop_queue(&self, id: QueueId) -> Result<()> {
        self.stop_queue_with(id, StopReason::User, true).await
    }

    /// Stop a queue and wait until its files confirmed the stop
    ///
    /// Clears the running and start-sound flags, stops every active or paused
    /// member, then runs the end-of-queue actions: turn off the computer, else
    /// exit the program, else the queue-stopped sound. The schedule-active
    /// flag is left alone; only the stop rule of a schedule clears it.
    pub async fn stop_queue_with(&self, id: QueueId, reason: StopReason, play_sound: bool) -> Result<()> {
        let plan = self.begin_stop_queue(id, reason, play_sound, true)?;
        self.complete_stop(plan).await;
        Ok(())
    }

    /// User stop that skips turn-off, exit and the stopped sound
    async fn stop_without_end_actions(&self, id: QueueId) -> Result<()> {
        let plan = self.begin_stop_queue(id, StopReason::User, false, false)?;
        self.complete_stop(plan).await;
        Ok(())
    }

    /// Stop every running queue without end-of-queue actions, as on shutdown
    pub async fn stop_all(&self) -> Result<()> {
        let running: Vec<QueueId> = self
            .queues()
            .into_iter()
            .filter(|snapshot| snapshot.is_running)
            .map(|snapshot| snapshot.queue.id)
            .collect();
        for id in running {
            self.stop_without_end_actions(id).await?;
        }
        Ok(())
    }

    fn spawn_stop(&self, id: QueueId, reason: StopReason, play_sound: bool) {
        let plan = match self.begin_stop_queue(id, reason, play_sound, true) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!("failed to stop queue {}: {}", id, e);
                return;
            }
        };
        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.complete_stop(plan).await });
        self.inner.pending_stops.lock().push(handle);
    }

    fn begin_stop_queue(
        &self,
        id: QueueId,
        reason: StopReason,
        play_sound: bool,
        run_end_actions: bool,
    ) -> Result<StopPlan> {
        let (active, end) = {
            let mut queues = self.inner.queues.write();
            let entry = queues
                .get_mut(&id)
                .ok_or(DownloadError::QueueNotFound(id))?;
            let runtime = &mut entry.runtime;
            runtime.is_running = false;
            runtime.is_start_sound_played = false;
            let active: Vec<FileId> = runtime.downloading_files.drain(..).collect();
            let supervision: Vec<(FileId, Supervision)> = runtime.supervision.drain().collect();
            for (file_id, supervision) in supervision {
                self.drop_pause_subscription(file_id, supervision);
            }
            let record = &entry.record;
            let end = EndActions {
                turn_off: record
                    .turn_off_computer_when_done
                    .then_some(record.turn_off_computer_mode),
                exit: record.exit_program_when_done,
            };
            (active, end)
        };

        let service = &self.inner.service;
        let mut stopped: Vec<FileId> = service
            .queue_members(id)
            .into_iter()
            .filter(|file| file.status.can_stop())
            .map(|file| file.id)
            .collect();
        for file_id in active {
            let stoppable = service.status(file_id).is_some_and(|status| status.can_stop());
            if stoppable && !stopped.contains(&file_id) {
                stopped.push(file_id);
            }
        }

        let mut waits = Vec::with_capacity(stopped.len());
        for file_id in &stopped {
            match service.begin_stop(*file_id, true) {
                Ok(Some(wait)) => waits.push(wait),
                Ok(None) => {}
                Err(e) => tracing::warn!("failed to stop file {}: {}", file_id, e),
            }
        }
        tracing::info!("stopping queue {} ({:?}, {} files)", id, reason, stopped.len());

        Ok(StopPlan {
            queue: id,
            reason,
            play_sound,
            run_end_actions,
            stopped,
            waits,
            end,
        })
    }

    async fn complete_stop(&self, plan: StopPlan) {
        let service = &self.inner.service;
        for wait in plan.waits {
            service.wait_stopped(wait).await;
        }

        let mut records = Vec::with_capacity(plan.stopped.len());
        for file_id in &plan.stopped {
            service.reset_error_count(*file_id);
            self.release(*file_id, plan.queue);
            if let Some(record) = service.file(*file_id) {
                records.push(record);
            }
        }
        service.persist().update_files(records);

        tracing::info!("queue {} stopped ({:?})", plan.queue, plan.reason);
        self.publish(QueueEvent::Stopped {
            id: plan.queue,
            reason: plan.reason,
        });

        if plan.run_end_actions {
            if let Some(mode) = plan.end.turn_off {
                tracing::info!("queue {} done, turning off the computer ({})", plan.queue, mode.label());
                self.inner.system.turn_off_computer(mode);
                return;
            }
            if plan.end.exit {
                tracing::info!("queue {} done, exiting", plan.queue);
                self.inner.system.exit_program();
                return;
            }
        }
        if plan.play_sound {
            service.play_sound(SoundKind::QueueStopped);
        }
    }

    /// Wait for the download service and for queue stops started by hooks
    pub async fn settle(&self) {
        loop {
            self.inner.service.settle().await;
            let pending = std::mem::take(&mut *self.inner.pending_stops.lock());
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    tracing::warn!("queue stop task failed: {}", e);
                }
            }
        }
        self.inner.service.persist().flush().await;
    }
}

/// Members a queue may start now, in scheduling order
///
/// `members` must already be sorted by priority. Files in `active` are
/// skipped even when their status would allow a start.
fn eligible_files(queue: &DownloadQueue, members: &[DownloadFile], active: &[FileId]) -> Vec<FileId> {
    members
        .iter()
        .filter(|file| !active.contains(&file.id))
        .filter(|file| queue.allows_attempt(file.count_of_error))
        .filter(|file| match file.status {
            DownloadStatus::None | DownloadStatus::Stopped | DownloadStatus::Error => true,
            DownloadStatus::Paused => queue.include_paused_files,
            _ => false,
        })
        .map(|file| file.id)
        .collect()
}

/// Clear default and last-choice flags that `changed` takes over
fn clear_exclusive_flags(
    queues: &mut BTreeMap<QueueId, QueueEntry>,
    changed: &DownloadQueue,
) -> Vec<DownloadQueue> {
    let mut touched = Vec::new();
    for entry in queues.values_mut() {
        if entry.record.id == changed.id {
            continue;
        }
        let mut dirty = false;
        if changed.is_default && entry.record.is_default {
            entry.record.is_default = false;
            dirty = true;
        }
        if changed.is_last_choice && entry.record.is_last_choice {
            entry.record.is_last_choice = false;
            dirty = true;
        }
        if dirty {
            touched.push(entry.record.clone());
        }
    }
    touched
}

#[cfg(test)]
mod tests;
