//! Scripted collaborators for tests
//!
//! [`MockTransport`] records every control call and lets a test drive the
//! transport lifecycle by emitting events itself. Cancellation is confirmed
//! right away with `Finished(Cancelled)`, like a well-behaved engine.

use crate::error::{DownloadError, Result};
use crate::model::{DownloadFile, FileId, TurnOffComputerMode};
use crate::system::{Clock, DiskSpace, Notifier, SoundKind, SystemActions};
use crate::transport::{
    EventSink, FinishOutcome, ProgressSample, StartRequest, Transport, TransportEvent,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockState {
    sinks: HashMap<FileId, EventSink>,
    starts: Vec<StartRequest>,
    pauses: Vec<FileId>,
    resumes: Vec<FileId>,
    cancels: Vec<FileId>,
    refuse_start: HashSet<FileId>,
    pause_package: Option<String>,
    supports_resume: bool,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blob returned from every `pause`
    pub fn set_pause_package(&self, blob: impl Into<String>) {
        self.state.lock().pause_package = Some(blob.into());
    }

    pub fn set_supports_resume(&self, supported: bool) {
        self.state.lock().supports_resume = supported;
    }

    /// Make `start` fail for this file
    pub fn refuse_start(&self, file_id: FileId) {
        self.state.lock().refuse_start.insert(file_id);
    }

    /// Files in start order, one entry per start
    pub fn started(&self) -> Vec<FileId> {
        self.state.lock().starts.iter().map(|r| r.file_id).collect()
    }

    pub fn start_count(&self, file_id: FileId) -> usize {
        self.state
            .lock()
            .starts
            .iter()
            .filter(|r| r.file_id == file_id)
            .count()
    }

    pub fn last_start(&self, file_id: FileId) -> Option<StartRequest> {
        self.state
            .lock()
            .starts
            .iter()
            .rev()
            .find(|r| r.file_id == file_id)
            .cloned()
    }

    pub fn paused(&self) -> Vec<FileId> {
        self.state.lock().pauses.clone()
    }

    pub fn resumed(&self) -> Vec<FileId> {
        self.state.lock().resumes.clone()
    }

    pub fn cancelled(&self) -> Vec<FileId> {
        self.state.lock().cancels.clone()
    }

    /// Emit an event for a file that was started at least once
    pub fn emit(&self, file_id: FileId, event: TransportEvent) -> bool {
        let sink = self.state.lock().sinks.get(&file_id).cloned();
        match sink {
            Some(sink) => sink.emit(file_id, event),
            None => false,
        }
    }

    pub fn progress(&self, file_id: FileId, received: u64, total: u64, speed: f64) -> bool {
        self.emit(
            file_id,
            TransportEvent::Progress(ProgressSample {
                received,
                total: Some(total),
                speed,
                average_speed: speed,
            }),
        )
    }

    pub fn complete(&self, file_id: FileId) -> bool {
        self.emit(file_id, TransportEvent::Finished(FinishOutcome::Success))
    }

    pub fn fail(&self, file_id: FileId, message: &str) -> bool {
        self.emit(
            file_id,
            TransportEvent::Finished(FinishOutcome::Failed(message.to_string())),
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn start(&self, request: StartRequest, events: EventSink) -> Result<()> {
        let file_id = request.file_id;
        let mut state = self.state.lock();
        if state.refuse_start.contains(&file_id) {
            return Err(DownloadError::transport("connection refused"));
        }
        state.starts.push(request);
        state.sinks.insert(file_id, events.clone());
        drop(state);
        events.emit(file_id, TransportEvent::Started);
        Ok(())
    }

    async fn pause(&self, file_id: FileId) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.pauses.push(file_id);
        Ok(state.pause_package.clone())
    }

    fn resume(&self, file_id: FileId) -> Result<()> {
        self.state.lock().resumes.push(file_id);
        Ok(())
    }

    fn cancel(&self, file_id: FileId) -> Result<()> {
        let sink = {
            let mut state = self.state.lock();
            state.cancels.push(file_id);
            state.sinks.get(&file_id).cloned()
        };
        if let Some(sink) = sink {
            sink.emit(file_id, TransportEvent::Finished(FinishOutcome::Cancelled));
        }
        Ok(())
    }

    async fn probe_resume_support(&self, _url: &str, _cancel: CancellationToken) -> Result<bool> {
        Ok(self.state.lock().supports_resume)
    }
}

/// A notifier call, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Sound(SoundKind),
    Completion(FileId),
    HookErrors(FileId, Vec<String>),
    Warning(FileId, String),
    StartRefused(FileId, String),
}

#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Notification> {
        self.calls.lock().clone()
    }

    pub fn sounds(&self) -> Vec<SoundKind> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Notification::Sound(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn refusals(&self) -> Vec<FileId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Notification::StartRefused(id, _) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn play_sound(&self, kind: SoundKind) {
        self.calls.lock().push(Notification::Sound(kind));
    }

    fn show_completion(&self, file: &DownloadFile) {
        self.calls.lock().push(Notification::Completion(file.id));
    }

    fn report_hook_errors(&self, file_id: FileId, errors: &[String]) {
        self.calls
            .lock()
            .push(Notification::HookErrors(file_id, errors.to_vec()));
    }

    fn warn(&self, file_id: FileId, message: &str) {
        self.calls
            .lock()
            .push(Notification::Warning(file_id, message.to_string()));
    }

    fn start_refused(&self, file_id: FileId, error: &DownloadError) {
        self.calls
            .lock()
            .push(Notification::StartRefused(file_id, error.to_string()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCall {
    TurnOff(TurnOffComputerMode),
    Exit,
}

#[derive(Default)]
pub struct RecordingSystemActions {
    calls: Mutex<Vec<SystemCall>>,
}

impl RecordingSystemActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SystemCall> {
        self.calls.lock().clone()
    }
}

impl SystemActions for RecordingSystemActions {
    fn turn_off_computer(&self, mode: TurnOffComputerMode) {
        self.calls.lock().push(SystemCall::TurnOff(mode));
    }

    fn exit_program(&self) {
        self.calls.lock().push(SystemCall::Exit);
    }
}

/// Disk with a settable amount of free space
pub struct FixedDiskSpace {
    available: AtomicU64,
}

impl FixedDiskSpace {
    pub fn new(available: u64) -> Self {
        Self {
            available: AtomicU64::new(available),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    pub fn set(&self, available: u64) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl DiskSpace for FixedDiskSpace {
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}
