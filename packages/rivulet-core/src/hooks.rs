//! Per-file completion hooks and pause subscriptions
//!
//! Hooks are one-shot: the finish queue takes them out of the registry and
//! runs them once, async hooks first in registration order, then sync hooks.

use crate::model::{DownloadFile, FileId};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot of a file handed to its completion hooks
#[derive(Debug, Clone)]
pub struct FinishedFile {
    pub file: DownloadFile,
    /// Transport error message when the file ended in Error
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookOutcome {
    /// The hook changed the record and wants it persisted
    pub update_required: bool,
}

pub type HookResult = Result<HookOutcome, String>;

pub type SyncHook = Box<dyn FnOnce(&FinishedFile) -> HookResult + Send>;

pub type AsyncHook = Box<dyn FnOnce(FinishedFile) -> BoxFuture<'static, HookResult> + Send>;

/// Hooks registered for one file
#[derive(Default)]
pub struct FileHooks {
    async_hooks: Vec<AsyncHook>,
    sync_hooks: Vec<SyncHook>,
}

/// What running a file's hooks produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookReport {
    pub ran: usize,
    pub update_required: bool,
    pub errors: Vec<String>,
}

impl HookReport {
    /// Persist when nothing ran or any hook asked for it
    pub fn needs_persist(&self) -> bool {
        self.ran == 0 || self.update_required
    }

    fn record(&mut self, result: HookResult) {
        self.ran += 1;
        match result {
            Ok(outcome) => self.update_required |= outcome.update_required,
            Err(error) => self.errors.push(error),
        }
    }
}

impl FileHooks {
    pub fn len(&self) -> usize {
        self.async_hooks.len() + self.sync_hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook once; a failing hook does not stop the others
    pub async fn run(self, finished: &FinishedFile) -> HookReport {
        let mut report = HookReport::default();
        for hook in self.async_hooks {
            report.record(hook(finished.clone()).await);
        }
        for hook in self.sync_hooks {
            report.record(hook(finished));
        }
        report
    }
}

/// Registry of one-shot completion hooks keyed by file
#[derive(Default)]
pub struct CompletionHookRegistry {
    hooks: Mutex<HashMap<FileId, FileHooks>>,
}

impl CompletionHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sync(&self, file_id: FileId, hook: SyncHook) {
        self.hooks
            .lock()
            .entry(file_id)
            .or_default()
            .sync_hooks
            .push(hook);
    }

    pub fn register_async(&self, file_id: FileId, hook: AsyncHook) {
        self.hooks
            .lock()
            .entry(file_id)
            .or_default()
            .async_hooks
            .push(hook);
    }

    /// Remove and return all hooks of a file
    pub fn take(&self, file_id: FileId) -> FileHooks {
        self.hooks.lock().remove(&file_id).unwrap_or_default()
    }

    pub fn clear(&self, file_id: FileId) {
        self.hooks.lock().remove(&file_id);
    }

    pub fn len(&self, file_id: FileId) -> usize {
        self.hooks.lock().get(&file_id).map_or(0, FileHooks::len)
    }
}

/// Handle returned by [`PauseSubscriptions::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type PauseCallback = Arc<dyn Fn(FileId) + Send + Sync>;

/// Explicit subscriber list for the "file paused" outcome
#[derive(Default)]
pub struct PauseSubscriptions {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<FileId, Vec<(SubscriptionId, PauseCallback)>>>,
}

impl PauseSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, file_id: FileId, callback: PauseCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .entry(file_id)
            .or_default()
            .push((id, callback));
        id
    }

    pub fn unsubscribe(&self, file_id: FileId, subscription: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(&file_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&file_id);
        }
        removed
    }

    /// Call every subscriber of the file in subscription order
    ///
    /// Callbacks run outside the registry lock and may unsubscribe themselves.
    pub fn notify(&self, file_id: FileId) {
        let callbacks: Vec<PauseCallback> = self
            .subscribers
            .lock()
            .get(&file_id)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(file_id);
        }
    }

    pub fn clear(&self, file_id: FileId) {
        self.subscribers.lock().remove(&file_id);
    }

    pub fn count(&self, file_id: FileId) -> usize {
        self.subscribers.lock().get(&file_id).map_or(0, Vec::len)
    }
}
