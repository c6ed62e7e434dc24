use crate::model::{DownloadFile, FileId, QueueId};
use crate::telemetry::FileTelemetry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A file record plus the state that only exists while the process runs
pub(super) struct FileEntry {
    pub(super) record: DownloadFile,
    pub(super) runtime: FileRuntime,
}

impl FileEntry {
    pub(super) fn new(record: DownloadFile) -> Self {
        let runtime = FileRuntime {
            telemetry: FileTelemetry::resuming_from(record.elapsed_time),
            ..FileRuntime::default()
        };
        Self { record, runtime }
    }
}

#[derive(Default)]
pub(super) struct FileRuntime {
    pub(super) telemetry: FileTelemetry,
    pub(super) ticker: Option<CancellationToken>,
    pub(super) probe: Option<CancellationToken>,
    /// The transport holds a live run that `resume` can continue
    pub(super) live_session: bool,
    pub(super) supports_resume: Option<bool>,
    pub(super) supervised_by: Option<QueueId>,
    /// Set from the terminal transition until the finish queue is done with it
    pub(super) in_finish: bool,
    pub(super) stop: Option<StopTracker>,
    pub(super) last_error: Option<String>,
}

impl FileRuntime {
    pub(super) fn stop_ticker(&mut self) {
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
    }

    pub(super) fn cancel_probe(&mut self) {
        if let Some(token) = self.probe.take() {
            token.cancel();
        }
    }

    /// Release everything tied to a transport run
    pub(super) fn teardown(&mut self) {
        self.stop_ticker();
        self.cancel_probe();
        self.live_session = false;
    }
}

/// One-shot "stop confirmed" signal of a file
pub(super) struct StopTracker {
    done: watch::Sender<bool>,
    /// A queue stop is waiting on it; the waiter removes the tracker
    pub(super) controlled: bool,
}

impl StopTracker {
    pub(super) fn new(controlled: bool) -> Self {
        let (done, _) = watch::channel(false);
        Self { done, controlled }
    }

    pub(super) fn subscribe(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub(super) fn signal(&self) {
        self.done.send_replace(true);
    }
}

/// Handle for awaiting a stop confirmation
pub(crate) struct StopWait {
    pub(crate) file_id: FileId,
    pub(super) done: watch::Receiver<bool>,
}

impl StopWait {
    /// Resolves once the finish queue confirmed the stop or the file is gone
    pub(super) async fn confirmed(mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_signal_reaches_late_subscriber() {
        let tracker = StopTracker::new(true);
        let early = StopWait {
            file_id: FileId(1),
            done: tracker.subscribe(),
        };
        tracker.signal();
        let late = StopWait {
            file_id: FileId(1),
            done: tracker.subscribe(),
        };
        drop(tracker);

        early.confirmed().await;
        late.confirmed().await;
    }

    #[test]
    fn test_teardown_cancels_tokens() {
        let mut runtime = FileRuntime::default();
        let ticker = CancellationToken::new();
        let probe = CancellationToken::new();
        runtime.ticker = Some(ticker.clone());
        runtime.probe = Some(probe.clone());
        runtime.live_session = true;

        runtime.teardown();
        assert!(ticker.is_cancelled());
        assert!(probe.is_cancelled());
        assert!(!runtime.live_session);
    }
}
