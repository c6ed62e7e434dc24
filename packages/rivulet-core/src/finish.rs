//! Single-flight finish queue
//!
//! Files that reached Completed, Error or Stopped are drained by one task,
//! one file at a time, so completion side effects never overlap.

use crate::model::FileId;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};

enum FinishMessage {
    File(FileId),
    Drain(oneshot::Sender<()>),
}

pub(crate) struct FinishQueue {
    tx: mpsc::UnboundedSender<FinishMessage>,
}

impl FinishQueue {
    /// Spawn the drain task
    ///
    /// `handler` returns `None` once its owner is gone, which ends the task.
    pub(crate) fn spawn<F, Fut>(handler: F) -> Self
    where
        F: Fn(FileId) -> Option<Fut> + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    FinishMessage::File(file_id) => match handler(file_id) {
                        Some(finish) => finish.await,
                        None => break,
                    },
                    FinishMessage::Drain(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!("finish queue closed");
        });
        Self { tx }
    }

    pub(crate) fn enqueue(&self, file_id: FileId) {
        if self.tx.send(FinishMessage::File(file_id)).is_err() {
            tracing::warn!("finish queue closed, dropping file {}", file_id);
        }
    }

    /// Wait until everything enqueued so far has been handled
    pub(crate) async fn drain(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(FinishMessage::Drain(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_files_are_finished_one_at_a_time_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = Arc::clone(&log);
        let queue = FinishQueue::spawn(move |file_id: FileId| {
            let log = Arc::clone(&handler_log);
            Some(async move {
                log.lock().push(format!("begin {}", file_id));
                tokio::time::sleep(Duration::from_millis(5)).await;
                log.lock().push(format!("end {}", file_id));
            })
        });

        queue.enqueue(FileId(1));
        queue.enqueue(FileId(2));
        queue.drain().await;

        assert_eq!(
            *log.lock(),
            vec!["begin 1", "end 1", "begin 2", "end 2"]
        );
    }

    #[tokio::test]
    async fn test_drain_returns_after_handler_is_gone() {
        let queue = FinishQueue::spawn(|_: FileId| None::<std::future::Ready<()>>);
        queue.enqueue(FileId(1));
        // The task ended on the first file; drain must not hang
        queue.drain().await;
    }
}
