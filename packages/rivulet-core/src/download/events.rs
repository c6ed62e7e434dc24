//! Transport event transitions and the finish step

use super::{DownloadService, FileEvent};
use crate::hooks::FinishedFile;
use crate::model::{DownloadStatus, FileId};
use crate::system::SoundKind;
use crate::telemetry::percent_of;
use crate::transport::{FinishOutcome, TransportEvent};
use std::sync::atomic::Ordering;

/// Side effects of one transition, performed after the arena lock is released
#[derive(Default)]
struct Effects {
    status: Option<(DownloadStatus, DownloadStatus)>,
    warning: Option<String>,
    finished: bool,
}

impl DownloadService {
    /// Apply one transport event to a file
    ///
    /// Events for unknown files, and progress arriving after the file left
    /// the transferring states, are ignored.
    pub fn apply_event(&self, file_id: FileId, event: TransportEvent) {
        let effects = {
            let mut files = self.inner.files.write();
            let Some(entry) = files.get_mut(&file_id) else {
                tracing::debug!("event for unknown file {}: {:?}", file_id, event);
                return;
            };
            let record = &mut entry.record;
            let runtime = &mut entry.runtime;
            let status = record.status;
            let mut effects = Effects::default();

            match event {
                TransportEvent::Started => {
                    if status.is_transferring() {
                        runtime.live_session = true;
                    }
                }
                TransportEvent::Progress(sample) => {
                    if !status.is_transferring() {
                        return;
                    }
                    if let Some(total) = sample.total {
                        record.size = Some(total);
                        record.is_size_unknown = false;
                    }
                    record.downloaded_size = sample.received;
                    record.download_progress = percent_of(sample.received, record.size);
                    record.transfer_rate = if sample.speed.is_finite() {
                        sample.speed.max(0.0)
                    } else {
                        0.0
                    };
                    runtime.telemetry.speed.record(sample.average_speed);
                    record.time_left = record.size.and_then(|size| {
                        runtime
                            .telemetry
                            .speed
                            .time_left(size.saturating_sub(sample.received))
                    });
                }
                TransportEvent::ChunkProgress(progress) => {
                    if status.is_transferring() {
                        runtime.telemetry.chunks.update(progress);
                    }
                }
                TransportEvent::MergeStarted => {
                    if status == DownloadStatus::Downloading {
                        record.status = DownloadStatus::Merging;
                        record.transfer_rate = 0.0;
                        record.time_left = None;
                        runtime.telemetry.elapsed.set_suspended(true);
                        runtime.telemetry.merge_percent = Some(0.0);
                        effects.status = Some((status, DownloadStatus::Merging));
                    }
                }
                TransportEvent::MergeProgress { percent } => {
                    if status == DownloadStatus::Merging {
                        runtime.telemetry.merge_percent = Some(percent.clamp(0.0, 100.0));
                    }
                }
                TransportEvent::ChunkRestarted { chunk_id, reason } => {
                    effects.warning = Some(format!("chunk {} restarted: {}", chunk_id, reason));
                }
                TransportEvent::Finished(outcome) => {
                    if status.is_finished() || status == DownloadStatus::None {
                        tracing::debug!("file {} already finished, ignoring {:?}", file_id, outcome);
                        return;
                    }
                    let next = match (&outcome, status) {
                        (FinishOutcome::Success, _) => DownloadStatus::Completed,
                        (_, DownloadStatus::Stopping) | (FinishOutcome::Cancelled, _) => {
                            DownloadStatus::Stopped
                        }
                        (FinishOutcome::Failed(_), _) => DownloadStatus::Error,
                    };
                    runtime.teardown();
                    runtime.telemetry.elapsed.set_suspended(false);
                    runtime.telemetry.merge_percent = None;
                    record.status = next;
                    record.transfer_rate = 0.0;
                    record.time_left = None;
                    match next {
                        DownloadStatus::Completed => {
                            if let Some(size) = record.size {
                                record.downloaded_size = size;
                            }
                            record.download_progress = 100.0;
                            record.download_package = None;
                            record.count_of_error = 0;
                            runtime.telemetry.chunks.clear();
                            runtime.last_error = None;
                        }
                        DownloadStatus::Error => {
                            if let FinishOutcome::Failed(message) = outcome {
                                runtime.last_error = Some(message);
                            }
                        }
                        _ => runtime.telemetry.chunks.pause_all(),
                    }
                    runtime.in_finish = true;
                    effects.status = Some((status, next));
                    effects.finished = true;
                }
            }
            effects
        };

        if let Some((from, to)) = effects.status {
            self.publish_status(file_id, from, to);
        }
        if let Some(message) = effects.warning {
            tracing::warn!("file {}: {}", file_id, message);
            self.inner.notifier.warn(file_id, &message);
            self.publish(FileEvent::Warning {
                id: file_id,
                message,
            });
        }
        if effects.finished {
            self.inner.finish.enqueue(file_id);
        }
    }

    /// Finish step of one file, run by the finish queue
    pub(super) async fn finish_file(&self, file_id: FileId) {
        let snapshot = {
            let files = self.inner.files.read();
            files.get(&file_id).map(|entry| {
                (
                    FinishedFile {
                        file: entry.record.clone(),
                        error: entry.runtime.last_error.clone(),
                    },
                    entry.runtime.supervised_by.is_some(),
                )
            })
        };
        let Some((finished, supervised)) = snapshot else {
            self.inner.hooks.clear(file_id);
            return;
        };

        let report = self.inner.hooks.take(file_id).run(&finished).await;
        if !report.errors.is_empty() {
            self.inner.notifier.report_hook_errors(file_id, &report.errors);
        }
        if report.needs_persist() {
            self.persist_file(file_id);
        }

        let status = finished.file.status;
        if !supervised {
            match status {
                DownloadStatus::Completed => {
                    self.play_sound(SoundKind::DownloadComplete);
                    if self.inner.settings.read().show_complete_dialog {
                        self.inner.notifier.show_completion(&finished.file);
                    }
                }
                DownloadStatus::Error => self.play_sound(SoundKind::DownloadFailed),
                DownloadStatus::Stopped => self.play_sound(SoundKind::DownloadStopped),
                _ => {}
            }
        }

        {
            let mut files = self.inner.files.write();
            if let Some(entry) = files.get_mut(&file_id) {
                entry.runtime.in_finish = false;
                if let Some(tracker) = entry.runtime.stop.take() {
                    tracker.signal();
                    if tracker.controlled {
                        // The waiting stop call removes it
                        entry.runtime.stop = Some(tracker);
                    }
                }
            }
        }

        self.inner.activity.fetch_add(1, Ordering::SeqCst);
        self.publish(FileEvent::Finished {
            id: file_id,
            status,
        });
    }
}
