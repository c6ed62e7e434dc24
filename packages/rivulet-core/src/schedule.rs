//! Time-of-day queue schedules
//!
//! [`ScheduleManager`] starts and stops queues when the local time matches
//! their start or stop rule. Matching is exact to the minute; a pass that does
//! not run during the configured minute misses that trigger.

use crate::error::Result;
use crate::model::{DownloadQueue, QueueId, TimeOfDay};
use crate::scheduler::{QueueScheduler, StopReason};
use crate::system::Clock;
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Queues a pass started and stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub started: Vec<QueueId>,
    pub stopped: Vec<QueueId>,
}

pub struct ScheduleManager {
    scheduler: QueueScheduler,
    clock: Arc<dyn Clock>,
}

impl ScheduleManager {
    pub fn new(scheduler: QueueScheduler, clock: Arc<dyn Clock>) -> Self {
        Self { scheduler, clock }
    }

    /// Run one pass at the clock's current time
    pub async fn evaluate(&self) -> Result<ScheduleReport> {
        self.evaluate_at(self.clock.now()).await
    }

    /// Run one pass as if the local time were `now`
    ///
    /// A queue whose rules fail is logged and skipped; the other queues are
    /// still evaluated.
    pub async fn evaluate_at(&self, now: NaiveDateTime) -> Result<ScheduleReport> {
        let mut report = ScheduleReport::default();
        for snapshot in self.scheduler.queues() {
            let id = snapshot.queue.id;
            if let Err(e) = self.apply_rules(&snapshot.queue, snapshot.is_schedule_enabled, now, &mut report).await {
                tracing::warn!("schedule rules for queue {} failed: {}", id, e);
            }
        }
        Ok(report)
    }

    async fn apply_rules(
        &self,
        queue: &DownloadQueue,
        schedule_enabled: bool,
        now: NaiveDateTime,
        report: &mut ScheduleReport,
    ) -> Result<()> {
        let id = queue.id;
        if let Some(start) = queue.start_download_schedule {
            if !schedule_enabled && is_due(queue, start, now) {
                if self.scheduler.members(id).is_empty() {
                    tracing::debug!("queue {} is due to start but has no files", id);
                } else {
                    tracing::info!("schedule starts queue {} at {}", id, now);
                    self.scheduler.set_schedule_enabled(id, true)?;
                    self.scheduler.start_queue(id)?;
                    report.started.push(id);
                }
            }
        }

        if let Some(stop) = queue.stop_download_schedule {
            let Some(current) = self.scheduler.queue(id) else {
                return Ok(());
            };
            if (current.is_schedule_enabled || current.is_running) && is_due(queue, stop, now) {
                tracing::info!("schedule stops queue {} at {}", id, now);
                self.scheduler.set_schedule_enabled(id, false)?;
                self.scheduler
                    .stop_queue_with(id, StopReason::Schedule, true)
                    .await?;
                report.stopped.push(id);
            }
        }
        Ok(())
    }

    /// Evaluate every `interval` until the handle is shut down
    ///
    /// The timer is off while a pass runs. Failed passes are logged and the
    /// next one runs on schedule.
    pub fn spawn(self, interval: Duration) -> ScheduleHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match self.evaluate().await {
                    Ok(report) if report.started.is_empty() && report.stopped.is_empty() => {}
                    Ok(report) => tracing::debug!("schedule pass: {:?}", report),
                    Err(e) => tracing::warn!("schedule pass failed: {}", e),
                }
            }
            tracing::debug!("schedule timer stopped");
        });
        ScheduleHandle { token, task }
    }

    /// Spawn with the interval from the service settings
    pub fn spawn_from_settings(self) -> ScheduleHandle {
        let seconds = self.scheduler.service().settings().schedule_interval_secs.max(1);
        self.spawn(Duration::from_secs(seconds))
    }
}

/// Handle of a running schedule timer
pub struct ScheduleHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ScheduleHandle {
    /// Stop the timer and wait for a running pass to end
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("schedule timer task failed: {}", e);
        }
    }
}

/// Day gating, then an exact hour and minute match
fn is_due(queue: &DownloadQueue, at: TimeOfDay, now: NaiveDateTime) -> bool {
    let today = if queue.is_daily {
        queue.days_of_week.contains(now.weekday())
    } else {
        queue.just_for_date == Some(now.date())
    };
    today && now.hour() == at.hour && now.minute() == at.minute
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadService;
    use crate::model::{DaysOfWeek, DownloadFile, DownloadStatus, FileId};
    use crate::store::MemoryStore;
    use crate::testing::{FixedDiskSpace, ManualClock, MockTransport, RecordingSystemActions};
    use chrono::{NaiveDate, Weekday};
    use tempfile::TempDir;

    const QUEUE: QueueId = QueueId(1);

    // 2024-01-01 is a Monday
    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, minute, 30)
            .unwrap()
    }

    fn daily_queue() -> DownloadQueue {
        let mut queue = DownloadQueue::new(QUEUE, "Night");
        queue.download_count_at_same_time = 2;
        queue.is_daily = true;
        queue.days_of_week = DaysOfWeek::from_days(&[Weekday::Mon, Weekday::Wed]);
        queue.start_download_schedule = Some(TimeOfDay::new(1, 30));
        queue.stop_download_schedule = Some(TimeOfDay::new(6, 0));
        queue
    }

    async fn setup(queue: DownloadQueue, with_member: bool) -> (ScheduleManager, QueueScheduler, Arc<ManualClock>, TempDir) {
        setup_with(queue, with_member.then_some(None)).await
    }

    /// `member` is the status override of the single member file, if any
    async fn setup_with(
        queue: DownloadQueue,
        member: Option<Option<DownloadStatus>>,
    ) -> (ScheduleManager, QueueScheduler, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut files = Vec::new();
        if let Some(status) = member {
            let mut file = DownloadFile::new(FileId(1), "http://example.com/a.iso", dir.path(), "a.iso");
            file.size = Some(1000);
            file.assign_queue(QUEUE, 0);
            if let Some(status) = status {
                file.status = status;
            }
            files.push(file);
        }
        let service = DownloadService::builder(Arc::new(MockTransport::new()))
            .store(Arc::new(MemoryStore::with_records(files, vec![queue])))
            .disk_space(Arc::new(FixedDiskSpace::unlimited()))
            .build();
        service.restore().await.unwrap();
        let scheduler = QueueScheduler::new(service, Arc::new(RecordingSystemActions::new()));
        scheduler.restore().await.unwrap();
        let clock = Arc::new(ManualClock::new(at(1, 0, 0)));
        let manager = ScheduleManager::new(scheduler.clone(), clock.clone());
        (manager, scheduler, clock, dir)
    }

    #[test]
    fn test_daily_rule_uses_weekday_bits() {
        let queue = daily_queue();
        let start = TimeOfDay::new(1, 30);
        assert!(is_due(&queue, start, at(1, 1, 30)));
        assert!(!is_due(&queue, start, at(2, 1, 30)));
        assert!(is_due(&queue, start, at(3, 1, 30)));
        assert!(!is_due(&queue, start, at(1, 1, 31)));
        assert!(!is_due(&queue, start, at(1, 2, 30)));
    }

    #[test]
    fn test_one_shot_rule_uses_date() {
        let mut queue = DownloadQueue::new(QUEUE, "Once");
        queue.just_for_date = NaiveDate::from_ymd_opt(2024, 1, 5);
        let start = TimeOfDay::new(23, 5);
        assert!(is_due(&queue, start, at(5, 23, 5)));
        assert!(!is_due(&queue, start, at(4, 23, 5)));

        queue.just_for_date = None;
        assert!(!is_due(&queue, start, at(5, 23, 5)));
    }

    #[tokio::test]
    async fn test_start_and_stop_by_schedule() {
        let (manager, scheduler, _clock, _dir) = setup(daily_queue(), true).await;

        let report = manager.evaluate_at(at(1, 1, 29)).await.unwrap();
        assert_eq!(report, ScheduleReport::default());

        let report = manager.evaluate_at(at(1, 1, 30)).await.unwrap();
        assert_eq!(report.started, vec![QUEUE]);
        let snapshot = scheduler.queue(QUEUE).unwrap();
        assert!(snapshot.is_running && snapshot.is_schedule_enabled);

        // Already schedule-active, the same minute does not start it twice
        let report = manager.evaluate_at(at(1, 1, 30)).await.unwrap();
        assert!(report.started.is_empty());

        let report = manager.evaluate_at(at(1, 6, 0)).await.unwrap();
        assert_eq!(report.stopped, vec![QUEUE]);
        let snapshot = scheduler.queue(QUEUE).unwrap();
        assert!(!snapshot.is_running && !snapshot.is_schedule_enabled);
        assert_eq!(
            scheduler.service().status(FileId(1)),
            Some(DownloadStatus::Stopped)
        );
    }

    #[tokio::test]
    async fn test_finished_queue_is_not_restarted_within_start_minute() {
        let (manager, scheduler, _clock, _dir) =
            setup_with(daily_queue(), Some(Some(DownloadStatus::Completed))).await;

        let mut starts = 0;
        for second in [0, 15, 30, 45, 59] {
            let now = NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(1, 30, second)
                .unwrap();
            starts += manager.evaluate_at(now).await.unwrap().started.len();
            scheduler.settle().await;
        }

        assert_eq!(starts, 1);
        let snapshot = scheduler.queue(QUEUE).unwrap();
        assert!(!snapshot.is_running);
        assert!(snapshot.is_schedule_enabled);

        // The stop rule ends the schedule run, so the next day starts again
        let report = manager.evaluate_at(at(1, 6, 0)).await.unwrap();
        assert_eq!(report.stopped, vec![QUEUE]);
        assert!(!scheduler.queue(QUEUE).unwrap().is_schedule_enabled);
        let report = manager.evaluate_at(at(3, 1, 30)).await.unwrap();
        assert_eq!(report.started, vec![QUEUE]);
    }

    #[tokio::test]
    async fn test_empty_queue_is_not_started() {
        let (manager, scheduler, _clock, _dir) = setup(daily_queue(), false).await;

        let report = manager.evaluate_at(at(1, 1, 30)).await.unwrap();
        assert!(report.started.is_empty());
        assert!(!scheduler.queue(QUEUE).unwrap().is_schedule_enabled);
    }

    #[tokio::test]
    async fn test_stop_rule_applies_to_manual_start() {
        let (manager, scheduler, _clock, _dir) = setup(daily_queue(), true).await;
        scheduler.start_queue(QUEUE).unwrap();

        let report = manager.evaluate_at(at(3, 6, 0)).await.unwrap();
        assert_eq!(report.stopped, vec![QUEUE]);
        assert!(!scheduler.queue(QUEUE).unwrap().is_running);
    }

    #[tokio::test]
    async fn test_stop_rule_ignores_idle_queue() {
        let (manager, _scheduler, _clock, _dir) = setup(daily_queue(), true).await;
        let report = manager.evaluate_at(at(1, 6, 0)).await.unwrap();
        assert!(report.stopped.is_empty());
    }

    #[tokio::test]
    async fn test_timer_runs_passes_until_shutdown() {
        let (manager, scheduler, clock, _dir) = setup(daily_queue(), true).await;
        clock.set(at(1, 1, 30));

        let handle = manager.spawn(Duration::from_millis(10));
        let started = tokio::time::timeout(Duration::from_secs(5), async {
            while !scheduler.queue(QUEUE).unwrap().is_running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(started.is_ok());
        handle.shutdown().await;
    }
}
