use super::*;
use crate::error::ErrorKind;
use crate::store::MemoryStore;
use crate::testing::{FixedDiskSpace, MockTransport, RecordingNotifier, RecordingSystemActions, SystemCall};
use rivulet_config::Settings;
use std::path::Path;
use tempfile::TempDir;

const QUEUE: QueueId = QueueId(1);

struct Harness {
    scheduler: QueueScheduler,
    service: DownloadService,
    transport: Arc<MockTransport>,
    notifier: Arc<RecordingNotifier>,
    system: Arc<RecordingSystemActions>,
    disk: Arc<FixedDiskSpace>,
    _dir: TempDir,
}

impl Harness {
    async fn new(queue: DownloadQueue, files: impl FnOnce(&Path) -> Vec<DownloadFile>) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::with_records(files(dir.path()), vec![queue]));
        let transport = Arc::new(MockTransport::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let system = Arc::new(RecordingSystemActions::new());
        let disk = Arc::new(FixedDiskSpace::unlimited());
        let service = DownloadService::builder(transport.clone())
            .store(store)
            .settings(Settings::default())
            .notifier(notifier.clone())
            .disk_space(disk.clone())
            .build();
        service.restore().await.unwrap();
        let scheduler = QueueScheduler::new(service.clone(), system.clone());
        scheduler.restore().await.unwrap();
        Self {
            scheduler,
            service,
            transport,
            notifier,
            system,
            disk,
            _dir: dir,
        }
    }

    fn active(&self) -> Vec<FileId> {
        self.scheduler.queue(QUEUE).unwrap().downloading_files
    }

    fn is_running(&self) -> bool {
        self.scheduler.queue(QUEUE).unwrap().is_running
    }
}

fn queue(limit: usize) -> DownloadQueue {
    let mut queue = DownloadQueue::new(QUEUE, "Downloads");
    queue.download_count_at_same_time = limit;
    queue
}

fn member(dir: &Path, id: u64, priority: i64) -> DownloadFile {
    let mut file = DownloadFile::new(
        FileId(id),
        format!("http://example.com/{}.bin", id),
        dir,
        format!("{}.bin", id),
    );
    file.size = Some(1000);
    file.assign_queue(QUEUE, priority);
    file
}

fn members(priorities: &[i64]) -> impl FnOnce(&Path) -> Vec<DownloadFile> + '_ {
    move |dir: &Path| {
        priorities
            .iter()
            .enumerate()
            .map(|(index, priority)| member(dir, index as u64 + 1, *priority))
            .collect()
    }
}

#[test]
fn test_eligible_files_filter() {
    let dir = Path::new("/downloads");
    let mut queue = queue(1);
    let with_status = |id: u64, status: DownloadStatus| {
        let mut file = member(dir, id, id as i64);
        file.status = status;
        file
    };
    let files = vec![
        with_status(1, DownloadStatus::None),
        with_status(2, DownloadStatus::Downloading),
        with_status(3, DownloadStatus::Paused),
        with_status(4, DownloadStatus::Stopping),
        with_status(5, DownloadStatus::Stopped),
        with_status(6, DownloadStatus::Error),
        with_status(7, DownloadStatus::Completed),
        with_status(8, DownloadStatus::Merging),
    ];
    assert_eq!(
        eligible_files(&queue, &files, &[]),
        vec![FileId(1), FileId(5), FileId(6)]
    );
    assert_eq!(eligible_files(&queue, &files, &[FileId(5)]), vec![FileId(1), FileId(6)]);

    queue.include_paused_files = true;
    assert_eq!(
        eligible_files(&queue, &files, &[]),
        vec![FileId(1), FileId(3), FileId(5), FileId(6)]
    );
}

#[test]
fn test_eligible_files_retry_guard() {
    let dir = Path::new("/downloads");
    let mut queue = queue(1);
    let mut failing = member(dir, 1, 0);
    failing.status = DownloadStatus::Error;
    failing.count_of_error = 2;
    let files = vec![failing];

    assert_eq!(eligible_files(&queue, &files, &[]), vec![FileId(1)]);
    queue.retry_on_download_failed = true;
    queue.retry_count = 3;
    assert_eq!(eligible_files(&queue, &files, &[]), vec![FileId(1)]);
    queue.retry_count = 2;
    assert!(eligible_files(&queue, &files, &[]).is_empty());
}

#[tokio::test]
async fn test_lowest_priority_starts_first() {
    let h = Harness::new(queue(1), members(&[3, 1, 2])).await;

    h.scheduler.start_queue(QUEUE).unwrap();
    assert_eq!(h.transport.started(), vec![FileId(2)]);
    h.scheduler.settle().await;

    h.transport.complete(FileId(2));
    h.scheduler.settle().await;
    h.transport.complete(FileId(3));
    h.scheduler.settle().await;
    assert_eq!(h.transport.started(), vec![FileId(2), FileId(3), FileId(1)]);
}

#[tokio::test]
async fn test_concurrency_limit_holds() {
    let h = Harness::new(queue(2), members(&[0, 0, 0])).await;

    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;
    assert_eq!(h.transport.started(), vec![FileId(1), FileId(2)]);
    assert_eq!(h.active(), vec![FileId(1), FileId(2)]);

    h.scheduler.continue_queue(QUEUE).unwrap();
    assert_eq!(h.transport.started().len(), 2);

    h.transport.complete(FileId(1));
    h.scheduler.settle().await;
    assert_eq!(h.transport.started(), vec![FileId(1), FileId(2), FileId(3)]);
    assert_eq!(h.active(), vec![FileId(2), FileId(3)]);
}

#[tokio::test]
async fn test_paused_file_leaves_queue_that_excludes_paused() {
    let h = Harness::new(queue(1), members(&[0, 1])).await;
    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;

    h.service.pause(FileId(1)).await.unwrap();
    assert_eq!(h.transport.started(), vec![FileId(1), FileId(2)]);
    assert_eq!(h.active(), vec![FileId(2)]);
    assert_eq!(h.service.status(FileId(1)), Some(DownloadStatus::Paused));
}

#[tokio::test]
async fn test_queue_including_paused_files_resumes_them() {
    let mut q = queue(1);
    q.include_paused_files = true;
    let h = Harness::new(q, |dir| {
        let mut paused = member(dir, 1, 0);
        paused.status = DownloadStatus::Paused;
        vec![paused]
    })
    .await;

    h.scheduler.start_queue(QUEUE).unwrap();
    assert_eq!(h.service.status(FileId(1)), Some(DownloadStatus::Downloading));
    assert_eq!(h.transport.started(), vec![FileId(1)]);

    // A paused file stays in the active set of such a queue
    h.scheduler.settle().await;
    h.service.pause(FileId(1)).await.unwrap();
    assert_eq!(h.active(), vec![FileId(1)]);
}

#[tokio::test]
async fn test_retry_stops_at_retry_count() {
    let mut q = queue(1);
    q.retry_on_download_failed = true;
    q.retry_count = 2;
    let h = Harness::new(q, members(&[0])).await;

    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;
    h.transport.fail(FileId(1), "reset");
    h.scheduler.settle().await;
    assert_eq!(h.transport.start_count(FileId(1)), 2);
    assert_eq!(h.service.file(FileId(1)).unwrap().count_of_error, 1);

    h.transport.fail(FileId(1), "reset");
    h.scheduler.settle().await;
    let file = h.service.file(FileId(1)).unwrap();
    assert_eq!(file.status, DownloadStatus::Error);
    assert_eq!(file.count_of_error, 2);
    assert_eq!(h.transport.start_count(FileId(1)), 2);
    assert!(!h.is_running());
}

#[tokio::test]
async fn test_failed_file_moves_behind_the_others() {
    let mut q = queue(1);
    q.retry_on_download_failed = true;
    q.retry_count = 5;
    let h = Harness::new(q, members(&[0, 1, 2])).await;

    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;
    h.transport.fail(FileId(1), "timeout");
    h.scheduler.settle().await;

    let priorities: Vec<(FileId, Option<i64>)> = h
        .scheduler
        .members(QUEUE)
        .iter()
        .map(|file| (file.id, file.download_queue_priority))
        .collect();
    assert_eq!(
        priorities,
        vec![(FileId(2), Some(1)), (FileId(3), Some(2)), (FileId(1), Some(3))]
    );
    assert_eq!(h.transport.started(), vec![FileId(1), FileId(2)]);
}

#[tokio::test]
async fn test_finished_queue_plays_alarm_and_stops() {
    let h = Harness::new(queue(1), members(&[0])).await;
    let mut events = h.scheduler.subscribe();

    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;
    h.transport.complete(FileId(1));
    h.scheduler.settle().await;

    assert!(!h.is_running());
    assert!(h.active().is_empty());
    assert_eq!(
        h.notifier.sounds(),
        vec![SoundKind::QueueStarted, SoundKind::QueueFinished]
    );
    assert!(h.system.calls().is_empty());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            QueueEvent::Started(QUEUE),
            QueueEvent::FileStarted {
                queue: QUEUE,
                file: FileId(1)
            },
            QueueEvent::Stopped {
                id: QUEUE,
                reason: StopReason::Finished
            },
        ]
    );
}

#[tokio::test]
async fn test_turn_off_takes_precedence_over_exit() {
    let mut q = queue(1);
    q.turn_off_computer_when_done = true;
    q.turn_off_computer_mode = TurnOffComputerMode::Hibernate;
    q.exit_program_when_done = true;
    let h = Harness::new(q, members(&[0])).await;

    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;
    h.transport.complete(FileId(1));
    h.scheduler.settle().await;

    assert_eq!(
        h.system.calls(),
        vec![SystemCall::TurnOff(TurnOffComputerMode::Hibernate)]
    );
    assert!(!h.notifier.sounds().contains(&SoundKind::QueueStopped));
}

#[tokio::test]
async fn test_exit_when_done() {
    let mut q = queue(1);
    q.exit_program_when_done = true;
    let h = Harness::new(q, members(&[0])).await;

    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;
    h.transport.complete(FileId(1));
    h.scheduler.settle().await;

    assert_eq!(h.system.calls(), vec![SystemCall::Exit]);
}

#[tokio::test]
async fn test_user_stop_waits_for_files_and_resets_errors() {
    let mut q = queue(2);
    q.retry_on_download_failed = true;
    q.retry_count = 3;
    q.turn_off_computer_when_done = true;
    let h = Harness::new(q, |dir| {
        let mut first = member(dir, 1, 0);
        first.count_of_error = 1;
        vec![first, member(dir, 2, 1)]
    })
    .await;

    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;
    h.scheduler.stop_queue(QUEUE).await.unwrap();

    assert_eq!(h.service.status(FileId(1)), Some(DownloadStatus::Stopped));
    assert_eq!(h.service.status(FileId(2)), Some(DownloadStatus::Stopped));
    assert_eq!(h.service.file(FileId(1)).unwrap().count_of_error, 0);
    assert!(!h.is_running());
    assert!(h.active().is_empty());
    // Turning the machine off supersedes the stop sound
    assert_eq!(
        h.system.calls(),
        vec![SystemCall::TurnOff(TurnOffComputerMode::Shutdown)]
    );
    assert_eq!(h.notifier.sounds(), vec![SoundKind::QueueStarted]);

    // Files stopped with the queue are not restarted by stale hooks
    h.scheduler.settle().await;
    assert_eq!(h.transport.started().len(), 2);
}

#[tokio::test]
async fn test_idle_queue_stops_when_nothing_can_start() {
    let h = Harness::new(queue(1), members(&[0])).await;
    h.disk.set(10);

    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;

    assert!(!h.is_running());
    assert!(h.transport.started().is_empty());
    assert_eq!(h.service.status(FileId(1)), Some(DownloadStatus::None));
    assert_eq!(h.notifier.refusals(), vec![FileId(1)]);
}

#[tokio::test]
async fn test_lowering_limit_stops_excess_files() {
    let mut q = queue(2);
    let h = Harness::new(q.clone(), members(&[0, 1, 2])).await;
    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;

    q.download_count_at_same_time = 1;
    h.scheduler.update_queue(q.clone()).unwrap();
    h.scheduler.settle().await;
    assert_eq!(h.active(), vec![FileId(1)]);
    assert_eq!(h.service.status(FileId(2)), Some(DownloadStatus::Stopped));

    q.download_count_at_same_time = 3;
    h.scheduler.update_queue(q).unwrap();
    assert_eq!(h.active().len(), 3);
}

#[tokio::test]
async fn test_exclusive_default_flag() {
    let h = Harness::new(queue(1), |_| Vec::new()).await;
    assert_eq!(h.scheduler.ensure_default_queue(), QUEUE);

    let mut first = DownloadQueue::new(QueueId(0), "First");
    first.is_default = true;
    first.is_last_choice = true;
    let first = h.scheduler.create_queue(first);

    let mut second = DownloadQueue::new(QueueId(0), "Second");
    second.is_default = true;
    let second = h.scheduler.create_queue(second);

    let first = h.scheduler.queue(first).unwrap().queue;
    assert!(!first.is_default);
    assert!(first.is_last_choice);
    assert!(h.scheduler.queue(second).unwrap().queue.is_default);
    assert_eq!(h.scheduler.ensure_default_queue(), second);

    let mut updated = h.scheduler.queue(QUEUE).unwrap().queue;
    updated.is_last_choice = true;
    h.scheduler.update_queue(updated).unwrap();
    assert!(!h.scheduler.queue(first.id).unwrap().queue.is_last_choice);
}

#[tokio::test]
async fn test_default_queue_created_once() {
    let service = DownloadService::builder(Arc::new(MockTransport::new())).build();
    let scheduler = QueueScheduler::new(service, Arc::new(RecordingSystemActions::new()));

    let id = scheduler.ensure_default_queue();
    assert_eq!(scheduler.ensure_default_queue(), id);
    let queues = scheduler.queues();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].queue.title, DEFAULT_QUEUE_TITLE);
    assert!(queues[0].queue.is_default);
}

#[tokio::test]
async fn test_new_queues_follow_include_paused_setting() {
    let service = DownloadService::builder(Arc::new(MockTransport::new()))
        .settings(Settings::default().with_include_paused_files(true))
        .build();
    let scheduler = QueueScheduler::new(service, Arc::new(RecordingSystemActions::new()));

    let id = scheduler.ensure_default_queue();
    assert!(scheduler.queue(id).unwrap().queue.include_paused_files);
    assert!(scheduler.queue_template("Extra").include_paused_files);

    let plain = DownloadService::builder(Arc::new(MockTransport::new())).build();
    let plain = QueueScheduler::new(plain, Arc::new(RecordingSystemActions::new()));
    assert!(!plain.queue_template("Extra").include_paused_files);
}

#[tokio::test]
async fn test_queue_membership_management() {
    let h = Harness::new(queue(1), members(&[0])).await;
    let loose = h
        .service
        .add_file(crate::download::NewDownload::new("http://example.com/x", h._dir.path(), "x"))
        .await
        .unwrap()
        .file_id();

    h.scheduler.add_files_to_queue(QUEUE, &[loose]).unwrap();
    assert_eq!(
        h.service.file(loose).unwrap().download_queue_priority,
        Some(1)
    );

    h.scheduler.change_priorities(QUEUE, &[loose]).unwrap();
    let order: Vec<FileId> = h.scheduler.members(QUEUE).iter().map(|f| f.id).collect();
    assert_eq!(order, vec![loose, FileId(1)]);

    let removed = h.scheduler.remove_files_from_queue(QUEUE, &[loose]).unwrap();
    assert_eq!(removed, vec![loose]);
    let file = h.service.file(loose).unwrap();
    assert!(file.download_queue_id.is_none() && file.download_queue_priority.is_none());

    let err = h.scheduler.add_files_to_queue(QueueId(99), &[loose]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_completed_files_cannot_join_a_queue() {
    let h = Harness::new(queue(1), |dir| {
        let mut done = member(dir, 1, 0);
        done.detach_queue();
        done.status = DownloadStatus::Completed;
        vec![done]
    })
    .await;

    let err = h.scheduler.add_files_to_queue(QUEUE, &[FileId(1)]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(h.scheduler.members(QUEUE).is_empty());
}

#[tokio::test]
async fn test_delete_queue_detaches_members() {
    let mut q = queue(1);
    q.turn_off_computer_when_done = true;
    let h = Harness::new(q, members(&[0, 1])).await;
    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;

    h.scheduler.delete_queue(QUEUE).await.unwrap();
    assert!(h.scheduler.queue(QUEUE).is_none());
    assert_eq!(h.service.status(FileId(1)), Some(DownloadStatus::Stopped));
    assert!(h.service.file(FileId(2)).unwrap().download_queue_id.is_none());
    assert!(h.system.calls().is_empty());
}

#[tokio::test]
async fn test_stop_all_stops_running_queues() {
    let mut q = queue(1);
    q.exit_program_when_done = true;
    let h = Harness::new(q, members(&[0])).await;
    let other = h.scheduler.create_queue(DownloadQueue::new(QueueId(0), "Other"));
    h.scheduler.start_queue(QUEUE).unwrap();
    h.scheduler.settle().await;

    h.scheduler.stop_all().await.unwrap();
    assert!(h.scheduler.queues().iter().all(|q| !q.is_running));
    assert!(!h.scheduler.queue(other).unwrap().is_running);
    assert_eq!(h.service.status(FileId(1)), Some(DownloadStatus::Stopped));
    // Shutdown does not exit or power off
    assert!(h.system.calls().is_empty());
}
