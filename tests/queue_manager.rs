use plotq_rs::file_manager::FileManager;
use plotq_rs::queue::{QueueManager, ORPHAN_ERROR};
use plotq_rs::store::{InMemoryJobStore, SqliteJobStore};
use plotq_shared::config::OrphanPolicy;
use plotq_shared::{JobError, JobParameters, JobStatus, StatusUpdate};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn manager() -> (QueueManager, TempDir) {
    let dir = tempdir().unwrap();
    let files = FileManager::new(dir.path());
    (QueueManager::new(Arc::new(InMemoryJobStore::new()), files), dir)
}

#[tokio::test]
async fn created_jobs_are_queued_in_fifo_order() {
    let (queue, _dir) = manager();
    let a = queue.create_job("a.svg", "/tmp/a.svg", JobParameters::default()).await.unwrap();
    let b = queue.create_job("b.svg", "/tmp/b.svg", JobParameters::default()).await.unwrap();

    assert_eq!(a.status, JobStatus::Queued);
    assert_eq!(a.progress, 0);
    assert_eq!(queue.queue_size().await.unwrap(), 2);
    assert_eq!(queue.next_queued_job().await.unwrap().unwrap().id, a.id);
    assert_eq!(queue.position_of(&b).await.unwrap(), Some(2));

    let running = queue.update_status(&a.id, StatusUpdate::running()).await.unwrap();
    assert_eq!(queue.position_of(&running).await.unwrap(), None);
    assert_eq!(queue.queue_position(&b.id).await.unwrap(), 1);
}

#[tokio::test]
async fn get_unknown_job_is_not_found() {
    let (queue, _dir) = manager();
    let err = queue.get_job("nope").await.unwrap_err();
    assert_eq!(err, JobError::NotFound("nope".to_string()));
}

#[tokio::test]
async fn delete_removes_record_and_file() {
    let (queue, dir) = manager();
    let path = queue.files().save_upload("drawing.svg", b"<svg/>").await.unwrap();
    let job = queue.create_job("drawing.svg", path.clone(), JobParameters::default()).await.unwrap();

    assert!(queue.delete_job(&job.id).await.unwrap());
    assert!(!path.exists());
    assert!(matches!(queue.get_job(&job.id).await, Err(JobError::NotFound(_))));
    assert!(!queue.delete_job(&job.id).await.unwrap());
    drop(dir);
}

#[tokio::test]
async fn delete_tolerates_missing_file() {
    let (queue, dir) = manager();
    let job = queue
        .create_job("gone.svg", dir.path().join("gone.svg"), JobParameters::default())
        .await
        .unwrap();
    assert!(queue.delete_job(&job.id).await.unwrap());
}

#[tokio::test]
async fn running_job_is_not_deletable() {
    let (queue, dir) = manager();
    let path = queue.files().save_upload("busy.svg", b"<svg/>").await.unwrap();
    let job = queue.create_job("busy.svg", path.clone(), JobParameters::default()).await.unwrap();
    queue.update_status(&job.id, StatusUpdate::running()).await.unwrap();

    let err = queue.delete_job(&job.id).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidState(_)));
    assert!(path.exists());
    drop(dir);
}

#[tokio::test]
async fn orphaned_running_jobs_are_failed_on_recovery() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("jobs.db");
    let files = FileManager::new(dir.path().join("uploads"));

    let (orphan, queued) = {
        let queue = QueueManager::new(Arc::new(SqliteJobStore::open(&db).unwrap()), files.clone());
        let orphan = queue.create_job("o.svg", "/tmp/o.svg", JobParameters::default()).await.unwrap();
        let queued = queue.create_job("q.svg", "/tmp/q.svg", JobParameters::default()).await.unwrap();
        queue.update_status(&orphan.id, StatusUpdate::running()).await.unwrap();
        (orphan.id, queued.id)
    };

    let queue = QueueManager::new(Arc::new(SqliteJobStore::open(&db).unwrap()), files);
    assert_eq!(queue.recover_orphans(OrphanPolicy::Fail).await.unwrap(), 1);
    let orphan = queue.get_job(&orphan).await.unwrap();
    assert_eq!(orphan.status, JobStatus::Failed);
    assert_eq!(orphan.error.as_deref(), Some(ORPHAN_ERROR));
    assert!(orphan.completed_at.is_some());
    assert_eq!(queue.get_job(&queued).await.unwrap().status, JobStatus::Queued);
    assert_eq!(queue.recover_orphans(OrphanPolicy::Fail).await.unwrap(), 0);
}

#[tokio::test]
async fn keep_policy_leaves_running_jobs_alone() {
    let (queue, _dir) = manager();
    let job = queue.create_job("k.svg", "/tmp/k.svg", JobParameters::default()).await.unwrap();
    queue.update_status(&job.id, StatusUpdate::running()).await.unwrap();

    assert_eq!(queue.recover_orphans(OrphanPolicy::Keep).await.unwrap(), 0);
    assert_eq!(queue.get_job(&job.id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn list_defaults_to_newest_first() {
    let (queue, _dir) = manager();
    let first = queue.create_job("1.svg", "/tmp/1.svg", JobParameters::default()).await.unwrap();
    let second = queue.create_job("2.svg", "/tmp/2.svg", JobParameters::default()).await.unwrap();
    queue.update_status(&first.id, StatusUpdate::cancelled()).await.unwrap();

    let all = queue.list_jobs(None, 10).await.unwrap();
    assert_eq!(all[0].id, second.id);
    let cancelled = queue.list_jobs(Some(JobStatus::Cancelled), 10).await.unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, first.id);
}
