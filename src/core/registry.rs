//! In-memory registry of user-visible transfer jobs.
//!
//! This is the only state shared between concurrently open dialogs (a
//! background import and a freshly opened export, say). Every operation is a
//! single merge under the lock, keyed by job id, so callers from independent
//! event loops need no coordination of their own.
//!
//! Jobs can legitimately vanish while notifications for them are still in
//! flight (the user dismissed a result), so operations on unknown ids are
//! silently ignored instead of reported.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::error::{Result, TransferError};
use super::models::{JobId, JobPhase, JobProgress, JobUpdate, NewJob, TransferJob};

/// Thread-safe list of tracked jobs, in insertion order.
///
/// Cloning is cheap; clones share the same underlying list.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<Vec<TransferJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in phase `Starting`.
    pub async fn track(&self, job: NewJob) -> JobId {
        let mut jobs = self.inner.write().await;
        let record = new_record(job);
        let id = record.id;
        jobs.push(record);
        debug!(job_id = %id, "Job tracked");
        id
    }

    /// Register a new job unless another job on the same connection is still
    /// running. The check and the insert happen under one lock.
    pub async fn try_track(&self, job: NewJob) -> Result<JobId> {
        let mut jobs = self.inner.write().await;
        if let Some(busy) = jobs
            .iter()
            .find(|j| j.connection_id == job.connection_id && j.phase.is_active())
        {
            return Err(TransferError::ConnectionBusy { job_id: busy.id });
        }
        let record = new_record(job);
        let id = record.id;
        jobs.push(record);
        debug!(job_id = %id, "Job tracked");
        Ok(id)
    }

    /// Merge fields into a job's progress and phase.
    pub async fn update(&self, id: JobId, update: JobUpdate) {
        self.with_job(id, |job| {
            if let Some(phase) = update.phase {
                job.phase = phase;
            }
            let p = &mut job.progress;
            if let Some(percent) = update.percent {
                p.percent = percent;
            }
            if let Some(item) = update.current_item {
                p.current_item = Some(item);
            }
            if let Some(index) = update.item_index {
                p.item_index = index;
            }
            if let Some(total) = update.item_total {
                p.item_total = total;
            }
            if let Some(processed) = update.processed_units {
                p.processed_units = processed;
            }
            if let Some(total) = update.total_units {
                p.total_units = total;
            }
        })
        .await;
    }

    /// Zero the progress for a fresh attempt of the same job.
    pub async fn restart(&self, id: JobId) {
        self.with_job(id, |job| {
            job.phase = JobPhase::Starting;
            job.progress = JobProgress::default();
            job.finished_at = None;
        })
        .await;
    }

    /// Mark a job finished at 100%. A `None` path keeps any path already
    /// recorded.
    pub async fn complete(&self, id: JobId, result_file_path: Option<PathBuf>) {
        self.with_job(id, |job| {
            job.phase = JobPhase::Completed;
            job.progress.percent = 100;
            if result_file_path.is_some() {
                job.result_file_path = result_file_path;
            }
            job.finished_at = Some(Utc::now());
        })
        .await;
    }

    /// Keep a failed job listed, with whatever progress it reached.
    pub async fn fail(&self, id: JobId) {
        self.with_job(id, |job| {
            job.phase = JobPhase::Failed;
            job.finished_at = Some(Utc::now());
        })
        .await;
    }

    /// Forget a job. Unknown ids are ignored, so a second remove is harmless.
    pub async fn remove(&self, id: JobId) {
        let mut jobs = self.inner.write().await;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            trace!(job_id = %id, "Remove for unknown job ignored");
        }
    }

    /// Copy of one job, if still listed.
    pub async fn get(&self, id: JobId) -> Option<TransferJob> {
        let jobs = self.inner.read().await;
        jobs.iter().find(|j| j.id == id).cloned()
    }

    /// Snapshot for rendering, in insertion order.
    pub async fn list(&self) -> Vec<TransferJob> {
        self.inner.read().await.clone()
    }

    /// Jobs still starting, transferring or paused.
    pub async fn active_count(&self) -> usize {
        let jobs = self.inner.read().await;
        jobs.iter().filter(|j| j.phase.is_active()).count()
    }

    async fn with_job(&self, id: JobId, f: impl FnOnce(&mut TransferJob)) {
        let mut jobs = self.inner.write().await;
        match jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => f(job),
            None => trace!(job_id = %id, "Update for unknown job ignored"),
        }
    }
}

fn new_record(job: NewJob) -> TransferJob {
    TransferJob {
        id: JobId::new(),
        connection_id: job.connection_id,
        direction: job.direction,
        scope: job.scope,
        selection: job.selection,
        label: job.label,
        phase: JobPhase::Starting,
        progress: JobProgress::default(),
        result_file_path: None,
        can_pause: job.can_pause,
        created_at: Utc::now(),
        finished_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Scope, TransferDirection};

    fn new_job(connection: &str, label: &str) -> NewJob {
        NewJob {
            connection_id: connection.to_string(),
            direction: TransferDirection::Import,
            scope: Scope::Database {
                database: "shop".into(),
            },
            selection: vec!["users".into(), "orders".into()],
            label: label.to_string(),
            can_pause: true,
        }
    }

    #[tokio::test]
    async fn test_registry_basic_operations() {
        let registry = JobRegistry::new();
        assert!(registry.list().await.is_empty());

        let id = registry.track(new_job("local", "Import shop")).await;
        let job = registry.get(id).await.unwrap();
        assert_eq!(job.phase, JobPhase::Starting);
        assert_eq!(job.label, "Import shop");

        registry
            .update(
                id,
                JobUpdate {
                    phase: Some(JobPhase::Transferring),
                    percent: Some(40),
                    current_item: Some("users".into()),
                    ..Default::default()
                },
            )
            .await;
        registry
            .update(
                id,
                JobUpdate {
                    processed_units: Some(4000),
                    ..Default::default()
                },
            )
            .await;

        let job = registry.get(id).await.unwrap();
        assert_eq!(job.phase_label(), "importing");
        assert_eq!(job.progress.percent, 40);
        assert_eq!(job.progress.current_item.as_deref(), Some("users"));
        assert_eq!(job.progress.processed_units, 4000);

        registry.remove(id).await;
        assert!(registry.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_complete_stamps_result_path_and_keeps_job() {
        let registry = JobRegistry::new();
        let id = registry.track(new_job("local", "Export shop")).await;

        registry
            .complete(id, Some(PathBuf::from("/tmp/shop.json")))
            .await;

        let job = registry.get(id).await.unwrap();
        assert_eq!(job.phase, JobPhase::Completed);
        assert_eq!(job.progress.percent, 100);
        assert_eq!(job.result_file_path, Some(PathBuf::from("/tmp/shop.json")));
        assert!(job.finished_at.is_some());
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_ignored() {
        let registry = JobRegistry::new();
        let id = registry.track(new_job("local", "Import shop")).await;
        let before = registry.list().await;

        let ghost = JobId::new();
        registry.update(ghost, JobUpdate::phase(JobPhase::Failed)).await;
        registry.complete(ghost, None).await;
        registry.fail(ghost).await;
        registry.restart(ghost).await;
        registry.remove(ghost).await;

        assert_eq!(registry.list().await, before);
        assert!(registry.get(id).await.is_some());
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let registry = JobRegistry::new();
        let a = registry.track(new_job("a", "first")).await;
        let b = registry.track(new_job("b", "second")).await;
        let c = registry.track(new_job("c", "third")).await;

        let ids: Vec<JobId> = registry.list().await.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[tokio::test]
    async fn test_try_track_refuses_busy_connection() {
        let registry = JobRegistry::new();
        let first = registry.try_track(new_job("local", "one")).await.unwrap();

        let err = registry.try_track(new_job("local", "two")).await.unwrap_err();
        assert_eq!(err, TransferError::ConnectionBusy { job_id: first });

        // Other connections are unaffected.
        assert!(registry.try_track(new_job("remote", "three")).await.is_ok());

        registry.complete(first, None).await;
        assert!(registry.try_track(new_job("local", "four")).await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_zeroes_progress() {
        let registry = JobRegistry::new();
        let id = registry.track(new_job("local", "Import shop")).await;
        registry
            .update(
                id,
                JobUpdate {
                    phase: Some(JobPhase::Transferring),
                    percent: Some(70),
                    processed_units: Some(700),
                    ..Default::default()
                },
            )
            .await;
        registry.fail(id).await;

        registry.restart(id).await;

        let job = registry.get(id).await.unwrap();
        assert_eq!(job.phase, JobPhase::Starting);
        assert_eq!(job.progress, JobProgress::default());
        assert_eq!(job.selection, vec!["users".to_string(), "orders".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_from_clones() {
        let registry = JobRegistry::new();
        let id = registry.track(new_job("local", "Import shop")).await;

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .update(
                        id,
                        JobUpdate {
                            processed_units: Some(i),
                            ..Default::default()
                        },
                    )
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.list().await.len(), 1);
    }
}
