use crate::core::error::EngineError;
use crate::core::models::{
    DryRunItem, DryRunResult, ItemResult, JobId, TransferDirection, TransferMode, TransferRequest,
    TransferResult,
};
use crate::core::transfer_engine::{
    EngineEventKind, EventBus, ProgressEvent, ProgressStage, RunEvents, RunReporter, Subscription,
    TransferEngine,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span};

/// One-shot failure injected into the next run that reaches `item`.
#[derive(Debug, Clone)]
pub struct SimulatedFailure {
    pub item: String,
    pub after_docs: u64,
    pub message: String,
}

struct RunControl {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    can_pause: bool,
    reporter: RunReporter,
}

/// In-process engine that pretends to move documents.
///
/// Each selected item holds `docs_per_item` documents (or its entry in
/// `item_docs`), of which `existing_docs` are already at the destination.
/// Progress is emitted every `tick`.
pub struct SimulatedEngine {
    pub docs_per_item: u64,
    pub item_docs: HashMap<String, u64>,
    pub existing_docs: HashMap<String, u64>,
    pub docs_per_tick: u64,
    pub tick: Duration,
    pub dry_run_delay: Duration,
    /// Re-send the previous progress notification after each new one.
    pub replay_stale_progress: bool,
    pub fail_dry_run: bool,
    failure: Mutex<Option<SimulatedFailure>>,
    bus: EventBus,
    runs: Arc<Mutex<HashMap<JobId, RunControl>>>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SimulatedEngine {
    pub fn new(event_buffer: usize) -> Self {
        Self {
            docs_per_item: 1000,
            item_docs: HashMap::new(),
            existing_docs: HashMap::new(),
            docs_per_tick: 250,
            tick: Duration::from_millis(20),
            dry_run_delay: Duration::from_millis(10),
            replay_stale_progress: false,
            fail_dry_run: false,
            failure: Mutex::new(None),
            bus: EventBus::new(event_buffer),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn fail_once(&self, failure: SimulatedFailure) {
        *self.failure.lock().await = Some(failure);
    }

    pub async fn running_jobs(&self) -> usize {
        self.runs.lock().await.len()
    }

    fn docs_for(&self, item: &str) -> u64 {
        self.item_docs
            .get(item)
            .copied()
            .unwrap_or(self.docs_per_item)
    }

    fn existing_for(&self, item: &str) -> u64 {
        self.existing_docs.get(item).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TransferEngine for SimulatedEngine {
    async fn start_transfer(
        &self,
        job_id: JobId,
        request: TransferRequest,
    ) -> Result<RunEvents, EngineError> {
        if request.selection.is_empty() {
            return Err(EngineError::Rejected("empty selection".into()));
        }

        let mut runs = self.runs.lock().await;
        if runs.contains_key(&job_id) {
            return Err(EngineError::Rejected(format!("job {job_id} is already running")));
        }

        let failure = {
            let mut slot = self.failure.lock().await;
            match slot.as_ref() {
                Some(f) if request.selection.contains(&f.item) => slot.take(),
                _ => None,
            }
        };

        let plan = RunPlan {
            items: request
                .selection
                .iter()
                .map(|name| PlannedItem {
                    name: name.clone(),
                    docs: self.docs_for(name),
                    existing: self.existing_for(name),
                })
                .collect(),
            mode: request.mode,
            docs_per_tick: self.docs_per_tick.max(1),
            tick: self.tick,
            replay_stale_progress: self.replay_stale_progress,
            failure,
            result_file_path: match request.direction {
                TransferDirection::Export => Some(
                    request
                        .output_path
                        .clone()
                        .unwrap_or_else(|| PathBuf::from(format!("{}-export.json", request.connection_id))),
                ),
                TransferDirection::Import => None,
            },
        };

        let cancel = CancellationToken::new();
        let (paused_tx, paused_rx) = watch::channel(false);
        let (reporter, events) = RunReporter::new(job_id, self.bus.clone());
        runs.insert(
            job_id,
            RunControl {
                cancel: cancel.clone(),
                paused: paused_tx,
                can_pause: request.format.supports_pause(),
                reporter: reporter.clone(),
            },
        );
        drop(runs);

        let runs = self.runs.clone();
        let span = info_span!("simulated_transfer", job_id = %job_id);

        tokio::spawn(
            async move {
                info!(items = plan.items.len(), "Starting simulated transfer");
                let kind = run(&plan, &reporter, cancel, paused_rx).await;
                // Drop the control's reporter first so the stream closes after the outcome.
                runs.lock().await.remove(&job_id);
                reporter.emit(kind);
            }
            .instrument(span),
        );

        Ok(events)
    }

    async fn dry_run(&self, request: TransferRequest) -> Result<DryRunResult, EngineError> {
        sleep(self.dry_run_delay).await;

        if self.fail_dry_run {
            return Err(EngineError::Failed("could not read source".into()));
        }

        let destructive = request.mode == TransferMode::Override;
        let items = request
            .selection
            .iter()
            .map(|name| {
                let docs = self.docs_for(name);
                let existing = self.existing_for(name);
                if destructive {
                    DryRunItem {
                        name: name.clone(),
                        would_insert: docs,
                        would_skip: 0,
                        would_drop: existing,
                    }
                } else {
                    DryRunItem {
                        name: name.clone(),
                        would_insert: docs.saturating_sub(existing),
                        would_skip: existing.min(docs),
                        would_drop: 0,
                    }
                }
            })
            .collect();

        Ok(DryRunResult {
            items,
            errors: Vec::new(),
            destructive,
        })
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), EngineError> {
        if let Some(control) = self.runs.lock().await.get(&job_id) {
            control.cancel.cancel();
        }
        Ok(())
    }

    async fn pause(&self, job_id: JobId) -> Result<(), EngineError> {
        let runs = self.runs.lock().await;
        let control = runs
            .get(&job_id)
            .ok_or_else(|| EngineError::Rejected("no transfer running".into()))?;
        if control.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !control.can_pause {
            return Err(EngineError::Unsupported("pause"));
        }
        if !*control.paused.borrow() {
            control.paused.send_replace(true);
            control.reporter.emit(EngineEventKind::Paused);
        }
        Ok(())
    }

    async fn resume(&self, job_id: JobId) -> Result<(), EngineError> {
        let runs = self.runs.lock().await;
        let control = runs
            .get(&job_id)
            .ok_or_else(|| EngineError::Rejected("no transfer running".into()))?;
        if control.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if *control.paused.borrow() {
            control.paused.send_replace(false);
            control.reporter.emit(EngineEventKind::Resumed);
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }
}

struct PlannedItem {
    name: String,
    docs: u64,
    existing: u64,
}

struct RunPlan {
    items: Vec<PlannedItem>,
    mode: TransferMode,
    docs_per_tick: u64,
    tick: Duration,
    replay_stale_progress: bool,
    failure: Option<SimulatedFailure>,
    result_file_path: Option<PathBuf>,
}

impl RunPlan {
    fn total_docs(&self) -> u64 {
        self.items.iter().map(|i| i.docs).sum()
    }
}

/// Counts accumulated so far in a run.
#[derive(Default)]
struct Tally {
    items: Vec<ItemResult>,
    dropped: u64,
}

impl Tally {
    fn record(&mut self, item: &PlannedItem, mode: TransferMode, done: u64, prev_done: u64) {
        if self.items.last().is_none_or(|i| i.name != item.name) {
            self.items.push(ItemResult {
                name: item.name.clone(),
                ..Default::default()
            });
        }
        let Some(entry) = self.items.last_mut() else {
            return;
        };
        match mode {
            TransferMode::Override => entry.inserted += done - prev_done,
            TransferMode::Skip => {
                // Existing documents come first in the source order.
                let skipped_now = done.min(item.existing) - prev_done.min(item.existing);
                entry.skipped += skipped_now;
                entry.inserted += (done - prev_done) - skipped_now;
            }
        }
    }

    fn to_result(&self, errors: Vec<String>) -> TransferResult {
        TransferResult {
            items_processed: self.items.clone(),
            total_inserted: self.items.iter().map(|i| i.inserted).sum(),
            total_skipped: self.items.iter().map(|i| i.skipped).sum(),
            total_dropped: (self.dropped > 0).then_some(self.dropped),
            errors,
        }
    }
}

async fn run(
    plan: &RunPlan,
    reporter: &RunReporter,
    cancel: CancellationToken,
    mut paused: watch::Receiver<bool>,
) -> EngineEventKind {
    let total = plan.total_docs();
    let item_total = plan.items.len() as u32;
    let mut processed: u64 = 0;
    let mut tally = Tally::default();
    let mut previous: Option<ProgressEvent> = None;

    reporter.emit(EngineEventKind::Progress(ProgressEvent {
        stage: Some(ProgressStage::Preparing),
        ..Default::default()
    }));

    for (index, item) in plan.items.iter().enumerate() {
        if plan.mode == TransferMode::Override {
            tally.dropped += item.existing;
        }

        let mut done: u64 = 0;
        loop {
            // Hold here while paused, unless cancelled.
            loop {
                let is_paused = *paused.borrow_and_update();
                if !is_paused || cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            if cancel.is_cancelled() {
                debug!("Simulated transfer cancelled");
                return EngineEventKind::Cancelled {
                    partial_result: tally.to_result(Vec::new()),
                };
            }

            if let Some(failure) = plan
                .failure
                .as_ref()
                .filter(|f| f.item == item.name && done >= f.after_docs.min(item.docs))
            {
                let remaining = plan.items[index..].iter().map(|i| i.name.clone()).collect();
                return EngineEventKind::Error {
                    message: failure.message.clone(),
                    partial_result: tally.to_result(Vec::new()),
                    failed_item: Some(item.name.clone()),
                    remaining,
                };
            }

            let event = ProgressEvent {
                item_index: Some(index as u32 + 1),
                item_total: Some(item_total),
                item_name: Some(item.name.clone()),
                processed: Some(processed),
                total: Some(total),
                stage: Some(ProgressStage::Transferring),
            };
            reporter.emit(EngineEventKind::Progress(event.clone()));
            if plan.replay_stale_progress {
                if let Some(stale) = previous.replace(event) {
                    reporter.emit(EngineEventKind::Progress(stale));
                }
            }

            if done >= item.docs {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => continue,
                _ = sleep(plan.tick) => {}
            }

            let step = plan.docs_per_tick.min(item.docs - done);
            tally.record(item, plan.mode, done + step, done);
            done += step;
            processed += step;
        }
    }

    reporter.emit(EngineEventKind::Progress(ProgressEvent {
        processed: Some(processed),
        total: Some(total),
        stage: Some(ProgressStage::Finalizing),
        ..Default::default()
    }));
    info!(processed, "Simulated transfer complete");

    EngineEventKind::Complete {
        result: tally.to_result(Vec::new()),
        result_file_path: plan.result_file_path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Scope, TransferFormat};
    use crate::core::transfer_engine::EngineEvent;
    use tokio::time::timeout;

    fn request(items: &[&str], mode: TransferMode) -> TransferRequest {
        TransferRequest {
            connection_id: "local".into(),
            direction: TransferDirection::Import,
            scope: Scope::Database {
                database: "shop".into(),
            },
            selection: items.iter().map(|s| s.to_string()).collect(),
            mode,
            format: TransferFormat::Json,
            destination: Some("shop".into()),
            output_path: None,
        }
    }

    fn fast_engine() -> SimulatedEngine {
        let mut engine = SimulatedEngine::new(1024);
        engine.docs_per_item = 100;
        engine.docs_per_tick = 50;
        engine.tick = Duration::from_millis(1);
        engine
    }

    async fn terminal(events: &mut RunEvents) -> EngineEvent {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timeout waiting for event")
                .expect("channel closed");
            if !matches!(event.kind, EngineEventKind::Progress(_)) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_skip_mode_counts_existing_as_skipped() {
        let mut engine = fast_engine();
        engine.existing_docs.insert("users".into(), 30);
        let job = JobId::new();

        let mut events = engine
            .start_transfer(job, request(&["users", "orders"], TransferMode::Skip))
            .await
            .unwrap();

        match terminal(&mut events).await.kind {
            EngineEventKind::Complete { result, .. } => {
                assert_eq!(result.total_inserted, 170);
                assert_eq!(result.total_skipped, 30);
                assert_eq!(result.items_processed.len(), 2);
                assert_eq!(result.total_dropped, None);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
        assert_eq!(engine.running_jobs().await, 0);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_reports_remaining_items() {
        let engine = fast_engine();
        engine
            .fail_once(SimulatedFailure {
                item: "orders".into(),
                after_docs: 50,
                message: "connection reset".into(),
            })
            .await;
        let job = JobId::new();

        let mut events = engine
            .start_transfer(job, request(&["users", "orders", "events"], TransferMode::Skip))
            .await
            .unwrap();

        match terminal(&mut events).await.kind {
            EngineEventKind::Error {
                partial_result,
                failed_item,
                remaining,
                ..
            } => {
                assert_eq!(failed_item.as_deref(), Some("orders"));
                assert_eq!(remaining, vec!["orders".to_string(), "events".to_string()]);
                assert_eq!(partial_result.items_processed[0].inserted, 100);
                assert_eq!(partial_result.items_processed[1].inserted, 50);
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pause_rejected_for_archive_format() {
        let mut engine = fast_engine();
        engine.tick = Duration::from_millis(50);
        let job = JobId::new();
        let mut req = request(&["users"], TransferMode::Skip);
        req.format = TransferFormat::Archive;

        engine.start_transfer(job, req).await.unwrap();

        assert_eq!(
            engine.pause(job).await,
            Err(EngineError::Unsupported("pause"))
        );
        engine.cancel(job).await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_is_reported_on_run_and_bus() {
        let mut engine = fast_engine();
        engine.tick = Duration::from_millis(50);
        let mut observer = engine.subscribe();
        let job = JobId::new();

        let mut events = engine
            .start_transfer(job, request(&["users"], TransferMode::Skip))
            .await
            .unwrap();
        engine.pause(job).await.unwrap();
        engine.cancel(job).await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) = timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            if !matches!(event.kind, EngineEventKind::Progress(_)) {
                seen.push(event.kind);
            }
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], EngineEventKind::Paused);
        assert!(matches!(seen[1], EngineEventKind::Cancelled { .. }));

        let mut observed_pause = false;
        while let Ok(Some(event)) = timeout(Duration::from_millis(50), observer.recv()).await {
            observed_pause |= event.kind == EngineEventKind::Paused;
        }
        assert!(observed_pause);
    }

    #[tokio::test]
    async fn test_dry_run_override_reports_drops() {
        let mut engine = fast_engine();
        engine.existing_docs.insert("users".into(), 40);

        let result = engine
            .dry_run(request(&["users", "orders"], TransferMode::Override))
            .await
            .unwrap();

        assert!(result.destructive);
        assert_eq!(result.total_drop(), 40);
        assert_eq!(result.total_insert(), 200);
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let mut engine = fast_engine();
        engine.tick = Duration::from_millis(50);
        let job = JobId::new();

        engine
            .start_transfer(job, request(&["users"], TransferMode::Skip))
            .await
            .unwrap();
        let second = engine
            .start_transfer(job, request(&["users"], TransferMode::Skip))
            .await;

        assert!(matches!(second, Err(EngineError::Rejected(_))));
        engine.cancel(job).await.unwrap();
    }
}
