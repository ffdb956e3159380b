//! Lifecycle of one import or export dialog.
//!
//! `Select → Configure → [Previewing ⇄ Preview] → Executing (⇄ Paused) →
//! Completed | Cancelled | Failed`, where `Failed` can re-enter `Executing`
//! through a recovery action.
//!
//! Engine notifications drive every execution-side transition. Sending cancel
//! or pause does not change the phase; the matching `Cancelled` / `Paused`
//! event does.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::context::AppContext;
use crate::logging::LogThrottle;

use super::error::{EngineError, Result, TransferError};
use super::models::{
    AtRisk, DryRunResult, JobId, JobPhase, JobUpdate, NewJob, Outcome, Scope, TransferDirection,
    TransferFormat, TransferMode, TransferRequest, TransferResult, TransferSummary,
};
use super::progress::ProgressAggregator;
use super::recovery::{ErrorRecoveryState, RecoveryAction, RecoveryPlan};
use super::samples::SampleStore;
use super::selection::{CheckState, SelectionTree};
use super::transfer_engine::{
    EngineEvent, EngineEventKind, ProgressEvent, RunEvents, TransferEngine,
};

const OVERRIDE_CONFIRMATION: &str = "override";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogPhase {
    Select,
    Configure,
    Previewing,
    Preview(DryRunResult),
    Executing,
    Paused,
    Completed(TransferSummary),
    /// Closed without a result.
    Cancelled,
    Failed { message: String },
}

impl DialogPhase {
    pub fn name(&self) -> &'static str {
        match self {
            DialogPhase::Select => "selecting a source",
            DialogPhase::Configure => "configuring",
            DialogPhase::Previewing => "previewing",
            DialogPhase::Preview(_) => "showing a preview",
            DialogPhase::Executing => "executing",
            DialogPhase::Paused => "paused",
            DialogPhase::Completed(_) => "completed",
            DialogPhase::Cancelled => "cancelled",
            DialogPhase::Failed { .. } => "failed",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, DialogPhase::Executing | DialogPhase::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DialogPhase::Completed(_) | DialogPhase::Cancelled | DialogPhase::Failed { .. }
        )
    }
}

/// What the dialog was opened for.
#[derive(Debug, Clone)]
pub struct DialogTarget {
    pub connection_id: String,
    pub direction: TransferDirection,
    pub scope: Scope,
}

/// One enumerated database of the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDatabase {
    pub name: String,
    /// `None` until collections have been enumerated.
    pub collections: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DialogProgress {
    pub percent: u8,
    pub current_item: Option<String>,
    pub item_index: u32,
    pub item_total: u32,
    pub processed: u64,
    pub total: u64,
    pub eta: Option<Duration>,
    pub throughput: Option<f64>,
}

/// Text the user must type before an override run, and what it will destroy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverridePrompt {
    pub expected: String,
    /// Known only once a destructive dry-run has completed.
    pub at_risk: Option<AtRisk>,
}

/// A dry-run handed out by [`TransferDialog::begin_preview`].
#[derive(Debug, Clone)]
pub struct PreviewTicket {
    generation: u64,
    pub request: TransferRequest,
}

pub struct TransferDialog {
    ctx: AppContext,
    engine: Arc<dyn TransferEngine>,
    target: DialogTarget,
    format: TransferFormat,
    mode: TransferMode,
    destination: Option<String>,
    output_path: Option<PathBuf>,
    selection: SelectionTree,
    phase: DialogPhase,
    notice: Option<String>,

    preview_generation: u64,
    last_dry_run: Option<DryRunResult>,
    override_confirmed: bool,

    job_id: Option<JobId>,
    can_pause: bool,
    run_selection: Vec<String>,
    carried: TransferResult,
    cancel_requested: bool,
    recovery: Option<ErrorRecoveryState>,
    detached: bool,
    run_events: Option<RunEvents>,

    aggregator: ProgressAggregator,
    samples: SampleStore,
    progress: DialogProgress,
    progress_log: LogThrottle,
}

impl TransferDialog {
    pub fn new(ctx: AppContext, engine: Arc<dyn TransferEngine>, target: DialogTarget) -> Self {
        let destination = match (&target.direction, &target.scope) {
            (TransferDirection::Import, Scope::Database { database })
            | (TransferDirection::Import, Scope::Collection { database, .. }) => {
                Some(database.clone())
            }
            _ => None,
        };
        let samples = SampleStore::new(
            Duration::from_secs(ctx.config.eta_window_secs),
            ctx.config.max_samples,
        );
        let progress_log =
            LogThrottle::new(Duration::from_millis(ctx.config.progress_log_interval_ms));

        Self {
            ctx,
            engine,
            target,
            format: TransferFormat::default(),
            mode: TransferMode::default(),
            destination,
            output_path: None,
            selection: SelectionTree::default(),
            phase: DialogPhase::Select,
            notice: None,
            preview_generation: 0,
            last_dry_run: None,
            override_confirmed: false,
            job_id: None,
            can_pause: false,
            run_selection: Vec::new(),
            carried: TransferResult::default(),
            cancel_requested: false,
            recovery: None,
            detached: false,
            run_events: None,
            aggregator: ProgressAggregator::new(),
            samples,
            progress: DialogProgress::default(),
            progress_log,
        }
    }

    pub fn phase(&self) -> &DialogPhase {
        &self.phase
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    pub fn progress(&self) -> &DialogProgress {
        &self.progress
    }

    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn recovery(&self) -> Option<&ErrorRecoveryState> {
        self.recovery.as_ref()
    }

    pub fn selection(&self) -> &SelectionTree {
        &self.selection
    }

    /// True once closed or backgrounded while the transfer was still running.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Whether the current run can still report anything.
    pub fn is_listening(&self) -> bool {
        self.run_events.is_some()
    }

    /// Whether the pause control should be offered at all.
    pub fn can_pause(&self) -> bool {
        self.can_pause && self.phase == DialogPhase::Executing
    }

    /// Item names the transfer would cover right now, in source order.
    pub fn selected_items(&self) -> Vec<String> {
        self.selection.items_for(&self.target.scope)
    }

    // --- Select / Configure -------------------------------------------------

    /// The source has been parsed or enumerated; move on to configuration.
    pub fn load_source(&mut self, databases: Vec<SourceDatabase>) -> Result<()> {
        self.require(
            matches!(self.phase, DialogPhase::Select | DialogPhase::Configure),
            "load a source",
        )?;

        let mut tree = SelectionTree::new(databases.iter().map(|d| d.name.clone()).collect());
        for db in &databases {
            if let Some(collections) = &db.collections {
                tree.children_loaded(&db.name, collections.clone());
            }
        }
        match &self.target.scope {
            Scope::Connection => tree.select_all(),
            Scope::Database { database } => tree.set_parent(database, true),
            Scope::Collection {
                database,
                collection,
            } => tree.toggle_child(database, collection),
        }

        self.selection = tree;
        self.invalidate_preview();
        self.transition(DialogPhase::Configure);
        Ok(())
    }

    /// Collections of `database` became known.
    pub fn children_loaded(&mut self, database: &str, collections: Vec<String>) -> Result<()> {
        self.require(!self.phase.is_running() && !self.phase.is_terminal(), "change the selection")?;
        let before = self.selected_items();
        self.selection.children_loaded(database, collections);
        if self.selected_items() != before {
            self.selection_changed();
        }
        Ok(())
    }

    /// Flip a whole database and report its new tri-state.
    pub fn toggle_database(&mut self, database: &str) -> Result<CheckState> {
        self.require_configuring("change the selection")?;
        self.selection.toggle_parent(database);
        self.selection_changed();
        Ok(self.selection.state(database))
    }

    pub fn toggle_collection(&mut self, database: &str, collection: &str) -> Result<CheckState> {
        self.require_configuring("change the selection")?;
        self.selection.toggle_child(database, collection);
        self.selection_changed();
        Ok(self.selection.state(database))
    }

    /// Changing the mode revokes any override confirmation and cached dry-run.
    pub fn set_mode(&mut self, mode: TransferMode) -> Result<()> {
        self.require_configuring("change the mode")?;
        if self.mode != mode {
            self.mode = mode;
            self.selection_changed();
        }
        Ok(())
    }

    pub fn set_format(&mut self, format: TransferFormat) -> Result<()> {
        self.require_configuring("change the format")?;
        if self.format != format {
            self.format = format;
            self.selection_changed();
        }
        Ok(())
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) -> Result<()> {
        self.require_configuring("change the destination")?;
        self.destination = Some(destination.into());
        self.selection_changed();
        Ok(())
    }

    pub fn set_output_path(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.require_configuring("change the output file")?;
        self.output_path = Some(path.into());
        Ok(())
    }

    /// The confirmation required before an override run, if the mode needs one.
    pub fn override_prompt(&self) -> Option<OverridePrompt> {
        if self.mode != TransferMode::Override {
            return None;
        }
        Some(OverridePrompt {
            expected: self.confirmation_text(),
            at_risk: self
                .last_dry_run
                .as_ref()
                .filter(|d| d.destructive)
                .map(DryRunResult::at_risk),
        })
    }

    /// Check the typed confirmation. A mismatch also revokes an earlier match.
    pub fn confirm_override(&mut self, typed: &str) -> Result<()> {
        self.require(
            matches!(self.phase, DialogPhase::Configure | DialogPhase::Preview(_)),
            "confirm",
        )?;
        if self.mode != TransferMode::Override {
            return Ok(());
        }
        if typed.trim() != self.confirmation_text() {
            self.override_confirmed = false;
            return Err(TransferError::ConfirmationMismatch);
        }
        self.override_confirmed = true;
        Ok(())
    }

    // --- Previewing / Preview -----------------------------------------------

    /// Enter `Previewing` and hand out the dry-run to perform. Any dry-run
    /// already in flight is superseded.
    pub fn begin_preview(&mut self) -> Result<PreviewTicket> {
        self.require(
            matches!(
                self.phase,
                DialogPhase::Configure | DialogPhase::Previewing | DialogPhase::Preview(_)
            ),
            "preview",
        )?;
        let selection = self.validated_selection()?;

        self.preview_generation += 1;
        self.notice = None;
        self.transition(DialogPhase::Previewing);
        Ok(PreviewTicket {
            generation: self.preview_generation,
            request: self.request(selection),
        })
    }

    /// Apply a dry-run outcome. Returns `false` if the ticket was superseded,
    /// in which case nothing changes.
    pub fn finish_preview(
        &mut self,
        ticket: PreviewTicket,
        outcome: std::result::Result<DryRunResult, EngineError>,
    ) -> bool {
        if ticket.generation != self.preview_generation || self.phase != DialogPhase::Previewing {
            debug!(
                generation = ticket.generation,
                current = self.preview_generation,
                "Dropping superseded dry-run result"
            );
            return false;
        }

        match outcome {
            Ok(result) => {
                self.last_dry_run = Some(result.clone());
                self.transition(DialogPhase::Preview(result));
            }
            Err(e) => {
                warn!(error = %e, "Dry run failed");
                self.notice = Some(format!("Dry run failed: {e}"));
                self.transition(DialogPhase::Configure);
            }
        }
        true
    }

    /// Run a dry-run to completion. Equivalent to `begin_preview` followed by
    /// `finish_preview`.
    pub async fn preview(&mut self) -> Result<bool> {
        let ticket = self.begin_preview()?;
        let outcome = self.engine.dry_run(ticket.request.clone()).await;
        Ok(self.finish_preview(ticket, outcome))
    }

    /// Abandon an in-flight dry-run and return to `Configure`.
    pub fn cancel_preview(&mut self) -> Result<()> {
        self.require(self.phase == DialogPhase::Previewing, "cancel the preview")?;
        self.preview_generation += 1;
        self.transition(DialogPhase::Configure);
        Ok(())
    }

    /// Leave a finished preview. The dry-run stays cached for the override prompt.
    pub fn back_to_configure(&mut self) -> Result<()> {
        self.require(matches!(self.phase, DialogPhase::Preview(_)), "go back")?;
        self.transition(DialogPhase::Configure);
        Ok(())
    }

    // --- Executing ----------------------------------------------------------

    /// Track a job and launch the real transfer.
    pub async fn execute(&mut self) -> Result<JobId> {
        self.require(
            matches!(self.phase, DialogPhase::Configure | DialogPhase::Preview(_)),
            "start the transfer",
        )?;
        let selection = self.validated_selection()?;
        if self.mode == TransferMode::Override && !self.override_confirmed {
            return Err(TransferError::ConfirmationRequired);
        }

        let can_pause = self.engine.supports_pause(self.format);
        let new_job = NewJob {
            connection_id: self.target.connection_id.clone(),
            direction: self.target.direction,
            scope: self.target.scope.clone(),
            selection: selection.clone(),
            label: self.label(&selection),
            can_pause,
        };
        let job_id = if self.ctx.config.single_flight {
            self.ctx.registry.try_track(new_job).await?
        } else {
            self.ctx.registry.track(new_job).await
        };

        let previous = self.phase.clone();
        self.job_id = Some(job_id);
        self.can_pause = can_pause;
        self.carried = TransferResult::default();

        if let Err(e) = self.launch(job_id, selection).await {
            // Refused before anything ran: a setup error, nothing to keep.
            self.ctx.registry.remove(job_id).await;
            self.job_id = None;
            self.phase = previous;
            if !e.is_cancellation() {
                self.notice = Some(e.to_string());
            }
            return Err(e.into());
        }

        Ok(job_id)
    }

    /// Ask the engine to cancel. The phase changes when `Cancelled` arrives.
    pub async fn cancel(&mut self) -> Result<()> {
        self.require(self.phase.is_running(), "cancel")?;
        let Some(job_id) = self.job_id else {
            return Ok(());
        };
        if self.cancel_requested {
            return Ok(());
        }
        self.cancel_requested = true;
        info!(job_id = %job_id, "Cancellation requested");
        if let Err(e) = self.engine.cancel(job_id).await {
            if e.is_cancellation() {
                debug!(job_id = %job_id, "Cancel raced an earlier cancel");
            } else {
                warn!(job_id = %job_id, error = %e, "Cancel command failed");
            }
        }
        Ok(())
    }

    /// Ask the engine to hold the run. The phase moves to `Paused` only when
    /// the engine acknowledges; formats without pause support are refused here.
    pub async fn pause(&mut self) -> Result<()> {
        self.require(self.phase == DialogPhase::Executing, "pause")?;
        if !self.can_pause {
            return Err(TransferError::PauseUnsupported);
        }
        let Some(job_id) = self.job_id else {
            return Ok(());
        };
        let outcome = self.engine.pause(job_id).await;
        self.command_outcome(job_id, "pause", outcome)
    }

    /// Counterpart of [`pause`](Self::pause), acknowledged by `Resumed`.
    pub async fn resume(&mut self) -> Result<()> {
        self.require(self.phase == DialogPhase::Paused, "resume")?;
        let Some(job_id) = self.job_id else {
            return Ok(());
        };
        let outcome = self.engine.resume(job_id).await;
        self.command_outcome(job_id, "resume", outcome)
    }

    /// Detach from the running job; it keeps its registry entry and keeps
    /// receiving progress.
    pub fn run_in_background(&mut self) -> Result<JobId> {
        self.require(self.phase.is_running(), "run in background")?;
        self.detached = true;
        let job_id = self.job_id.ok_or(TransferError::InvalidTransition {
            phase: self.phase.name(),
            action: "run in background",
        })?;
        info!(job_id = %job_id, "Transfer moved to background");
        Ok(job_id)
    }

    /// Close the dialog. Running transfers are moved to the background
    /// instead of being stopped.
    pub fn close(&mut self) {
        if self.phase.is_running() {
            self.detached = true;
            info!(job_id = ?self.job_id, "Dialog closed; transfer continues in background");
            return;
        }
        if let (DialogPhase::Failed { .. }, Some(job_id)) = (&self.phase, self.job_id) {
            // Failed job left listed with its partial progress.
            self.recovery = None;
            debug!(job_id = %job_id, "Dialog closed on failed job");
        }
        if !self.phase.is_terminal() {
            self.preview_generation += 1;
            self.transition(DialogPhase::Cancelled);
        }
    }

    /// Drop a settled job from the background list.
    pub async fn acknowledge(&mut self) {
        if let Some(job_id) = self.job_id {
            if !self.phase.is_running() {
                self.ctx.registry.remove(job_id).await;
            }
        }
    }

    // --- Engine events ------------------------------------------------------

    /// Wait for the current run's next notification. Pending forever when
    /// there is no run, so it can sit in a `select!` unconditionally.
    pub async fn next_run_event(&mut self) -> Option<EngineEvent> {
        match self.run_events.as_mut() {
            Some(events) => events.recv().await,
            None => std::future::pending().await,
        }
    }

    /// The run's stream ended. A run that never delivered its outcome fails
    /// so the user can retry it.
    pub async fn run_events_closed(&mut self) {
        self.run_events = None;
        let Some(job_id) = self.job_id else {
            return;
        };
        if self.phase.is_running() {
            let carried = std::mem::take(&mut self.carried);
            let remaining = self.run_selection.clone();
            self.fail(
                job_id,
                "transfer engine stopped reporting".into(),
                carried,
                None,
                remaining,
            )
            .await;
        }
    }

    /// Apply an engine notification. Returns whether it belonged to this dialog.
    pub async fn handle_event(&mut self, event: EngineEvent) -> bool {
        let Some(job_id) = self.job_id.filter(|id| *id == event.job_id) else {
            trace!(job_id = %event.job_id, "Ignoring event for another job");
            return false;
        };

        match event.kind {
            EngineEventKind::Progress(progress) => {
                if self.phase.is_running() {
                    self.apply_progress(job_id, &progress).await;
                }
            }
            EngineEventKind::Paused => {
                if self.phase == DialogPhase::Executing {
                    self.transition(DialogPhase::Paused);
                    self.ctx
                        .registry
                        .update(job_id, JobUpdate::phase(JobPhase::Paused))
                        .await;
                }
            }
            EngineEventKind::Resumed => {
                if self.phase == DialogPhase::Paused {
                    self.transition(DialogPhase::Executing);
                    self.ctx
                        .registry
                        .update(job_id, JobUpdate::phase(JobPhase::Transferring))
                        .await;
                }
            }
            EngineEventKind::Complete {
                result,
                result_file_path,
            } => {
                if self.phase.is_running() {
                    let mut total = std::mem::take(&mut self.carried);
                    total.merge(result);
                    self.progress.percent = 100;
                    self.progress.eta = None;
                    self.ctx
                        .registry
                        .complete(job_id, result_file_path.clone())
                        .await;
                    self.transition(DialogPhase::Completed(TransferSummary {
                        outcome: Outcome::Clean,
                        result: total,
                        result_file_path,
                    }));
                }
            }
            EngineEventKind::Cancelled { partial_result } => {
                if self.phase.is_running() {
                    let mut total = std::mem::take(&mut self.carried);
                    total.merge(partial_result);
                    self.progress.eta = None;
                    self.ctx.registry.remove(job_id).await;
                    self.transition(DialogPhase::Completed(TransferSummary {
                        outcome: Outcome::Cancelled,
                        result: total,
                        result_file_path: None,
                    }));
                }
            }
            EngineEventKind::Error {
                message,
                partial_result,
                failed_item,
                remaining,
            } => {
                if self.phase.is_running() {
                    let mut total = std::mem::take(&mut self.carried);
                    total.merge(partial_result);
                    let remaining = if remaining.is_empty() && failed_item.is_none() {
                        self.run_selection.clone()
                    } else {
                        remaining
                    };
                    self.fail(job_id, message, total, failed_item, remaining)
                        .await;
                }
            }
        }
        true
    }

    // --- Failed -------------------------------------------------------------

    /// Actions the failure allows; empty unless `Failed`.
    pub fn recovery_actions(&self) -> Vec<RecoveryAction> {
        self.recovery
            .as_ref()
            .map(ErrorRecoveryState::available_actions)
            .unwrap_or_default()
    }

    /// Consume the recovery state. A retry or skip relaunches under the same
    /// job id; a dismiss keeps whatever was already transferred.
    pub async fn recover(&mut self, action: RecoveryAction) -> Result<()> {
        self.require(matches!(self.phase, DialogPhase::Failed { .. }), "recover")?;
        let state = self.recovery.take().ok_or(TransferError::NoRecoveryState)?;
        let Some(job_id) = self.job_id else {
            return Err(TransferError::NoRecoveryState);
        };

        let reinvokes = state
            .available_actions()
            .contains(&action)
            && action != RecoveryAction::Dismiss;
        if reinvokes && self.ctx.config.single_flight {
            let busy = self
                .ctx
                .registry
                .list()
                .await
                .into_iter()
                .find(|j| {
                    j.id != job_id
                        && j.connection_id == self.target.connection_id
                        && j.phase.is_active()
                });
            if let Some(busy) = busy {
                // Not consumed: the same state stays on offer.
                self.recovery = Some(state);
                return Err(TransferError::ConnectionBusy { job_id: busy.id });
            }
        }

        info!(job_id = %job_id, ?action, "Recovering failed transfer");
        match state.plan(action) {
            RecoveryPlan::Reinvoke {
                selection,
                carried,
                skipped,
            } => {
                if let Some(item) = skipped {
                    info!(job_id = %job_id, item = %item, "Skipping failed item");
                }
                self.carried = carried;
                if let Err(e) = self.launch(job_id, selection.clone()).await {
                    // Refused relaunch fails into a fresh recovery state.
                    let carried = std::mem::take(&mut self.carried);
                    let failed_item = selection.first().cloned();
                    self.fail(job_id, e.to_string(), carried, failed_item, selection)
                        .await;
                    return Err(e.into());
                }
            }
            RecoveryPlan::Complete(result) => {
                self.ctx.registry.complete(job_id, None).await;
                self.transition(DialogPhase::Completed(TransferSummary {
                    outcome: Outcome::Partial,
                    result,
                    result_file_path: None,
                }));
            }
            RecoveryPlan::Close => {
                self.ctx.registry.remove(job_id).await;
                self.transition(DialogPhase::Cancelled);
            }
        }
        Ok(())
    }

    // --- internals ----------------------------------------------------------

    async fn launch(
        &mut self,
        job_id: JobId,
        selection: Vec<String>,
    ) -> std::result::Result<(), EngineError> {
        self.aggregator.reset();
        self.samples.reset();
        self.progress = DialogProgress::default();
        self.cancel_requested = false;
        self.notice = None;
        self.progress_log.reset();
        self.ctx.registry.restart(job_id).await;

        let request = self.request(selection.clone());
        self.run_selection = selection;
        self.transition(DialogPhase::Executing);

        // A relaunch never hears the previous run again.
        self.run_events = None;
        self.run_events = Some(self.engine.start_transfer(job_id, request).await?);
        self.ctx
            .registry
            .update(job_id, JobUpdate::phase(JobPhase::Transferring))
            .await;
        Ok(())
    }

    async fn fail(
        &mut self,
        job_id: JobId,
        message: String,
        partial_result: TransferResult,
        failed_item: Option<String>,
        remaining: Vec<String>,
    ) {
        warn!(
            job_id = %job_id,
            error = %message,
            failed_item = failed_item.as_deref().unwrap_or("-"),
            remaining = remaining.len(),
            "Transfer failed"
        );
        self.progress.eta = None;
        self.ctx.registry.fail(job_id).await;
        self.recovery = Some(ErrorRecoveryState {
            message: message.clone(),
            partial_result,
            failed_item,
            remaining,
        });
        self.transition(DialogPhase::Failed { message });
    }

    async fn apply_progress(&mut self, job_id: JobId, event: &ProgressEvent) {
        let percent = self.aggregator.apply(event);
        let p = &mut self.progress;
        p.percent = percent;
        p.current_item = self.aggregator.current_item().map(str::to_string);
        if let Some(index) = event.item_index {
            p.item_index = index;
        }
        if let Some(total) = event.item_total {
            p.item_total = total;
        }
        if let Some(total) = event.total {
            p.total = total;
        }
        if let Some(processed) = event.processed {
            // Stale counts do not move the sample window backwards.
            p.processed = p.processed.max(processed);
            self.samples.record(p.processed);
        }
        p.eta = self.samples.estimate(p.processed, p.total);
        p.throughput = self.samples.throughput();

        if self.progress_log.should_log() {
            debug!(
                job_id = %job_id,
                percent,
                processed = p.processed,
                total = p.total,
                item = p.current_item.as_deref().unwrap_or("-"),
                "Transfer progress"
            );
        }

        let update = JobUpdate {
            percent: Some(percent),
            current_item: p.current_item.clone(),
            item_index: event.item_index,
            item_total: event.item_total,
            processed_units: event.processed.map(|_| p.processed),
            total_units: event.total,
            ..Default::default()
        };
        self.ctx.registry.update(job_id, update).await;
    }

    fn command_outcome(
        &self,
        job_id: JobId,
        command: &'static str,
        outcome: std::result::Result<(), EngineError>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancellation() || self.cancel_requested => {
                debug!(job_id = %job_id, command, error = %e, "Suppressing error after cancellation");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn validated_selection(&self) -> Result<Vec<String>> {
        if self.selection.parents().is_empty() {
            return Err(TransferError::NoSource);
        }
        let selection = self.selected_items();
        if selection.is_empty() {
            return Err(TransferError::NothingSelected);
        }
        let needs_destination = self.target.direction == TransferDirection::Import
            && !matches!(self.target.scope, Scope::Connection);
        if needs_destination
            && self
                .destination
                .as_deref()
                .is_none_or(|d| d.trim().is_empty())
        {
            return Err(TransferError::MissingDestination);
        }
        Ok(selection)
    }

    fn request(&self, selection: Vec<String>) -> TransferRequest {
        TransferRequest {
            connection_id: self.target.connection_id.clone(),
            direction: self.target.direction,
            scope: self.target.scope.clone(),
            selection,
            mode: self.mode,
            format: self.format,
            destination: self.destination.clone(),
            output_path: self.output_path.clone(),
        }
    }

    fn label(&self, selection: &[String]) -> String {
        let verb = match self.target.direction {
            TransferDirection::Import => "Import",
            TransferDirection::Export => "Export",
        };
        let what = match &self.target.scope {
            Scope::Connection => format!("{} databases", selection.len()),
            Scope::Database { database } => {
                format!("{database} ({} collections)", selection.len())
            }
            Scope::Collection {
                database,
                collection,
            } => format!("{database}.{collection}"),
        };
        format!("{verb} {what}")
    }

    fn confirmation_text(&self) -> String {
        self.destination
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| OVERRIDE_CONFIRMATION.to_string())
    }

    fn selection_changed(&mut self) {
        self.invalidate_preview();
        if matches!(self.phase, DialogPhase::Previewing | DialogPhase::Preview(_)) {
            self.transition(DialogPhase::Configure);
        }
    }

    fn invalidate_preview(&mut self) {
        self.preview_generation += 1;
        self.last_dry_run = None;
        self.override_confirmed = false;
    }

    fn require_configuring(&self, action: &'static str) -> Result<()> {
        self.require(self.phase == DialogPhase::Configure, action)
    }

    fn require(&self, allowed: bool, action: &'static str) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(TransferError::InvalidTransition {
                phase: self.phase.name(),
                action,
            })
        }
    }

    fn transition(&mut self, next: DialogPhase) {
        if self.phase != next {
            info!(
                job_id = ?self.job_id,
                from = self.phase.name(),
                to = next.name(),
                "Dialog phase changed"
            );
        }
        self.phase = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::models::ItemResult;
    use crate::core::transfer_engine::SimulatedEngine;

    fn dialog(direction: TransferDirection, scope: Scope) -> (TransferDialog, AppContext) {
        let ctx = AppContext::new(AppConfig::default());
        let mut engine = SimulatedEngine::new(16);
        engine.tick = Duration::from_secs(1);
        engine.dry_run_delay = Duration::ZERO;
        let target = DialogTarget {
            connection_id: "local".into(),
            direction,
            scope,
        };
        (TransferDialog::new(ctx.clone(), Arc::new(engine), target), ctx)
    }

    fn shop_import() -> (TransferDialog, AppContext) {
        dialog(
            TransferDirection::Import,
            Scope::Database {
                database: "shop".into(),
            },
        )
    }

    fn shop() -> Vec<SourceDatabase> {
        vec![SourceDatabase {
            name: "shop".into(),
            collections: Some(vec!["a".into(), "b".into()]),
        }]
    }

    fn progress(job_id: JobId, processed: u64, total: u64) -> EngineEvent {
        EngineEvent {
            job_id,
            kind: EngineEventKind::Progress(ProgressEvent {
                processed: Some(processed),
                total: Some(total),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_execute_validates_selection() {
        let (mut d, _) = shop_import();
        assert!(matches!(
            d.execute().await,
            Err(TransferError::InvalidTransition { .. })
        ));

        d.load_source(Vec::new()).unwrap();
        assert_eq!(d.execute().await, Err(TransferError::NoSource));

        d.load_source(shop()).unwrap();
        d.toggle_database("shop").unwrap();
        assert_eq!(d.execute().await, Err(TransferError::NothingSelected));
        assert_eq!(*d.phase(), DialogPhase::Configure);
    }

    #[tokio::test]
    async fn test_import_needs_destination() {
        let (mut d, ctx) = shop_import();
        d.load_source(shop()).unwrap();
        d.set_destination("  ").unwrap();

        assert_eq!(d.execute().await, Err(TransferError::MissingDestination));
        assert!(ctx.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_superseded_dry_run_is_dropped() {
        let (mut d, _) = shop_import();
        d.load_source(shop()).unwrap();

        let first = d.begin_preview().unwrap();
        let second = d.begin_preview().unwrap();

        assert!(!d.finish_preview(first, Ok(DryRunResult::default())));
        assert_eq!(*d.phase(), DialogPhase::Previewing);

        assert!(d.finish_preview(second, Ok(DryRunResult::default())));
        assert!(matches!(d.phase(), DialogPhase::Preview(_)));
    }

    #[tokio::test]
    async fn test_preview_runs_dry_run() {
        let (mut d, _) = shop_import();
        d.load_source(shop()).unwrap();

        assert!(d.preview().await.unwrap());
        let DialogPhase::Preview(result) = d.phase() else {
            panic!("expected preview, got {:?}", d.phase());
        };
        assert_eq!(result.items.len(), 2);

        d.back_to_configure().unwrap();
        assert_eq!(*d.phase(), DialogPhase::Configure);
    }

    #[tokio::test]
    async fn test_mode_change_revokes_confirmation() {
        let (mut d, _) = shop_import();
        d.load_source(shop()).unwrap();
        d.set_mode(TransferMode::Override).unwrap();

        assert_eq!(
            d.confirm_override("wrong"),
            Err(TransferError::ConfirmationMismatch)
        );
        d.confirm_override(" shop ").unwrap();

        d.set_mode(TransferMode::Skip).unwrap();
        d.set_mode(TransferMode::Override).unwrap();
        assert_eq!(d.execute().await, Err(TransferError::ConfirmationRequired));
    }

    #[test]
    fn test_confirmation_text_without_destination() {
        let (mut d, _) = dialog(TransferDirection::Export, Scope::Connection);
        d.load_source(shop()).unwrap();
        assert!(d.override_prompt().is_none());

        d.set_mode(TransferMode::Override).unwrap();
        let prompt = d.override_prompt().unwrap();
        assert_eq!(prompt.expected, OVERRIDE_CONFIRMATION);
        assert!(prompt.at_risk.is_none());
    }

    #[tokio::test]
    async fn test_progress_only_moves_forward() {
        let (mut d, ctx) = shop_import();
        d.load_source(shop()).unwrap();
        let job_id = d.execute().await.unwrap();

        assert!(d.handle_event(progress(job_id, 500, 2000)).await);
        assert_eq!(d.progress().percent, 25);

        // Late and out-of-order notifications never lower the bar.
        assert!(d.handle_event(progress(job_id, 100, 2000)).await);
        assert_eq!(d.progress().percent, 25);
        assert_eq!(d.progress().processed, 500);

        assert!(!d.handle_event(progress(JobId::new(), 1900, 2000)).await);
        assert_eq!(d.progress().percent, 25);

        let job = ctx.registry.get(job_id).await.unwrap();
        assert_eq!(job.progress.percent, 25);
        assert_eq!(job.phase, JobPhase::Transferring);
    }

    #[tokio::test]
    async fn test_events_after_completion_are_ignored() {
        let (mut d, ctx) = shop_import();
        d.load_source(shop()).unwrap();
        let job_id = d.execute().await.unwrap();

        let result = TransferResult {
            items_processed: vec![ItemResult {
                name: "a".into(),
                inserted: 10,
                skipped: 0,
            }],
            total_inserted: 10,
            ..Default::default()
        };
        d.handle_event(EngineEvent {
            job_id,
            kind: EngineEventKind::Complete {
                result,
                result_file_path: None,
            },
        })
        .await;
        assert!(matches!(d.phase(), DialogPhase::Completed(_)));

        d.handle_event(EngineEvent {
            job_id,
            kind: EngineEventKind::Error {
                message: "late".into(),
                partial_result: TransferResult::default(),
                failed_item: None,
                remaining: Vec::new(),
            },
        })
        .await;
        d.handle_event(progress(job_id, 1, 2)).await;

        let DialogPhase::Completed(summary) = d.phase() else {
            panic!("expected completed, got {:?}", d.phase());
        };
        assert_eq!(summary.outcome, Outcome::Clean);
        assert_eq!(d.progress().percent, 100);
        assert_eq!(
            ctx.registry.get(job_id).await.unwrap().phase,
            JobPhase::Completed
        );
    }

    #[tokio::test]
    async fn test_error_without_position_retries_whole_run() {
        let (mut d, _) = shop_import();
        d.load_source(shop()).unwrap();
        let job_id = d.execute().await.unwrap();

        d.handle_event(EngineEvent {
            job_id,
            kind: EngineEventKind::Error {
                message: "connection lost".into(),
                partial_result: TransferResult::default(),
                failed_item: None,
                remaining: Vec::new(),
            },
        })
        .await;

        let state = d.recovery().unwrap();
        assert_eq!(state.remaining, vec!["a", "b"]);
        assert_eq!(
            d.recovery_actions(),
            vec![
                RecoveryAction::Retry,
                RecoveryAction::SkipAndContinue,
                RecoveryAction::Dismiss
            ]
        );
    }

    #[tokio::test]
    async fn test_commands_after_cancel_are_quiet() {
        let (mut d, _) = shop_import();
        d.load_source(shop()).unwrap();
        d.execute().await.unwrap();

        d.cancel().await.unwrap();
        d.cancel().await.unwrap();
        assert_eq!(d.pause().await, Ok(()));
        assert_eq!(*d.phase(), DialogPhase::Executing);
    }

    #[tokio::test]
    async fn test_close_while_running_detaches() {
        let (mut d, ctx) = shop_import();
        d.load_source(shop()).unwrap();
        let job_id = d.execute().await.unwrap();

        d.close();
        assert!(d.is_detached());
        assert_eq!(*d.phase(), DialogPhase::Executing);
        assert!(ctx.registry.get(job_id).await.is_some());
    }
}
