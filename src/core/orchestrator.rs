use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::context::AppContext;
use crate::core::dialog::{
    DialogPhase, DialogProgress, DialogTarget, OverridePrompt, PreviewTicket, SourceDatabase,
    TransferDialog,
};
use crate::core::error::{EngineError, Result};
use crate::core::models::{DryRunResult, JobId, TransferFormat, TransferMode};
use crate::core::recovery::RecoveryAction;
use crate::core::transfer_engine::TransferEngine;

/// User intents delivered to a dialog's event loop.
#[derive(Debug, Clone)]
pub enum DialogCommand {
    LoadSource(Vec<SourceDatabase>),
    ChildrenLoaded {
        database: String,
        collections: Vec<String>,
    },
    ToggleDatabase(String),
    ToggleCollection {
        database: String,
        collection: String,
    },
    SetMode(TransferMode),
    SetFormat(TransferFormat),
    SetDestination(String),
    SetOutputPath(PathBuf),
    ConfirmOverride(String),
    Preview,
    CancelPreview,
    BackToConfigure,
    Execute,
    Pause,
    Resume,
    Cancel,
    RunInBackground,
    Recover(RecoveryAction),
    Acknowledge,
    Close,
}

/// Everything a view needs to render the dialog.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogSnapshot {
    pub phase: DialogPhase,
    pub progress: DialogProgress,
    pub job_id: Option<JobId>,
    pub notice: Option<String>,
    pub last_error: Option<String>,
    pub recovery_actions: Vec<RecoveryAction>,
    pub override_prompt: Option<OverridePrompt>,
    pub can_pause: bool,
    pub detached: bool,
    pub selection: Vec<String>,
}

impl DialogSnapshot {
    fn capture(dialog: &TransferDialog, last_error: Option<String>) -> Self {
        Self {
            phase: dialog.phase().clone(),
            progress: dialog.progress().clone(),
            job_id: dialog.job_id(),
            notice: dialog.notice().map(str::to_string),
            last_error,
            recovery_actions: dialog.recovery_actions(),
            override_prompt: dialog.override_prompt(),
            can_pause: dialog.can_pause(),
            detached: dialog.is_detached(),
            selection: dialog.selected_items(),
        }
    }
}

/// Handle held by the view that opened the dialog.
pub struct DialogHandle {
    commands: mpsc::Sender<DialogCommand>,
    snapshots: watch::Receiver<DialogSnapshot>,
    task: JoinHandle<()>,
}

impl DialogHandle {
    /// Queue a command. Fails only if the dialog loop has already exited.
    pub async fn send(&self, command: DialogCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub fn snapshot(&self) -> DialogSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait until a snapshot satisfies `f`. `None` if the loop exited first.
    pub async fn wait_for(
        &mut self,
        f: impl FnMut(&DialogSnapshot) -> bool,
    ) -> Option<DialogSnapshot> {
        self.snapshots.wait_for(f).await.ok().map(|s| (*s).clone())
    }

    /// Next published snapshot. `None` once the loop has exited.
    pub async fn changed(&mut self) -> Option<DialogSnapshot> {
        self.snapshots.changed().await.ok()?;
        Some(self.snapshots.borrow_and_update().clone())
    }

    /// Drop the command side and wait for the loop to settle. Running
    /// transfers continue in the background until they finish.
    pub async fn join(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Dialog task ended abnormally");
        }
    }
}

type PreviewOutcome = (PreviewTicket, std::result::Result<DryRunResult, EngineError>);

/// Event loop of one dialog.
///
/// Merges user commands, the current run's notifications and finished
/// dry-runs. Everything that touches the dialog happens on this one task.
pub struct Orchestrator {
    dialog: TransferDialog,
    engine: Arc<dyn TransferEngine>,
    preview_tx: mpsc::Sender<PreviewOutcome>,
    preview_rx: mpsc::Receiver<PreviewOutcome>,
    /// Refusal of the most recent command, kept until the next one.
    last_error: Option<String>,
    closing: bool,
}

impl Orchestrator {
    pub fn new(ctx: AppContext, engine: Arc<dyn TransferEngine>, target: DialogTarget) -> Self {
        let (preview_tx, preview_rx) = mpsc::channel(4);
        Self {
            dialog: TransferDialog::new(ctx, engine.clone(), target),
            engine,
            preview_tx,
            preview_rx,
            last_error: None,
            closing: false,
        }
    }

    /// Start the loop on its own task.
    pub fn spawn(self) -> DialogHandle {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) =
            watch::channel(DialogSnapshot::capture(&self.dialog, None));
        let span = info_span!("transfer_dialog");
        let task = tokio::spawn(self.run(commands_rx, snapshot_tx).instrument(span));

        DialogHandle {
            commands: commands_tx,
            snapshots: snapshot_rx,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<DialogCommand>,
        snapshots: watch::Sender<DialogSnapshot>,
    ) {
        let mut commands_open = true;

        loop {
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        self.last_error = match self.handle_command(command).await {
                            Ok(()) => None,
                            Err(e) => {
                                debug!(error = %e, "Command refused");
                                Some(e.to_string())
                            }
                        };
                    }
                    None => {
                        commands_open = false;
                        self.dialog.close();
                        self.closing = true;
                    }
                },
                event = self.dialog.next_run_event(), if self.dialog.is_listening() => match event {
                    Some(event) => {
                        self.dialog.handle_event(event).await;
                    }
                    None => self.dialog.run_events_closed().await,
                },
                Some((ticket, outcome)) = self.preview_rx.recv() => {
                    self.dialog.finish_preview(ticket, outcome);
                }
            }

            snapshots.send_replace(DialogSnapshot::capture(&self.dialog, self.last_error.clone()));

            let settled = !self.dialog.phase().is_running();
            if settled && (self.closing || self.dialog.is_detached()) {
                break;
            }
            if *self.dialog.phase() == DialogPhase::Cancelled {
                break;
            }
        }

        info!(job_id = ?self.dialog.job_id(), phase = self.dialog.phase().name(), "Dialog closed");
    }

    async fn handle_command(&mut self, command: DialogCommand) -> Result<()> {
        let dialog = &mut self.dialog;
        match command {
            DialogCommand::LoadSource(databases) => dialog.load_source(databases)?,
            DialogCommand::ChildrenLoaded {
                database,
                collections,
            } => dialog.children_loaded(&database, collections)?,
            DialogCommand::ToggleDatabase(database) => {
                dialog.toggle_database(&database)?;
            }
            DialogCommand::ToggleCollection {
                database,
                collection,
            } => {
                dialog.toggle_collection(&database, &collection)?;
            }
            DialogCommand::SetMode(mode) => dialog.set_mode(mode)?,
            DialogCommand::SetFormat(format) => dialog.set_format(format)?,
            DialogCommand::SetDestination(destination) => dialog.set_destination(destination)?,
            DialogCommand::SetOutputPath(path) => dialog.set_output_path(path)?,
            DialogCommand::ConfirmOverride(typed) => dialog.confirm_override(&typed)?,
            DialogCommand::Preview => {
                let ticket = dialog.begin_preview()?;
                let engine = self.engine.clone();
                let tx = self.preview_tx.clone();
                tokio::spawn(async move {
                    let outcome = engine.dry_run(ticket.request.clone()).await;
                    // The loop may be gone; then nobody wants the result.
                    let _ = tx.send((ticket, outcome)).await;
                });
            }
            DialogCommand::CancelPreview => dialog.cancel_preview()?,
            DialogCommand::BackToConfigure => dialog.back_to_configure()?,
            DialogCommand::Execute => {
                dialog.execute().await?;
            }
            DialogCommand::Pause => dialog.pause().await?,
            DialogCommand::Resume => dialog.resume().await?,
            DialogCommand::Cancel => {
                if *dialog.phase() == DialogPhase::Previewing {
                    dialog.cancel_preview()?;
                } else {
                    dialog.cancel().await?;
                }
            }
            DialogCommand::RunInBackground => {
                dialog.run_in_background()?;
            }
            DialogCommand::Recover(action) => dialog.recover(action).await?,
            DialogCommand::Acknowledge => {
                dialog.acknowledge().await;
                self.closing = true;
            }
            DialogCommand::Close => {
                dialog.close();
                self.closing = true;
            }
        }
        Ok(())
    }
}
