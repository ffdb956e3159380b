use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use docport::config::AppConfig;
use docport::context::AppContext;
use docport::core::dialog::SourceDatabase;
use docport::core::transfer_engine::SimulatedFailure;
use docport::core::{
    DialogCommand, DialogPhase, DialogTarget, Orchestrator, RecoveryAction, Scope,
    SimulatedEngine, TransferDirection, TransferEngine, TransferFormat, TransferMode, format_eta,
};
use docport::logging::{self, LogConfig};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "docport")]
#[command(about = "Bulk import/export orchestration for document databases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./docport.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: GlobalArgs,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    single_flight: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated import end to end
    Simulate(SimulateArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Skip,
    Override,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Csv,
    Archive,
}

#[derive(Clone, Copy, ValueEnum)]
enum OnFailure {
    Retry,
    Skip,
    Dismiss,
}

#[derive(Args)]
struct SimulateArgs {
    /// Target database
    #[arg(long, default_value = "shop")]
    database: String,

    /// Collections to import
    #[arg(long, value_delimiter = ',', default_value = "users,orders,events")]
    items: Vec<String>,

    /// Documents per collection
    #[arg(long, default_value_t = 2000)]
    docs: u64,

    /// Documents already present in each destination collection
    #[arg(long, default_value_t = 0)]
    existing: u64,

    #[arg(long, value_enum, default_value = "skip")]
    mode: ModeArg,

    #[arg(long, value_enum, default_value = "json")]
    format: FormatArg,

    /// Confirmation text for override mode
    #[arg(long)]
    confirm: Option<String>,

    /// Preview the transfer before running it
    #[arg(long)]
    dry_run: bool,

    /// Fail once while importing this collection
    #[arg(long)]
    fail_at: Option<String>,

    /// Documents into the failing collection before the failure
    #[arg(long)]
    fail_after: Option<u64>,

    #[arg(long, value_enum, default_value = "dismiss")]
    on_failure: OnFailure,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;
    logging::init(LogConfig::from(&config))?;

    match cli.command {
        Commands::Config => print!("{}", config.to_toml()?),
        Commands::Simulate(args) => run_simulation(config, args)
            .await
            .context("Simulated transfer failed")?,
    }

    Ok(())
}

async fn run_simulation(config: AppConfig, args: SimulateArgs) -> Result<()> {
    let ctx = AppContext::new(config);

    let mut engine = SimulatedEngine::new(ctx.config.event_buffer);
    engine.docs_per_item = args.docs;
    engine.docs_per_tick = ctx.config.simulation.docs_per_tick;
    engine.tick = Duration::from_millis(ctx.config.simulation.tick_ms);
    for item in &args.items {
        engine.existing_docs.insert(item.clone(), args.existing);
    }
    if let Some(item) = &args.fail_at {
        engine
            .fail_once(SimulatedFailure {
                item: item.clone(),
                after_docs: args.fail_after.unwrap_or(args.docs / 2),
                message: "simulated network error".into(),
            })
            .await;
    }
    let engine: Arc<dyn TransferEngine> = Arc::new(engine);

    let target = DialogTarget {
        connection_id: "simulated".into(),
        direction: TransferDirection::Import,
        scope: Scope::Database {
            database: args.database.clone(),
        },
    };
    let mut handle = Orchestrator::new(ctx.clone(), engine, target).spawn();

    let mode = match args.mode {
        ModeArg::Skip => TransferMode::Skip,
        ModeArg::Override => TransferMode::Override,
    };
    let format = match args.format {
        FormatArg::Json => TransferFormat::Json,
        FormatArg::Csv => TransferFormat::Csv,
        FormatArg::Archive => TransferFormat::Archive,
    };

    handle
        .send(DialogCommand::LoadSource(vec![SourceDatabase {
            name: args.database.clone(),
            collections: Some(args.items.clone()),
        }]))
        .await;
    handle.send(DialogCommand::SetFormat(format)).await;
    handle.send(DialogCommand::SetMode(mode)).await;

    if args.dry_run {
        handle.send(DialogCommand::Preview).await;
        let snapshot = handle
            .wait_for(|s| {
                matches!(s.phase, DialogPhase::Preview(_)) || s.notice.is_some() || s.last_error.is_some()
            })
            .await
            .context("Dialog closed during preview")?;
        match &snapshot.phase {
            DialogPhase::Preview(dry) => {
                println!(
                    "Dry run: {} to insert, {} to skip, {} to drop",
                    dry.total_insert(),
                    dry.total_skip(),
                    dry.total_drop()
                );
                for item in &dry.items {
                    println!(
                        "  {}: +{} ~{} -{}",
                        item.name, item.would_insert, item.would_skip, item.would_drop
                    );
                }
            }
            _ => bail!(
                "{}",
                snapshot
                    .notice
                    .or(snapshot.last_error)
                    .unwrap_or_else(|| "preview failed".into())
            ),
        }
    }

    if mode == TransferMode::Override {
        let current = handle
            .wait_for(|s| s.override_prompt.is_some() || s.last_error.is_some())
            .await
            .context("Dialog closed before confirmation")?;
        if let Some(prompt) = current.override_prompt {
            match prompt.at_risk {
                Some(risk) => warn!(
                    records = risk.records,
                    collections = risk.items,
                    "Override will drop existing data; type '{}' to confirm",
                    prompt.expected
                ),
                None => warn!("Override drops existing data; type '{}' to confirm", prompt.expected),
            }
        }
        handle
            .send(DialogCommand::ConfirmOverride(args.confirm.clone().unwrap_or_default()))
            .await;
    }

    handle.send(DialogCommand::Execute).await;

    let mut last_percent = None;
    let mut recovering = false;
    let mut reported: Option<String> = None;
    while let Some(snapshot) = handle.changed().await {
        // Refusals stay on the snapshot until the next command.
        let fresh_error = snapshot.last_error.is_some() && snapshot.last_error != reported;
        reported = snapshot.last_error.clone();
        if let Some(err) = snapshot.last_error.as_ref().filter(|_| fresh_error) {
            if matches!(snapshot.phase, DialogPhase::Configure | DialogPhase::Preview(_)) {
                bail!("{err}");
            }
            warn!(error = %err, "Command refused");
            if recovering && matches!(snapshot.phase, DialogPhase::Failed { .. }) {
                handle
                    .send(DialogCommand::Recover(RecoveryAction::Dismiss))
                    .await;
                continue;
            }
        }

        match &snapshot.phase {
            DialogPhase::Executing | DialogPhase::Paused => {
                recovering = false;
                let p = &snapshot.progress;
                if last_percent != Some(p.percent) {
                    last_percent = Some(p.percent);
                    info!(
                        percent = p.percent,
                        item = p.current_item.as_deref().unwrap_or("-"),
                        eta = %p.eta.map(format_eta).unwrap_or_else(|| "-".into()),
                        "Importing"
                    );
                }
            }
            DialogPhase::Failed { message } if !recovering => {
                warn!(error = %message, "Transfer failed");
                let wanted = match args.on_failure {
                    OnFailure::Retry => RecoveryAction::Retry,
                    OnFailure::Skip => RecoveryAction::SkipAndContinue,
                    OnFailure::Dismiss => RecoveryAction::Dismiss,
                };
                let action = if snapshot.recovery_actions.contains(&wanted) {
                    wanted
                } else {
                    RecoveryAction::Dismiss
                };
                recovering = true;
                last_percent = None;
                handle.send(DialogCommand::Recover(action)).await;
            }
            DialogPhase::Completed(summary) => {
                if args.json {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(summary)
                            .context("Failed to serialize summary")?
                    );
                } else {
                    print!("{}", summary.to_clipboard_text());
                }
                handle.send(DialogCommand::Acknowledge).await;
                break;
            }
            DialogPhase::Cancelled => {
                println!("Nothing was imported.");
                break;
            }
            _ => {}
        }
    }

    handle.join().await;
    Ok(())
}
