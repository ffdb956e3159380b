pub mod dialog;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod recovery;
pub mod registry;
pub mod samples;
pub mod selection;
pub mod transfer_engine;

pub use dialog::{DialogPhase, DialogProgress, DialogTarget, SourceDatabase, TransferDialog};
pub use error::{EngineError, TransferError};
pub use models::{
    DryRunResult, JobId, JobPhase, Outcome, Scope, TransferDirection, TransferFormat, TransferJob,
    TransferMode, TransferResult, TransferSummary,
};
pub use orchestrator::{DialogCommand, DialogHandle, DialogSnapshot, Orchestrator};
pub use progress::ProgressAggregator;
pub use recovery::{ErrorRecoveryState, RecoveryAction};
pub use registry::JobRegistry;
pub use samples::{SampleStore, format_eta};
pub use selection::{CheckState, SelectionTree};
pub use transfer_engine::{EngineEvent, EngineEventKind, SimulatedEngine, TransferEngine};
