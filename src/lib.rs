//! Orchestration core for bulk import/export between a document database and
//! files: phases, pause/resume/cancel, dry-runs, progress aggregation and
//! recovery from partial failures. The engine that moves documents is an
//! external collaborator behind [`core::TransferEngine`].

pub mod config;
pub mod context;
pub mod core;
pub mod logging;
