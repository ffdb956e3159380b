//! Recovery options after a transfer fails mid-flight.
//!
//! A failure captures an [`ErrorRecoveryState`]. Exactly one action consumes it;
//! if the re-invoked run fails again, the engine's new error produces a fresh
//! state rather than an edited old one.

use serde::{Deserialize, Serialize};

use super::models::TransferResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecoveryState {
    pub message: String,
    /// Counts from every attempt so far, including the failed one.
    pub partial_result: TransferResult,
    pub failed_item: Option<String>,
    /// Items not yet finished; the failed item first.
    pub remaining: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    SkipAndContinue,
    Dismiss,
}

/// What the dialog should do with a consumed recovery state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// Run again over `selection`, carrying `carried` into the final totals.
    Reinvoke {
        selection: Vec<String>,
        carried: TransferResult,
        skipped: Option<String>,
    },
    /// Show the partial counts as the final result.
    Complete(TransferResult),
    /// Nothing worth showing.
    Close,
}

impl ErrorRecoveryState {
    /// Retry needs something left to run; skip needs something after the failed item.
    pub fn available_actions(&self) -> Vec<RecoveryAction> {
        let mut actions = Vec::with_capacity(3);
        if !self.remaining.is_empty() {
            actions.push(RecoveryAction::Retry);
        }
        if self.remaining.len() > 1 {
            actions.push(RecoveryAction::SkipAndContinue);
        }
        actions.push(RecoveryAction::Dismiss);
        actions
    }

    /// Consume the state. An action that is not on offer degrades to a dismiss.
    pub fn plan(self, action: RecoveryAction) -> RecoveryPlan {
        match action {
            RecoveryAction::Retry if !self.remaining.is_empty() => RecoveryPlan::Reinvoke {
                selection: self.remaining,
                carried: self.partial_result,
                skipped: None,
            },
            RecoveryAction::SkipAndContinue if self.remaining.len() > 1 => {
                let mut remaining = self.remaining;
                let skipped = remaining.remove(0);
                RecoveryPlan::Reinvoke {
                    selection: remaining,
                    carried: self.partial_result,
                    skipped: Some(skipped),
                }
            }
            // Nothing left to run: behave like dismiss.
            _ => self.dismiss(),
        }
    }

    fn dismiss(self) -> RecoveryPlan {
        if !self.partial_result.has_completed_work() {
            return RecoveryPlan::Close;
        }
        let mut result = self.partial_result;
        result.errors.push(self.message);
        RecoveryPlan::Complete(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ItemResult;

    fn state(remaining: &[&str], inserted: u64) -> ErrorRecoveryState {
        ErrorRecoveryState {
            message: "connection reset".into(),
            partial_result: TransferResult {
                items_processed: vec![ItemResult {
                    name: "users".into(),
                    inserted,
                    skipped: 0,
                }],
                total_inserted: inserted,
                ..Default::default()
            },
            failed_item: remaining.first().map(|s| s.to_string()),
            remaining: remaining.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn retry_reinvokes_with_remaining_only() {
        let plan = state(&["orders", "events"], 500).plan(RecoveryAction::Retry);
        match plan {
            RecoveryPlan::Reinvoke {
                selection,
                carried,
                skipped,
            } => {
                assert_eq!(selection, vec!["orders".to_string(), "events".to_string()]);
                assert_eq!(carried.total_inserted, 500);
                assert_eq!(skipped, None);
            }
            other => panic!("expected Reinvoke, got {other:?}"),
        }
    }

    #[test]
    fn skip_drops_the_failed_item() {
        let plan = state(&["orders", "events"], 500).plan(RecoveryAction::SkipAndContinue);
        match plan {
            RecoveryPlan::Reinvoke {
                selection, skipped, ..
            } => {
                assert_eq!(selection, vec!["events".to_string()]);
                assert_eq!(skipped.as_deref(), Some("orders"));
            }
            other => panic!("expected Reinvoke, got {other:?}"),
        }
    }

    #[test]
    fn skip_with_single_remaining_matches_dismiss() {
        let skip = state(&["orders"], 500).plan(RecoveryAction::SkipAndContinue);
        let dismiss = state(&["orders"], 500).plan(RecoveryAction::Dismiss);
        assert_eq!(skip, dismiss);
        match skip {
            RecoveryPlan::Complete(result) => {
                assert_eq!(result.total_inserted, 500);
                assert_eq!(result.errors, vec!["connection reset".to_string()]);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn dismiss_without_work_closes() {
        assert_eq!(
            state(&["users"], 0).plan(RecoveryAction::Dismiss),
            RecoveryPlan::Close
        );
    }

    #[test]
    fn actions_offered_depend_on_remaining() {
        assert_eq!(
            state(&["a", "b"], 1).available_actions(),
            vec![
                RecoveryAction::Retry,
                RecoveryAction::SkipAndContinue,
                RecoveryAction::Dismiss
            ]
        );
        assert_eq!(
            state(&["a"], 1).available_actions(),
            vec![RecoveryAction::Retry, RecoveryAction::Dismiss]
        );
        assert_eq!(
            state(&[], 1).available_actions(),
            vec![RecoveryAction::Dismiss]
        );
    }
}
