//! Boundary to the engine that actually moves documents.
//!
//! Commands go out through [`TransferEngine`]. Each accepted run reports back
//! on its own [`RunEvents`] stream, which never drops a notification and ends
//! after the run's outcome. The same events are also fanned out on a
//! [`Subscription`] for observers; that stream is lossy under load.
//!
//! Progress may still arrive out of order or more than once. Every command and
//! every event carries the job id, so several tracked jobs never confuse each
//! other's pause or cancel.

pub mod simulated;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use super::error::EngineError;
use super::models::{DryRunResult, JobId, TransferFormat, TransferRequest, TransferResult};

pub use simulated::{SimulatedEngine, SimulatedFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Preparing,
    Transferring,
    Finalizing,
}

/// A progress notification. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub item_index: Option<u32>,
    pub item_total: Option<u32>,
    pub item_name: Option<String>,
    pub processed: Option<u64>,
    pub total: Option<u64>,
    pub stage: Option<ProgressStage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEventKind {
    Progress(ProgressEvent),
    Complete {
        result: TransferResult,
        result_file_path: Option<PathBuf>,
    },
    Cancelled {
        partial_result: TransferResult,
    },
    Paused,
    Resumed,
    Error {
        message: String,
        partial_result: TransferResult,
        failed_item: Option<String>,
        /// Items not yet finished, starting with the failed one.
        remaining: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub job_id: JobId,
    pub kind: EngineEventKind,
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Whether runs in this format accept pause/resume.
    fn supports_pause(&self, format: TransferFormat) -> bool {
        format.supports_pause()
    }

    /// Launch a run. Returns once the engine has accepted or refused it. The
    /// returned stream carries the run's notifications, ending with exactly
    /// one of `Complete`, `Cancelled` or `Error`.
    async fn start_transfer(
        &self,
        job_id: JobId,
        request: TransferRequest,
    ) -> Result<RunEvents, EngineError>;

    /// Simulate a run without touching the destination.
    async fn dry_run(&self, request: TransferRequest) -> Result<DryRunResult, EngineError>;

    /// Request cancellation. Acknowledged by a `Cancelled` event.
    async fn cancel(&self, job_id: JobId) -> Result<(), EngineError>;

    /// Hold a running job. Acknowledged by a `Paused` event on its run stream.
    async fn pause(&self, job_id: JobId) -> Result<(), EngineError>;

    async fn resume(&self, job_id: JobId) -> Result<(), EngineError>;

    /// Observe events of every job. Slow observers lose events.
    fn subscribe(&self) -> Subscription;
}

/// Fan-out of engine events to every subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, job_id: JobId, kind: EngineEventKind) {
        self.publish(EngineEvent { job_id, kind });
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine: nobody is watching.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: Some(self.tx.subscribe()),
        }
    }
}

/// Ordered, lossless notifications of a single run.
///
/// Closes once every [`RunReporter`] for the run is dropped, normally right
/// after the terminal event.
#[derive(Debug)]
pub struct RunEvents {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl RunEvents {
    /// Next notification, or `None` once the engine is done with the run.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }
}

/// Engine side of a run's notifications.
///
/// Every event goes to the run's own [`RunEvents`] and to the shared bus.
/// Unbounded so that `pause` and `resume` can report while the caller is
/// still awaiting them.
#[derive(Debug, Clone)]
pub struct RunReporter {
    job_id: JobId,
    tx: mpsc::UnboundedSender<EngineEvent>,
    bus: EventBus,
}

impl RunReporter {
    pub fn new(job_id: JobId, bus: EventBus) -> (Self, RunEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { job_id, tx, bus }, RunEvents { rx })
    }

    pub fn emit(&self, kind: EngineEventKind) {
        let event = EngineEvent {
            job_id: self.job_id,
            kind,
        };
        if self.tx.send(event.clone()).is_err() {
            trace!(job_id = %self.job_id, "Run listener gone");
        }
        self.bus.publish(event);
    }
}

/// Handle on the engine's shared event stream.
///
/// Unsubscribing is idempotent and also happens on drop, after which no
/// further events are delivered to this handle.
#[derive(Debug)]
pub struct Subscription {
    rx: Option<broadcast::Receiver<EngineEvent>>,
}

impl Subscription {
    /// Next event, or `None` once unsubscribed or the engine is gone.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) => return Some(event),
                // Observers only; run outcomes are never read from here.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged; skipping missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            debug!("Engine subscription released");
        }
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_receives_emitted_events() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();
        let job = JobId::new();

        bus.emit(job, EngineEventKind::Paused);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.job_id, job);
        assert_eq!(event.kind, EngineEventKind::Paused);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());

        bus.emit(JobId::new(), EngineEventKind::Resumed);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        let job = JobId::new();

        for _ in 0..5 {
            bus.emit(job, EngineEventKind::Paused);
        }
        bus.emit(job, EngineEventKind::Resumed);

        // Oldest events were overwritten; the stream continues with what is left.
        let mut last = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
        {
            last = Some(event.kind);
        }
        assert_eq!(last, Some(EngineEventKind::Resumed));
    }

    #[tokio::test]
    async fn test_run_events_survive_a_flooded_bus() {
        let bus = EventBus::new(2);
        let mut observer = bus.subscribe();
        let job = JobId::new();
        let (reporter, mut events) = RunReporter::new(job, bus.clone());

        for processed in 0..10 {
            reporter.emit(EngineEventKind::Progress(ProgressEvent {
                processed: Some(processed),
                ..Default::default()
            }));
        }
        reporter.emit(EngineEventKind::Paused);
        drop(reporter);

        let mut kinds = Vec::new();
        while let Some(event) = events.recv().await {
            assert_eq!(event.job_id, job);
            kinds.push(event.kind);
        }
        assert_eq!(kinds.len(), 11);
        assert_eq!(kinds.last(), Some(&EngineEventKind::Paused));

        // The observer lagged but still sees the tail.
        let first = observer.recv().await.unwrap();
        assert_ne!(first.kind, kinds[0]);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = EngineEvent {
            job_id: JobId::new(),
            kind: EngineEventKind::Progress(ProgressEvent {
                processed: Some(10),
                total: Some(100),
                ..Default::default()
            }),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"progress""#));
        assert!(json.contains(r#""processed":10"#));
    }
}
