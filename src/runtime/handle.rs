use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::broadcast,
    task::AbortHandle,
    time::{Duration, MissedTickBehavior},
};
use tracing::warn;

use crate::{
    access::{AccessError, Actor, Operation, authorize},
    core::service::{
        Adjustment, CapacityError, CapacityService, Outcome, ReconcileReport, RefundRequest,
        ReserveRequest,
    },
    ledger::{LedgerEntry, LedgerQuery},
    types::Tokens,
};

use super::events::CapacityEvent;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("blocking task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_capacity: usize,
    /// Zero disables the background drift monitor.
    pub drift_check_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            drift_check_interval_ms: 0,
        }
    }
}

#[derive(Clone)]
pub struct CapacityHandle {
    service: Arc<CapacityService>,
    events_tx: broadcast::Sender<CapacityEvent>,
    monitor: Option<Arc<AbortHandle>>,
}

pub fn spawn_capacity(service: CapacityService, config: RuntimeConfig) -> CapacityHandle {
    let (events_tx, _) = broadcast::channel::<CapacityEvent>(config.event_capacity.max(1));
    let mut handle = CapacityHandle {
        service: Arc::new(service),
        events_tx,
        monitor: None,
    };

    if config.drift_check_interval_ms > 0 {
        let every = Duration::from_millis(config.drift_check_interval_ms);
        let monitor = handle.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = monitor.sweep().await {
                    warn!(error = %err, "drift sweep failed");
                }
            }
        });
        handle.monitor = Some(Arc::new(task.abort_handle()));
    }

    handle
}

impl CapacityHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<CapacityEvent> {
        self.events_tx.subscribe()
    }

    pub fn service(&self) -> &CapacityService {
        &self.service
    }

    pub async fn reserve(&self, req: ReserveRequest) -> Result<Outcome, RuntimeError> {
        let competition_id = req.competition_id.clone();
        let reservation_id = req.reservation_id.clone();
        let spaces = req.spaces;
        let outcome = self.run(move |svc| svc.reserve(&req)).await?;
        match &outcome {
            Outcome::Applied(change) => self.emit(CapacityEvent::Reserved {
                competition_id,
                reservation_id,
                spaces,
                available_after: change.available_after,
            }),
            Outcome::AlreadyApplied(duplicate) => self.emit(CapacityEvent::DuplicateSkipped {
                competition_id,
                duplicate: duplicate.clone(),
            }),
        }
        Ok(outcome)
    }

    pub async fn refund(&self, req: RefundRequest) -> Result<Outcome, RuntimeError> {
        let competition_id = req.competition_id.clone();
        let reservation_id = req.reservation_id.clone();
        let spaces = req.spaces;
        let reason = req.reason;
        let outcome = self.run(move |svc| svc.refund(&req)).await?;
        match &outcome {
            Outcome::Applied(change) => self.emit(CapacityEvent::Refunded {
                competition_id,
                reservation_id,
                spaces,
                reason,
                available_after: change.available_after,
            }),
            Outcome::AlreadyApplied(duplicate) => self.emit(CapacityEvent::DuplicateSkipped {
                competition_id,
                duplicate: duplicate.clone(),
            }),
        }
        Ok(outcome)
    }

    /// Applies a manual adjustment recorded under the actor's user id.
    pub async fn adjust(&self, actor: &Actor, adj: Adjustment) -> Result<Outcome, RuntimeError> {
        authorize(actor, Operation::Adjust)?;
        let adj = Adjustment {
            acting_user: actor.user_id.clone(),
            ..adj
        };
        let competition_id = adj.competition_id.clone();
        let change = adj.change;
        let reason = adj.reason;
        let outcome = self.run(move |svc| svc.adjust(&adj)).await?;
        match &outcome {
            Outcome::Applied(applied) => self.emit(CapacityEvent::Adjusted {
                competition_id,
                change,
                reason,
                available_after: applied.available_after,
            }),
            Outcome::AlreadyApplied(duplicate) => self.emit(CapacityEvent::DuplicateSkipped {
                competition_id,
                duplicate: duplicate.clone(),
            }),
        }
        Ok(outcome)
    }

    pub async fn available(
        &self,
        actor: &Actor,
        competition_id: impl Into<String>,
    ) -> Result<Tokens, RuntimeError> {
        authorize(actor, Operation::GetAvailable)?;
        let competition_id = competition_id.into();
        self.run(move |svc| svc.get_available(&competition_id)).await
    }

    pub async fn ledger(
        &self,
        actor: &Actor,
        competition_id: impl Into<String>,
        query: LedgerQuery,
    ) -> Result<Vec<LedgerEntry>, RuntimeError> {
        authorize(actor, Operation::GetLedger)?;
        let competition_id = competition_id.into();
        self.run(move |svc| svc.get_ledger(&competition_id, &query))
            .await
    }

    pub async fn reconcile(
        &self,
        actor: &Actor,
        competition_id: impl Into<String>,
    ) -> Result<ReconcileReport, RuntimeError> {
        authorize(actor, Operation::Reconcile)?;
        let competition_id = competition_id.into();
        let report = self.run(move |svc| svc.reconcile(&competition_id)).await?;
        self.emit_drift(&report);
        Ok(report)
    }

    pub async fn reconcile_all(&self, actor: &Actor) -> Result<Vec<ReconcileReport>, RuntimeError> {
        authorize(actor, Operation::Reconcile)?;
        self.sweep().await
    }

    /// Stops the background drift monitor, if any.
    pub fn shutdown(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.abort();
        }
    }

    async fn sweep(&self) -> Result<Vec<ReconcileReport>, RuntimeError> {
        let reports = self.run(|svc| svc.reconcile_all()).await?;
        for report in &reports {
            self.emit_drift(report);
        }
        Ok(reports)
    }

    async fn run<T, F>(&self, f: F) -> Result<T, RuntimeError>
    where
        T: Send + 'static,
        F: FnOnce(&CapacityService) -> Result<T, CapacityError> + Send + 'static,
    {
        let service = Arc::clone(&self.service);
        let out = tokio::task::spawn_blocking(move || f(&service))
            .await
            .map_err(|e| RuntimeError::Join(e.to_string()))??;
        Ok(out)
    }

    fn emit_drift(&self, report: &ReconcileReport) {
        if !report.is_accurate {
            self.emit(CapacityEvent::DriftDetected {
                competition_id: report.competition_id.clone(),
                discrepancy: report.discrepancy,
            });
        }
    }

    fn emit(&self, event: CapacityEvent) {
        let _ = self.events_tx.send(event);
    }
}
