//! Escrow Worker
//!
//! Background sweeps that move transactions no caller will move:
//! timed-out cancel requests, cancelled transactions without a refund,
//! refunds due for retry, and undelivered notifications.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::error::EscrowError;
use super::service::EscrowService;
use super::state::TransactionStatus;
use super::types::{Actor, Refund, RefundRequest};

/// Configuration for the escrow worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to sweep
    pub sweep_interval: Duration,
    /// Maximum rows per sweep step
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub auto_cancelled: usize,
    pub refunds_started: usize,
    pub refunds_retried: usize,
    pub notifications_delivered: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct EscrowWorker {
    service: Arc<EscrowService>,
    config: WorkerConfig,
}

impl EscrowWorker {
    pub fn new(service: Arc<EscrowService>, config: WorkerConfig) -> Self {
        Self { service, config }
    }

    pub fn with_defaults(service: Arc<EscrowService>) -> Self {
        Self::new(service, WorkerConfig::default())
    }

    /// Sweep until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            cancel_timeout_secs = self.service.config().cancel_timeout.as_secs(),
            "Starting escrow worker"
        );

        loop {
            match self.sweep().await {
                Ok(report) if !report.is_empty() => info!(?report, "Escrow sweep finished"),
                Ok(_) => debug!("Escrow sweep found nothing to do"),
                Err(e) => error!(error = %e, "Escrow sweep failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Escrow worker stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Run every step once. A failing item is logged and skipped; only
    /// a failing store query aborts the sweep.
    pub async fn sweep(&self) -> Result<SweepReport, EscrowError> {
        Ok(SweepReport {
            auto_cancelled: self.auto_cancel().await?,
            refunds_started: self.auto_refund().await?,
            refunds_retried: self.retry_refunds().await?,
            notifications_delivered: self.service.flush_outbox(self.config.batch_size).await?,
        })
    }

    async fn auto_cancel(&self) -> Result<usize, EscrowError> {
        let timeout = chrono::Duration::seconds(
            self.service.config().cancel_timeout.as_secs().min(i32::MAX as u64) as i64,
        );
        let stale = self
            .service
            .store()
            .find_stale_cancel_requests(Utc::now() - timeout, self.config.batch_size)
            .await?;

        let mut cancelled = 0;
        for tx in stale {
            match self.service.auto_cancel(tx.id).await {
                Ok(Some(_)) => cancelled += 1,
                Ok(None) => {}
                Err(e) => error!(transaction_id = %tx.id, error = %e, "Auto-cancel failed"),
            }
        }
        Ok(cancelled)
    }

    /// CANCELLED with no refund yet (chained refund never started)
    async fn auto_refund(&self) -> Result<usize, EscrowError> {
        let store = self.service.store();
        let cancelled = store
            .find_by_status(TransactionStatus::Cancelled, self.config.batch_size)
            .await?;

        let mut started = 0;
        for tx in cancelled {
            if store.list_refunds(tx.id).await?.iter().any(Refund::is_outstanding) {
                continue;
            }
            match self
                .service
                .process_refund(Actor::System, RefundRequest::full(tx.id, "automatic refund after cancellation"))
                .await
            {
                Ok(outcome) => {
                    debug!(transaction_id = %tx.id, refund_id = %outcome.refund_id, "Automatic refund started");
                    started += 1;
                }
                Err(e) => error!(transaction_id = %tx.id, error = %e, "Automatic refund failed to start"),
            }
        }
        Ok(started)
    }

    async fn retry_refunds(&self) -> Result<usize, EscrowError> {
        let due = self
            .service
            .store()
            .find_refunds_due(Utc::now(), self.config.batch_size)
            .await?;

        let mut retried = 0;
        for refund in due {
            debug!(
                refund_id = %refund.id,
                transaction_id = %refund.transaction_id,
                attempts = refund.attempts,
                "Retrying refund"
            );
            match self.service.drive_refund(refund.id, Actor::System).await {
                Ok(_) => retried += 1,
                Err(e) => error!(refund_id = %refund.id, error = %e, "Refund retry failed"),
            }
        }
        Ok(retried)
    }
}
