//! Stale Payment Sweep
//!
//! Collection requests expire at the provider after [`PAYMENT_TIMEOUT`].
//! The sweep cancels local payments still `pending` past that window plus
//! [`SWEEP_GRACE`] so history and the return page stop showing them as open.
//! Settlements that arrive afterwards hit a terminal row and are refused by
//! the guarded write.
//!
//! The same pass hands completed payments that were never provisioned back
//! to the [`Reconciler`], so a failed provisioning attempt recovers even if
//! the provider never redelivers.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use serde::Serialize;

use kash_core::{BillingStore, Clock, PaymentStatus, PaymentStatusUpdate, PaymentStore, StatusChange};

use crate::config::{PAYMENT_TIMEOUT, PROVISIONING_LEASE_MINUTES, SWEEP_GRACE};
use crate::error::{PaymentError, Result};
use crate::reconcile::{Provisioning, Reconciler};

/// What one sweep pass changed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired pending payments moved to `cancelled`
    pub cancelled: usize,
    /// Completed payments whose provisioning finished on this pass
    pub provisioned: usize,
}

pub struct PaymentSweeper {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    reconciler: Arc<Reconciler>,
    max_age: chrono::Duration,
}

impl PaymentSweeper {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>, reconciler: Arc<Reconciler>) -> Result<Self> {
        Self::with_max_age(store, clock, reconciler, PAYMENT_TIMEOUT + SWEEP_GRACE)
    }

    pub fn with_max_age(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        reconciler: Arc<Reconciler>,
        max_age: Duration,
    ) -> Result<Self> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| PaymentError::Config(format!("sweep max age: {e}")))?;
        Ok(Self {
            store,
            clock,
            reconciler,
            max_age,
        })
    }

    /// Cancel expired pending payments, then retry unfinished provisioning
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        Ok(SweepReport {
            cancelled: self.cancel_expired().await?,
            provisioned: self.retry_provisioning().await?,
        })
    }

    async fn cancel_expired(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.max_age;
        let stale = self.store.list_stale_pending(cutoff).await?;

        let mut cancelled = 0;
        for payment in stale {
            match self
                .store
                .update_payment_status(payment.id, PaymentStatusUpdate::status(PaymentStatus::Cancelled))
                .await?
            {
                StatusChange::Applied(p) => {
                    tracing::info!(
                        payment_id = %p.id,
                        request_id = ?p.request_id,
                        created_at = %p.created_at,
                        "Cancelled expired pending payment"
                    );
                    cancelled += 1;
                }
                // Settled between the listing and the write
                other => {
                    tracing::debug!(
                        payment_id = %payment.id,
                        status = %other.payment().status,
                        "Pending payment settled before sweep"
                    );
                }
            }
        }
        Ok(cancelled)
    }

    /// Completed payments settled at least one lease ago and still unprovisioned
    async fn retry_provisioning(&self) -> Result<usize> {
        let cutoff = self.clock.now() - chrono::Duration::minutes(PROVISIONING_LEASE_MINUTES);
        let unprovisioned = self.store.list_unprovisioned(cutoff).await?;

        let mut provisioned = 0;
        for payment in unprovisioned {
            tracing::warn!(
                payment_id = %payment.id,
                completed_at = ?payment.completed_at,
                "Retrying provisioning for completed payment"
            );
            if let Provisioning::Completed { .. } = self.reconciler.provision_payment(&payment).await {
                provisioned += 1;
            }
        }
        Ok(provisioned)
    }

    /// Run [`sweep_once`](Self::sweep_once) every `every` on the runtime
    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tracing::info!(interval_secs = every.as_secs(), "Stale payment sweep enabled");
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            loop {
                timer.tick().await;
                match self.sweep_once().await {
                    Ok(report) if report != SweepReport::default() => {
                        tracing::info!(
                            cancelled = report.cancelled,
                            provisioned = report.provisioned,
                            "Payment sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, retryable = e.is_retryable(), "Payment sweep failed");
                    }
                }
            }
        })
    }
}
