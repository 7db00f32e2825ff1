//! Gateway webhook handling.
//!
//! The gateway's subscription state is eventually consistent with ours;
//! inbound events re-enter the ledger here and, where access is affected,
//! trigger the suspension cascade. Events arrive pre-parsed; transport and
//! signature verification belong to the HTTP layer, not this core.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::ledger::BillingStatus;
use crate::store::BillingStore;
use crate::suspension::SuspensionService;

/// Kinds of subscription events the gateway emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventKind {
    SubscriptionActivated,
    PaymentFailed,
    SubscriptionCancelled,
}

impl GatewayEventKind {
    fn target_status(&self) -> BillingStatus {
        match self {
            GatewayEventKind::SubscriptionActivated => BillingStatus::Active,
            GatewayEventKind::PaymentFailed => BillingStatus::PastDue,
            GatewayEventKind::SubscriptionCancelled => BillingStatus::Cancelled,
        }
    }
}

/// A subscription status event from the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    pub subscription_id: String,
    pub kind: GatewayEventKind,
    pub occurred_at: OffsetDateTime,
}

/// Result of applying one webhook event.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookOutcome {
    /// False when the event was a duplicate (status already equal).
    pub applied: bool,
    pub previous_status: BillingStatus,
    pub new_status: BillingStatus,
    pub message: String,
}

/// Applies gateway events to the ledger and cascades access changes.
#[derive(Clone)]
pub struct WebhookHandler {
    billing: Arc<dyn BillingStore>,
    suspension: SuspensionService,
}

impl WebhookHandler {
    pub fn new(billing: Arc<dyn BillingStore>, suspension: SuspensionService) -> Self {
        Self {
            billing,
            suspension,
        }
    }

    /// Apply one event. Duplicate deliveries are no-ops.
    pub async fn handle_event(&self, event: &GatewayEvent) -> BillingResult<WebhookOutcome> {
        let record = self
            .billing
            .record_by_subscription(&event.subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "No billing record for gateway subscription {}",
                    event.subscription_id
                ))
            })?;

        let target = event.kind.target_status();
        if record.status == target {
            return Ok(WebhookOutcome {
                applied: false,
                previous_status: record.status,
                new_status: target,
                message: format!("Duplicate event {}; status already {}", event.id, target),
            });
        }

        self.billing.update_status(record.id, target).await?;
        tracing::info!(
            event_id = %event.id,
            school_id = %record.school_id,
            subscription_id = %event.subscription_id,
            from = %record.status,
            to = %target,
            "Gateway event applied to billing record"
        );

        match event.kind {
            GatewayEventKind::PaymentFailed => {
                self.suspension
                    .suspend(
                        record.school_id,
                        &format!("Payment failed (gateway event {})", event.id),
                        None,
                    )
                    .await?;
            }
            GatewayEventKind::SubscriptionCancelled => {
                self.suspension
                    .suspend(
                        record.school_id,
                        &format!("Subscription cancelled (gateway event {})", event.id),
                        None,
                    )
                    .await?;
            }
            GatewayEventKind::SubscriptionActivated => {
                // Restore only suspensions the system imposed; a school a
                // platform admin suspended by hand stays suspended.
                let open = self.suspension.open_suspension(record.school_id).await?;
                if matches!(&open, Some(entry) if entry.suspended_by.is_none()) {
                    self.suspension.restore(record.school_id, None).await?;
                }
            }
        }

        Ok(WebhookOutcome {
            applied: true,
            previous_status: record.status,
            new_status: target,
            message: format!(
                "Event {} applied: {} -> {}",
                event.id, record.status, target
            ),
        })
    }
}
