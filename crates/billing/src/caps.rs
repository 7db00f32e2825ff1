//! Membership cap enforcement and proration.
//!
//! All cap mutations go through [`CapService::set_cap`]; there is a single
//! code path, so rollback behavior cannot diverge between admin and school
//! admin callers. The cap write, the enforcement flag, and the history
//! append are one atomic, version-guarded store call; a gateway failure
//! while charging the prorated increase rolls that write back before the
//! error surfaces.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::ledger::{AmountsUpdate, BillingMode, BillingRecord, CapHistoryEntry, School};
use crate::rates::{resolve_effective_rate, PlatformRates};
use crate::store::{BillingStore, MemberDirectory, SchoolStore};

/// Atomic cap write: cap fields plus the history entry, applied together.
#[derive(Debug, Clone)]
pub struct CapChange {
    pub new_cap: i64,
    pub cap_enforced: bool,
    pub set_by: Uuid,
    pub set_at: OffsetDateTime,
    pub history: CapHistoryEntry,
}

/// Compensating write undoing a [`CapChange`].
#[derive(Debug, Clone)]
pub struct CapRevert {
    pub previous_cap: Option<i64>,
    pub previous_enforced: bool,
    pub previous_set_at: Option<OffsetDateTime>,
    pub previous_set_by: Option<Uuid>,
    /// History entry appended by the change being undone.
    pub history_entry_id: Uuid,
}

/// Outcome of a cap mutation.
#[derive(Debug, Clone, Serialize)]
pub struct CapChangeResult {
    pub school_id: Uuid,
    pub previous_cap: Option<i64>,
    pub new_cap: i64,
    pub delta: i64,
    /// Prorated cost of the increase, when one applied.
    pub additional_cost_cents: Option<i64>,
    /// Whether the cost was charged immediately (vs deferred to
    /// subscription creation).
    pub charged: bool,
    pub message: String,
}

/// Outcome of a cap reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub school_id: Uuid,
    pub realigned: bool,
    pub local_cap: Option<i64>,
    pub billed_cap: Option<i64>,
    pub message: String,
}

/// Service enforcing membership caps and charging prorated increases.
#[derive(Clone)]
pub struct CapService {
    schools: Arc<dyn SchoolStore>,
    billing: Arc<dyn BillingStore>,
    directory: Arc<dyn MemberDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    config: BillingConfig,
}

impl CapService {
    pub fn new(
        schools: Arc<dyn SchoolStore>,
        billing: Arc<dyn BillingStore>,
        directory: Arc<dyn MemberDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        config: BillingConfig,
    ) -> Self {
        Self {
            schools,
            billing,
            directory,
            gateway,
            config,
        }
    }

    /// Set (or raise) a school's membership cap.
    ///
    /// Rejects caps below the current billable headcount before anything is
    /// written. A positive delta at a positive rate is charged immediately
    /// when a live gateway subscription exists, otherwise deferred; any
    /// gateway failure rolls the cap write back and surfaces the error.
    pub async fn set_cap(
        &self,
        school_id: Uuid,
        new_cap: i64,
        actor: Uuid,
        reason: Option<&str>,
    ) -> BillingResult<CapChangeResult> {
        let school = self.load_school(school_id).await?;
        let record = self.billing.current_record(school_id).await?;

        self.check_cap_alignment(&school, record.as_ref())?;

        if new_cap <= 0 {
            return Err(BillingError::Validation(format!(
                "Membership cap must be positive, got {}",
                new_cap
            )));
        }

        let rate = resolve_effective_rate(
            &school.overrides,
            &PlatformRates::new(self.config.standard_rate_cents),
        )?;
        let billable = self.directory.billable_member_count(school_id).await?;
        if new_cap < billable {
            return Err(BillingError::Validation(format!(
                "Cap of {} is below the current billable member count of {}",
                new_cap, billable
            )));
        }

        let previous_cap = school.membership_cap;
        let delta = new_cap - previous_cap.unwrap_or(0);
        let now = OffsetDateTime::now_utc();

        let history = CapHistoryEntry {
            id: Uuid::new_v4(),
            school_id,
            previous_cap,
            new_cap,
            changed_by: actor,
            reason: reason.map(str::to_string),
            changed_at: now,
        };
        let change = CapChange {
            new_cap,
            cap_enforced: true,
            set_by: actor,
            set_at: now,
            history: history.clone(),
        };
        let new_version = self
            .schools
            .apply_cap_change(school_id, school.version, &change)
            .await?;

        let additional_cost = if delta > 0 && rate > 0 {
            Some(delta * rate)
        } else {
            None
        };

        let mut charged = false;
        if let Some(cost) = additional_cost {
            let live = record
                .as_ref()
                .filter(|r| r.has_live_subscription())
                .and_then(|r| r.gateway_customer_id.clone().map(|c| (r.id, c)));

            if let Some((record_id, customer_id)) = live {
                match self
                    .gateway
                    .charge_prorated_amount(&customer_id, delta, rate)
                    .await
                {
                    Ok(amount) => {
                        charged = true;
                        self.billing.mark_payment(record_id, now).await?;
                        tracing::info!(
                            school_id = %school_id,
                            delta = delta,
                            amount_cents = amount,
                            "Prorated cap increase charged"
                        );
                    }
                    Err(e) => {
                        self.rollback_cap_change(school_id, new_version, &school, &history, &e)
                            .await?;
                        return Err(e);
                    }
                }
            } else {
                tracing::info!(
                    school_id = %school_id,
                    delta = delta,
                    cost_cents = cost,
                    "No live gateway subscription; prorated charge deferred to subscription creation"
                );
            }
        }

        // Keep the ledger in step with the new capacity.
        if let Some(rec) = &record {
            let update = AmountsUpdate::compute(rec.mode, billable, Some(new_cap), rate);
            self.billing.update_amounts(rec.id, &update).await?;
        }

        tracing::info!(
            school_id = %school_id,
            previous_cap = ?previous_cap,
            new_cap = new_cap,
            delta = delta,
            charged = charged,
            "Membership cap updated"
        );

        Ok(CapChangeResult {
            school_id,
            previous_cap,
            new_cap,
            delta,
            additional_cost_cents: additional_cost,
            charged,
            message: match (additional_cost, charged) {
                (Some(cost), true) => format!(
                    "Cap set to {}; charged {} for {} additional seats",
                    new_cap,
                    classloop_shared::format_cents(cost),
                    delta
                ),
                (Some(cost), false) => format!(
                    "Cap set to {}; {} will be charged at subscription creation",
                    new_cap,
                    classloop_shared::format_cents(cost)
                ),
                _ => format!("Cap set to {}", new_cap),
            },
        })
    }

    /// Raise an already-enforced cap. Same contract as [`set_cap`], and
    /// additionally rejects targets at or below the current cap.
    pub async fn request_cap_increase(
        &self,
        school_id: Uuid,
        new_cap: i64,
        actor: Uuid,
        reason: Option<&str>,
    ) -> BillingResult<CapChangeResult> {
        let school = self.load_school(school_id).await?;
        let current = match (school.cap_enforced, school.membership_cap) {
            (true, Some(cap)) => cap,
            _ => {
                return Err(BillingError::Validation(format!(
                    "School {} has no enforced cap to increase",
                    school_id
                )))
            }
        };
        if new_cap <= current {
            return Err(BillingError::Validation(format!(
                "Cap increase must exceed the current cap of {}, got {}",
                current, new_cap
            )));
        }
        self.set_cap(school_id, new_cap, actor, reason).await
    }

    /// Whether a new registration would be admitted under the cap.
    ///
    /// Consulted by the registration subsystem before creating a billable
    /// member.
    pub async fn admits_new_member(&self, school_id: Uuid) -> BillingResult<bool> {
        let school = self.load_school(school_id).await?;
        match (school.cap_enforced, school.membership_cap) {
            (true, Some(cap)) => {
                let billable = self.directory.billable_member_count(school_id).await?;
                Ok(billable < cap)
            }
            _ => Ok(true),
        }
    }

    /// Detect and repair divergence between the local cap and the last
    /// billed cap (crash between cap write and ledger confirmation).
    ///
    /// When a charge was confirmed (`billed_cap` set), the billed side is
    /// trusted and the local cap moves back to it. When nothing was ever
    /// billed, the ledger is aligned to the local cap instead.
    pub async fn reconcile_cap(
        &self,
        school_id: Uuid,
        actor: Uuid,
    ) -> BillingResult<ReconcileOutcome> {
        let school = self.load_school(school_id).await?;
        let record = self.billing.current_record(school_id).await?;

        let Some(rec) = record else {
            return Ok(ReconcileOutcome {
                school_id,
                realigned: false,
                local_cap: school.membership_cap,
                billed_cap: None,
                message: "No billing record; nothing to reconcile".to_string(),
            });
        };

        if self.check_cap_alignment(&school, Some(&rec)).is_ok() {
            return Ok(ReconcileOutcome {
                school_id,
                realigned: false,
                local_cap: school.membership_cap,
                billed_cap: rec.billed_cap,
                message: "Cap and billed cap already aligned".to_string(),
            });
        }

        tracing::error!(
            school_id = %school_id,
            local_cap = ?school.membership_cap,
            billed_cap = ?rec.billed_cap,
            "Cap divergence detected; reconciling"
        );

        let now = OffsetDateTime::now_utc();
        match rec.billed_cap {
            Some(billed) => {
                let change = CapChange {
                    new_cap: billed,
                    cap_enforced: true,
                    set_by: actor,
                    set_at: now,
                    history: CapHistoryEntry {
                        id: Uuid::new_v4(),
                        school_id,
                        previous_cap: school.membership_cap,
                        new_cap: billed,
                        changed_by: actor,
                        reason: Some("reconciliation: realigned to last billed cap".to_string()),
                        changed_at: now,
                    },
                };
                self.schools
                    .apply_cap_change(school_id, school.version, &change)
                    .await?;
                Ok(ReconcileOutcome {
                    school_id,
                    realigned: true,
                    local_cap: Some(billed),
                    billed_cap: Some(billed),
                    message: format!("Local cap realigned to last billed cap {}", billed),
                })
            }
            None => {
                let rate = resolve_effective_rate(
                    &school.overrides,
                    &PlatformRates::new(self.config.standard_rate_cents),
                )?;
                let billable = self.directory.billable_member_count(school_id).await?;
                let update =
                    AmountsUpdate::compute(rec.mode, billable, school.membership_cap, rate);
                self.billing.update_amounts(rec.id, &update).await?;
                Ok(ReconcileOutcome {
                    school_id,
                    realigned: true,
                    local_cap: school.membership_cap,
                    billed_cap: school.membership_cap,
                    message: "Ledger aligned to local cap (no confirmed charge)".to_string(),
                })
            }
        }
    }

    async fn load_school(&self, school_id: Uuid) -> BillingResult<School> {
        self.schools
            .school(school_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("School {} not found", school_id)))
    }

    /// Consistency guard run before any cap mutation: an enforced prepaid
    /// cap must match the billed cap. A mismatch means a prior change died
    /// between the gateway charge and the local write.
    fn check_cap_alignment(
        &self,
        school: &School,
        record: Option<&BillingRecord>,
    ) -> BillingResult<()> {
        if let Some(rec) = record {
            if rec.mode == BillingMode::PrepaidCap
                && school.cap_enforced
                && rec.billed_cap.is_some()
                && school.membership_cap != rec.billed_cap
            {
                return Err(BillingError::Consistency(format!(
                    "School {}: local cap {:?} diverges from billed cap {:?}; reconcile before further cap changes",
                    school.id, school.membership_cap, rec.billed_cap
                )));
            }
        }
        Ok(())
    }

    async fn rollback_cap_change(
        &self,
        school_id: Uuid,
        version_after_change: i64,
        school_before: &School,
        history: &CapHistoryEntry,
        cause: &BillingError,
    ) -> BillingResult<()> {
        tracing::warn!(
            school_id = %school_id,
            error = %cause,
            "Gateway charge failed; rolling back cap change"
        );
        let revert = CapRevert {
            previous_cap: school_before.membership_cap,
            previous_enforced: school_before.cap_enforced,
            previous_set_at: school_before.cap_set_at,
            previous_set_by: school_before.cap_set_by,
            history_entry_id: history.id,
        };
        if let Err(revert_err) = self
            .schools
            .revert_cap_change(school_id, version_after_change, &revert)
            .await
        {
            tracing::error!(
                school_id = %school_id,
                error = %revert_err,
                "Cap rollback FAILED after gateway error; manual reconciliation required"
            );
            return Err(BillingError::Consistency(format!(
                "Cap rollback failed after gateway error ({}); school {} requires reconciliation",
                revert_err, school_id
            )));
        }
        Ok(())
    }
}
