//! Billing invariant checks.
//!
//! Runnable, read-only consistency sweeps over the billing state. The
//! worker runs these daily; they can also be run after any mutation or
//! webhook replay. Checks only read, never write, and every violation
//! carries enough context to debug.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::ledger::BillingMode;
use crate::store::{BillingStore, MemberDirectory, SchoolStore};

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// System may be charging incorrectly.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// A single invariant violation.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub school_id: Uuid,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Summary of one sweep.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Runs the billing consistency checks.
#[derive(Clone)]
pub struct InvariantChecker {
    schools: Arc<dyn SchoolStore>,
    billing: Arc<dyn BillingStore>,
    directory: Arc<dyn MemberDirectory>,
}

impl InvariantChecker {
    pub fn new(
        schools: Arc<dyn SchoolStore>,
        billing: Arc<dyn BillingStore>,
        directory: Arc<dyn MemberDirectory>,
    ) -> Self {
        Self {
            schools,
            billing,
            directory,
        }
    }

    /// Run all checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_total_amounts().await?);
        violations.extend(self.check_caps_not_exceeded().await?);
        violations.extend(self.check_billed_cap_alignment().await?);
        violations.extend(self.check_free_schools_unsubscribed().await?);

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: 4,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Total == billed members × rate on every live record.
    async fn check_total_amounts(&self) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for record in self.billing.live_records().await? {
            let expected = record.billed_members() * record.rate_per_member_cents;
            if record.total_amount_cents != expected {
                violations.push(InvariantViolation {
                    invariant: "total_amount_consistent".to_string(),
                    school_id: record.school_id,
                    description: format!(
                        "Record {} has total {} but billed_members x rate is {}",
                        record.id, record.total_amount_cents, expected
                    ),
                    context: serde_json::json!({
                        "record_id": record.id,
                        "mode": record.mode.as_str(),
                        "member_count": record.member_count,
                        "billed_cap": record.billed_cap,
                        "rate_cents": record.rate_per_member_cents,
                        "total_cents": record.total_amount_cents,
                        "expected_cents": expected,
                    }),
                    severity: ViolationSeverity::Critical,
                });
            }
        }
        Ok(violations)
    }

    /// Enforced caps are never exceeded by the active billable count.
    async fn check_caps_not_exceeded(&self) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for school in self.schools.active_schools().await? {
            let (true, Some(cap)) = (school.cap_enforced, school.membership_cap) else {
                continue;
            };
            let billable = self.directory.billable_member_count(school.id).await?;
            if billable > cap {
                violations.push(InvariantViolation {
                    invariant: "cap_not_exceeded".to_string(),
                    school_id: school.id,
                    description: format!(
                        "School '{}' has {} billable members over an enforced cap of {}",
                        school.name, billable, cap
                    ),
                    context: serde_json::json!({
                        "cap": cap,
                        "billable_members": billable,
                    }),
                    severity: ViolationSeverity::Critical,
                });
            }
        }
        Ok(violations)
    }

    /// Crash detection: prepaid billed_cap must match the local cap.
    async fn check_billed_cap_alignment(&self) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for record in self.billing.live_records().await? {
            if record.mode != BillingMode::PrepaidCap || record.billed_cap.is_none() {
                continue;
            }
            let Some(school) = self.schools.school(record.school_id).await? else {
                continue;
            };
            if school.cap_enforced && school.membership_cap != record.billed_cap {
                violations.push(InvariantViolation {
                    invariant: "billed_cap_aligned".to_string(),
                    school_id: school.id,
                    description: format!(
                        "School '{}' local cap {:?} diverges from billed cap {:?}",
                        school.name, school.membership_cap, record.billed_cap
                    ),
                    context: serde_json::json!({
                        "local_cap": school.membership_cap,
                        "billed_cap": record.billed_cap,
                        "record_id": record.id,
                    }),
                    severity: ViolationSeverity::High,
                });
            }
        }
        Ok(violations)
    }

    /// Free schools carry no live gateway subscription.
    async fn check_free_schools_unsubscribed(&self) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for record in self.billing.live_records().await? {
            if !record.has_live_subscription() {
                continue;
            }
            let Some(school) = self.schools.school(record.school_id).await? else {
                continue;
            };
            if school.overrides.is_free() {
                violations.push(InvariantViolation {
                    invariant: "free_school_unsubscribed".to_string(),
                    school_id: school.id,
                    description: format!(
                        "Free school '{}' has a live gateway subscription",
                        school.name
                    ),
                    context: serde_json::json!({
                        "record_id": record.id,
                        "subscription_id": record.gateway_subscription_id,
                    }),
                    severity: ViolationSeverity::Medium,
                });
            }
        }
        Ok(violations)
    }
}
