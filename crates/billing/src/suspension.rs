//! Access suspension cascade.
//!
//! Suspending a school marks its gateway subscription non-chargeable, sets
//! the local status override, records a first-class audit entry, and
//! invalidates sessions for every billable member. Staff, teachers, and
//! school admins always retain access. Both suspend and restore are
//! idempotent.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use classloop_shared::MemberProfile;

use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::ledger::{resolve_status, BillingStatus, School};
use crate::store::{BillingStore, MemberDirectory, SchoolStore, SessionStore};

/// First-class suspension audit row. Open entries (no `restored_at`) are
/// the currently suspended schools.
#[derive(Debug, Clone, Serialize)]
pub struct SuspensionAuditEntry {
    pub id: Uuid,
    pub school_id: Uuid,
    pub reason: String,
    pub suspended_at: OffsetDateTime,
    /// None when the suspension was system-initiated (payment failure).
    pub suspended_by: Option<Uuid>,
    pub restored_at: Option<OffsetDateTime>,
    pub restored_by: Option<Uuid>,
}

/// Outcome of a suspend or restore call.
#[derive(Debug, Clone, Serialize)]
pub struct SuspensionOutcome {
    pub school_id: Uuid,
    /// False when the call was an idempotent no-op.
    pub changed: bool,
    /// Sessions invalidated by this call; always 0 for restore.
    pub sessions_invalidated: u64,
    pub affected_students: usize,
    pub message: String,
}

/// One school's row in the suspension audit report.
#[derive(Debug, Clone, Serialize)]
pub struct SuspendedSchoolReport {
    pub school_id: Uuid,
    pub school_name: String,
    pub reason: String,
    pub suspended_at: OffsetDateTime,
    pub suspended_by: Option<Uuid>,
    pub student_count: i64,
}

/// Aggregate report over all currently suspended schools.
#[derive(Debug, Clone, Serialize)]
pub struct SuspensionAuditReport {
    pub generated_at: OffsetDateTime,
    pub schools: Vec<SuspendedSchoolReport>,
    pub total_students_affected: i64,
}

/// Service driving the suspension cascade.
#[derive(Clone)]
pub struct SuspensionService {
    schools: Arc<dyn SchoolStore>,
    billing: Arc<dyn BillingStore>,
    directory: Arc<dyn MemberDirectory>,
    sessions: Arc<dyn SessionStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl SuspensionService {
    pub fn new(
        schools: Arc<dyn SchoolStore>,
        billing: Arc<dyn BillingStore>,
        directory: Arc<dyn MemberDirectory>,
        sessions: Arc<dyn SessionStore>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            schools,
            billing,
            directory,
            sessions,
            gateway,
        }
    }

    /// Suspend a school and cascade to its billable members.
    ///
    /// Idempotent: an already-suspended school is a no-op success, though
    /// any sessions left behind by an interrupted cascade are still swept.
    /// A gateway failure leaves the school in its prior state.
    pub async fn suspend(
        &self,
        school_id: Uuid,
        reason: &str,
        actor: Option<Uuid>,
    ) -> BillingResult<SuspensionOutcome> {
        let school = self.load_school(school_id).await?;
        let records = self.billing.records_for_school(school_id).await?;

        if resolve_status(&school, &records) == BillingStatus::Suspended {
            // A prior suspend may have died between the local status write
            // and the session sweep. Invalidation is idempotent, so finish
            // the cascade here rather than trusting that it ran.
            let student_ids = self.directory.billable_member_ids(school_id).await?;
            let invalidated = self
                .sessions
                .invalidate_sessions_for_members(&student_ids)
                .await?;
            if invalidated > 0 {
                tracing::warn!(
                    school_id = %school_id,
                    school_name = %school.name,
                    sessions_invalidated = invalidated,
                    "Swept lingering sessions for already-suspended school"
                );
            }
            return Ok(SuspensionOutcome {
                school_id,
                changed: false,
                sessions_invalidated: invalidated,
                affected_students: student_ids.len(),
                message: format!("School {} is already suspended", school.name),
            });
        }

        // Gateway first: if marking the subscription non-chargeable fails,
        // nothing local has been written yet.
        let live = records.iter().find(|r| r.has_live_subscription());
        if let Some(sub_id) = live.and_then(|r| r.gateway_subscription_id.as_deref()) {
            self.gateway.suspend_subscription(sub_id, reason).await?;
        }

        self.schools
            .set_status_override(school_id, school.version, Some(BillingStatus::Suspended))
            .await?;
        if let Some(rec) = live {
            self.billing
                .update_status(rec.id, BillingStatus::Suspended)
                .await?;
        }

        let now = OffsetDateTime::now_utc();
        self.schools
            .record_suspension(&SuspensionAuditEntry {
                id: Uuid::new_v4(),
                school_id,
                reason: reason.to_string(),
                suspended_at: now,
                suspended_by: actor,
                restored_at: None,
                restored_by: None,
            })
            .await?;

        let student_ids = self.directory.billable_member_ids(school_id).await?;
        let invalidated = self
            .sessions
            .invalidate_sessions_for_members(&student_ids)
            .await?;

        tracing::warn!(
            school_id = %school_id,
            school_name = %school.name,
            reason = %reason,
            students = student_ids.len(),
            sessions_invalidated = invalidated,
            "School suspended; student sessions invalidated"
        );

        Ok(SuspensionOutcome {
            school_id,
            changed: true,
            sessions_invalidated: invalidated,
            affected_students: student_ids.len(),
            message: format!(
                "School {} suspended; {} student sessions invalidated",
                school.name, invalidated
            ),
        })
    }

    /// Restore a suspended school. Idempotent mirror of [`suspend`].
    pub async fn restore(
        &self,
        school_id: Uuid,
        actor: Option<Uuid>,
    ) -> BillingResult<SuspensionOutcome> {
        let school = self.load_school(school_id).await?;
        let records = self.billing.records_for_school(school_id).await?;

        if resolve_status(&school, &records) != BillingStatus::Suspended {
            return Ok(SuspensionOutcome {
                school_id,
                changed: false,
                sessions_invalidated: 0,
                affected_students: 0,
                message: format!("School {} is not suspended", school.name),
            });
        }

        let live = records
            .iter()
            .find(|r| r.gateway_subscription_id.is_some() && r.superseded_at.is_none());
        if let Some(sub_id) = live.and_then(|r| r.gateway_subscription_id.as_deref()) {
            self.gateway.resume_subscription(sub_id).await?;
        }

        self.schools
            .set_status_override(school_id, school.version, None)
            .await?;
        if let Some(rec) = live {
            if rec.status == BillingStatus::Suspended {
                self.billing
                    .update_status(rec.id, BillingStatus::Active)
                    .await?;
            }
        }
        self.schools
            .close_suspension(school_id, OffsetDateTime::now_utc(), actor)
            .await?;

        tracing::info!(
            school_id = %school_id,
            school_name = %school.name,
            "School access restored"
        );

        Ok(SuspensionOutcome {
            school_id,
            changed: true,
            sessions_invalidated: 0,
            affected_students: 0,
            message: format!("School {} restored", school.name),
        })
    }

    /// Effective-access check consulted by registration and session
    /// middleware. Staff, teachers, and school admins always pass; members
    /// without a school always pass; students pass only when their school
    /// resolves active.
    pub async fn resolve_access(&self, member: &MemberProfile) -> BillingResult<bool> {
        if !member.role.is_billable() {
            return Ok(true);
        }
        let Some(school_id) = member.school_id else {
            return Ok(true);
        };
        let school = self.load_school(school_id).await?;
        let records = self.billing.records_for_school(school_id).await?;
        Ok(resolve_status(&school, &records) == BillingStatus::Active)
    }

    /// Audit report over all currently suspended schools.
    pub async fn suspension_audit_report(&self) -> BillingResult<SuspensionAuditReport> {
        let open = self.schools.open_suspensions().await?;
        let mut rows = Vec::with_capacity(open.len());
        let mut total = 0;
        for entry in open {
            let name = self
                .schools
                .school(entry.school_id)
                .await?
                .map(|s| s.name)
                .unwrap_or_else(|| "(unknown)".to_string());
            let students = self
                .directory
                .billable_member_count(entry.school_id)
                .await?;
            total += students;
            rows.push(SuspendedSchoolReport {
                school_id: entry.school_id,
                school_name: name,
                reason: entry.reason,
                suspended_at: entry.suspended_at,
                suspended_by: entry.suspended_by,
                student_count: students,
            });
        }
        Ok(SuspensionAuditReport {
            generated_at: OffsetDateTime::now_utc(),
            schools: rows,
            total_students_affected: total,
        })
    }

    /// The open suspension entry for a school, if any.
    pub async fn open_suspension(
        &self,
        school_id: Uuid,
    ) -> BillingResult<Option<SuspensionAuditEntry>> {
        self.schools.open_suspension(school_id).await
    }

    async fn load_school(&self, school_id: Uuid) -> BillingResult<School> {
        self.schools
            .school(school_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("School {} not found", school_id)))
    }
}
