//! Postgres implementations of the storage traits.
//!
//! Runtime queries over a shared `PgPool`. Cap changes and their
//! compensating reverts run inside a transaction with a `FOR UPDATE` row
//! lock, and every version-guarded write re-checks the optimistic version
//! before touching the row.

use async_trait::async_trait;
use classloop_shared::{MemberProfile, MemberRole};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::caps::{CapChange, CapRevert};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{
    AmountsUpdate, BillingMode, BillingRecord, BillingStatus, CapHistoryEntry, School,
};
use crate::lifecycle::{AlumniStatus, MemberLifecycleRecord, VerificationStatus};
use crate::rates::BillingOverrides;
use crate::store::{
    BillingStore, LifecycleStore, MemberDirectory, NotificationSink, SchoolStore, SessionStore,
};
use crate::suspension::SuspensionAuditEntry;

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))
}

#[derive(Debug, sqlx::FromRow)]
struct SchoolRow {
    id: Uuid,
    name: String,
    admin_override: bool,
    free_activation: bool,
    paid_subscription_despite_free: bool,
    custom_rate_cents: Option<i64>,
    discount_percent: Option<f64>,
    membership_cap: Option<i64>,
    cap_enforced: bool,
    cap_set_at: Option<OffsetDateTime>,
    cap_set_by: Option<Uuid>,
    status_override: Option<String>,
    version: i64,
}

impl SchoolRow {
    fn into_school(self) -> BillingResult<School> {
        let status_override = match self.status_override {
            Some(s) => Some(BillingStatus::parse(&s).ok_or_else(|| {
                BillingError::Database(format!("Unknown status override '{}'", s))
            })?),
            None => None,
        };
        Ok(School {
            id: self.id,
            name: self.name,
            overrides: BillingOverrides {
                admin_override: self.admin_override,
                free_activation: self.free_activation,
                paid_subscription_despite_free: self.paid_subscription_despite_free,
                custom_rate_cents: self.custom_rate_cents,
                discount_percent: self.discount_percent,
            },
            membership_cap: self.membership_cap,
            cap_enforced: self.cap_enforced,
            cap_set_at: self.cap_set_at,
            cap_set_by: self.cap_set_by,
            status_override,
            version: self.version,
        })
    }
}

const SCHOOL_COLUMNS: &str = "id, name, admin_override, free_activation, \
     paid_subscription_despite_free, custom_rate_cents, discount_percent, \
     membership_cap, cap_enforced, cap_set_at, cap_set_by, status_override, version";

/// Postgres-backed [`SchoolStore`].
#[derive(Clone)]
pub struct PgSchoolStore {
    pool: PgPool,
}

impl PgSchoolStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchoolStore for PgSchoolStore {
    async fn school(&self, id: Uuid) -> BillingResult<Option<School>> {
        let row: Option<SchoolRow> = sqlx::query_as(&format!(
            "SELECT {} FROM schools WHERE id = $1",
            SCHOOL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SchoolRow::into_school).transpose()
    }

    async fn insert_school(&self, school: &School) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO schools
                (id, name, admin_override, free_activation, paid_subscription_despite_free,
                 custom_rate_cents, discount_percent, membership_cap, cap_enforced,
                 cap_set_at, cap_set_by, status_override, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(school.id)
        .bind(&school.name)
        .bind(school.overrides.admin_override)
        .bind(school.overrides.free_activation)
        .bind(school.overrides.paid_subscription_despite_free)
        .bind(school.overrides.custom_rate_cents)
        .bind(school.overrides.discount_percent)
        .bind(school.membership_cap)
        .bind(school.cap_enforced)
        .bind(school.cap_set_at)
        .bind(school.cap_set_by)
        .bind(school.status_override.map(|s| s.as_str()))
        .bind(school.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_schools(&self) -> BillingResult<Vec<School>> {
        let rows: Vec<SchoolRow> = sqlx::query_as(&format!(
            "SELECT {} FROM schools \
             WHERE status_override IS NULL \
                OR status_override NOT IN ('suspended', 'cancelled')",
            SCHOOL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SchoolRow::into_school).collect()
    }

    async fn apply_cap_change(
        &self,
        id: Uuid,
        expected_version: i64,
        change: &CapChange,
    ) -> BillingResult<i64> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM schools WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let (version,) =
            current.ok_or_else(|| BillingError::NotFound(format!("School {} not found", id)))?;
        if version != expected_version {
            return Err(BillingError::ConcurrentModification(format!(
                "School {} version is {}, expected {}",
                id, version, expected_version
            )));
        }

        sqlx::query(
            r#"
            UPDATE schools SET
                membership_cap = $1,
                cap_enforced = $2,
                cap_set_at = $3,
                cap_set_by = $4,
                version = version + 1
            WHERE id = $5
            "#,
        )
        .bind(change.new_cap)
        .bind(change.cap_enforced)
        .bind(change.set_at)
        .bind(change.set_by)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO cap_history
                (id, school_id, previous_cap, new_cap, changed_by, reason, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(change.history.id)
        .bind(change.history.school_id)
        .bind(change.history.previous_cap)
        .bind(change.history.new_cap)
        .bind(change.history.changed_by)
        .bind(&change.history.reason)
        .bind(change.history.changed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(expected_version + 1)
    }

    async fn revert_cap_change(
        &self,
        id: Uuid,
        expected_version: i64,
        revert: &CapRevert,
    ) -> BillingResult<i64> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            UPDATE schools SET
                membership_cap = $1,
                cap_enforced = $2,
                cap_set_at = $3,
                cap_set_by = $4,
                version = version + 1
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(revert.previous_cap)
        .bind(revert.previous_enforced)
        .bind(revert.previous_set_at)
        .bind(revert.previous_set_by)
        .bind(id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "School {} changed while reverting cap",
                id
            )));
        }

        sqlx::query("DELETE FROM cap_history WHERE id = $1")
            .bind(revert.history_entry_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(expected_version + 1)
    }

    async fn cap_history(&self, school_id: Uuid) -> BillingResult<Vec<CapHistoryEntry>> {
        let rows: Vec<(Uuid, Uuid, Option<i64>, i64, Uuid, Option<String>, OffsetDateTime)> =
            sqlx::query_as(
                "SELECT id, school_id, previous_cap, new_cap, changed_by, reason, changed_at \
                 FROM cap_history WHERE school_id = $1 ORDER BY changed_at",
            )
            .bind(school_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, school_id, previous_cap, new_cap, changed_by, reason, changed_at)| {
                    CapHistoryEntry {
                        id,
                        school_id,
                        previous_cap,
                        new_cap,
                        changed_by,
                        reason,
                        changed_at,
                    }
                },
            )
            .collect())
    }

    async fn set_status_override(
        &self,
        id: Uuid,
        expected_version: i64,
        status: Option<BillingStatus>,
    ) -> BillingResult<i64> {
        let rows = sqlx::query(
            "UPDATE schools SET status_override = $1, version = version + 1 \
             WHERE id = $2 AND version = $3",
        )
        .bind(status.map(|s| s.as_str()))
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if rows == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "School {} was modified by another process",
                id
            )));
        }
        Ok(expected_version + 1)
    }

    async fn record_suspension(&self, entry: &SuspensionAuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO suspension_audit
                (id, school_id, reason, suspended_at, suspended_by, restored_at, restored_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.school_id)
        .bind(&entry.reason)
        .bind(entry.suspended_at)
        .bind(entry.suspended_by)
        .bind(entry.restored_at)
        .bind(entry.restored_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_suspension(
        &self,
        school_id: Uuid,
        restored_at: OffsetDateTime,
        restored_by: Option<Uuid>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE suspension_audit SET restored_at = $1, restored_by = $2 \
             WHERE school_id = $3 AND restored_at IS NULL",
        )
        .bind(restored_at)
        .bind(restored_by)
        .bind(school_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_suspension(
        &self,
        school_id: Uuid,
    ) -> BillingResult<Option<SuspensionAuditEntry>> {
        let row: Option<SuspensionRow> = sqlx::query_as(
            "SELECT id, school_id, reason, suspended_at, suspended_by, restored_at, restored_by \
             FROM suspension_audit WHERE school_id = $1 AND restored_at IS NULL \
             ORDER BY suspended_at DESC LIMIT 1",
        )
        .bind(school_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SuspensionRow::into_entry))
    }

    async fn open_suspensions(&self) -> BillingResult<Vec<SuspensionAuditEntry>> {
        let rows: Vec<SuspensionRow> = sqlx::query_as(
            "SELECT id, school_id, reason, suspended_at, suspended_by, restored_at, restored_by \
             FROM suspension_audit WHERE restored_at IS NULL ORDER BY suspended_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SuspensionRow::into_entry).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SuspensionRow {
    id: Uuid,
    school_id: Uuid,
    reason: String,
    suspended_at: OffsetDateTime,
    suspended_by: Option<Uuid>,
    restored_at: Option<OffsetDateTime>,
    restored_by: Option<Uuid>,
}

impl SuspensionRow {
    fn into_entry(self) -> SuspensionAuditEntry {
        SuspensionAuditEntry {
            id: self.id,
            school_id: self.school_id,
            reason: self.reason,
            suspended_at: self.suspended_at,
            suspended_by: self.suspended_by,
            restored_at: self.restored_at,
            restored_by: self.restored_by,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BillingRecordRow {
    id: Uuid,
    school_id: Uuid,
    mode: String,
    status: String,
    billing_cycle: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    member_count: i64,
    rate_per_member_cents: i64,
    total_amount_cents: i64,
    billed_cap: Option<i64>,
    gateway_customer_id: Option<String>,
    gateway_subscription_id: Option<String>,
    last_payment_at: Option<OffsetDateTime>,
    next_payment_at: Option<OffsetDateTime>,
    created_via: String,
    created_at: OffsetDateTime,
    superseded_at: Option<OffsetDateTime>,
}

impl BillingRecordRow {
    fn into_record(self) -> BillingResult<BillingRecord> {
        Ok(BillingRecord {
            id: self.id,
            school_id: self.school_id,
            mode: BillingMode::parse(&self.mode)
                .ok_or_else(|| BillingError::Database(format!("Unknown mode '{}'", self.mode)))?,
            status: BillingStatus::parse(&self.status).ok_or_else(|| {
                BillingError::Database(format!("Unknown status '{}'", self.status))
            })?,
            billing_cycle: self.billing_cycle,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            member_count: self.member_count,
            rate_per_member_cents: self.rate_per_member_cents,
            total_amount_cents: self.total_amount_cents,
            billed_cap: self.billed_cap,
            gateway_customer_id: self.gateway_customer_id,
            gateway_subscription_id: self.gateway_subscription_id,
            last_payment_at: self.last_payment_at,
            next_payment_at: self.next_payment_at,
            created_via: self.created_via,
            created_at: self.created_at,
            superseded_at: self.superseded_at,
        })
    }
}

const RECORD_COLUMNS: &str = "id, school_id, mode, status, billing_cycle, \
     current_period_start, current_period_end, member_count, rate_per_member_cents, \
     total_amount_cents, billed_cap, gateway_customer_id, gateway_subscription_id, \
     last_payment_at, next_payment_at, created_via, created_at, superseded_at";

/// Postgres-backed [`BillingStore`].
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn record(&self, id: Uuid) -> BillingResult<Option<BillingRecord>> {
        let row: Option<BillingRecordRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_records WHERE id = $1",
            RECORD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BillingRecordRow::into_record).transpose()
    }

    async fn current_record(&self, school_id: Uuid) -> BillingResult<Option<BillingRecord>> {
        let row: Option<BillingRecordRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_records \
             WHERE school_id = $1 AND superseded_at IS NULL \
             ORDER BY created_at DESC LIMIT 1",
            RECORD_COLUMNS
        ))
        .bind(school_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BillingRecordRow::into_record).transpose()
    }

    async fn record_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingRecord>> {
        let row: Option<BillingRecordRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_records \
             WHERE gateway_subscription_id = $1 AND superseded_at IS NULL \
             ORDER BY created_at DESC LIMIT 1",
            RECORD_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BillingRecordRow::into_record).transpose()
    }

    async fn records_for_school(&self, school_id: Uuid) -> BillingResult<Vec<BillingRecord>> {
        let rows: Vec<BillingRecordRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_records WHERE school_id = $1 ORDER BY created_at",
            RECORD_COLUMNS
        ))
        .bind(school_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BillingRecordRow::into_record).collect()
    }

    async fn insert_record(&self, record: &BillingRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_records
                (id, school_id, mode, status, billing_cycle, current_period_start,
                 current_period_end, member_count, rate_per_member_cents,
                 total_amount_cents, billed_cap, gateway_customer_id,
                 gateway_subscription_id, last_payment_at, next_payment_at,
                 created_via, created_at, superseded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18)
            "#,
        )
        .bind(record.id)
        .bind(record.school_id)
        .bind(record.mode.as_str())
        .bind(record.status.as_str())
        .bind(&record.billing_cycle)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.member_count)
        .bind(record.rate_per_member_cents)
        .bind(record.total_amount_cents)
        .bind(record.billed_cap)
        .bind(&record.gateway_customer_id)
        .bind(&record.gateway_subscription_id)
        .bind(record.last_payment_at)
        .bind(record.next_payment_at)
        .bind(&record.created_via)
        .bind(record.created_at)
        .bind(record.superseded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn supersede_record(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query("UPDATE billing_records SET superseded_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_amounts(&self, id: Uuid, update: &AmountsUpdate) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_records SET
                member_count = $1,
                rate_per_member_cents = $2,
                billed_cap = $3,
                total_amount_cents = $4
            WHERE id = $5
            "#,
        )
        .bind(update.member_count)
        .bind(update.rate_per_member_cents)
        .bind(update.billed_cap)
        .bind(update.total_amount_cents)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: BillingStatus) -> BillingResult<()> {
        sqlx::query("UPDATE billing_records SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_payment(&self, id: Uuid, paid_at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query("UPDATE billing_records SET last_payment_at = $1 WHERE id = $2")
            .bind(paid_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn live_records(&self) -> BillingResult<Vec<BillingRecord>> {
        let rows: Vec<BillingRecordRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_records WHERE superseded_at IS NULL",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BillingRecordRow::into_record).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LifecycleRow {
    id: Uuid,
    school_id: Uuid,
    member_id: Uuid,
    graduated_at: OffsetDateTime,
    grace_period_ends_at: OffsetDateTime,
    notified_about_deletion: bool,
    notified_at: Option<OffsetDateTime>,
    verification_status: String,
    alumni_status: String,
}

impl LifecycleRow {
    fn into_record(self) -> MemberLifecycleRecord {
        MemberLifecycleRecord {
            id: self.id,
            school_id: self.school_id,
            member_id: self.member_id,
            graduated_at: self.graduated_at,
            grace_period_ends_at: self.grace_period_ends_at,
            notified_about_deletion: self.notified_about_deletion,
            notified_at: self.notified_at,
            verification_status: match self.verification_status.as_str() {
                "verified" => VerificationStatus::Verified,
                _ => VerificationStatus::Pending,
            },
            alumni_status: match self.alumni_status.as_str() {
                "confirmed" => AlumniStatus::Confirmed,
                "declined" => AlumniStatus::Declined,
                _ => AlumniStatus::Pending,
            },
        }
    }
}

const LIFECYCLE_COLUMNS: &str = "id, school_id, member_id, graduated_at, \
     grace_period_ends_at, notified_about_deletion, notified_at, \
     verification_status, alumni_status";

/// Postgres-backed [`LifecycleStore`].
#[derive(Clone)]
pub struct PgLifecycleStore {
    pool: PgPool,
}

impl PgLifecycleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LifecycleStore for PgLifecycleStore {
    async fn record_for_member(
        &self,
        member_id: Uuid,
    ) -> BillingResult<Option<MemberLifecycleRecord>> {
        let row: Option<LifecycleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM member_lifecycle WHERE member_id = $1",
            LIFECYCLE_COLUMNS
        ))
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(LifecycleRow::into_record))
    }

    async fn insert(&self, record: &MemberLifecycleRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO member_lifecycle
                (id, school_id, member_id, graduated_at, grace_period_ends_at,
                 notified_about_deletion, notified_at, verification_status, alumni_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.school_id)
        .bind(record.member_id)
        .bind(record.graduated_at)
        .bind(record.grace_period_ends_at)
        .bind(record.notified_about_deletion)
        .bind(record.notified_at)
        .bind(match record.verification_status {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Pending => "pending",
        })
        .bind(match record.alumni_status {
            AlumniStatus::Confirmed => "confirmed",
            AlumniStatus::Declined => "declined",
            AlumniStatus::Pending => "pending",
        })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_for_warning(
        &self,
        now: OffsetDateTime,
        window: time::Duration,
    ) -> BillingResult<Vec<MemberLifecycleRecord>> {
        let rows: Vec<LifecycleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM member_lifecycle \
             WHERE notified_about_deletion = false \
               AND grace_period_ends_at > $1 \
               AND grace_period_ends_at <= $2",
            LIFECYCLE_COLUMNS
        ))
        .bind(now)
        .bind(now + window)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LifecycleRow::into_record).collect())
    }

    async fn past_grace(&self, now: OffsetDateTime) -> BillingResult<Vec<MemberLifecycleRecord>> {
        let rows: Vec<LifecycleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM member_lifecycle WHERE grace_period_ends_at <= $1",
            LIFECYCLE_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LifecycleRow::into_record).collect())
    }

    async fn mark_notified(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query(
            "UPDATE member_lifecycle SET notified_about_deletion = true, notified_at = $1 \
             WHERE id = $2",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM member_lifecycle WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Postgres-backed [`MemberDirectory`] over the platform's members table.
#[derive(Clone)]
pub struct PgMemberDirectory {
    pool: PgPool,
}

impl PgMemberDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MemberDirectory for PgMemberDirectory {
    async fn member(&self, id: Uuid) -> BillingResult<Option<MemberProfile>> {
        let row: Option<(Uuid, Option<Uuid>, String)> =
            sqlx::query_as("SELECT id, school_id, role FROM members WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(id, school_id, role)| {
            let role = MemberRole::parse(&role)
                .ok_or_else(|| BillingError::Database(format!("Unknown member role '{}'", role)))?;
            Ok(MemberProfile::new(id, school_id, role))
        })
        .transpose()
    }

    async fn billable_member_count(&self, school_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM members \
             WHERE school_id = $1 AND role = 'student' AND deactivated_at IS NULL",
        )
        .bind(school_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn billable_member_ids(&self, school_id: Uuid) -> BillingResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM members \
             WHERE school_id = $1 AND role = 'student' AND deactivated_at IS NULL",
        )
        .bind(school_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn graduation_candidates(
        &self,
        school_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Uuid>> {
        // The graduation condition is owned by the member subsystem; it
        // exposes it as the expected_graduation_at column.
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM members \
             WHERE school_id = $1 AND role = 'student' AND deactivated_at IS NULL \
               AND expected_graduation_at IS NOT NULL AND expected_graduation_at <= $2",
        )
        .bind(school_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

/// Postgres-backed [`SessionStore`] over the auth subsystem's sessions table.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn invalidate_sessions_for_members(&self, member_ids: &[Uuid]) -> BillingResult<u64> {
        if member_ids.is_empty() {
            return Ok(0);
        }
        let rows = sqlx::query("DELETE FROM sessions WHERE member_id = ANY($1)")
            .bind(member_ids)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }
}

/// Postgres-backed [`NotificationSink`]: rows in outbox/queue tables that a
/// separate delivery worker drains.
#[derive(Clone)]
pub struct PgNotificationOutbox {
    pool: PgPool,
}

impl PgNotificationOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgNotificationOutbox {
    async fn send_deletion_warning(
        &self,
        member_id: Uuid,
        delete_on: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO deletion_warning_outbox (id, member_id, delete_on, created_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(member_id)
        .bind(delete_on)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_account_deletion(&self, member_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO account_deletion_queue (id, member_id, enqueued_at) \
             VALUES ($1, $2, $3)",
        )
        .bind(Uuid::new_v4())
        .bind(member_id)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
