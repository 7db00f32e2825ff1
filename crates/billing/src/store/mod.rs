//! Storage and collaborator traits.
//!
//! The billing core is written against these seams; production runs on the
//! Postgres implementations in [`postgres`], tests and local runs on the
//! in-memory ones in [`memory`]. The trait surface maps 1:1 to the external
//! interfaces the rest of the platform provides: persistence, the member
//! directory, the session store, and the notification/deletion queue.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use classloop_shared::MemberProfile;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::caps::{CapChange, CapRevert};
use crate::error::BillingResult;
use crate::ledger::{
    AmountsUpdate, BillingRecord, BillingStatus, CapHistoryEntry, School,
};
use crate::lifecycle::MemberLifecycleRecord;
use crate::suspension::SuspensionAuditEntry;

/// Persistence for schools, their cap history, and suspension audit rows.
///
/// Cap and status writes are guarded by the school's optimistic `version`:
/// the store must refuse the write (returning
/// `BillingError::ConcurrentModification`) when the stored version differs
/// from `expected_version`, and return the new version on success.
#[async_trait]
pub trait SchoolStore: Send + Sync {
    async fn school(&self, id: Uuid) -> BillingResult<Option<School>>;

    async fn insert_school(&self, school: &School) -> BillingResult<()>;

    /// Schools whose resolved status should be treated as active for
    /// scheduling purposes (not explicitly suspended or cancelled).
    async fn active_schools(&self) -> BillingResult<Vec<School>>;

    /// Atomically write a new cap, set `cap_enforced`, and append the
    /// history entry. Returns the new version.
    async fn apply_cap_change(
        &self,
        id: Uuid,
        expected_version: i64,
        change: &CapChange,
    ) -> BillingResult<i64>;

    /// Compensating write: restore the previous cap fields and remove the
    /// history entry appended by the matching [`apply_cap_change`].
    /// Returns the new version.
    async fn revert_cap_change(
        &self,
        id: Uuid,
        expected_version: i64,
        revert: &CapRevert,
    ) -> BillingResult<i64>;

    async fn cap_history(&self, school_id: Uuid) -> BillingResult<Vec<CapHistoryEntry>>;

    /// Set or clear the explicit status override. Returns the new version.
    async fn set_status_override(
        &self,
        id: Uuid,
        expected_version: i64,
        status: Option<BillingStatus>,
    ) -> BillingResult<i64>;

    async fn record_suspension(&self, entry: &SuspensionAuditEntry) -> BillingResult<()>;

    /// Close the open suspension audit entry for a school, if any.
    async fn close_suspension(
        &self,
        school_id: Uuid,
        restored_at: OffsetDateTime,
        restored_by: Option<Uuid>,
    ) -> BillingResult<()>;

    /// The open (not yet restored) suspension entry for a school.
    async fn open_suspension(&self, school_id: Uuid)
        -> BillingResult<Option<SuspensionAuditEntry>>;

    /// All open suspension entries, for the audit report.
    async fn open_suspensions(&self) -> BillingResult<Vec<SuspensionAuditEntry>>;
}

/// Persistence for billing records.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn record(&self, id: Uuid) -> BillingResult<Option<BillingRecord>>;

    /// The most recent non-superseded record for a school.
    async fn current_record(&self, school_id: Uuid) -> BillingResult<Option<BillingRecord>>;

    async fn record_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingRecord>>;

    /// All records for a school, oldest first.
    async fn records_for_school(&self, school_id: Uuid) -> BillingResult<Vec<BillingRecord>>;

    async fn insert_record(&self, record: &BillingRecord) -> BillingResult<()>;

    async fn supersede_record(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()>;

    /// Write a full amounts recomputation produced by the ledger.
    async fn update_amounts(&self, id: Uuid, update: &AmountsUpdate) -> BillingResult<()>;

    async fn update_status(&self, id: Uuid, status: BillingStatus) -> BillingResult<()>;

    async fn mark_payment(&self, id: Uuid, paid_at: OffsetDateTime) -> BillingResult<()>;

    /// All non-superseded records across schools, for invariant sweeps.
    async fn live_records(&self) -> BillingResult<Vec<BillingRecord>>;
}

/// Persistence for graduated-member lifecycle records.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    async fn record_for_member(
        &self,
        member_id: Uuid,
    ) -> BillingResult<Option<MemberLifecycleRecord>>;

    async fn insert(&self, record: &MemberLifecycleRecord) -> BillingResult<()>;

    /// Records inside the warning window that have not yet been notified.
    async fn due_for_warning(
        &self,
        now: OffsetDateTime,
        window: time::Duration,
    ) -> BillingResult<Vec<MemberLifecycleRecord>>;

    /// Records whose grace period has fully elapsed.
    async fn past_grace(&self, now: OffsetDateTime) -> BillingResult<Vec<MemberLifecycleRecord>>;

    async fn mark_notified(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()>;

    async fn delete(&self, id: Uuid) -> BillingResult<()>;
}

/// Read-only view of the platform's member records.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn member(&self, id: Uuid) -> BillingResult<Option<MemberProfile>>;

    /// Count of active billable members (students) in a school.
    async fn billable_member_count(&self, school_id: Uuid) -> BillingResult<i64>;

    async fn billable_member_ids(&self, school_id: Uuid) -> BillingResult<Vec<Uuid>>;

    /// Members of the school currently meeting the graduation condition.
    /// The condition itself lives with the member subsystem.
    async fn graduation_candidates(
        &self,
        school_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Uuid>>;
}

/// Session invalidation, provided by the auth subsystem.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Invalidate all active sessions for the given members; returns how
    /// many sessions were dropped.
    async fn invalidate_sessions_for_members(&self, member_ids: &[Uuid]) -> BillingResult<u64>;
}

/// Outbound notifications and the account-deletion queue.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_deletion_warning(
        &self,
        member_id: Uuid,
        delete_on: OffsetDateTime,
    ) -> BillingResult<()>;

    async fn enqueue_account_deletion(&self, member_id: Uuid) -> BillingResult<()>;
}
