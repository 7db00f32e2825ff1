//! In-memory implementations of the storage and collaborator traits.
//!
//! Used by the test suite and local development. Each store is a
//! `Mutex<HashMap>` with the same observable semantics as the Postgres
//! implementations, including optimistic-version enforcement.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use classloop_shared::MemberProfile;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::caps::{CapChange, CapRevert};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{
    AmountsUpdate, BillingRecord, BillingStatus, CapHistoryEntry, School,
};
use crate::lifecycle::MemberLifecycleRecord;
use crate::store::{
    BillingStore, LifecycleStore, MemberDirectory, NotificationSink, SchoolStore, SessionStore,
};
use crate::suspension::SuspensionAuditEntry;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// InMemorySchoolStore
// ============================================================================

#[derive(Default)]
pub struct InMemorySchoolStore {
    schools: Mutex<HashMap<Uuid, School>>,
    cap_history: Mutex<Vec<CapHistoryEntry>>,
    suspensions: Mutex<Vec<SuspensionAuditEntry>>,
}

impl InMemorySchoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schools(schools: Vec<School>) -> Self {
        Self {
            schools: Mutex::new(schools.into_iter().map(|s| (s.id, s)).collect()),
            ..Default::default()
        }
    }

    fn check_version(school: &School, expected: i64) -> BillingResult<()> {
        if school.version != expected {
            return Err(BillingError::ConcurrentModification(format!(
                "School {} version is {}, expected {}",
                school.id, school.version, expected
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SchoolStore for InMemorySchoolStore {
    async fn school(&self, id: Uuid) -> BillingResult<Option<School>> {
        Ok(lock(&self.schools).get(&id).cloned())
    }

    async fn insert_school(&self, school: &School) -> BillingResult<()> {
        lock(&self.schools).insert(school.id, school.clone());
        Ok(())
    }

    async fn active_schools(&self) -> BillingResult<Vec<School>> {
        Ok(lock(&self.schools)
            .values()
            .filter(|s| {
                !matches!(
                    s.status_override,
                    Some(BillingStatus::Suspended) | Some(BillingStatus::Cancelled)
                )
            })
            .cloned()
            .collect())
    }

    async fn apply_cap_change(
        &self,
        id: Uuid,
        expected_version: i64,
        change: &CapChange,
    ) -> BillingResult<i64> {
        let mut schools = lock(&self.schools);
        let school = schools
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("School {} not found", id)))?;
        Self::check_version(school, expected_version)?;

        school.membership_cap = Some(change.new_cap);
        school.cap_enforced = change.cap_enforced;
        school.cap_set_at = Some(change.set_at);
        school.cap_set_by = Some(change.set_by);
        school.version += 1;

        lock(&self.cap_history).push(change.history.clone());
        Ok(school.version)
    }

    async fn revert_cap_change(
        &self,
        id: Uuid,
        expected_version: i64,
        revert: &CapRevert,
    ) -> BillingResult<i64> {
        let mut schools = lock(&self.schools);
        let school = schools
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("School {} not found", id)))?;
        Self::check_version(school, expected_version)?;

        school.membership_cap = revert.previous_cap;
        school.cap_enforced = revert.previous_enforced;
        school.cap_set_at = revert.previous_set_at;
        school.cap_set_by = revert.previous_set_by;
        school.version += 1;

        lock(&self.cap_history).retain(|e| e.id != revert.history_entry_id);
        Ok(school.version)
    }

    async fn cap_history(&self, school_id: Uuid) -> BillingResult<Vec<CapHistoryEntry>> {
        Ok(lock(&self.cap_history)
            .iter()
            .filter(|e| e.school_id == school_id)
            .cloned()
            .collect())
    }

    async fn set_status_override(
        &self,
        id: Uuid,
        expected_version: i64,
        status: Option<BillingStatus>,
    ) -> BillingResult<i64> {
        let mut schools = lock(&self.schools);
        let school = schools
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("School {} not found", id)))?;
        Self::check_version(school, expected_version)?;
        school.status_override = status;
        school.version += 1;
        Ok(school.version)
    }

    async fn record_suspension(&self, entry: &SuspensionAuditEntry) -> BillingResult<()> {
        lock(&self.suspensions).push(entry.clone());
        Ok(())
    }

    async fn close_suspension(
        &self,
        school_id: Uuid,
        restored_at: OffsetDateTime,
        restored_by: Option<Uuid>,
    ) -> BillingResult<()> {
        let mut suspensions = lock(&self.suspensions);
        for entry in suspensions.iter_mut() {
            if entry.school_id == school_id && entry.restored_at.is_none() {
                entry.restored_at = Some(restored_at);
                entry.restored_by = restored_by;
            }
        }
        Ok(())
    }

    async fn open_suspension(
        &self,
        school_id: Uuid,
    ) -> BillingResult<Option<SuspensionAuditEntry>> {
        Ok(lock(&self.suspensions)
            .iter()
            .find(|e| e.school_id == school_id && e.restored_at.is_none())
            .cloned())
    }

    async fn open_suspensions(&self) -> BillingResult<Vec<SuspensionAuditEntry>> {
        Ok(lock(&self.suspensions)
            .iter()
            .filter(|e| e.restored_at.is_none())
            .cloned()
            .collect())
    }
}

// ============================================================================
// InMemoryBillingStore
// ============================================================================

#[derive(Default)]
pub struct InMemoryBillingStore {
    records: Mutex<HashMap<Uuid, BillingRecord>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: Uuid, f: F) -> BillingResult<()>
    where
        F: FnOnce(&mut BillingRecord),
    {
        let mut records = lock(&self.records);
        let record = records
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("Billing record {} not found", id)))?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn record(&self, id: Uuid) -> BillingResult<Option<BillingRecord>> {
        Ok(lock(&self.records).get(&id).cloned())
    }

    async fn current_record(&self, school_id: Uuid) -> BillingResult<Option<BillingRecord>> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| r.school_id == school_id && r.superseded_at.is_none())
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn record_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingRecord>> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| {
                r.gateway_subscription_id.as_deref() == Some(subscription_id)
                    && r.superseded_at.is_none()
            })
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn records_for_school(&self, school_id: Uuid) -> BillingResult<Vec<BillingRecord>> {
        let mut records: Vec<BillingRecord> = lock(&self.records)
            .values()
            .filter(|r| r.school_id == school_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn insert_record(&self, record: &BillingRecord) -> BillingResult<()> {
        lock(&self.records).insert(record.id, record.clone());
        Ok(())
    }

    async fn supersede_record(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        self.update(id, |r| r.superseded_at = Some(at))
    }

    async fn update_amounts(&self, id: Uuid, update: &AmountsUpdate) -> BillingResult<()> {
        self.update(id, |r| {
            r.member_count = update.member_count;
            r.rate_per_member_cents = update.rate_per_member_cents;
            r.billed_cap = update.billed_cap;
            r.total_amount_cents = update.total_amount_cents;
        })
    }

    async fn update_status(&self, id: Uuid, status: BillingStatus) -> BillingResult<()> {
        self.update(id, |r| r.status = status)
    }

    async fn mark_payment(&self, id: Uuid, paid_at: OffsetDateTime) -> BillingResult<()> {
        self.update(id, |r| r.last_payment_at = Some(paid_at))
    }

    async fn live_records(&self) -> BillingResult<Vec<BillingRecord>> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| r.superseded_at.is_none())
            .cloned()
            .collect())
    }
}

// ============================================================================
// InMemoryLifecycleStore
// ============================================================================

#[derive(Default)]
pub struct InMemoryLifecycleStore {
    records: Mutex<HashMap<Uuid, MemberLifecycleRecord>>,
}

impl InMemoryLifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<MemberLifecycleRecord> {
        lock(&self.records).values().cloned().collect()
    }
}

#[async_trait]
impl LifecycleStore for InMemoryLifecycleStore {
    async fn record_for_member(
        &self,
        member_id: Uuid,
    ) -> BillingResult<Option<MemberLifecycleRecord>> {
        Ok(lock(&self.records)
            .values()
            .find(|r| r.member_id == member_id)
            .cloned())
    }

    async fn insert(&self, record: &MemberLifecycleRecord) -> BillingResult<()> {
        lock(&self.records).insert(record.id, record.clone());
        Ok(())
    }

    async fn due_for_warning(
        &self,
        now: OffsetDateTime,
        window: time::Duration,
    ) -> BillingResult<Vec<MemberLifecycleRecord>> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| {
                !r.notified_about_deletion
                    && r.grace_period_ends_at > now
                    && r.grace_period_ends_at <= now + window
            })
            .cloned()
            .collect())
    }

    async fn past_grace(&self, now: OffsetDateTime) -> BillingResult<Vec<MemberLifecycleRecord>> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| r.grace_period_ends_at <= now)
            .cloned()
            .collect())
    }

    async fn mark_notified(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        let mut records = lock(&self.records);
        let record = records
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("Lifecycle record {} not found", id)))?;
        record.notified_about_deletion = true;
        record.notified_at = Some(at);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> BillingResult<()> {
        lock(&self.records).remove(&id);
        Ok(())
    }
}

// ============================================================================
// InMemoryMemberDirectory
// ============================================================================

#[derive(Default)]
pub struct InMemoryMemberDirectory {
    members: Mutex<HashMap<Uuid, MemberProfile>>,
    graduation_candidates: Mutex<HashSet<Uuid>>,
}

impl InMemoryMemberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members(members: Vec<MemberProfile>) -> Self {
        Self {
            members: Mutex::new(members.into_iter().map(|m| (m.id, m)).collect()),
            ..Default::default()
        }
    }

    pub fn add_member(&self, member: MemberProfile) {
        lock(&self.members).insert(member.id, member);
    }

    pub fn remove_member(&self, id: Uuid) {
        lock(&self.members).remove(&id);
        lock(&self.graduation_candidates).remove(&id);
    }

    /// Mark members as meeting the graduation condition.
    pub fn set_graduation_candidates(&self, ids: Vec<Uuid>) {
        *lock(&self.graduation_candidates) = ids.into_iter().collect();
    }
}

#[async_trait]
impl MemberDirectory for InMemoryMemberDirectory {
    async fn member(&self, id: Uuid) -> BillingResult<Option<MemberProfile>> {
        Ok(lock(&self.members).get(&id).cloned())
    }

    async fn billable_member_count(&self, school_id: Uuid) -> BillingResult<i64> {
        Ok(lock(&self.members)
            .values()
            .filter(|m| m.school_id == Some(school_id) && m.role.is_billable())
            .count() as i64)
    }

    async fn billable_member_ids(&self, school_id: Uuid) -> BillingResult<Vec<Uuid>> {
        Ok(lock(&self.members)
            .values()
            .filter(|m| m.school_id == Some(school_id) && m.role.is_billable())
            .map(|m| m.id)
            .collect())
    }

    async fn graduation_candidates(
        &self,
        school_id: Uuid,
        _now: OffsetDateTime,
    ) -> BillingResult<Vec<Uuid>> {
        let candidates = lock(&self.graduation_candidates);
        Ok(lock(&self.members)
            .values()
            .filter(|m| m.school_id == Some(school_id) && candidates.contains(&m.id))
            .map(|m| m.id)
            .collect())
    }
}

// ============================================================================
// InMemorySessionStore
// ============================================================================

#[derive(Default)]
pub struct InMemorySessionStore {
    /// member_id -> active session count
    sessions: Mutex<HashMap<Uuid, u64>>,
    fail_next: AtomicU64,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_sessions(&self, member_id: Uuid, count: u64) {
        lock(&self.sessions).insert(member_id, count);
    }

    pub fn active_session_count(&self, member_id: Uuid) -> u64 {
        lock(&self.sessions).get(&member_id).copied().unwrap_or(0)
    }

    /// Fail the next `n` invalidation calls, for cascade-recovery tests.
    pub fn fail_next_invalidations(&self, n: u64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn invalidate_sessions_for_members(&self, member_ids: &[Uuid]) -> BillingResult<u64> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(BillingError::Database(
                "session store unavailable".to_string(),
            ));
        }
        let mut sessions = lock(&self.sessions);
        let mut dropped = 0;
        for id in member_ids {
            dropped += sessions.remove(id).unwrap_or(0);
        }
        Ok(dropped)
    }
}

// ============================================================================
// InMemoryNotificationSink
// ============================================================================

#[derive(Default)]
pub struct InMemoryNotificationSink {
    warnings: Mutex<Vec<(Uuid, OffsetDateTime)>>,
    deletions: Mutex<Vec<Uuid>>,
    fail_warnings_for: Mutex<HashSet<Uuid>>,
    fail_next_warnings: AtomicU64,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warnings_sent(&self) -> Vec<(Uuid, OffsetDateTime)> {
        lock(&self.warnings).clone()
    }

    pub fn deletions_enqueued(&self) -> Vec<Uuid> {
        lock(&self.deletions).clone()
    }

    /// Fail warning sends for a specific member, for batch-recovery tests.
    pub fn fail_warnings_for(&self, member_id: Uuid) {
        lock(&self.fail_warnings_for).insert(member_id);
    }

    pub fn fail_next_warnings(&self, n: u64) {
        self.fail_next_warnings.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn send_deletion_warning(
        &self,
        member_id: Uuid,
        delete_on: OffsetDateTime,
    ) -> BillingResult<()> {
        if lock(&self.fail_warnings_for).contains(&member_id) {
            return Err(BillingError::Database(format!(
                "notification delivery failed for member {}",
                member_id
            )));
        }
        let remaining = self.fail_next_warnings.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_warnings.store(remaining - 1, Ordering::SeqCst);
            return Err(BillingError::Database(
                "notification delivery failed".to_string(),
            ));
        }
        lock(&self.warnings).push((member_id, delete_on));
        Ok(())
    }

    async fn enqueue_account_deletion(&self, member_id: Uuid) -> BillingResult<()> {
        lock(&self.deletions).push(member_id);
        Ok(())
    }
}
