//! Billing ledger.
//!
//! Owns the authoritative billing record per school, its status machine,
//! and total-amount computation. The ledger is the ONLY writer of
//! `total_amount_cents`: every path that mutates member count, rate,
//! billed cap, or mode goes through [`AmountsUpdate::compute`].
//!
//! Records are superseded, never rewritten: a mode or cap change closes the
//! current row (`superseded_at`) and inserts a new one with a `created_via`
//! reason, preserving audit history.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::rates::BillingOverrides;
use crate::store::{BillingStore, SchoolStore};

/// How a school is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// Bill the current active billable member count.
    PerMember,
    /// Bill a fixed purchased capacity regardless of headcount.
    PrepaidCap,
}

impl BillingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingMode::PerMember => "per_member",
            BillingMode::PrepaidCap => "prepaid_cap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "per_member" => Some(BillingMode::PerMember),
            "prepaid_cap" => Some(BillingMode::PrepaidCap),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription status, local mirror of the gateway's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Pending,
    Active,
    Suspended,
    PastDue,
    Cancelled,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Pending => "pending",
            BillingStatus::Active => "active",
            BillingStatus::Suspended => "suspended",
            BillingStatus::PastDue => "past_due",
            BillingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BillingStatus::Pending),
            "active" => Some(BillingStatus::Active),
            "suspended" => Some(BillingStatus::Suspended),
            "past_due" => Some(BillingStatus::PastDue),
            "cancelled" => Some(BillingStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A school as the billing core sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct School {
    pub id: Uuid,
    pub name: String,
    pub overrides: BillingOverrides,
    /// Purchased membership capacity; None means no cap has been set.
    pub membership_cap: Option<i64>,
    pub cap_enforced: bool,
    pub cap_set_at: Option<OffsetDateTime>,
    pub cap_set_by: Option<Uuid>,
    /// Explicit administrative status, winning over anything derived from
    /// billing records. None means "derive it".
    pub status_override: Option<BillingStatus>,
    /// Optimistic-lock version; bumped on every cap or status write.
    pub version: i64,
}

impl School {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            overrides: BillingOverrides::default(),
            membership_cap: None,
            cap_enforced: false,
            cap_set_at: None,
            cap_set_by: None,
            status_override: None,
            version: 1,
        }
    }
}

/// One billing record. A school accumulates many over time; the
/// authoritative one is the most recent row without `superseded_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRecord {
    pub id: Uuid,
    pub school_id: Uuid,
    pub mode: BillingMode,
    pub status: BillingStatus,
    pub billing_cycle: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    /// Current active billable member count at last recomputation.
    pub member_count: i64,
    pub rate_per_member_cents: i64,
    pub total_amount_cents: i64,
    /// Purchased capacity; meaningful only in `prepaid_cap` mode.
    pub billed_cap: Option<i64>,
    pub gateway_customer_id: Option<String>,
    pub gateway_subscription_id: Option<String>,
    pub last_payment_at: Option<OffsetDateTime>,
    pub next_payment_at: Option<OffsetDateTime>,
    /// Why this row was created: "onboarding", "mode_switch", etc.
    pub created_via: String,
    pub created_at: OffsetDateTime,
    pub superseded_at: Option<OffsetDateTime>,
}

impl BillingRecord {
    /// Open a fresh record for a school.
    pub fn open(school_id: Uuid, mode: BillingMode, created_via: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            school_id,
            mode,
            status: BillingStatus::Pending,
            billing_cycle: "monthly".to_string(),
            current_period_start: None,
            current_period_end: None,
            member_count: 0,
            rate_per_member_cents: 0,
            total_amount_cents: 0,
            billed_cap: None,
            gateway_customer_id: None,
            gateway_subscription_id: None,
            last_payment_at: None,
            next_payment_at: None,
            created_via: created_via.to_string(),
            created_at: OffsetDateTime::now_utc(),
            superseded_at: None,
        }
    }

    /// The member count this record bills for, per mode.
    pub fn billed_members(&self) -> i64 {
        match self.mode {
            BillingMode::PrepaidCap => self.billed_cap.unwrap_or(self.member_count),
            BillingMode::PerMember => self.member_count,
        }
    }

    /// Whether this record is backed by a chargeable gateway subscription.
    pub fn has_live_subscription(&self) -> bool {
        self.gateway_subscription_id.is_some()
            && self.superseded_at.is_none()
            && self.status != BillingStatus::Cancelled
    }
}

/// Append-only record of a cap change. First-class rows, never embedded
/// JSON on the school.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapHistoryEntry {
    pub id: Uuid,
    pub school_id: Uuid,
    pub previous_cap: Option<i64>,
    pub new_cap: i64,
    pub changed_by: Uuid,
    pub reason: Option<String>,
    pub changed_at: OffsetDateTime,
}

/// A full recomputation of a record's billed amounts.
///
/// Constructed only through [`AmountsUpdate::compute`], which keeps the
/// ledger the single writer of `total_amount_cents`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountsUpdate {
    pub member_count: i64,
    pub rate_per_member_cents: i64,
    pub billed_cap: Option<i64>,
    pub total_amount_cents: i64,
}

impl AmountsUpdate {
    pub fn compute(
        mode: BillingMode,
        member_count: i64,
        billed_cap: Option<i64>,
        rate_per_member_cents: i64,
    ) -> Self {
        let billed_members = match mode {
            BillingMode::PrepaidCap => billed_cap.unwrap_or(member_count),
            BillingMode::PerMember => member_count,
        };
        Self {
            member_count,
            rate_per_member_cents,
            billed_cap,
            total_amount_cents: billed_members * rate_per_member_cents,
        }
    }
}

/// Resolve a school's effective subscription status.
///
/// An explicit administrative override wins. Otherwise the most recent
/// record with a live gateway subscription decides, falling back to the
/// most recent record overall, falling back to `pending`. A free school
/// with no gateway subscription is `active` unless explicitly suspended.
pub fn resolve_status(school: &School, records: &[BillingRecord]) -> BillingStatus {
    if let Some(status) = school.status_override {
        return status;
    }

    if school.overrides.is_free() && !records.iter().any(|r| r.has_live_subscription()) {
        return BillingStatus::Active;
    }

    let live = records
        .iter()
        .filter(|r| r.has_live_subscription())
        .max_by_key(|r| r.created_at);
    if let Some(record) = live {
        return record.status;
    }

    records
        .iter()
        .max_by_key(|r| r.created_at)
        .map(|r| r.status)
        .unwrap_or(BillingStatus::Pending)
}

/// Service owning billing-record reads and mutations.
#[derive(Clone)]
pub struct LedgerService {
    schools: Arc<dyn SchoolStore>,
    billing: Arc<dyn BillingStore>,
}

impl LedgerService {
    pub fn new(schools: Arc<dyn SchoolStore>, billing: Arc<dyn BillingStore>) -> Self {
        Self { schools, billing }
    }

    /// The authoritative (non-superseded) record for a school.
    pub async fn authoritative_record(&self, school_id: Uuid) -> BillingResult<BillingRecord> {
        self.billing
            .current_record(school_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("No billing record for school {}", school_id))
            })
    }

    /// Resolve the school's effective subscription status (see
    /// [`resolve_status`]).
    pub async fn resolve_school_status(&self, school_id: Uuid) -> BillingResult<BillingStatus> {
        let school = self
            .schools
            .school(school_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("School {} not found", school_id)))?;
        let records = self.billing.records_for_school(school_id).await?;
        Ok(resolve_status(&school, &records))
    }

    /// Recompute a record's total after a headcount or rate change.
    pub async fn recompute_amounts(
        &self,
        record_id: Uuid,
        member_count: i64,
        billed_cap: Option<i64>,
        rate_per_member_cents: i64,
    ) -> BillingResult<AmountsUpdate> {
        let record = self
            .billing
            .record(record_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Billing record {}", record_id)))?;
        let update = AmountsUpdate::compute(
            record.mode,
            member_count,
            billed_cap,
            rate_per_member_cents,
        );
        self.billing.update_amounts(record_id, &update).await?;
        Ok(update)
    }

    /// Switch billing mode by superseding the current record.
    ///
    /// The old row is closed, a new row carries the gateway handles forward,
    /// and the total is recomputed under the new mode.
    pub async fn switch_mode(
        &self,
        school_id: Uuid,
        new_mode: BillingMode,
        reason: &str,
    ) -> BillingResult<BillingRecord> {
        let current = self.authoritative_record(school_id).await?;
        if current.mode == new_mode {
            return Err(BillingError::Validation(format!(
                "School {} is already billed in {} mode",
                school_id, new_mode
            )));
        }

        let now = OffsetDateTime::now_utc();
        let mut next = BillingRecord::open(school_id, new_mode, reason);
        next.status = current.status;
        next.billing_cycle = current.billing_cycle.clone();
        next.current_period_start = current.current_period_start;
        next.current_period_end = current.current_period_end;
        next.gateway_customer_id = current.gateway_customer_id.clone();
        next.gateway_subscription_id = current.gateway_subscription_id.clone();
        next.last_payment_at = current.last_payment_at;
        next.next_payment_at = current.next_payment_at;
        next.billed_cap = current.billed_cap;

        let update = AmountsUpdate::compute(
            new_mode,
            current.member_count,
            current.billed_cap,
            current.rate_per_member_cents,
        );
        next.member_count = update.member_count;
        next.rate_per_member_cents = update.rate_per_member_cents;
        next.total_amount_cents = update.total_amount_cents;

        self.billing.supersede_record(current.id, now).await?;
        self.billing.insert_record(&next).await?;

        tracing::info!(
            school_id = %school_id,
            from_mode = %current.mode,
            to_mode = %new_mode,
            reason = %reason,
            total_cents = next.total_amount_cents,
            "Billing mode switched; record superseded"
        );

        Ok(next)
    }
}
