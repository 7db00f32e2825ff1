// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! Tests critical boundary conditions across:
//! - Cap enforcement, proration, and the compensating rollback
//! - Concurrent cap modification
//! - Crash detection and cap reconciliation
//! - Suspension cascade and access resolution
//! - Webhook deduplication and system-vs-admin restore
//! - Member lifecycle jobs (graduation, warnings, deletions)
//! - Ledger invariant sweeps

#[cfg(test)]
mod harness {
    use std::sync::Arc;

    use classloop_shared::{MemberProfile, MemberRole};
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::config::BillingConfig;
    use crate::gateway::InMemoryGateway;
    use crate::invariants::InvariantChecker;
    use crate::ledger::{
        BillingMode, BillingRecord, BillingStatus, LedgerService, School,
    };
    use crate::lifecycle::LifecycleService;
    use crate::caps::CapService;
    use crate::store::memory::{
        InMemoryBillingStore, InMemoryLifecycleStore, InMemoryMemberDirectory,
        InMemoryNotificationSink, InMemorySchoolStore, InMemorySessionStore,
    };
    use crate::store::{BillingStore, SchoolStore};
    use crate::suspension::SuspensionService;
    use crate::webhooks::WebhookHandler;

    /// Every service wired against shared in-memory stores and gateway.
    pub struct Harness {
        pub schools: Arc<InMemorySchoolStore>,
        pub billing: Arc<InMemoryBillingStore>,
        pub lifecycle_store: Arc<InMemoryLifecycleStore>,
        pub directory: Arc<InMemoryMemberDirectory>,
        pub sessions: Arc<InMemorySessionStore>,
        pub notifications: Arc<InMemoryNotificationSink>,
        pub gateway: Arc<InMemoryGateway>,
        pub ledger: LedgerService,
        pub caps: CapService,
        pub suspension: SuspensionService,
        pub lifecycle: LifecycleService,
        pub webhooks: WebhookHandler,
        pub invariants: InvariantChecker,
    }

    impl Harness {
        pub fn new() -> Self {
            let schools = Arc::new(InMemorySchoolStore::new());
            let billing = Arc::new(InMemoryBillingStore::new());
            let lifecycle_store = Arc::new(InMemoryLifecycleStore::new());
            let directory = Arc::new(InMemoryMemberDirectory::new());
            let sessions = Arc::new(InMemorySessionStore::new());
            let notifications = Arc::new(InMemoryNotificationSink::new());
            let gateway = Arc::new(InMemoryGateway::new());
            let config = BillingConfig::default();

            let suspension = SuspensionService::new(
                schools.clone(),
                billing.clone(),
                directory.clone(),
                sessions.clone(),
                gateway.clone(),
            );

            Self {
                ledger: LedgerService::new(schools.clone(), billing.clone()),
                caps: CapService::new(
                    schools.clone(),
                    billing.clone(),
                    directory.clone(),
                    gateway.clone(),
                    config.clone(),
                ),
                suspension: suspension.clone(),
                lifecycle: LifecycleService::new(
                    schools.clone(),
                    lifecycle_store.clone(),
                    directory.clone(),
                    notifications.clone(),
                    config,
                ),
                webhooks: WebhookHandler::new(billing.clone(), suspension),
                invariants: InvariantChecker::new(
                    schools.clone(),
                    billing.clone(),
                    directory.clone(),
                ),
                schools,
                billing,
                lifecycle_store,
                directory,
                sessions,
                notifications,
                gateway,
            }
        }

        pub async fn add_school(&self, name: &str) -> School {
            let school = School::new(Uuid::new_v4(), name);
            self.schools.insert_school(&school).await.unwrap();
            school
        }

        pub async fn add_capped_school(&self, name: &str, cap: i64) -> School {
            let mut school = School::new(Uuid::new_v4(), name);
            school.membership_cap = Some(cap);
            school.cap_enforced = true;
            school.cap_set_at = Some(OffsetDateTime::now_utc());
            school.cap_set_by = Some(Uuid::new_v4());
            self.schools.insert_school(&school).await.unwrap();
            school
        }

        pub fn add_students(&self, school_id: Uuid, n: usize) -> Vec<Uuid> {
            (0..n)
                .map(|_| {
                    let id = Uuid::new_v4();
                    self.directory.add_member(MemberProfile::new(
                        id,
                        Some(school_id),
                        MemberRole::Student,
                    ));
                    id
                })
                .collect()
        }

        /// Insert an active record backed by a live gateway subscription.
        pub async fn open_active_record(
            &self,
            school_id: Uuid,
            mode: BillingMode,
            member_count: i64,
            billed_cap: Option<i64>,
            rate: i64,
        ) -> BillingRecord {
            let mut record = BillingRecord::open(school_id, mode, "onboarding");
            record.status = BillingStatus::Active;
            record.member_count = member_count;
            record.rate_per_member_cents = rate;
            record.billed_cap = billed_cap;
            record.total_amount_cents = match mode {
                BillingMode::PrepaidCap => billed_cap.unwrap_or(member_count) * rate,
                BillingMode::PerMember => member_count * rate,
            };
            record.gateway_customer_id = Some(format!("cus_{}", school_id.simple()));
            record.gateway_subscription_id = Some(format!("sub_{}", school_id.simple()));
            self.billing.insert_record(&record).await.unwrap();
            record
        }
    }
}

#[cfg(test)]
mod cap_tests {
    use uuid::Uuid;

    use super::harness::Harness;
    use crate::error::BillingError;
    use crate::gateway::GatewayCall;
    use crate::ledger::BillingMode;
    use crate::store::{BillingStore, SchoolStore};

    // =========================================================================
    // Per-member school: total follows the current headcount
    // =========================================================================
    #[tokio::test]
    async fn per_member_total_follows_headcount() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        h.add_students(school.id, 40);
        let record = h
            .open_active_record(school.id, BillingMode::PerMember, 0, None, 125)
            .await;

        let update = h
            .ledger
            .recompute_amounts(record.id, 40, None, 125)
            .await
            .unwrap();

        assert_eq!(update.total_amount_cents, 5_000); // 40 x $1.25
        let stored = h.ledger.authoritative_record(school.id).await.unwrap();
        assert_eq!(stored.total_amount_cents, 5_000);
        assert_eq!(stored.member_count, 40);
    }

    // =========================================================================
    // Prepaid cap increase: prorated charge, ledger and history updated
    // =========================================================================
    #[tokio::test]
    async fn cap_increase_charges_prorated_delta() {
        let h = Harness::new();
        let school = h.add_capped_school("Lakeview Academy", 100).await;
        h.add_students(school.id, 80);
        h.open_active_record(school.id, BillingMode::PrepaidCap, 80, Some(100), 125)
            .await;

        let actor = Uuid::new_v4();
        let result = h
            .caps
            .request_cap_increase(school.id, 150, actor, Some("enrollment growth"))
            .await
            .unwrap();

        assert_eq!(result.delta, 50);
        assert_eq!(result.additional_cost_cents, Some(6_250)); // 50 x $1.25
        assert!(result.charged);

        let charged: Vec<_> = h
            .gateway
            .calls()
            .into_iter()
            .filter(|c| matches!(c, GatewayCall::ProratedCharge { .. }))
            .collect();
        assert_eq!(charged.len(), 1);

        let record = h.ledger.authoritative_record(school.id).await.unwrap();
        assert_eq!(record.billed_cap, Some(150));
        assert_eq!(record.total_amount_cents, 18_750); // 150 x $1.25

        let updated = h.schools.school(school.id).await.unwrap().unwrap();
        assert_eq!(updated.membership_cap, Some(150));

        let history = h.schools.cap_history(school.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].previous_cap, Some(100));
        assert_eq!(history[0].new_cap, 150);
    }

    // =========================================================================
    // Gateway charge failure: cap write is rolled back, history erased
    // =========================================================================
    #[tokio::test]
    async fn failed_charge_rolls_back_cap() {
        let h = Harness::new();
        let school = h.add_capped_school("Lakeview Academy", 100).await;
        h.add_students(school.id, 80);
        h.open_active_record(school.id, BillingMode::PrepaidCap, 80, Some(100), 125)
            .await;
        h.gateway.fail_permanently(true);

        let err = h
            .caps
            .request_cap_increase(school.id, 150, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Gateway(_)));

        // The cap, the billed cap, and the history are back where they were.
        let after = h.schools.school(school.id).await.unwrap().unwrap();
        assert_eq!(after.membership_cap, Some(100));
        assert!(after.cap_enforced);
        assert!(h.schools.cap_history(school.id).await.unwrap().is_empty());
        let record = h.ledger.authoritative_record(school.id).await.unwrap();
        assert_eq!(record.billed_cap, Some(100));

        // A later attempt succeeds once the gateway recovers.
        h.gateway.fail_permanently(false);
        let result = h
            .caps
            .request_cap_increase(school.id, 150, Uuid::new_v4(), None)
            .await
            .unwrap();
        assert!(result.charged);
    }

    // =========================================================================
    // Cap below current headcount is rejected before anything is written
    // =========================================================================
    #[tokio::test]
    async fn cap_below_headcount_rejected() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        h.add_students(school.id, 30);

        let err = h
            .caps
            .set_cap(school.id, 20, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(h.schools.cap_history(school.id).await.unwrap().is_empty());

        let unchanged = h.schools.school(school.id).await.unwrap().unwrap();
        assert_eq!(unchanged.membership_cap, None);
    }

    // =========================================================================
    // Free school: cap changes never touch the gateway
    // =========================================================================
    #[tokio::test]
    async fn free_school_cap_change_skips_gateway() {
        let h = Harness::new();
        let mut school = h.add_school("Scholarship Prep").await;
        school.overrides.free_activation = true;
        h.schools.insert_school(&school).await.unwrap();
        h.add_students(school.id, 10);

        let result = h
            .caps
            .set_cap(school.id, 50, Uuid::new_v4(), None)
            .await
            .unwrap();

        assert_eq!(result.additional_cost_cents, None);
        assert!(!result.charged);
        assert!(h.gateway.calls().is_empty());
    }

    // =========================================================================
    // No live subscription: the charge is deferred, not dropped
    // =========================================================================
    #[tokio::test]
    async fn cap_increase_without_subscription_defers_charge() {
        let h = Harness::new();
        let school = h.add_capped_school("Lakeview Academy", 100).await;
        h.add_students(school.id, 80);
        // Record exists but has no gateway handles yet.
        let mut record =
            crate::ledger::BillingRecord::open(school.id, BillingMode::PrepaidCap, "onboarding");
        record.billed_cap = Some(100);
        h.billing.insert_record(&record).await.unwrap();

        let result = h
            .caps
            .request_cap_increase(school.id, 150, Uuid::new_v4(), None)
            .await
            .unwrap();

        assert_eq!(result.additional_cost_cents, Some(6_250));
        assert!(!result.charged);
        assert!(h.gateway.calls().is_empty());
        // The ledger still reflects the new capacity for the eventual charge.
        let stored = h.ledger.authoritative_record(school.id).await.unwrap();
        assert_eq!(stored.billed_cap, Some(150));
    }

    // =========================================================================
    // Registration admission under the cap
    // =========================================================================
    #[tokio::test]
    async fn admission_denied_at_cap_and_allowed_after_raise() {
        let h = Harness::new();
        let school = h.add_capped_school("Lakeview Academy", 2).await;
        h.add_students(school.id, 2);

        assert!(!h.caps.admits_new_member(school.id).await.unwrap());

        h.caps
            .set_cap(school.id, 3, Uuid::new_v4(), None)
            .await
            .unwrap();
        assert!(h.caps.admits_new_member(school.id).await.unwrap());
    }

    // =========================================================================
    // Uncapped school always admits
    // =========================================================================
    #[tokio::test]
    async fn uncapped_school_always_admits() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        h.add_students(school.id, 500);
        assert!(h.caps.admits_new_member(school.id).await.unwrap());
    }

    // =========================================================================
    // Stale version loses: concurrent cap writes cannot interleave
    // =========================================================================
    #[tokio::test]
    async fn stale_version_is_rejected() {
        use time::OffsetDateTime;

        use crate::caps::CapChange;
        use crate::ledger::CapHistoryEntry;

        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let actor = Uuid::new_v4();
        let change = |cap: i64| CapChange {
            new_cap: cap,
            cap_enforced: true,
            set_by: actor,
            set_at: OffsetDateTime::now_utc(),
            history: CapHistoryEntry {
                id: Uuid::new_v4(),
                school_id: school.id,
                previous_cap: None,
                new_cap: cap,
                changed_by: actor,
                reason: None,
                changed_at: OffsetDateTime::now_utc(),
            },
        };

        // First writer wins with the version it loaded.
        h.schools
            .apply_cap_change(school.id, school.version, &change(100))
            .await
            .unwrap();

        // Second writer still holds the old version and must fail.
        let err = h
            .schools
            .apply_cap_change(school.id, school.version, &change(120))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::BillingError::ConcurrentModification(_)));

        let stored = h.schools.school(school.id).await.unwrap().unwrap();
        assert_eq!(stored.membership_cap, Some(100));
    }
}

#[cfg(test)]
mod consistency_tests {
    use uuid::Uuid;

    use super::harness::Harness;
    use crate::error::BillingError;
    use crate::ledger::BillingMode;
    use crate::store::{BillingStore, SchoolStore};

    // =========================================================================
    // Divergent billed cap blocks further mutations until reconciled
    // =========================================================================
    #[tokio::test]
    async fn divergence_blocks_cap_changes_until_reconciled() {
        let h = Harness::new();
        // Simulates a crash after the charge confirmed but before the local
        // cap write: billed 100, local cap says 120.
        let school = h.add_capped_school("Lakeview Academy", 120).await;
        h.add_students(school.id, 80);
        h.open_active_record(school.id, BillingMode::PrepaidCap, 80, Some(100), 125)
            .await;

        let err = h
            .caps
            .set_cap(school.id, 150, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Consistency(_)));

        // Reconciliation trusts the billed side.
        let outcome = h.caps.reconcile_cap(school.id, Uuid::new_v4()).await.unwrap();
        assert!(outcome.realigned);
        assert_eq!(outcome.local_cap, Some(100));

        let repaired = h.schools.school(school.id).await.unwrap().unwrap();
        assert_eq!(repaired.membership_cap, Some(100));

        // Mutations work again.
        h.caps
            .set_cap(school.id, 150, Uuid::new_v4(), None)
            .await
            .unwrap();
    }

    // =========================================================================
    // Reconciliation with nothing billed aligns the ledger to the local cap
    // =========================================================================
    #[tokio::test]
    async fn reconcile_without_billed_cap_updates_ledger() {
        let h = Harness::new();
        let school = h.add_capped_school("Lakeview Academy", 60).await;
        h.add_students(school.id, 40);
        let record =
            crate::ledger::BillingRecord::open(school.id, BillingMode::PrepaidCap, "onboarding");
        h.billing.insert_record(&record).await.unwrap();

        let outcome = h.caps.reconcile_cap(school.id, Uuid::new_v4()).await.unwrap();
        assert!(outcome.realigned);

        let stored = h.ledger.authoritative_record(school.id).await.unwrap();
        assert_eq!(stored.billed_cap, Some(60));
        assert_eq!(stored.total_amount_cents, 60 * 125);
    }

    // =========================================================================
    // Invariant sweep: clean ledger, then a corrupted total
    // =========================================================================
    #[tokio::test]
    async fn invariant_sweep_flags_corrupted_total() {
        use crate::ledger::AmountsUpdate;

        let h = Harness::new();
        let school = h.add_capped_school("Lakeview Academy", 100).await;
        h.add_students(school.id, 80);
        let record = h
            .open_active_record(school.id, BillingMode::PrepaidCap, 80, Some(100), 125)
            .await;

        let clean = h.invariants.run_all_checks().await.unwrap();
        assert!(clean.healthy);
        assert!(clean.violations.is_empty());

        // Corrupt the stored total without going through the ledger.
        h.billing
            .update_amounts(
                record.id,
                &AmountsUpdate {
                    member_count: 80,
                    rate_per_member_cents: 125,
                    billed_cap: Some(100),
                    total_amount_cents: 1,
                },
            )
            .await
            .unwrap();

        let dirty = h.invariants.run_all_checks().await.unwrap();
        assert!(!dirty.healthy);
        assert!(dirty
            .violations
            .iter()
            .any(|v| v.invariant == "total_amount_consistent"));
    }

    // =========================================================================
    // Invariant sweep: enforced cap exceeded by headcount
    // =========================================================================
    #[tokio::test]
    async fn invariant_sweep_flags_cap_overrun() {
        let h = Harness::new();
        let school = h.add_capped_school("Lakeview Academy", 10).await;
        h.add_students(school.id, 12);

        let summary = h.invariants.run_all_checks().await.unwrap();
        assert!(summary
            .violations
            .iter()
            .any(|v| v.invariant == "cap_not_exceeded" && v.school_id == school.id));
    }
}

#[cfg(test)]
mod suspension_tests {
    use classloop_shared::{MemberProfile, MemberRole};
    use uuid::Uuid;

    use super::harness::Harness;
    use crate::ledger::{BillingMode, BillingStatus};
    use crate::store::MemberDirectory;

    // =========================================================================
    // Suspension cascades: gateway, status, audit, student sessions
    // =========================================================================
    #[tokio::test]
    async fn suspend_invalidates_student_sessions() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let students = h.add_students(school.id, 3);
        for id in &students {
            h.sessions.open_sessions(*id, 2);
        }
        h.open_active_record(school.id, BillingMode::PerMember, 3, None, 125)
            .await;

        let outcome = h
            .suspension
            .suspend(school.id, "payment failure", None)
            .await
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.affected_students, 3);
        assert_eq!(outcome.sessions_invalidated, 6);
        for id in &students {
            assert_eq!(h.sessions.active_session_count(*id), 0);
        }
        assert_eq!(
            h.ledger.resolve_school_status(school.id).await.unwrap(),
            BillingStatus::Suspended
        );
    }

    // =========================================================================
    // Suspending twice is a no-op, not an error and not a second audit row
    // =========================================================================
    #[tokio::test]
    async fn suspend_is_idempotent() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        h.open_active_record(school.id, BillingMode::PerMember, 1, None, 125)
            .await;

        let first = h
            .suspension
            .suspend(school.id, "payment failure", None)
            .await
            .unwrap();
        assert!(first.changed);

        let second = h
            .suspension
            .suspend(school.id, "payment failure", None)
            .await
            .unwrap();
        assert!(!second.changed);

        let report = h.suspension.suspension_audit_report().await.unwrap();
        assert_eq!(report.schools.len(), 1);
    }

    // =========================================================================
    // Access resolution: students gated by school status, staff never
    // =========================================================================
    #[tokio::test]
    async fn access_follows_school_status_for_students_only() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let student_id = h.add_students(school.id, 1)[0];
        let teacher = MemberProfile::new(Uuid::new_v4(), Some(school.id), MemberRole::Teacher);
        h.directory.add_member(teacher.clone());
        h.open_active_record(school.id, BillingMode::PerMember, 1, None, 125)
            .await;

        let student = h.directory.member(student_id).await.unwrap().unwrap();
        assert!(h.suspension.resolve_access(&student).await.unwrap());

        h.suspension
            .suspend(school.id, "payment failure", None)
            .await
            .unwrap();
        assert!(!h.suspension.resolve_access(&student).await.unwrap());
        // Teachers keep access regardless.
        assert!(h.suspension.resolve_access(&teacher).await.unwrap());

        h.suspension.restore(school.id, None).await.unwrap();
        assert!(h.suspension.resolve_access(&student).await.unwrap());
    }

    // =========================================================================
    // Cascade interrupted by a session-store failure is finished on retry
    // =========================================================================
    #[tokio::test]
    async fn retried_suspend_finishes_interrupted_session_sweep() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let students = h.add_students(school.id, 3);
        for id in &students {
            h.sessions.open_sessions(*id, 2);
        }
        h.open_active_record(school.id, BillingMode::PerMember, 3, None, 125)
            .await;

        // The local suspension lands but the session sweep dies.
        h.sessions.fail_next_invalidations(1);
        let err = h
            .suspension
            .suspend(school.id, "payment failure", None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::BillingError::Database(_)));
        assert_eq!(
            h.ledger.resolve_school_status(school.id).await.unwrap(),
            BillingStatus::Suspended
        );
        for id in &students {
            assert_eq!(h.sessions.active_session_count(*id), 2);
        }

        // The retry is still a no-op for state, but it sweeps the sessions.
        let retried = h
            .suspension
            .suspend(school.id, "payment failure", None)
            .await
            .unwrap();
        assert!(!retried.changed);
        assert_eq!(retried.sessions_invalidated, 6);
        for id in &students {
            assert_eq!(h.sessions.active_session_count(*id), 0);
        }
        let report = h.suspension.suspension_audit_report().await.unwrap();
        assert_eq!(report.schools.len(), 1);
    }

    // =========================================================================
    // Audit report counts billable students only; staff stay unaffected
    // =========================================================================
    #[tokio::test]
    async fn audit_report_counts_students_and_excludes_staff() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        h.add_students(school.id, 50);
        let staff: Vec<MemberProfile> = (0..5)
            .map(|_| MemberProfile::new(Uuid::new_v4(), Some(school.id), MemberRole::Staff))
            .collect();
        for member in &staff {
            h.directory.add_member(member.clone());
        }
        h.open_active_record(school.id, BillingMode::PerMember, 50, None, 125)
            .await;

        let outcome = h
            .suspension
            .suspend(school.id, "payment failure", None)
            .await
            .unwrap();
        assert_eq!(outcome.affected_students, 50);

        let report = h.suspension.suspension_audit_report().await.unwrap();
        assert_eq!(report.schools.len(), 1);
        assert_eq!(report.schools[0].student_count, 50);
        assert_eq!(report.total_students_affected, 50);

        for member in &staff {
            assert!(h.suspension.resolve_access(member).await.unwrap());
        }
    }

    // =========================================================================
    // Members without a school are never gated
    // =========================================================================
    #[tokio::test]
    async fn member_without_school_always_has_access() {
        let h = Harness::new();
        let floating = MemberProfile::new(Uuid::new_v4(), None, MemberRole::Student);
        assert!(h.suspension.resolve_access(&floating).await.unwrap());
    }

    // =========================================================================
    // Restore closes the audit entry
    // =========================================================================
    #[tokio::test]
    async fn restore_closes_audit_entry() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        h.open_active_record(school.id, BillingMode::PerMember, 1, None, 125)
            .await;

        let admin = Uuid::new_v4();
        h.suspension
            .suspend(school.id, "policy violation", Some(admin))
            .await
            .unwrap();
        let open = h.suspension.open_suspension(school.id).await.unwrap().unwrap();
        assert_eq!(open.suspended_by, Some(admin));

        h.suspension.restore(school.id, Some(admin)).await.unwrap();
        assert!(h.suspension.open_suspension(school.id).await.unwrap().is_none());

        let report = h.suspension.suspension_audit_report().await.unwrap();
        assert!(report.schools.is_empty());
    }
}

#[cfg(test)]
mod webhook_tests {
    use time::OffsetDateTime;

    use super::harness::Harness;
    use crate::ledger::{BillingMode, BillingStatus};
    use crate::webhooks::{GatewayEvent, GatewayEventKind};

    fn event(subscription_id: &str, kind: GatewayEventKind, id: &str) -> GatewayEvent {
        GatewayEvent {
            id: id.to_string(),
            subscription_id: subscription_id.to_string(),
            kind,
            occurred_at: OffsetDateTime::now_utc(),
        }
    }

    // =========================================================================
    // Payment failure suspends the school as a system action
    // =========================================================================
    #[tokio::test]
    async fn payment_failed_suspends_school() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        h.add_students(school.id, 2);
        let record = h
            .open_active_record(school.id, BillingMode::PerMember, 2, None, 125)
            .await;
        let sub = record.gateway_subscription_id.clone().unwrap();

        let outcome = h
            .webhooks
            .handle_event(&event(&sub, GatewayEventKind::PaymentFailed, "evt_1"))
            .await
            .unwrap();

        assert!(outcome.applied);
        assert_eq!(outcome.new_status, BillingStatus::PastDue);
        assert_eq!(
            h.ledger.resolve_school_status(school.id).await.unwrap(),
            BillingStatus::Suspended
        );
        // System suspension: no actor on the audit entry.
        let open = h.suspension.open_suspension(school.id).await.unwrap().unwrap();
        assert_eq!(open.suspended_by, None);
    }

    // =========================================================================
    // Duplicate delivery is a no-op
    // =========================================================================
    #[tokio::test]
    async fn duplicate_event_is_ignored() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let record = h
            .open_active_record(school.id, BillingMode::PerMember, 1, None, 125)
            .await;
        let sub = record.gateway_subscription_id.clone().unwrap();

        let first = h
            .webhooks
            .handle_event(&event(&sub, GatewayEventKind::PaymentFailed, "evt_1"))
            .await
            .unwrap();
        assert!(first.applied);

        let second = h
            .webhooks
            .handle_event(&event(&sub, GatewayEventKind::PaymentFailed, "evt_1_redelivery"))
            .await
            .unwrap();
        assert!(!second.applied);

        // Still exactly one open suspension.
        let report = h.suspension.suspension_audit_report().await.unwrap();
        assert_eq!(report.schools.len(), 1);
    }

    // =========================================================================
    // Activation after recovery restores a system-imposed suspension
    // =========================================================================
    #[tokio::test]
    async fn activation_restores_system_suspension() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let record = h
            .open_active_record(school.id, BillingMode::PerMember, 1, None, 125)
            .await;
        let sub = record.gateway_subscription_id.clone().unwrap();

        h.webhooks
            .handle_event(&event(&sub, GatewayEventKind::PaymentFailed, "evt_1"))
            .await
            .unwrap();
        assert_eq!(
            h.ledger.resolve_school_status(school.id).await.unwrap(),
            BillingStatus::Suspended
        );

        h.webhooks
            .handle_event(&event(&sub, GatewayEventKind::SubscriptionActivated, "evt_2"))
            .await
            .unwrap();
        assert_eq!(
            h.ledger.resolve_school_status(school.id).await.unwrap(),
            BillingStatus::Active
        );
    }

    // =========================================================================
    // Activation does NOT lift a suspension an admin imposed by hand
    // =========================================================================
    #[tokio::test]
    async fn activation_leaves_admin_suspension_in_place() {
        use uuid::Uuid;

        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let record = h
            .open_active_record(school.id, BillingMode::PerMember, 1, None, 125)
            .await;
        let sub = record.gateway_subscription_id.clone().unwrap();

        let admin = Uuid::new_v4();
        h.suspension
            .suspend(school.id, "policy violation", Some(admin))
            .await
            .unwrap();

        h.webhooks
            .handle_event(&event(&sub, GatewayEventKind::SubscriptionActivated, "evt_1"))
            .await
            .unwrap();

        assert_eq!(
            h.ledger.resolve_school_status(school.id).await.unwrap(),
            BillingStatus::Suspended
        );
        assert!(h.suspension.open_suspension(school.id).await.unwrap().is_some());
    }

    // =========================================================================
    // Unknown subscription surfaces NotFound
    // =========================================================================
    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let h = Harness::new();
        let err = h
            .webhooks
            .handle_event(&event("sub_missing", GatewayEventKind::PaymentFailed, "evt_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::BillingError::NotFound(_)));
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use time::macros::datetime;

    use super::harness::Harness;

    // =========================================================================
    // Full pass: graduate, warn inside the window, delete after grace
    // =========================================================================
    #[tokio::test]
    async fn graduation_through_deletion() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let student = h.add_students(school.id, 1)[0];
        h.directory.set_graduation_candidates(vec![student]);

        let graduated = datetime!(2025-06-01 00:00 UTC);
        let summary = h.lifecycle.run_graduation(graduated).await.unwrap();
        assert_eq!(summary.succeeded, 1);

        let record = h
            .lifecycle_store
            .all()
            .into_iter()
            .find(|r| r.member_id == student)
            .unwrap();
        assert_eq!(record.grace_period_ends_at, datetime!(2025-07-01 00:00 UTC));

        // Too early for a warning (more than 7 days out).
        let early = h.lifecycle.run_warnings(datetime!(2025-06-10 00:00 UTC)).await.unwrap();
        assert_eq!(early.processed, 0);

        // Inside the window the member is warned exactly once.
        let warned = h.lifecycle.run_warnings(datetime!(2025-06-26 00:00 UTC)).await.unwrap();
        assert_eq!(warned.succeeded, 1);
        let again = h.lifecycle.run_warnings(datetime!(2025-06-27 00:00 UTC)).await.unwrap();
        assert_eq!(again.processed, 0);
        assert_eq!(h.notifications.warnings_sent().len(), 1);

        // Nothing is deleted before the grace period elapses.
        let premature = h.lifecycle.run_deletions(datetime!(2025-06-30 00:00 UTC)).await.unwrap();
        assert_eq!(premature.processed, 0);
        assert!(h.notifications.deletions_enqueued().is_empty());

        // Past grace the deletion is enqueued and the record removed.
        let deleted = h.lifecycle.run_deletions(datetime!(2025-07-02 00:00 UTC)).await.unwrap();
        assert_eq!(deleted.succeeded, 1);
        assert_eq!(h.notifications.deletions_enqueued(), vec![student]);
        assert!(h.lifecycle_store.all().is_empty());
    }

    // =========================================================================
    // Graduation job re-runs do not duplicate lifecycle records
    // =========================================================================
    #[tokio::test]
    async fn graduation_is_idempotent() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let student = h.add_students(school.id, 1)[0];
        h.directory.set_graduation_candidates(vec![student]);

        let now = datetime!(2025-06-01 00:00 UTC);
        h.lifecycle.run_graduation(now).await.unwrap();
        h.lifecycle.run_graduation(now).await.unwrap();

        assert_eq!(h.lifecycle_store.all().len(), 1);
    }

    // =========================================================================
    // One failed warning does not block the rest of the batch
    // =========================================================================
    #[tokio::test]
    async fn warning_batch_survives_partial_failure() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let students = h.add_students(school.id, 2);
        h.directory.set_graduation_candidates(students.clone());
        h.lifecycle
            .run_graduation(datetime!(2025-06-01 00:00 UTC))
            .await
            .unwrap();

        h.notifications.fail_next_warnings(1);
        let first = h
            .lifecycle
            .run_warnings(datetime!(2025-06-26 00:00 UTC))
            .await
            .unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.succeeded, 1);
        assert_eq!(first.failed, 1);

        // The failed member is still pending and is picked up on the rerun.
        let second = h
            .lifecycle
            .run_warnings(datetime!(2025-06-26 06:00 UTC))
            .await
            .unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(second.succeeded, 1);
        assert_eq!(h.notifications.warnings_sent().len(), 2);
    }

    // =========================================================================
    // Orphaned lifecycle record (member already deleted) is cleaned up
    // =========================================================================
    #[tokio::test]
    async fn orphaned_record_is_removed_without_deletion_request() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let student = h.add_students(school.id, 1)[0];
        h.directory.set_graduation_candidates(vec![student]);
        h.lifecycle
            .run_graduation(datetime!(2025-06-01 00:00 UTC))
            .await
            .unwrap();

        h.directory.remove_member(student);

        let summary = h
            .lifecycle
            .run_deletions(datetime!(2025-07-02 00:00 UTC))
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(h.notifications.deletions_enqueued().is_empty());
        assert!(h.lifecycle_store.all().is_empty());
    }

    // =========================================================================
    // Suspended schools are excluded from graduation processing
    // =========================================================================
    #[tokio::test]
    async fn suspended_school_is_skipped_by_graduation() {
        use crate::ledger::BillingMode;

        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let student = h.add_students(school.id, 1)[0];
        h.directory.set_graduation_candidates(vec![student]);
        h.open_active_record(school.id, BillingMode::PerMember, 1, None, 125)
            .await;
        h.suspension
            .suspend(school.id, "payment failure", None)
            .await
            .unwrap();

        let summary = h
            .lifecycle
            .run_graduation(datetime!(2025-06-01 00:00 UTC))
            .await
            .unwrap();
        assert_eq!(summary.processed, 0);
        assert!(h.lifecycle_store.all().is_empty());
    }
}

#[cfg(test)]
mod mode_switch_tests {
    use super::harness::Harness;
    use crate::error::BillingError;
    use crate::ledger::BillingMode;
    use crate::store::BillingStore;

    // =========================================================================
    // Mode switch supersedes the old record and carries handles forward
    // =========================================================================
    #[tokio::test]
    async fn switch_supersedes_and_recomputes() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        let old = h
            .open_active_record(school.id, BillingMode::PerMember, 40, None, 125)
            .await;

        let next = h
            .ledger
            .switch_mode(school.id, BillingMode::PrepaidCap, "mode_switch")
            .await
            .unwrap();

        assert_eq!(next.mode, BillingMode::PrepaidCap);
        assert_eq!(next.gateway_subscription_id, old.gateway_subscription_id);
        assert_eq!(next.gateway_customer_id, old.gateway_customer_id);

        let superseded = h.billing.record(old.id).await.unwrap().unwrap();
        assert!(superseded.superseded_at.is_some());
        let authoritative = h.ledger.authoritative_record(school.id).await.unwrap();
        assert_eq!(authoritative.id, next.id);

        // Both rows remain for audit.
        let all = h.billing.records_for_school(school.id).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    // =========================================================================
    // Switching to the current mode is rejected
    // =========================================================================
    #[tokio::test]
    async fn switch_to_same_mode_rejected() {
        let h = Harness::new();
        let school = h.add_school("Northside High").await;
        h.open_active_record(school.id, BillingMode::PerMember, 40, None, 125)
            .await;

        let err = h
            .ledger
            .switch_mode(school.id, BillingMode::PerMember, "mode_switch")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
