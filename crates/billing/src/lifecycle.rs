//! Graduated-member lifecycle.
//!
//! Three unattended jobs move members from graduation through a grace
//! period to deletion: `run_graduation` creates lifecycle records,
//! `run_warnings` notifies members approaching deletion, `run_deletions`
//! enqueues the actual account deletion once the grace period has elapsed.
//! Each job is idempotent and recovers from per-record failures; only a
//! failure to load the candidate set aborts a run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::BillingResult;
use crate::store::{LifecycleStore, MemberDirectory, NotificationSink, SchoolStore};

/// Identity verification state of a graduated member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
}

/// Whether the member opted into an alumni account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlumniStatus {
    Pending,
    Confirmed,
    Declined,
}

/// Lifecycle record for a graduated member. Created by the graduation job,
/// destroyed only by the deletion job, and never before
/// `grace_period_ends_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberLifecycleRecord {
    pub id: Uuid,
    pub school_id: Uuid,
    pub member_id: Uuid,
    pub graduated_at: OffsetDateTime,
    pub grace_period_ends_at: OffsetDateTime,
    pub notified_about_deletion: bool,
    pub notified_at: Option<OffsetDateTime>,
    pub verification_status: VerificationStatus,
    pub alumni_status: AlumniStatus,
}

impl MemberLifecycleRecord {
    pub fn graduate(
        school_id: Uuid,
        member_id: Uuid,
        graduated_at: OffsetDateTime,
        grace_period_days: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            school_id,
            member_id,
            graduated_at,
            grace_period_ends_at: graduated_at + Duration::days(grace_period_days),
            notified_about_deletion: false,
            notified_at: None,
            verification_status: VerificationStatus::Pending,
            alumni_status: AlumniStatus::Pending,
        }
    }
}

/// Aggregate counts for one job run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobSummary {
    fn success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    fn failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }
}

/// Service behind the three lifecycle jobs.
#[derive(Clone)]
pub struct LifecycleService {
    schools: Arc<dyn SchoolStore>,
    lifecycle: Arc<dyn LifecycleStore>,
    directory: Arc<dyn MemberDirectory>,
    notifications: Arc<dyn NotificationSink>,
    config: BillingConfig,
}

impl LifecycleService {
    pub fn new(
        schools: Arc<dyn SchoolStore>,
        lifecycle: Arc<dyn LifecycleStore>,
        directory: Arc<dyn MemberDirectory>,
        notifications: Arc<dyn NotificationSink>,
        config: BillingConfig,
    ) -> Self {
        Self {
            schools,
            lifecycle,
            directory,
            notifications,
            config,
        }
    }

    /// Create lifecycle records for members that have met the graduation
    /// condition. Safe to re-run: members that already have a record are
    /// skipped.
    pub async fn run_graduation(&self, now: OffsetDateTime) -> BillingResult<JobSummary> {
        let schools = self.schools.active_schools().await?;
        let mut summary = JobSummary::default();

        for school in schools {
            let candidates = match self.directory.graduation_candidates(school.id, now).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(
                        school_id = %school.id,
                        error = %e,
                        "Failed to load graduation candidates"
                    );
                    summary.failure();
                    continue;
                }
            };

            for member_id in candidates {
                match self.graduate_member(school.id, member_id, now).await {
                    Ok(_) => summary.success(),
                    Err(e) => {
                        tracing::error!(
                            school_id = %school.id,
                            member_id = %member_id,
                            error = %e,
                            "Failed to create lifecycle record"
                        );
                        summary.failure();
                    }
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Graduation job complete"
        );
        Ok(summary)
    }

    async fn graduate_member(
        &self,
        school_id: Uuid,
        member_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        if self.lifecycle.record_for_member(member_id).await?.is_some() {
            return Ok(false);
        }
        let record = MemberLifecycleRecord::graduate(
            school_id,
            member_id,
            now,
            self.config.grace_period_days,
        );
        self.lifecycle.insert(&record).await?;
        tracing::info!(
            school_id = %school_id,
            member_id = %member_id,
            grace_period_ends_at = %record.grace_period_ends_at,
            "Member graduated; grace period started"
        );
        Ok(true)
    }

    /// Warn members whose grace period ends within the warning window.
    /// Already-notified records are excluded by the store query, so re-runs
    /// are no-ops.
    pub async fn run_warnings(&self, now: OffsetDateTime) -> BillingResult<JobSummary> {
        let window = Duration::days(self.config.warning_window_days);
        let due = self.lifecycle.due_for_warning(now, window).await?;
        let mut summary = JobSummary::default();

        for record in due {
            let result = async {
                self.notifications
                    .send_deletion_warning(record.member_id, record.grace_period_ends_at)
                    .await?;
                self.lifecycle.mark_notified(record.id, now).await
            }
            .await;

            match result {
                Ok(()) => summary.success(),
                Err(e) => {
                    tracing::error!(
                        member_id = %record.member_id,
                        record_id = %record.id,
                        error = %e,
                        "Failed to send deletion warning"
                    );
                    summary.failure();
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Deletion warning job complete"
        );
        Ok(summary)
    }

    /// Delete accounts whose grace period has elapsed. Orphaned lifecycle
    /// records (member already gone) are cleaned up and counted as
    /// successes.
    pub async fn run_deletions(&self, now: OffsetDateTime) -> BillingResult<JobSummary> {
        let expired = self.lifecycle.past_grace(now).await?;
        let mut summary = JobSummary::default();

        for record in expired {
            match self.delete_one(&record).await {
                Ok(()) => summary.success(),
                Err(e) => {
                    tracing::error!(
                        member_id = %record.member_id,
                        record_id = %record.id,
                        error = %e,
                        "Failed to process account deletion"
                    );
                    summary.failure();
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Account deletion job complete"
        );
        Ok(summary)
    }

    async fn delete_one(&self, record: &MemberLifecycleRecord) -> BillingResult<()> {
        match self.directory.member(record.member_id).await? {
            None => {
                tracing::warn!(
                    member_id = %record.member_id,
                    record_id = %record.id,
                    "Member already gone; removing orphaned lifecycle record"
                );
                self.lifecycle.delete(record.id).await
            }
            Some(_) => {
                self.notifications
                    .enqueue_account_deletion(record.member_id)
                    .await?;
                self.lifecycle.delete(record.id).await?;
                tracing::info!(
                    member_id = %record.member_id,
                    "Account deletion enqueued; lifecycle record removed"
                );
                Ok(())
            }
        }
    }
}
