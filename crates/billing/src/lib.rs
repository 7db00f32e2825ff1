// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Service constructors take every collaborator explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Classloop Billing Engine
//!
//! Subscription and access-control core for school accounts.
//!
//! ## Features
//!
//! - **Rate Resolution**: Per-student rate from platform standard, custom
//!   rates, discounts, and free-activation overrides
//! - **Billing Ledger**: Append-only billing records per school with two
//!   modes (per-member and prepaid cap)
//! - **Cap Enforcement**: Membership caps with prorated charges on increase
//!   and a compensating rollback when the charge fails
//! - **Suspension Cascade**: School suspension that invalidates student
//!   sessions and flows from payment failures
//! - **Member Lifecycle**: Graduation, grace period, deletion warning, and
//!   account-deletion jobs
//! - **Webhooks**: Apply gateway subscription events to the ledger
//! - **Invariants**: Scheduled consistency checks over the whole ledger

pub mod caps;
pub mod config;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod lifecycle;
pub mod rates;
pub mod store;
pub mod suspension;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Caps
pub use caps::{CapChange, CapChangeResult, CapRevert, CapService, ReconcileOutcome};

// Config
pub use config::{BillingConfig, RetryPolicy};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{GatewayCall, InMemoryGateway, PaymentGateway, RetryingGateway};

// Ledger
pub use ledger::{
    resolve_status, AmountsUpdate, BillingMode, BillingRecord, BillingStatus, CapHistoryEntry,
    LedgerService, School,
};

// Lifecycle
pub use lifecycle::{
    AlumniStatus, JobSummary, LifecycleService, MemberLifecycleRecord, VerificationStatus,
};

// Rates
pub use rates::{resolve_effective_rate, BillingOverrides, PlatformRates};

// Store
pub use store::{
    BillingStore, LifecycleStore, MemberDirectory, NotificationSink, SchoolStore, SessionStore,
};

// Suspension
pub use suspension::{
    SuspendedSchoolReport, SuspensionAuditEntry, SuspensionAuditReport, SuspensionOutcome,
    SuspensionService,
};

// Webhooks
pub use webhooks::{GatewayEvent, GatewayEventKind, WebhookHandler, WebhookOutcome};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use std::sync::Arc;

use sqlx::PgPool;

use store::postgres::{
    PgBillingStore, PgLifecycleStore, PgMemberDirectory, PgNotificationOutbox, PgSchoolStore,
    PgSessionStore,
};

/// Main billing service that combines all billing functionality.
#[derive(Clone)]
pub struct BillingService {
    pub ledger: LedgerService,
    pub caps: CapService,
    pub suspension: SuspensionService,
    pub lifecycle: LifecycleService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Wire the service against explicit stores and a gateway.
    ///
    /// The gateway is wrapped in the bounded retry decorator here, so every
    /// service sees the same retry behavior.
    pub fn new<G: PaymentGateway + 'static>(
        schools: Arc<dyn SchoolStore>,
        billing: Arc<dyn BillingStore>,
        lifecycle_store: Arc<dyn LifecycleStore>,
        directory: Arc<dyn MemberDirectory>,
        sessions: Arc<dyn SessionStore>,
        notifications: Arc<dyn NotificationSink>,
        gateway: G,
        config: BillingConfig,
    ) -> Self {
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(RetryingGateway::new(gateway, config.retry));

        let suspension = SuspensionService::new(
            schools.clone(),
            billing.clone(),
            directory.clone(),
            sessions,
            gateway.clone(),
        );

        Self {
            ledger: LedgerService::new(schools.clone(), billing.clone()),
            caps: CapService::new(
                schools.clone(),
                billing.clone(),
                directory.clone(),
                gateway,
                config.clone(),
            ),
            suspension: suspension.clone(),
            lifecycle: LifecycleService::new(
                schools.clone(),
                lifecycle_store,
                directory.clone(),
                notifications,
                config,
            ),
            webhooks: WebhookHandler::new(billing.clone(), suspension),
            invariants: InvariantChecker::new(schools, billing, directory),
        }
    }

    /// Wire the service against Postgres-backed stores.
    pub fn from_pool<G: PaymentGateway + 'static>(
        pool: PgPool,
        gateway: G,
        config: BillingConfig,
    ) -> Self {
        Self::new(
            Arc::new(PgSchoolStore::new(pool.clone())),
            Arc::new(PgBillingStore::new(pool.clone())),
            Arc::new(PgLifecycleStore::new(pool.clone())),
            Arc::new(PgMemberDirectory::new(pool.clone())),
            Arc::new(PgSessionStore::new(pool.clone())),
            Arc::new(PgNotificationOutbox::new(pool)),
            gateway,
            config,
        )
    }
}
