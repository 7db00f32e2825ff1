//! Payment gateway boundary.
//!
//! The engine never speaks the gateway's wire protocol; it calls this trait.
//! [`RetryingGateway`] wraps any implementation with the bounded
//! exponential-backoff policy from [`RetryPolicy`], so callers see a
//! `Gateway` error only after retries are exhausted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::error::{BillingError, BillingResult};

/// External payment gateway operations the billing core depends on.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a gateway customer for a school; returns the customer handle.
    async fn create_customer(&self, school_id: Uuid, name: &str) -> BillingResult<String>;

    /// Create a subscription at the given per-student rate; returns the
    /// subscription handle.
    async fn create_subscription(&self, customer_id: &str, rate_cents: i64)
        -> BillingResult<String>;

    async fn update_subscription_rate(
        &self,
        subscription_id: &str,
        rate_cents: i64,
    ) -> BillingResult<()>;

    /// Immediately charge a prorated amount for `delta_members` additional
    /// seats; returns the amount charged in cents.
    async fn charge_prorated_amount(
        &self,
        customer_id: &str,
        delta_members: i64,
        rate_cents: i64,
    ) -> BillingResult<i64>;

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()>;

    /// Mark the subscription non-chargeable, recording the reason.
    async fn suspend_subscription(&self, subscription_id: &str, reason: &str)
        -> BillingResult<()>;

    async fn resume_subscription(&self, subscription_id: &str) -> BillingResult<()>;
}

fn backoff(policy: &RetryPolicy) -> impl Iterator<Item = Duration> {
    // from_millis(2) yields 2, 4, 8...; the factor scales that to
    // base_delay, 2*base_delay, 4*base_delay...
    ExponentialBackoff::from_millis(2)
        .factor(policy.base_delay_ms / 2)
        .map(jitter)
        .take(policy.max_attempts.saturating_sub(1) as usize)
}

fn is_transient(e: &BillingError) -> bool {
    matches!(e, BillingError::Gateway(_))
}

/// Decorator applying the bounded retry policy to every gateway call.
///
/// Only `Gateway` errors are retried; validation and not-found failures
/// surface immediately.
pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G: PaymentGateway> RetryingGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

#[async_trait]
impl<G: PaymentGateway> PaymentGateway for RetryingGateway<G> {
    async fn create_customer(&self, school_id: Uuid, name: &str) -> BillingResult<String> {
        RetryIf::start(
            backoff(&self.policy),
            || self.inner.create_customer(school_id, name),
            is_transient,
        )
        .await
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        rate_cents: i64,
    ) -> BillingResult<String> {
        RetryIf::start(
            backoff(&self.policy),
            || self.inner.create_subscription(customer_id, rate_cents),
            is_transient,
        )
        .await
    }

    async fn update_subscription_rate(
        &self,
        subscription_id: &str,
        rate_cents: i64,
    ) -> BillingResult<()> {
        RetryIf::start(
            backoff(&self.policy),
            || self.inner.update_subscription_rate(subscription_id, rate_cents),
            is_transient,
        )
        .await
    }

    async fn charge_prorated_amount(
        &self,
        customer_id: &str,
        delta_members: i64,
        rate_cents: i64,
    ) -> BillingResult<i64> {
        RetryIf::start(
            backoff(&self.policy),
            || {
                self.inner
                    .charge_prorated_amount(customer_id, delta_members, rate_cents)
            },
            is_transient,
        )
        .await
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        RetryIf::start(
            backoff(&self.policy),
            || self.inner.cancel_subscription(subscription_id),
            is_transient,
        )
        .await
    }

    async fn suspend_subscription(
        &self,
        subscription_id: &str,
        reason: &str,
    ) -> BillingResult<()> {
        RetryIf::start(
            backoff(&self.policy),
            || self.inner.suspend_subscription(subscription_id, reason),
            is_transient,
        )
        .await
    }

    async fn resume_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        RetryIf::start(
            backoff(&self.policy),
            || self.inner.resume_subscription(subscription_id),
            is_transient,
        )
        .await
    }
}

/// One gateway call, as recorded by [`InMemoryGateway`].
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    CreateCustomer { school_id: Uuid },
    CreateSubscription { customer_id: String, rate_cents: i64 },
    UpdateRate { subscription_id: String, rate_cents: i64 },
    ProratedCharge { customer_id: String, delta_members: i64, rate_cents: i64 },
    Cancel { subscription_id: String },
    Suspend { subscription_id: String, reason: String },
    Resume { subscription_id: String },
}

/// In-memory gateway used by tests and local development.
///
/// Records every call and can be told to fail the next N calls with a
/// transient gateway error.
#[derive(Default)]
pub struct InMemoryGateway {
    calls: Mutex<Vec<GatewayCall>>,
    fail_next: AtomicU64,
    fail_permanently: AtomicBool,
    seq: AtomicU64,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with a transient gateway error.
    pub fn fail_next(&self, n: u64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every call until cleared; used for rollback tests.
    pub fn fail_permanently(&self, on: bool) {
        self.fail_permanently.store(on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: GatewayCall) -> BillingResult<()> {
        if self.fail_permanently.load(Ordering::SeqCst) {
            return Err(BillingError::Gateway("gateway unavailable".to_string()));
        }
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(BillingError::Gateway("transient gateway error".to_string()));
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
        Ok(())
    }

    fn next_handle(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn create_customer(&self, school_id: Uuid, _name: &str) -> BillingResult<String> {
        self.record(GatewayCall::CreateCustomer { school_id })?;
        Ok(self.next_handle("cus"))
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        rate_cents: i64,
    ) -> BillingResult<String> {
        self.record(GatewayCall::CreateSubscription {
            customer_id: customer_id.to_string(),
            rate_cents,
        })?;
        Ok(self.next_handle("sub"))
    }

    async fn update_subscription_rate(
        &self,
        subscription_id: &str,
        rate_cents: i64,
    ) -> BillingResult<()> {
        self.record(GatewayCall::UpdateRate {
            subscription_id: subscription_id.to_string(),
            rate_cents,
        })
    }

    async fn charge_prorated_amount(
        &self,
        customer_id: &str,
        delta_members: i64,
        rate_cents: i64,
    ) -> BillingResult<i64> {
        self.record(GatewayCall::ProratedCharge {
            customer_id: customer_id.to_string(),
            delta_members,
            rate_cents,
        })?;
        Ok(delta_members * rate_cents)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        self.record(GatewayCall::Cancel {
            subscription_id: subscription_id.to_string(),
        })
    }

    async fn suspend_subscription(
        &self,
        subscription_id: &str,
        reason: &str,
    ) -> BillingResult<()> {
        self.record(GatewayCall::Suspend {
            subscription_id: subscription_id.to_string(),
            reason: reason.to_string(),
        })
    }

    async fn resume_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        self.record(GatewayCall::Resume {
            subscription_id: subscription_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retrying_gateway_recovers_from_transient_failures() {
        let inner = InMemoryGateway::new();
        inner.fail_next(2);
        let gateway = RetryingGateway::new(
            inner,
            RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
            },
        );

        let charged = gateway
            .charge_prorated_amount("cus_1", 50, 125)
            .await
            .unwrap();
        assert_eq!(charged, 6_250);
        assert_eq!(gateway.inner().calls().len(), 1);
    }

    #[tokio::test]
    async fn retrying_gateway_gives_up_after_max_attempts() {
        let inner = InMemoryGateway::new();
        inner.fail_next(3);
        let gateway = RetryingGateway::new(
            inner,
            RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
            },
        );

        let err = gateway
            .charge_prorated_amount("cus_1", 50, 125)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Gateway(_)));
        assert!(gateway.inner().calls().is_empty());
    }
}
