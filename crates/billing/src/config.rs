//! Billing configuration.
//!
//! Everything the engine needs is carried in one explicit struct and passed
//! into services at construction time. Nothing reads the environment after
//! startup.

/// Bounded retry policy for payment-gateway calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

/// Configuration for the billing core.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Platform standard per-student rate, in cents.
    pub standard_rate_cents: i64,
    /// Days between graduation and account deletion.
    pub grace_period_days: i64,
    /// How far ahead of deletion the warning job notifies members.
    pub warning_window_days: i64,
    /// Retry policy applied to every gateway call.
    pub retry: RetryPolicy,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            standard_rate_cents: 125,
            grace_period_days: 30,
            warning_window_days: 7,
            retry: RetryPolicy::default(),
        }
    }
}

impl BillingConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            standard_rate_cents: env_i64("STANDARD_RATE_CENTS", defaults.standard_rate_cents),
            grace_period_days: env_i64("GRACE_PERIOD_DAYS", defaults.grace_period_days),
            warning_window_days: env_i64("DELETION_WARNING_DAYS", defaults.warning_window_days),
            retry: RetryPolicy {
                max_attempts: env_i64("GATEWAY_RETRY_ATTEMPTS", 3) as u32,
                base_delay_ms: env_i64("GATEWAY_RETRY_BASE_MS", 500) as u64,
            },
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
