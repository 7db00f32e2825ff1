//! Effective rate resolution.
//!
//! Turns a school's billing overrides plus the cached platform price into a
//! single per-student rate in cents. Pure: same inputs always produce the
//! same output, and nothing here touches storage or the gateway.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Platform price catalog entry, fetched from the gateway and cached.
///
/// Staleness is the caller's concern; the resolver only reads the value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformRates {
    /// Standard per-student rate in cents.
    pub standard_rate_cents: i64,
    /// When the rate was last fetched from the gateway's price catalog.
    pub cached_at: OffsetDateTime,
}

impl PlatformRates {
    pub fn new(standard_rate_cents: i64) -> Self {
        Self {
            standard_rate_cents,
            cached_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Typed billing overrides for a school.
///
/// Previously an ad-hoc metadata blob; every field now has a name and a
/// type, and nothing else about billing is hiding in school metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingOverrides {
    /// Platform admin marked the school free.
    pub admin_override: bool,
    /// School was activated under a free program (pilots, partners).
    pub free_activation: bool,
    /// School is flagged free but chose to pay anyway.
    pub paid_subscription_despite_free: bool,
    /// Negotiated per-student rate in cents, overriding the standard rate.
    pub custom_rate_cents: Option<i64>,
    /// Percentage discount off the standard rate, in `[0, 100)`.
    pub discount_percent: Option<f64>,
}

impl BillingOverrides {
    /// Whether the school bills at zero and needs no gateway subscription.
    pub fn is_free(&self) -> bool {
        (self.admin_override || self.free_activation) && !self.paid_subscription_despite_free
    }
}

/// Resolve the effective per-student rate in cents.
///
/// Priority: free override, then custom rate, then percentage discount off
/// the standard rate, then the standard rate itself.
pub fn resolve_effective_rate(
    overrides: &BillingOverrides,
    platform: &PlatformRates,
) -> BillingResult<i64> {
    if overrides.is_free() {
        return Ok(0);
    }

    if let Some(custom) = overrides.custom_rate_cents {
        if custom <= 0 {
            return Err(BillingError::Validation(format!(
                "Custom rate must be greater than $0.00, got {} cents",
                custom
            )));
        }
        return Ok(custom);
    }

    if let Some(discount) = overrides.discount_percent {
        if !(0.0..100.0).contains(&discount) {
            return Err(BillingError::Validation(format!(
                "Discount percent must be in [0, 100), got {}",
                discount
            )));
        }
        let discounted =
            (platform.standard_rate_cents as f64 * (100.0 - discount) / 100.0).round() as i64;
        if discounted <= 0 {
            return Err(BillingError::Validation(format!(
                "Discount of {}% reduces the rate to $0.00 or below",
                discount
            )));
        }
        return Ok(discounted);
    }

    Ok(platform.standard_rate_cents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(cents: i64) -> PlatformRates {
        PlatformRates::new(cents)
    }

    #[test]
    fn standard_rate_when_no_overrides() {
        let rate = resolve_effective_rate(&BillingOverrides::default(), &platform(125));
        assert_eq!(rate.unwrap(), 125);
    }

    #[test]
    fn free_overrides_win_over_everything() {
        let overrides = BillingOverrides {
            admin_override: true,
            custom_rate_cents: Some(900),
            discount_percent: Some(50.0),
            ..Default::default()
        };
        assert_eq!(resolve_effective_rate(&overrides, &platform(125)).unwrap(), 0);

        let overrides = BillingOverrides {
            free_activation: true,
            ..Default::default()
        };
        assert_eq!(resolve_effective_rate(&overrides, &platform(125)).unwrap(), 0);
    }

    #[test]
    fn paid_despite_free_reinstates_billing() {
        let overrides = BillingOverrides {
            free_activation: true,
            paid_subscription_despite_free: true,
            ..Default::default()
        };
        assert_eq!(
            resolve_effective_rate(&overrides, &platform(125)).unwrap(),
            125
        );
    }

    #[test]
    fn custom_rate_beats_discount() {
        let overrides = BillingOverrides {
            custom_rate_cents: Some(99),
            discount_percent: Some(50.0),
            ..Default::default()
        };
        assert_eq!(resolve_effective_rate(&overrides, &platform(125)).unwrap(), 99);
    }

    #[test]
    fn discount_rounds_to_cents() {
        let overrides = BillingOverrides {
            discount_percent: Some(50.0),
            ..Default::default()
        };
        // 125 * 0.5 = 62.5 -> rounds to 63 cents
        assert_eq!(resolve_effective_rate(&overrides, &platform(125)).unwrap(), 63);
    }

    #[test]
    fn zero_or_negative_custom_rate_rejected() {
        for cents in [0, -50] {
            let overrides = BillingOverrides {
                custom_rate_cents: Some(cents),
                ..Default::default()
            };
            let err = resolve_effective_rate(&overrides, &platform(125)).unwrap_err();
            assert!(matches!(err, BillingError::Validation(_)));
        }
    }

    #[test]
    fn discount_out_of_range_rejected() {
        for pct in [-1.0, 100.0, 150.0] {
            let overrides = BillingOverrides {
                discount_percent: Some(pct),
                ..Default::default()
            };
            let err = resolve_effective_rate(&overrides, &platform(125)).unwrap_err();
            assert!(matches!(err, BillingError::Validation(_)));
        }
    }

    #[test]
    fn discount_rounding_to_zero_rejected() {
        // 1 cent standard rate at 60% off rounds to 0
        let overrides = BillingOverrides {
            discount_percent: Some(60.0),
            ..Default::default()
        };
        let err = resolve_effective_rate(&overrides, &platform(1)).unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn resolution_is_idempotent() {
        let overrides = BillingOverrides {
            discount_percent: Some(20.0),
            ..Default::default()
        };
        let first = resolve_effective_rate(&overrides, &platform(125)).unwrap();
        let second = resolve_effective_rate(&overrides, &platform(125)).unwrap();
        assert_eq!(first, second);
    }
}
