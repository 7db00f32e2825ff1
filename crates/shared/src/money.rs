//! Money formatting.
//!
//! All amounts in the billing core are integer cents; this is the one
//! place they are rendered as dollars.

/// Format an amount in cents as a dollar string, e.g. `12550` → `"$125.50"`.
pub fn format_cents(cents: i64) -> String {
    if cents < 0 {
        format!("-${:.2}", (-cents) as f64 / 100.0)
    } else {
        format!("${:.2}", cents as f64 / 100.0)
    }
}
