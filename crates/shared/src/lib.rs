//! Classloop Shared Types
//!
//! Types used by both the billing core and the background worker:
//! member roles, member profiles, and money formatting.

pub mod money;
pub mod roles;

pub use money::format_cents;
pub use roles::{MemberProfile, MemberRole};
