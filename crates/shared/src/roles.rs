//! Member roles and profiles.
//!
//! A school (tenant) has students, teachers, staff, and school admins.
//! Only students count toward billing; every other role retains access
//! regardless of the school's subscription state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a member within a school.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Student,
    Teacher,
    Staff,
    SchoolAdmin,
}

impl MemberRole {
    /// Whether this role counts toward the school's billable member count.
    pub fn is_billable(&self) -> bool {
        matches!(self, MemberRole::Student)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Student => "student",
            MemberRole::Teacher => "teacher",
            MemberRole::Staff => "staff",
            MemberRole::SchoolAdmin => "school_admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "student" => Some(MemberRole::Student),
            "teacher" => Some(MemberRole::Teacher),
            "staff" => Some(MemberRole::Staff),
            "school_admin" => Some(MemberRole::SchoolAdmin),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Minimal view of a member as the billing core needs it.
///
/// The full member record (profile, feed, auth) lives elsewhere; billing
/// only cares about identity, school membership, and role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub id: Uuid,
    /// None for members not attached to any school (personal accounts).
    pub school_id: Option<Uuid>,
    pub role: MemberRole,
}

impl MemberProfile {
    pub fn new(id: Uuid, school_id: Option<Uuid>, role: MemberRole) -> Self {
        Self {
            id,
            school_id,
            role,
        }
    }
}
