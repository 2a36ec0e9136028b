//! Priority classes and the static priority table.
//!
//! Priority is derived from the resource class of a request plus a few
//! additive modifiers from the caller's context. The calculation is pure.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Priority class, most urgent first
///
/// The derived ordering sorts `Critical` before `Low`, which is the order
/// the scheduler admits work in.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Bypasses throttling, admitted before everything else
    Critical,
    /// Interactive work the user is waiting on
    High,
    /// Default class
    #[default]
    Medium,
    /// Background and speculative work
    Low,
}

impl Priority {
    /// All classes, most urgent first
    pub const ALL: [Priority; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    /// Ordinal rank (0 = most urgent)
    #[must_use]
    pub const fn rank(&self) -> i32 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    /// Class for a rank, clamped to the valid range
    #[must_use]
    pub const fn from_rank(rank: i32) -> Self {
        match rank {
            i32::MIN..=0 => Self::Critical,
            1 => Self::High,
            2 => Self::Medium,
            _ => Self::Low,
        }
    }

    /// Whether this class skips the throttler
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller context that shifts the base priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriorityContext {
    /// The request carries credentials that gate further work
    pub auth_required: bool,
    /// The caller holds an elevated role
    pub elevated_role: bool,
    /// Triggered by a direct user action
    pub user_initiated: bool,
    /// Issued by a background job
    pub background: bool,
}

impl PriorityContext {
    /// Empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark as requiring authentication
    #[must_use]
    pub fn auth_required(mut self) -> Self {
        self.auth_required = true;
        self
    }

    /// Mark as issued by an elevated role
    #[must_use]
    pub fn elevated(mut self) -> Self {
        self.elevated_role = true;
        self
    }

    /// Mark as user initiated
    #[must_use]
    pub fn user_initiated(mut self) -> Self {
        self.user_initiated = true;
        self
    }

    /// Mark as background work
    #[must_use]
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Net rank shift of all modifiers (negative = more urgent)
    #[must_use]
    pub fn modifier(&self) -> i32 {
        let mut shift = 0;
        if self.auth_required {
            shift -= 1;
        }
        if self.elevated_role {
            shift -= 1;
        }
        if self.user_initiated {
            shift -= 1;
        }
        if self.background {
            shift += 1;
        }
        shift
    }
}

/// Static mapping from resource class to base priority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityTable {
    entries: HashMap<String, Priority>,
    fallback: Priority,
}

impl PriorityTable {
    /// Empty table where every class maps to `fallback`
    #[must_use]
    pub fn empty(fallback: Priority) -> Self {
        Self {
            entries: HashMap::new(),
            fallback,
        }
    }

    /// Add or replace an entry
    #[must_use]
    pub fn with_entry(mut self, resource_class: impl Into<String>, priority: Priority) -> Self {
        self.entries.insert(resource_class.into(), priority);
        self
    }

    /// Base class for a resource class
    #[must_use]
    pub fn base(&self, resource_class: &str) -> Priority {
        self.entries
            .get(resource_class)
            .copied()
            .unwrap_or(self.fallback)
    }

    /// Compute the priority of a request
    #[must_use]
    pub fn calculate(&self, resource_class: &str, context: &PriorityContext) -> Priority {
        let rank = self.base(resource_class).rank() + context.modifier();
        Priority::from_rank(rank)
    }
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self::empty(Priority::Medium)
            .with_entry("auth", Priority::Critical)
            .with_entry("session", Priority::Critical)
            .with_entry("profile", Priority::High)
            .with_entry("permissions", Priority::High)
            .with_entry("query", Priority::Medium)
            .with_entry("list", Priority::Medium)
            .with_entry("detail", Priority::Medium)
            .with_entry("analytics", Priority::Low)
            .with_entry("prefetch", Priority::Low)
            .with_entry("report", Priority::Low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_from_rank_clamps() {
        assert_eq!(Priority::from_rank(-5), Priority::Critical);
        assert_eq!(Priority::from_rank(2), Priority::Medium);
        assert_eq!(Priority::from_rank(17), Priority::Low);
    }

    #[test]
    fn test_table_defaults() {
        let table = PriorityTable::default();
        assert_eq!(table.base("auth"), Priority::Critical);
        assert_eq!(table.base("profile"), Priority::High);
        assert_eq!(table.base("analytics"), Priority::Low);
        assert_eq!(table.base("unknown"), Priority::Medium);
    }

    #[test]
    fn test_modifiers_shift_and_clamp() {
        let table = PriorityTable::default();
        let ctx = PriorityContext::new().auth_required();
        assert_eq!(table.calculate("query", &ctx), Priority::High);

        let ctx = PriorityContext::new().auth_required().elevated().user_initiated();
        assert_eq!(table.calculate("query", &ctx), Priority::Critical);

        let ctx = PriorityContext::new().background();
        assert_eq!(table.calculate("report", &ctx), Priority::Low);
        assert_eq!(table.calculate("profile", &ctx), Priority::Medium);
    }

    #[test]
    fn test_calculation_is_deterministic() {
        let table = PriorityTable::default();
        let ctx = PriorityContext::new().elevated();
        let first = table.calculate("list", &ctx);
        for _ in 0..10 {
            assert_eq!(table.calculate("list", &ctx), first);
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_urgent_modifiers_never_demote(
            class in prop::sample::select(vec!["auth", "profile", "query", "report", "other"]),
            elevated: bool,
            user: bool,
            background: bool,
        ) {
            let table = PriorityTable::default();
            let ctx = PriorityContext {
                auth_required: false,
                elevated_role: elevated,
                user_initiated: user,
                background,
            };
            let with_auth = PriorityContext { auth_required: true, ..ctx };
            prop_assert!(table.calculate(class, &with_auth) <= table.calculate(class, &ctx));
        }
    }
}
