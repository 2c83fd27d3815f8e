//! Route conflict detection.
//!
//! Two routes collide when some request host could be matched by both:
//! - equal priority is an error, because the proxy's tie-break is undefined;
//! - different priority with overlapping paths is a warning, because the
//!   lower-priority route is (partly) shadowed.
//!
//! Rules without any host constraint are compared by path alone.

use serde::{Deserialize, Serialize};

use crate::{RuleError, RuleMatch};

/// Kind of collision between two routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    DuplicatePriority,
    PathOverlap,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicatePriority => "duplicate_priority",
            Self::PathOverlap => "path_overlap",
        }
    }
}

/// Whether a conflict blocks a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

/// A single detected conflict. `route_a` is the route being evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub route_a: String,
    pub route_b: String,
    pub kind: ConflictKind,
    pub severity: Severity,
    pub message: String,
}

/// Result of checking a candidate route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub valid: bool,
    pub errors: Vec<Conflict>,
    pub warnings: Vec<Conflict>,
}

impl Default for ConflictReport {
    fn default() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl ConflictReport {
    fn push(&mut self, conflict: Conflict) {
        match conflict.severity {
            Severity::Error => {
                self.valid = false;
                self.errors.push(conflict);
            }
            Severity::Warning => self.warnings.push(conflict),
        }
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: ConflictReport) {
        for conflict in other.errors.into_iter().chain(other.warnings) {
            self.push(conflict);
        }
    }

    /// No errors and no warnings.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    /// All findings, errors first.
    pub fn all(&self) -> impl Iterator<Item = &Conflict> {
        self.errors.iter().chain(self.warnings.iter())
    }
}

/// The fields of a route that matter for conflict detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub name: String,
    pub rule: String,
    pub priority: i32,
}

impl RouteSpec {
    pub fn new(name: impl Into<String>, rule: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            rule: rule.into(),
            priority,
        }
    }
}

#[derive(Debug)]
struct ParsedRoute {
    name: String,
    priority: i32,
    rule: RuleMatch,
}

impl ParsedRoute {
    fn parse(spec: &RouteSpec) -> Result<Self, RuleError> {
        Ok(Self {
            name: spec.name.clone(),
            priority: spec.priority,
            rule: RuleMatch::parse(&spec.rule)?,
        })
    }
}

/// Conflict detector over a fixed set of active routes.
#[derive(Debug, Default)]
pub struct ConflictDetector {
    routes: Vec<ParsedRoute>,
    unparseable: Vec<(String, RuleError)>,
}

impl ConflictDetector {
    /// Build a detector from the currently active routes.
    ///
    /// Routes whose rule no longer parses are set aside and reported by
    /// [`ConflictDetector::unparseable`] instead of failing the whole check.
    pub fn new<I>(active: I) -> Self
    where
        I: IntoIterator<Item = RouteSpec>,
    {
        let mut detector = Self::default();
        for spec in active {
            match ParsedRoute::parse(&spec) {
                Ok(parsed) => detector.routes.push(parsed),
                Err(e) => detector.unparseable.push((spec.name, e)),
            }
        }
        detector
    }

    /// Active routes that could not be parsed.
    pub fn unparseable(&self) -> &[(String, RuleError)] {
        &self.unparseable
    }

    /// Check a candidate against every active route except itself.
    pub fn check(&self, candidate: &RouteSpec) -> Result<ConflictReport, RuleError> {
        let candidate = ParsedRoute::parse(candidate)?;
        let mut report = ConflictReport::default();
        for existing in self.routes.iter().filter(|r| r.name != candidate.name) {
            if let Some(conflict) = compare(&candidate, existing) {
                report.push(conflict);
            }
        }
        Ok(report)
    }

    /// Pairwise scan of the active set, each pair reported once.
    pub fn scan(&self) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        for (i, a) in self.routes.iter().enumerate() {
            for b in &self.routes[i + 1..] {
                if let Some(conflict) = compare(a, b) {
                    conflicts.push(conflict);
                }
            }
        }
        conflicts
    }
}

fn compare(a: &ParsedRoute, b: &ParsedRoute) -> Option<Conflict> {
    let mut hosts_overlap = false;
    let mut paths_overlap = false;

    for left in &a.rule.clauses {
        for right in &b.rule.clauses {
            let paths = left.paths_overlap(right);
            let hosts = left.hosts_overlap(right).unwrap_or(paths);
            if hosts {
                hosts_overlap = true;
                paths_overlap |= paths;
            }
        }
    }

    if !hosts_overlap {
        return None;
    }

    if a.priority == b.priority {
        return Some(Conflict {
            route_a: a.name.clone(),
            route_b: b.name.clone(),
            kind: ConflictKind::DuplicatePriority,
            severity: Severity::Error,
            message: format!(
                "routes '{}' and '{}' match overlapping hosts with the same priority {}",
                a.name, b.name, a.priority
            ),
        });
    }

    if paths_overlap {
        let (winner, loser) = if a.priority > b.priority { (a, b) } else { (b, a) };
        return Some(Conflict {
            route_a: a.name.clone(),
            route_b: b.name.clone(),
            kind: ConflictKind::PathOverlap,
            severity: Severity::Warning,
            message: format!(
                "route '{}' (priority {}) shadows '{}' (priority {}) on overlapping paths",
                winner.name, winner.priority, loser.name, loser.priority
            ),
        });
    }

    None
}
