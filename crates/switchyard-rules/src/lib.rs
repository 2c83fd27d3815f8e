//! Routing rule parsing and conflict detection.
//!
//! Parses proxy match expressions (`Host(...) && PathPrefix(...)`) into a
//! normalized set of match clauses and compares routes for host/path/priority
//! collisions before they are written.

pub mod conflict;
pub mod error;
pub mod rule;

pub use conflict::{
    Conflict, ConflictDetector, ConflictKind, ConflictReport, RouteSpec, Severity,
};
pub use error::RuleError;
pub use rule::{HostPattern, MatchClause, PathMatch, RuleMatch};
