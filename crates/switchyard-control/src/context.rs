//! Who is performing an operation, and the audit records it produces.

use chrono::Utc;
use uuid::Uuid;

use crate::db::AuditEntry;

/// Identity attached to every mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub actor: String,
    pub role: Option<String>,
    pub source_ip: Option<String>,
}

impl OperationContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            role: None,
            source_ip: None,
        }
    }

    /// Context for background work (discovery, certificate sweeps, startup).
    pub fn system(component: &str) -> Self {
        Self::new(format!("system:{component}"))
    }

    pub fn with_source_ip(mut self, ip: Option<String>) -> Self {
        self.source_ip = ip;
        self
    }

    pub fn with_role(mut self, role: Option<String>) -> Self {
        self.role = role;
        self
    }
}

/// An audit record whose outcome is not known yet.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub entity_type: &'static str,
    pub entity_id: Option<Uuid>,
    pub entity_name: String,
    pub action: &'static str,
    pub diff: serde_json::Value,
    /// Outcome that holds whatever happens to the enclosing operation.
    pub fixed_result: Option<&'static str>,
}

impl AuditDraft {
    pub fn new(
        entity_type: &'static str,
        entity_id: Option<Uuid>,
        entity_name: impl Into<String>,
        action: &'static str,
        diff: serde_json::Value,
    ) -> Self {
        Self {
            entity_type,
            entity_id,
            entity_name: entity_name.into(),
            action,
            diff,
            fixed_result: None,
        }
    }

    pub fn with_result(mut self, result: &'static str) -> Self {
        self.fixed_result = Some(result);
        self
    }

    /// Finalize the draft once the operation's outcome is known.
    pub fn finish(&self, ctx: &OperationContext, success: bool, result: &str) -> AuditEntry {
        AuditEntry {
            id: Uuid::now_v7(),
            entity_type: self.entity_type.to_string(),
            entity_id: self.entity_id,
            entity_name: self.entity_name.clone(),
            action: self.action.to_string(),
            diff: self.diff.clone(),
            actor: ctx.actor.clone(),
            source_ip: ctx.source_ip.clone(),
            success,
            result: self.fixed_result.unwrap_or(result).to_string(),
            created_at: Utc::now(),
        }
    }
}
