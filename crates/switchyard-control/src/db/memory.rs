//! In-memory [`ConfigStore`] for development and tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::models::{
    AuditEntry, Certificate, Change, ConfigSnapshot, ConfigState, RouteConflict, SnapshotSummary,
};
use super::store::{ConfigStore, StoreError};

#[derive(Default)]
struct Inner {
    state: ConfigState,
    certificates: BTreeMap<String, Certificate>,
    snapshots: Vec<ConfigSnapshot>,
    published: Option<Uuid>,
    audit: Vec<AuditEntry>,
    conflicts: Vec<RouteConflict>,
}

/// Process-local store with the same transactional semantics as PostgreSQL.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make configuration writes fail until reset, to exercise failure paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes are disabled".into()));
        }
        Ok(())
    }
}

fn check_unique(state: &ConfigState) -> Result<(), StoreError> {
    fn dupes<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name) {
                return Err(StoreError::UniqueViolation(format!("{kind} '{name}'")));
            }
        }
        Ok(())
    }
    dupes("route", state.routes.iter().map(|r| r.name.as_str()))?;
    dupes("service", state.services.iter().map(|s| s.name.as_str()))?;
    dupes("middleware", state.middlewares.iter().map(|m| m.name.as_str()))
}

fn strip_derived(mut state: ConfigState) -> ConfigState {
    for middleware in &mut state.middlewares {
        middleware.usage_count = 0;
    }
    state.sort();
    state
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load_state(&self) -> Result<ConfigState, StoreError> {
        Ok(self.inner.read().state.clone())
    }

    async fn apply(&self, changes: &[Change]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let mut next = inner.state.clone();
        next.apply_changes(changes);
        let next = strip_derived(next);
        check_unique(&next)?;
        inner.state = next;
        Ok(())
    }

    async fn replace_state(&self, state: &ConfigState) -> Result<(), StoreError> {
        self.check_writable()?;
        let next = strip_derived(state.clone());
        check_unique(&next)?;
        self.inner.write().state = next;
        Ok(())
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>, StoreError> {
        Ok(self.inner.read().certificates.values().cloned().collect())
    }

    async fn upsert_certificates(&self, certificates: &[Certificate]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for cert in certificates {
            inner.certificates.insert(cert.domain.clone(), cert.clone());
        }
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &ConfigSnapshot) -> Result<(), StoreError> {
        self.inner.write().snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<ConfigSnapshot>, StoreError> {
        Ok(self
            .inner
            .read()
            .snapshots
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, StoreError> {
        // Insertion order breaks timestamp ties.
        Ok(self
            .inner
            .read()
            .snapshots
            .iter()
            .rev()
            .map(ConfigSnapshot::summary)
            .collect())
    }

    async fn mark_snapshot_restored(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(snapshot) = self.inner.write().snapshots.iter_mut().find(|s| s.id == id) {
            snapshot.restored_at = Some(at);
        }
        Ok(())
    }

    async fn delete_snapshots(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.snapshots.len();
        inner.snapshots.retain(|s| !ids.contains(&s.id));
        Ok((before - inner.snapshots.len()) as u64)
    }

    async fn published_snapshot(&self) -> Result<Option<Uuid>, StoreError> {
        Ok(self.inner.read().published)
    }

    async fn set_published_snapshot(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.write().published = Some(id);
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.inner.write().audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(&self, limit: i64) -> Result<Vec<AuditEntry>, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .inner
            .read()
            .audit
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_conflicts(&self, conflicts: &[RouteConflict]) -> Result<(), StoreError> {
        self.inner.write().conflicts.extend_from_slice(conflicts);
        Ok(())
    }

    async fn list_conflicts(&self, limit: i64) -> Result<Vec<RouteConflict>, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .inner
            .read()
            .conflicts
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{RouteSource, RouteStatus, Service, ServiceStatus, ServiceType};

    fn service(name: &str) -> Service {
        let now = Utc::now();
        Service {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: ServiceType::Http,
            backend_targets: vec![],
            health_check: None,
            status: ServiceStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn route(name: &str) -> crate::db::models::Route {
        let now = Utc::now();
        crate::db::models::Route {
            id: Uuid::new_v4(),
            name: name.into(),
            rule: "Host(`a.example.com`)".into(),
            service_ref: "api".into(),
            priority: 0,
            entrypoints: vec![],
            tls_enabled: false,
            middleware_refs: vec![],
            status: RouteStatus::Active,
            source: RouteSource::Manual,
            metadata: serde_json::json!({}),
            created_at: now,
            created_by: "test".into(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn apply_is_all_or_nothing_on_duplicate_names() {
        let store = MemoryStore::new();
        store
            .apply(&[Change::PutService(service("api"))])
            .await
            .unwrap();

        let err = store
            .apply(&[
                Change::PutRoute(route("web")),
                Change::PutService(service("api")),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));

        let state = store.load_state().await.unwrap();
        assert!(state.routes.is_empty());
        assert_eq!(state.services.len(), 1);
    }

    #[tokio::test]
    async fn failing_writes_leave_state_untouched() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store
            .apply(&[Change::PutRoute(route("web"))])
            .await
            .is_err());
        store.set_fail_writes(false);
        assert!(store.load_state().await.unwrap().routes.is_empty());
    }

    #[tokio::test]
    async fn snapshots_list_newest_first() {
        let store = MemoryStore::new();
        for label in ["one", "two"] {
            store
                .insert_snapshot(&ConfigSnapshot {
                    id: Uuid::new_v4(),
                    label: label.into(),
                    created_at: Utc::now(),
                    created_by: "test".into(),
                    is_automatic: true,
                    config_data: ConfigState::default(),
                    rendered_file_content: None,
                    checksum: None,
                    restored_at: None,
                })
                .await
                .unwrap();
        }
        let labels: Vec<_> = store
            .list_snapshots()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.label)
            .collect();
        assert_eq!(labels, vec!["two", "one"]);
    }
}
