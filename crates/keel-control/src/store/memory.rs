//! In-memory deployment store for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentId, DeploymentRecord};

use super::{DeploymentFilter, DeploymentStore, StatusUpdate};

/// In-memory deployment store.
///
/// A single write lock makes each transition's check-and-set atomic. Data is
/// lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<DeploymentId, DeploymentRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<DeploymentRecord> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        if deployments.contains_key(&record.id) {
            return Err(ControlError::conflict(format!(
                "deployment {} already exists",
                record.id
            )));
        }

        let latest = deployments
            .values()
            .filter(|d| d.app_id == record.app_id && d.service_name == record.service_name)
            .map(|d| d.version)
            .max()
            .unwrap_or(0);

        let mut record = record.clone();
        record.version = latest + 1;
        deployments.insert(record.id.clone(), record.clone());

        Ok(record)
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(deployments.get(id).cloned())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut results: Vec<_> = deployments
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        results.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let offset = usize::try_from(filter.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = filter
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));

        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn transition(
        &self,
        id: &DeploymentId,
        update: &StatusUpdate,
    ) -> ControlResult<DeploymentRecord> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let current = deployments
            .get(id)
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;

        if !update.allows(current.status) {
            return Err(ControlError::conflict(format!(
                "deployment {id} is {}, expected one of {:?}",
                current.status, update.from
            )));
        }

        if update.to.is_active() {
            let busy = deployments.values().find(|d| {
                d.id != *id
                    && d.app_id == current.app_id
                    && d.service_name == current.service_name
                    && d.status.is_active()
            });
            if let Some(other) = busy {
                return Err(ControlError::conflict(format!(
                    "deployment {} is already {} for {}/{}",
                    other.id, other.status, other.app_id, other.service_name
                )));
            }
        }

        let record = deployments
            .get_mut(id)
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;

        record.status = update.to;
        record.updated_at = Utc::now();
        if let Some(ref artifact) = update.artifact {
            record.artifact = Some(artifact.clone());
        }
        if let Some(ref node_id) = update.node_id {
            record.node_id = Some(node_id.clone());
        }
        if let Some(ref error) = update.error {
            record.error = Some(error.clone());
        }

        Ok(record.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{AppId, DeploymentStatus};
    use std::sync::Arc;

    use DeploymentStatus::{Building, Deploying, Pending, Running};

    fn record(app: &str, service: &str) -> DeploymentRecord {
        DeploymentRecord::new(AppId::new(app), service)
    }

    #[tokio::test]
    async fn insert_assigns_versions_per_key() {
        let store = MemoryStore::new();

        let a1 = store.insert(&record("a", "web")).await.unwrap();
        let a2 = store.insert(&record("a", "web")).await.unwrap();
        let b1 = store.insert(&record("a", "worker")).await.unwrap();

        assert_eq!(a1.version, 1);
        assert_eq!(a2.version, 2);
        assert_eq!(b1.version, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = MemoryStore::new();
        let r = record("a", "web");
        store.insert(&r).await.unwrap();
        assert!(store.insert(&r).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn transition_checks_expected_status() {
        let store = MemoryStore::new();
        let r = store.insert(&record("a", "web")).await.unwrap();

        let err = store
            .transition(&r.id, &StatusUpdate::new(&[Deploying], Running))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let updated = store
            .transition(&r.id, &StatusUpdate::new(&[Pending], Building))
            .await
            .unwrap();
        assert_eq!(updated.status, Building);
    }

    #[tokio::test]
    async fn transition_unknown_deployment() {
        let store = MemoryStore::new();
        let err = store
            .transition(
                &DeploymentId::generate(),
                &StatusUpdate::new(&[Pending], Building),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::DeploymentNotFound(_)));
    }

    #[tokio::test]
    async fn one_active_deployment_per_key() {
        let store = MemoryStore::new();
        let first = store.insert(&record("a", "web")).await.unwrap();
        let second = store.insert(&record("a", "web")).await.unwrap();
        let other = store.insert(&record("a", "api")).await.unwrap();

        store
            .transition(&first.id, &StatusUpdate::new(&[Pending], Building))
            .await
            .unwrap();

        let err = store
            .transition(&second.id, &StatusUpdate::new(&[Pending], Building))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // A different service is not blocked.
        store
            .transition(&other.id, &StatusUpdate::new(&[Pending], Building))
            .await
            .unwrap();

        // Once the first is no longer active the key frees up.
        store
            .transition(&first.id, &StatusUpdate::new(&[Building], Deploying))
            .await
            .unwrap();
        store
            .transition(&first.id, &StatusUpdate::new(&[Deploying], Running))
            .await
            .unwrap();
        store
            .transition(&second.id, &StatusUpdate::new(&[Pending], Building))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.insert(&record("a", "web")).await.unwrap();
        }
        store.insert(&record("b", "web")).await.unwrap();

        let filter = DeploymentFilter::new().for_service(AppId::new("a"), "web");
        let all = store.list(&filter).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].created_at >= all[2].created_at);

        let page = store
            .list(&filter.clone().with_limit(1).with_offset(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, all[1].id);

        let pending = store
            .list(&DeploymentFilter::new().with_status(Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transitions_one_wins() {
        let store = Arc::new(MemoryStore::new());
        let r = store.insert(&record("a", "web")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = r.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition(&id, &StatusUpdate::new(&[Pending], Building))
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(e.is_conflict()),
            }
        }
        assert_eq!(wins, 1);
    }
}
