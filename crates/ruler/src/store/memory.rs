use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::rules::RuleGroup;
use crate::store::RuleStore;

/// In-memory rule store. The trait is the seam to a durable backend;
/// this implementation backs tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryRuleStore {
    // tenant -> (namespace, name) -> group
    groups: RwLock<HashMap<String, BTreeMap<(String, String), RuleGroup>>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with a set of groups, e.g. from test fixtures.
    pub async fn with_groups(groups: Vec<RuleGroup>) -> Self {
        let store = Self::new();
        for group in groups {
            // Infallible for the in-memory implementation.
            let _ = store.set_group(group).await;
        }
        store
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn list_tenants(&self) -> crate::Result<Vec<String>> {
        let groups = self.groups.read().await;
        let mut tenants: Vec<String> = groups.keys().cloned().collect();
        tenants.sort();
        Ok(tenants)
    }

    async fn list_groups(&self, tenant: &str) -> crate::Result<Vec<RuleGroup>> {
        let groups = self.groups.read().await;
        Ok(groups
            .get(tenant)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_group(&self, group: RuleGroup) -> crate::Result<()> {
        let mut groups = self.groups.write().await;
        groups
            .entry(group.id.tenant.clone())
            .or_default()
            .insert((group.id.namespace.clone(), group.id.name.clone()), group);
        Ok(())
    }

    async fn delete_group(&self, tenant: &str, namespace: &str, name: &str) -> crate::Result<()> {
        let mut groups = self.groups.write().await;
        if let Some(tenant_groups) = groups.get_mut(tenant) {
            tenant_groups.remove(&(namespace.to_string(), name.to_string()));
            if tenant_groups.is_empty() {
                groups.remove(tenant);
            }
        }
        Ok(())
    }
}
