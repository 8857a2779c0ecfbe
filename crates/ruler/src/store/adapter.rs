use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::rules::{GroupId, RuleGroup};
use crate::store::RuleStore;

/// Diff produced by one sync pass against the rule store.
#[derive(Debug, Default)]
pub struct SyncResult {
    pub added: Vec<RuleGroup>,
    pub changed: Vec<RuleGroup>,
    pub removed: Vec<GroupId>,
}

impl SyncResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Thin sync layer over the external rule store. Each [`sync`] lists
/// every tenant's groups, drops malformed definitions, and diffs the
/// rest against the previously seen content hashes.
///
/// [`sync`]: StoreAdapter::sync
pub struct StoreAdapter {
    store: Arc<dyn RuleStore>,
    seen: Mutex<HashMap<GroupId, String>>,
}

impl StoreAdapter {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub async fn sync(&self) -> crate::Result<SyncResult> {
        let mut current: HashMap<GroupId, (String, RuleGroup)> = HashMap::new();
        for tenant in self.store.list_tenants().await? {
            for group in self.store.list_groups(&tenant).await? {
                // Definition errors exclude the group from scheduling
                // but are never fatal to the instance.
                if let Err(e) = group.validate() {
                    tracing::warn!(group = %group.id, error = %e, "skipping malformed rule group");
                    crate::metrics::INVALID_GROUPS_TOTAL.inc();
                    continue;
                }
                current.insert(group.id.clone(), (group.content_hash(), group));
            }
        }

        let mut seen = self.seen.lock().await;
        let mut result = SyncResult::default();

        for (id, (hash, group)) in &current {
            match seen.get(id) {
                None => result.added.push(group.clone()),
                Some(prev) if prev != hash => result.changed.push(group.clone()),
                Some(_) => {}
            }
        }
        result
            .removed
            .extend(seen.keys().filter(|id| !current.contains_key(*id)).cloned());

        *seen = current
            .into_iter()
            .map(|(id, (hash, _))| (id, hash))
            .collect();

        tracing::debug!(
            added = result.added.len(),
            changed = result.changed.len(),
            removed = result.removed.len(),
            "rule store sync complete"
        );
        Ok(result)
    }
}
