mod adapter;
mod memory;

pub use adapter::{StoreAdapter, SyncResult};
pub use memory::InMemoryRuleStore;

use async_trait::async_trait;

use crate::rules::RuleGroup;

/// Durable store holding serialized rule group definitions, keyed by
/// tenant. The storage engine behind it is out of scope; definitions
/// are content-addressed via [`RuleGroup::content_hash`] so the adapter
/// can diff cheaply.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_tenants(&self) -> crate::Result<Vec<String>>;
    async fn list_groups(&self, tenant: &str) -> crate::Result<Vec<RuleGroup>>;
    async fn set_group(&self, group: RuleGroup) -> crate::Result<()>;
    async fn delete_group(&self, tenant: &str, namespace: &str, name: &str) -> crate::Result<()>;
}
