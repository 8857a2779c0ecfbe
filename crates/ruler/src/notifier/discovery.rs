use async_trait::async_trait;

/// Source of receiver endpoint addresses for a notifier.
///
/// `initial` seeds a freshly created notifier without performing I/O;
/// `resolve` is called by the refresh loop to keep the live set current.
/// For static configuration the two are identical, so a new notifier's
/// receiver set has converged before `get_or_create` returns.
#[async_trait]
pub trait ReceiverDiscovery: Send + Sync {
    fn initial(&self) -> Vec<String> {
        Vec::new()
    }

    async fn resolve(&self) -> crate::Result<Vec<String>>;
}

/// Fixed receiver set from configuration.
pub struct StaticReceivers {
    endpoints: Vec<String>,
}

impl StaticReceivers {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl ReceiverDiscovery for StaticReceivers {
    fn initial(&self) -> Vec<String> {
        self.endpoints.clone()
    }

    async fn resolve(&self) -> crate::Result<Vec<String>> {
        Ok(self.endpoints.clone())
    }
}
