//! Per-tenant notification pipeline.
//!
//! A [`Notifier`] is created lazily on the first alert for a tenant and
//! owns a bounded outbound queue plus a background send loop. Every
//! outbound request carries the tenant identity in the
//! [`TENANT_ID_HEADER`] header; that propagation is the tenant-isolation
//! boundary at the notification edge. Queue overflow drops the oldest
//! entries (documented backpressure policy) and is counted; delivery
//! failures rotate through the receiver set with exponential backoff and
//! are never fatal to the evaluation pipeline.

mod discovery;

pub use discovery::{ReceiverDiscovery, StaticReceivers};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Notify};

use crate::alerts::AlertNotification;
use crate::config::NotifierConfig;
use crate::metrics;
use crate::TENANT_ID_HEADER;

pub struct NotifierManager {
    cfg: NotifierConfig,
    client: reqwest::Client,
    discovery: Arc<dyn ReceiverDiscovery>,
    notifiers: Mutex<HashMap<String, Arc<Notifier>>>,
}

impl NotifierManager {
    pub fn new(cfg: NotifierConfig) -> crate::Result<Self> {
        let discovery = Arc::new(StaticReceivers::new(cfg.receivers.clone()));
        Self::with_discovery(cfg, discovery)
    }

    pub fn with_discovery(
        cfg: NotifierConfig,
        discovery: Arc<dyn ReceiverDiscovery>,
    ) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.send_timeout())
            .build()?;
        Ok(Self {
            cfg,
            client,
            discovery,
            notifiers: Mutex::new(HashMap::new()),
        })
    }

    /// Idempotent create-or-fetch. Concurrent callers racing to create
    /// the same tenant's notifier all receive the single winner.
    pub fn get_or_create(&self, tenant: &str) -> Arc<Notifier> {
        let mut notifiers = self.lock_notifiers();
        notifiers
            .entry(tenant.to_string())
            .or_insert_with(|| {
                tracing::info!(tenant, "creating notifier");
                Notifier::start(
                    tenant,
                    &self.cfg,
                    self.client.clone(),
                    self.discovery.clone(),
                )
            })
            .clone()
    }

    /// Enqueue alerts for `tenant` without blocking the evaluation path.
    pub fn send(&self, tenant: &str, alerts: Vec<AlertNotification>) {
        if alerts.is_empty() {
            return;
        }
        self.get_or_create(tenant).enqueue(alerts);
    }

    /// Tear down the notifier for `tenant`, draining its queue bounded
    /// by `grace`.
    pub async fn stop(&self, tenant: &str, grace: Duration) {
        let notifier = self.lock_notifiers().remove(tenant);
        if let Some(notifier) = notifier {
            notifier.stop(grace).await;
        }
    }

    /// Tear down notifiers for tenants not in `keep`, draining each
    /// bounded by `grace`. Returns the tenants that were removed.
    pub async fn retain_tenants(
        &self,
        keep: &std::collections::HashSet<String>,
        grace: Duration,
    ) -> Vec<String> {
        let stale: Vec<Arc<Notifier>> = {
            let mut notifiers = self.lock_notifiers();
            let tenants: Vec<String> = notifiers
                .keys()
                .filter(|t| !keep.contains(*t))
                .cloned()
                .collect();
            tenants
                .into_iter()
                .filter_map(|t| notifiers.remove(&t))
                .collect()
        };
        let mut removed = Vec::with_capacity(stale.len());
        for notifier in stale {
            tracing::info!(tenant = %notifier.tenant, "tearing down notifier, tenant no longer owned");
            notifier.stop(grace).await;
            removed.push(notifier.tenant.clone());
        }
        removed.sort();
        removed
    }

    pub async fn stop_all(&self, grace: Duration) {
        let drained: Vec<Arc<Notifier>> = self.lock_notifiers().drain().map(|(_, n)| n).collect();
        for notifier in drained {
            notifier.stop(grace).await;
        }
    }

    pub fn active_tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.lock_notifiers().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    fn lock_notifiers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Notifier>>> {
        self.notifiers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-tenant notifier: receiver discovery, bounded queue, send loop.
pub struct Notifier {
    tenant: String,
    queue: Mutex<VecDeque<AlertNotification>>,
    queue_capacity: usize,
    wakeup: Notify,
    receivers: RwLock<Vec<String>>,
    ready: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    rotation: AtomicUsize,
    client: reqwest::Client,
    max_retries: u32,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl Notifier {
    fn start(
        tenant: &str,
        cfg: &NotifierConfig,
        client: reqwest::Client,
        discovery: Arc<dyn ReceiverDiscovery>,
    ) -> Arc<Self> {
        let initial = discovery.initial();
        let (ready, _) = watch::channel(!initial.is_empty());
        let (shutdown, _) = watch::channel(false);
        let notifier = Arc::new(Self {
            tenant: tenant.to_string(),
            queue: Mutex::new(VecDeque::new()),
            queue_capacity: cfg.queue_capacity,
            wakeup: Notify::new(),
            receivers: RwLock::new(initial),
            ready,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            rotation: AtomicUsize::new(0),
            client,
            max_retries: cfg.max_retries,
            min_backoff: cfg.min_backoff(),
            max_backoff: cfg.max_backoff(),
        });

        let send_task = tokio::spawn(Self::run_send_loop(notifier.clone()));
        let refresh_task = tokio::spawn(Self::run_discovery_loop(
            notifier.clone(),
            discovery,
            cfg.refresh_interval(),
        ));
        {
            let mut tasks = notifier.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.push(send_task);
            tasks.push(refresh_task);
        }
        notifier
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Observable convergence of the receiver set: flips to `true` once
    /// at least one receiver endpoint is known.
    pub fn receivers_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn receivers(&self) -> Vec<String> {
        self.receivers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Enqueue without blocking; the oldest entries are dropped when the
    /// queue is full.
    pub fn enqueue(&self, alerts: Vec<AlertNotification>) {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            for alert in alerts {
                queue.push_back(alert);
            }
            while queue.len() > self.queue_capacity {
                queue.pop_front();
                metrics::NOTIFICATIONS_DROPPED_TOTAL.inc();
                tracing::warn!(tenant = %self.tenant, "notification queue full, dropping oldest");
            }
        }
        self.wakeup.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn stop(&self, grace: Duration) {
        let _ = self.shutdown.send(true);
        self.wakeup.notify_one();
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for mut task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!(tenant = %self.tenant, "notifier task did not drain in time, aborting");
                abort.abort();
            }
        }
    }

    async fn run_send_loop(notifier: Arc<Notifier>) {
        let mut shutdown = notifier.shutdown.subscribe();
        loop {
            let batch: Vec<AlertNotification> = {
                let mut queue = notifier.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.drain(..).collect()
            };
            if !batch.is_empty() {
                notifier.deliver(batch).await;
                continue;
            }
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = notifier.wakeup.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn run_discovery_loop(
        notifier: Arc<Notifier>,
        discovery: Arc<dyn ReceiverDiscovery>,
        refresh_interval: Duration,
    ) {
        let mut shutdown = notifier.shutdown.subscribe();
        let mut ticker = tokio::time::interval(refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            match discovery.resolve().await {
                Ok(endpoints) => {
                    let converged = !endpoints.is_empty();
                    *notifier.receivers.write().unwrap_or_else(|e| e.into_inner()) = endpoints;
                    if converged {
                        let _ = notifier.ready.send(true);
                    }
                }
                Err(e) => {
                    tracing::warn!(tenant = %notifier.tenant, error = %e, "receiver discovery failed")
                }
            }
        }
    }

    /// Deliver one batch, rotating through the receiver set with
    /// exponential backoff. Persistent failure is logged and counted,
    /// never propagated.
    async fn deliver(&self, batch: Vec<AlertNotification>) {
        let receivers = self.receivers();
        if receivers.is_empty() {
            tracing::warn!(tenant = %self.tenant, "no receiver endpoints known, dropping batch");
            metrics::NOTIFICATION_FAILURES_TOTAL.inc();
            return;
        }

        let start = self.rotation.fetch_add(1, Ordering::Relaxed);
        let mut backoff = self.min_backoff;
        let attempts = self.max_retries.max(1) as usize;
        for attempt in 0..attempts {
            let url = &receivers[(start + attempt) % receivers.len()];
            match self
                .client
                .post(url)
                .header(TENANT_ID_HEADER, &self.tenant)
                .json(&batch)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    metrics::NOTIFICATIONS_SENT_TOTAL.inc_by(batch.len() as u64);
                    tracing::debug!(tenant = %self.tenant, receiver = %url, count = batch.len(), "notifications delivered");
                    return;
                }
                Ok(resp) => {
                    tracing::warn!(tenant = %self.tenant, receiver = %url, status = %resp.status(), "receiver rejected notification batch");
                }
                Err(e) => {
                    tracing::warn!(tenant = %self.tenant, receiver = %url, error = %e, "notification send failed");
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.max_backoff);
            }
        }
        tracing::error!(tenant = %self.tenant, count = batch.len(), "notification batch failed across all receivers");
        metrics::NOTIFICATION_FAILURES_TOTAL.inc();
    }
}
