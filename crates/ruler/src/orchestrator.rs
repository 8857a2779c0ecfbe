//! Top-level control loop.
//!
//! The orchestrator owns the only code path that starts or stops group
//! schedulers. Ring topology changes and rule store syncs both funnel
//! into the serialized reconciliation below, which recomputes the
//! ownership map from ring state and converges the set of running
//! schedulers toward it. Ownership handoff never emits resolved
//! notifications; only deletion from the store does.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Semaphore};

use crate::config::Config;
use crate::eval::{Evaluator, SamplePusher};
use crate::notifier::NotifierManager;
use crate::ring::{Membership, RingHandle, RingSnapshot};
use crate::rules::{GroupId, RuleGroup};
use crate::scheduler::{EvalContext, GroupScheduler, GroupSnapshot};
use crate::store::{RuleStore, StoreAdapter};
use crate::TENANT_ID_HEADER;

/// Optional namespace / group-name filter on the query surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFilter {
    pub namespace: Option<String>,
    pub group: Option<String>,
}

impl RuleFilter {
    fn matches(&self, id: &GroupId) -> bool {
        self.namespace.as_deref().map_or(true, |ns| ns == id.namespace)
            && self.group.as_deref().map_or(true, |g| g == id.name)
    }
}

/// Query-surface response. `partial` is set when some peers did not
/// answer within the per-peer timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesResponse {
    pub groups: Vec<GroupSnapshot>,
    pub partial: bool,
}

struct RulerState {
    /// All known valid groups, owned or not.
    inventory: HashMap<GroupId, RuleGroup>,
    /// Schedulers for the groups this instance currently owns.
    schedulers: HashMap<GroupId, GroupScheduler>,
}

pub struct Ruler {
    ring: RingHandle,
    adapter: StoreAdapter,
    ctx: Arc<EvalContext>,
    state: Mutex<RulerState>,
    client: reqwest::Client,
    cfg: Config,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Ruler {
    /// Join the ring and perform the initial rule load. Failing to join
    /// the ring is the only process-fatal error in the service.
    pub async fn new(
        cfg: Config,
        membership: Arc<Membership>,
        store: Arc<dyn RuleStore>,
        evaluator: Arc<dyn Evaluator>,
        pusher: Arc<dyn SamplePusher>,
        notifiers: Arc<NotifierManager>,
    ) -> crate::Result<Arc<Self>> {
        let ring = RingHandle::join(
            membership,
            &cfg.ring.instance_id,
            &cfg.ring.instance_addr,
            cfg.ring.num_tokens,
        )?;
        let ctx = Arc::new(EvalContext {
            evaluator,
            pusher,
            notifiers,
            permits: Arc::new(Semaphore::new(cfg.evaluation.max_concurrent)),
        });
        let client = reqwest::Client::builder()
            .timeout(cfg.server.peer_timeout())
            .build()?;
        let (shutdown, _) = watch::channel(false);
        let ruler = Arc::new(Self {
            ring,
            adapter: StoreAdapter::new(store),
            ctx,
            state: Mutex::new(RulerState {
                inventory: HashMap::new(),
                schedulers: HashMap::new(),
            }),
            client,
            cfg,
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        // Load rules before serving so the first reconcile pass starts
        // everything this instance owns.
        ruler.sync_and_reconcile().await?;
        Ok(ruler)
    }

    pub fn instance_id(&self) -> &str {
        self.ring.instance_id()
    }

    pub fn ring_snapshot(&self) -> RingSnapshot {
        self.ring.membership().snapshot()
    }

    /// Spawn the heartbeat and the reconciliation trigger loop.
    pub fn spawn(self: &Arc<Self>) {
        let heartbeat = self
            .ring
            .spawn_heartbeat(self.cfg.ring.heartbeat_interval());

        let ruler = self.clone();
        let reconcile_loop = tokio::spawn(async move {
            let mut ring_watch = ruler.ring.membership().watch();
            let mut shutdown = ruler.shutdown.subscribe();
            let sync_interval = ruler.cfg.store.sync_interval();
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + sync_interval,
                sync_interval,
            );
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = ruler.sync_and_reconcile().await {
                            tracing::error!(error = %e, "rule store sync failed");
                        }
                    }
                    changed = ring_watch.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        tracing::debug!(
                            version = *ring_watch.borrow_and_update(),
                            "ring topology changed, reconciling"
                        );
                        ruler.reconcile().await;
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });

        let mut tasks = self.lock_tasks();
        tasks.push(heartbeat);
        tasks.push(reconcile_loop);
    }

    /// Sync the rule store and reconcile the scheduler set. Also invoked
    /// on demand (startup, tests).
    pub async fn sync_and_reconcile(&self) -> crate::Result<(usize, usize)> {
        let diff = self.adapter.sync().await?;
        let grace = self.cfg.evaluation.shutdown_grace();
        let mut state = self.state.lock().await;

        // Deleted groups: one resolved notification per firing alert,
        // then teardown.
        for id in &diff.removed {
            state.inventory.remove(id);
            if let Some(scheduler) = state.schedulers.remove(id) {
                let resolved = scheduler.resolve_all(Utc::now()).await;
                if !resolved.is_empty() {
                    tracing::info!(group = %id, count = resolved.len(), "resolving alerts for deleted group");
                    self.ctx.notifiers.send(&id.tenant, resolved);
                }
                scheduler.stop(grace).await;
            }
        }

        for group in diff.added {
            state.inventory.insert(group.id.clone(), group);
        }
        // A changed definition restarts the group from scratch,
        // discarding in-memory alert state.
        for group in diff.changed {
            if let Some(scheduler) = state.schedulers.remove(&group.id) {
                tracing::info!(group = %group.id, "rule group definition changed, restarting");
                scheduler.stop(grace).await;
            }
            state.inventory.insert(group.id.clone(), group);
        }

        Ok(self.reconcile_locked(&mut state).await)
    }

    /// Converge running schedulers toward the ownership map. Idempotent:
    /// with no topology or definition change this is a no-op.
    pub async fn reconcile(&self) -> (usize, usize) {
        let mut state = self.state.lock().await;
        self.reconcile_locked(&mut state).await
    }

    async fn reconcile_locked(&self, state: &mut RulerState) -> (usize, usize) {
        // A pass racing shutdown must not resurrect schedulers that
        // stop() has already drained; the ring entry may still be
        // present at that point.
        if *self.shutdown.borrow() {
            return (0, 0);
        }
        let grace = self.cfg.evaluation.shutdown_grace();
        let mut started = 0;
        let mut stopped = 0;

        // Ownership handoff: stop without resolving anything. The next
        // owner picks the group (and its firing alerts) up.
        let to_stop: Vec<GroupId> = state
            .schedulers
            .keys()
            .filter(|id| {
                !state.inventory.contains_key(*id) || !self.ring.owns(&id.ring_key())
            })
            .cloned()
            .collect();
        for id in to_stop {
            if let Some(scheduler) = state.schedulers.remove(&id) {
                tracing::info!(group = %id, "no longer owner, stopping scheduler");
                scheduler.stop(grace).await;
                stopped += 1;
            }
        }

        for (id, group) in &state.inventory {
            if state.schedulers.contains_key(id) || !self.ring.owns(&id.ring_key()) {
                continue;
            }
            state
                .schedulers
                .insert(id.clone(), GroupScheduler::start(group.clone(), self.ctx.clone()));
            started += 1;
        }

        // Notifiers live only while their tenant has owned groups.
        let owned_tenants: HashSet<String> = state
            .schedulers
            .keys()
            .map(|id| id.tenant.clone())
            .collect();
        self.ctx
            .notifiers
            .retain_tenants(&owned_tenants, grace)
            .await;

        if started > 0 || stopped > 0 {
            tracing::info!(started, stopped, "reconciled rule group ownership");
        }
        (started, stopped)
    }

    /// Groups currently scheduled on this instance, for tests and the
    /// ring debug page.
    pub async fn running_groups(&self) -> Vec<GroupId> {
        let state = self.state.lock().await;
        let mut ids: Vec<GroupId> = state.schedulers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Live state of the tenant's groups scheduled on this instance.
    pub async fn list_local_rules(&self, tenant: &str, filter: &RuleFilter) -> Vec<GroupSnapshot> {
        let state = self.state.lock().await;
        let mut groups = Vec::new();
        for (id, scheduler) in &state.schedulers {
            if id.tenant != tenant || !filter.matches(id) {
                continue;
            }
            groups.push(scheduler.snapshot().await);
        }
        groups.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        groups
    }

    /// Query surface: local state merged with every peer's, with a
    /// per-peer timeout. Peers that do not answer set `partial` rather
    /// than blocking the response.
    pub async fn list_rules(&self, tenant: &str, filter: &RuleFilter) -> RulesResponse {
        let mut groups = self.list_local_rules(tenant, filter).await;
        let peers = self
            .ring
            .membership()
            .peer_addrs(self.ring.instance_id());
        let mut partial = false;

        let fetches = peers
            .iter()
            .map(|addr| self.fetch_peer_rules(addr, tenant, filter));
        for (addr, result) in peers.iter().zip(join_all(fetches).await) {
            match result {
                Ok(mut peer_groups) => groups.append(&mut peer_groups),
                Err(e) => {
                    tracing::warn!(peer = %addr, error = %e, "peer rules query failed");
                    partial = true;
                }
            }
        }

        // During a handoff two instances may briefly report the same
        // group; keep the most recently evaluated copy.
        groups.sort_by(|a, b| {
            (&a.namespace, &a.name)
                .cmp(&(&b.namespace, &b.name))
                .then(b.last_evaluation.cmp(&a.last_evaluation))
        });
        groups.dedup_by(|a, b| a.namespace == b.namespace && a.name == b.name);

        RulesResponse { groups, partial }
    }

    async fn fetch_peer_rules(
        &self,
        addr: &str,
        tenant: &str,
        filter: &RuleFilter,
    ) -> crate::Result<Vec<GroupSnapshot>> {
        let url = format!("{}/ruler/local/rules", addr.trim_end_matches('/'));
        let mut request = self.client.get(&url).header(TENANT_ID_HEADER, tenant);
        if let Some(ns) = &filter.namespace {
            request = request.query(&[("namespace", ns)]);
        }
        if let Some(g) = &filter.group {
            request = request.query(&[("group", g)]);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(crate::Error::NotFound(format!(
                "peer {addr} returned {status}"
            )));
        }
        let body: RulesResponse = resp
            .json()
            .await
            .map_err(crate::Error::Http)?;
        Ok(body.groups)
    }

    /// Graceful shutdown: stop triggers, drain schedulers and notifier
    /// queues bounded by the grace period, leave the ring.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let grace = self.cfg.evaluation.shutdown_grace();

        let mut state = self.state.lock().await;
        let schedulers: Vec<GroupScheduler> =
            state.schedulers.drain().map(|(_, s)| s).collect();
        drop(state);
        for scheduler in schedulers {
            scheduler.stop(grace).await;
        }

        self.ctx.notifiers.stop_all(grace).await;
        self.ring.leave();

        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        tracing::info!(instance = self.ring.instance_id(), "ruler stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<tokio::task::JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
