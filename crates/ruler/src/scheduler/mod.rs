//! Per-group evaluation scheduling.
//!
//! Every owned rule group runs on its own timer task. The first tick is
//! offset deterministically within the interval (derived from the group
//! identity) so groups do not all fire at once. A global semaphore caps
//! concurrently in-flight passes across all groups; because a group's
//! loop awaits its own pass, at most one pass per group is ever in
//! flight, and ticks that would have fired during a long pass are
//! dropped and counted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Semaphore};

use crate::alerts::{AlertInstance, AlertNotification, AlertTracker};
use crate::eval::{Evaluator, Sample, SamplePusher};
use crate::metrics;
use crate::notifier::NotifierManager;
use crate::ring::hash_key;
use crate::rules::{GroupId, Labels, Rule, RuleGroup};

/// Shared handles a scheduler needs to run evaluation passes.
pub struct EvalContext {
    pub evaluator: Arc<dyn Evaluator>,
    pub pusher: Arc<dyn SamplePusher>,
    pub notifiers: Arc<NotifierManager>,
    /// Global cap on in-flight evaluation passes for this instance.
    pub permits: Arc<Semaphore>,
}

/// Query-surface view of one rule group's live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub namespace: String,
    pub name: String,
    pub interval_secs: u64,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub last_evaluation_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub rules: Vec<RuleSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub name: String,
    pub kind: RuleKind,
    pub expr: String,
    pub last_error: Option<String>,
    #[serde(default)]
    pub alerts: Vec<AlertInstance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Recording,
    Alerting,
}

struct RuleRuntime {
    rule: Rule,
    last_error: Option<String>,
    tracker: Option<AlertTracker>,
}

struct GroupRuntime {
    group: RuleGroup,
    last_evaluation: Option<DateTime<Utc>>,
    last_duration: Option<Duration>,
    rules: Vec<RuleRuntime>,
}

impl GroupRuntime {
    fn new(group: RuleGroup) -> Self {
        let rules = group
            .rules
            .iter()
            .map(|rule| RuleRuntime {
                tracker: match rule {
                    Rule::Alert {
                        alert,
                        labels,
                        annotations,
                        ..
                    } => Some(AlertTracker::new(
                        alert,
                        rule.hold_duration(),
                        labels.clone(),
                        annotations.clone(),
                    )),
                    Rule::Record { .. } => None,
                },
                rule: rule.clone(),
                last_error: None,
            })
            .collect();
        Self {
            group,
            last_evaluation: None,
            last_duration: None,
            rules,
        }
    }

    fn snapshot(&self) -> GroupSnapshot {
        let rules: Vec<RuleSnapshot> = self
            .rules
            .iter()
            .map(|rr| RuleSnapshot {
                name: rr.rule.name().to_string(),
                kind: if rr.rule.is_alerting() {
                    RuleKind::Alerting
                } else {
                    RuleKind::Recording
                },
                expr: rr.rule.expr().to_string(),
                last_error: rr.last_error.clone(),
                alerts: rr
                    .tracker
                    .as_ref()
                    .map(|t| t.instances())
                    .unwrap_or_default(),
            })
            .collect();
        GroupSnapshot {
            namespace: self.group.id.namespace.clone(),
            name: self.group.id.name.clone(),
            interval_secs: self.group.interval_secs,
            last_evaluation: self.last_evaluation,
            last_evaluation_duration_ms: self.last_duration.map(|d| d.as_millis() as u64),
            last_error: rules.iter().find_map(|r| r.last_error.clone()),
            rules,
        }
    }
}

/// Handle to a running group evaluation loop.
pub struct GroupScheduler {
    id: GroupId,
    runtime: Arc<Mutex<GroupRuntime>>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl GroupScheduler {
    pub fn start(group: RuleGroup, ctx: Arc<EvalContext>) -> Self {
        let id = group.id.clone();
        let interval = group.interval();
        let runtime = Arc::new(Mutex::new(GroupRuntime::new(group)));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            id.clone(),
            interval,
            runtime.clone(),
            ctx,
            shutdown_rx,
        ));
        metrics::GROUPS_RUNNING.inc();
        tracing::info!(group = %id, interval_secs = interval.as_secs(), "started rule group scheduler");
        Self {
            id,
            runtime,
            shutdown,
            task,
        }
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    pub async fn snapshot(&self) -> GroupSnapshot {
        self.runtime.lock().await.snapshot()
    }

    /// Resolve every live alert in the group, returning the resolved
    /// notifications. Used when the group is deleted from the store;
    /// plain ownership handoff must NOT call this.
    pub async fn resolve_all(&self, now: DateTime<Utc>) -> Vec<AlertNotification> {
        let mut runtime = self.runtime.lock().await;
        let mut notifications = Vec::new();
        for rr in runtime.rules.iter_mut() {
            if let Some(tracker) = rr.tracker.as_mut() {
                notifications.extend(tracker.resolve_all(now));
            }
        }
        notifications
    }

    /// Stop the loop, waiting up to `grace` for an in-flight pass to
    /// drain before abandoning it.
    pub async fn stop(self, grace: Duration) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        let abort = task.abort_handle();
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::warn!(group = %self.id, "evaluation did not drain in time, abandoning tick");
            abort.abort();
        }
        metrics::GROUPS_RUNNING.dec();
        tracing::info!(group = %self.id, "stopped rule group scheduler");
    }
}

/// Deterministic first-tick offset within the interval, derived from the
/// group identity so the fleet spreads evaluation load.
fn eval_offset(id: &GroupId, interval: Duration) -> Duration {
    let interval_ms = interval.as_millis().max(1) as u64;
    Duration::from_millis(hash_key(&id.ring_key()) as u64 % interval_ms)
}

async fn run_loop(
    id: GroupId,
    interval: Duration,
    runtime: Arc<Mutex<GroupRuntime>>,
    ctx: Arc<EvalContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    // The loop keeps its own tick schedule so every tick that could
    // not run, whether the pass overran or the permit queue was
    // backed up, is accounted for.
    let mut next_tick = tokio::time::Instant::now() + eval_offset(&id, interval);

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_tick) => {}
            _ = shutdown.changed() => return,
        }

        // Saturated pool: ticks queue in arrival order (the semaphore
        // is FIFO).
        let permit = tokio::select! {
            permit = ctx.permits.acquire() => permit,
            _ = shutdown.changed() => return,
        };
        let Ok(_permit) = permit else {
            return; // semaphore closed on shutdown
        };

        let started = tokio::time::Instant::now();
        let now = Utc::now();
        {
            let mut runtime = runtime.lock().await;
            evaluate_pass(&ctx, &mut runtime, now).await;
        }
        metrics::EVALUATION_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        // Ticks that came due while this tick waited for a permit or
        // its pass ran are skipped, not queued.
        next_tick += interval;
        let resumed = tokio::time::Instant::now();
        let mut skipped = 0u64;
        while next_tick < resumed {
            next_tick += interval;
            skipped += 1;
        }
        if skipped > 0 {
            metrics::TICKS_DROPPED_TOTAL.inc_by(skipped);
            tracing::warn!(group = %id, skipped, "evaluation fell behind, skipping ticks");
        }
    }
}

/// One evaluation pass: rules strictly in declared order, a failing
/// rule isolated to itself, effects applied per rule as the pass
/// proceeds.
async fn evaluate_pass(ctx: &EvalContext, runtime: &mut GroupRuntime, now: DateTime<Utc>) {
    let tenant = runtime.group.id.tenant.clone();
    let started = tokio::time::Instant::now();

    for idx in 0..runtime.rules.len() {
        metrics::EVALUATIONS_TOTAL.inc();
        let expr = runtime.rules[idx].rule.expr().to_string();
        let name = runtime.rules[idx].rule.name().to_string();

        let samples = match ctx.evaluator.evaluate(&tenant, &expr, now).await {
            Ok(samples) => samples,
            Err(e) => {
                metrics::EVALUATION_FAILURES_TOTAL.inc();
                tracing::warn!(group = %runtime.group.id, rule = %name, error = %e, "rule evaluation failed");
                runtime.rules[idx].last_error = Some(e.to_string());
                continue;
            }
        };

        match &runtime.rules[idx].rule {
            Rule::Record { record, labels, .. } => {
                let output = recorded_samples(samples, record, labels);
                match ctx.pusher.push(&tenant, output).await {
                    Ok(()) => runtime.rules[idx].last_error = None,
                    Err(e) => {
                        metrics::EVALUATION_FAILURES_TOTAL.inc();
                        tracing::warn!(group = %runtime.group.id, rule = %name, error = %e, "sample push failed");
                        runtime.rules[idx].last_error = Some(e.to_string());
                    }
                }
            }
            Rule::Alert { .. } => {
                let notifications = match runtime.rules[idx].tracker.as_mut() {
                    Some(tracker) => tracker.observe(&samples, now),
                    None => Vec::new(),
                };
                runtime.rules[idx].last_error = None;
                // Enqueue is synchronous, so a transition and its
                // notification are applied together or not at all.
                ctx.notifiers.send(&tenant, notifications);
            }
        }
    }

    runtime.last_evaluation = Some(now);
    runtime.last_duration = Some(started.elapsed());
}

fn recorded_samples(samples: Vec<Sample>, record: &str, rule_labels: &Labels) -> Vec<Sample> {
    samples
        .into_iter()
        .map(|mut sample| {
            sample
                .labels
                .insert("__name__".to_string(), record.to_string());
            for (k, v) in rule_labels {
                sample.labels.insert(k.clone(), v.clone());
            }
            sample
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertPhase;
    use crate::config::NotifierConfig;
    use crate::rules::labels_from;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Evaluator fake that records evaluation order and serves canned
    /// results per expression.
    #[derive(Default)]
    struct ScriptedEvaluator {
        calls: StdMutex<Vec<String>>,
        results: StdMutex<std::collections::HashMap<String, Result<Vec<Sample>, String>>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedEvaluator {
        fn ok(mut self, expr: &str, samples: Vec<Sample>) -> Self {
            self.results
                .get_mut()
                .unwrap()
                .insert(expr.to_string(), Ok(samples));
            self
        }

        fn err(mut self, expr: &str, msg: &str) -> Self {
            self.results
                .get_mut()
                .unwrap()
                .insert(expr.to_string(), Err(msg.to_string()));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Evaluator for ScriptedEvaluator {
        async fn evaluate(
            &self,
            _tenant: &str,
            expr: &str,
            _at: DateTime<Utc>,
        ) -> crate::Result<Vec<Sample>> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().unwrap().push(expr.to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let results = self.results.lock().unwrap();
            match results.get(expr) {
                Some(Ok(samples)) => Ok(samples.clone()),
                Some(Err(msg)) => Err(crate::Error::Evaluation(msg.clone())),
                None => Ok(Vec::new()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingPusher {
        pushes: StdMutex<Vec<(String, Vec<Sample>)>>,
    }

    impl RecordingPusher {
        fn pushes(&self) -> Vec<(String, Vec<Sample>)> {
            self.pushes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SamplePusher for RecordingPusher {
        async fn push(&self, tenant: &str, samples: Vec<Sample>) -> crate::Result<()> {
            self.pushes
                .lock()
                .unwrap()
                .push((tenant.to_string(), samples));
            Ok(())
        }
    }

    fn test_notifiers() -> Arc<NotifierManager> {
        Arc::new(
            NotifierManager::new(NotifierConfig {
                receivers: Vec::new(),
                queue_capacity: 64,
                refresh_interval_secs: 3600,
                send_timeout_secs: 1,
                max_retries: 1,
                min_backoff_ms: 1,
                max_backoff_ms: 2,
            })
            .unwrap(),
        )
    }

    fn ctx(evaluator: Arc<ScriptedEvaluator>, pusher: Arc<RecordingPusher>) -> Arc<EvalContext> {
        Arc::new(EvalContext {
            evaluator,
            pusher,
            notifiers: test_notifiers(),
            permits: Arc::new(Semaphore::new(4)),
        })
    }

    fn sample(value: f64) -> Sample {
        Sample {
            labels: labels_from([("instance", "a")]),
            value,
            timestamp: Utc::now(),
        }
    }

    fn recording_rule(record: &str, expr: &str) -> Rule {
        Rule::Record {
            record: record.to_string(),
            expr: expr.to_string(),
            labels: labels_from([("team", "infra")]),
        }
    }

    fn group(rules: Vec<Rule>) -> RuleGroup {
        RuleGroup {
            id: GroupId::new("user1", "ns", "g1"),
            interval_secs: 10,
            rules,
        }
    }

    #[tokio::test]
    async fn rules_evaluate_strictly_in_declared_order() {
        let evaluator = Arc::new(
            ScriptedEvaluator::default()
                .ok("expr1", vec![sample(1.0)])
                .ok("expr2", vec![sample(2.0)])
                .ok("expr3", vec![sample(3.0)]),
        );
        let pusher = Arc::new(RecordingPusher::default());
        let ctx = ctx(evaluator.clone(), pusher);

        let mut runtime = GroupRuntime::new(group(vec![
            recording_rule("r1", "expr1"),
            recording_rule("r2", "expr2"),
            recording_rule("r3", "expr3"),
        ]));

        for _ in 0..3 {
            evaluate_pass(&ctx, &mut runtime, Utc::now()).await;
        }
        let calls = evaluator.calls();
        assert_eq!(
            calls,
            vec!["expr1", "expr2", "expr3", "expr1", "expr2", "expr3", "expr1", "expr2", "expr3"]
        );
    }

    #[tokio::test]
    async fn recorded_samples_are_tagged_and_tenant_scoped() {
        let evaluator = Arc::new(ScriptedEvaluator::default().ok("expr1", vec![sample(1.0)]));
        let pusher = Arc::new(RecordingPusher::default());
        let ctx = ctx(evaluator, pusher.clone());

        let mut runtime = GroupRuntime::new(group(vec![recording_rule("job:up:sum", "expr1")]));
        evaluate_pass(&ctx, &mut runtime, Utc::now()).await;

        let pushes = pusher.pushes();
        assert_eq!(pushes.len(), 1);
        let (tenant, samples) = &pushes[0];
        assert_eq!(tenant, "user1");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels.get("__name__").unwrap(), "job:up:sum");
        assert_eq!(samples[0].labels.get("team").unwrap(), "infra");
    }

    #[tokio::test]
    async fn evaluator_failure_is_isolated_to_one_rule() {
        let evaluator = Arc::new(
            ScriptedEvaluator::default()
                .err("bad", "backend unavailable")
                .ok("good", vec![sample(1.0)]),
        );
        let pusher = Arc::new(RecordingPusher::default());
        let ctx = ctx(evaluator.clone(), pusher.clone());

        let mut runtime = GroupRuntime::new(group(vec![
            recording_rule("r1", "bad"),
            recording_rule("r2", "good"),
        ]));

        evaluate_pass(&ctx, &mut runtime, Utc::now()).await;
        // The failing rule records its error, the next rule still ran.
        assert!(runtime.rules[0].last_error.as_deref().unwrap().contains("backend unavailable"));
        assert!(runtime.rules[1].last_error.is_none());
        assert_eq!(pusher.pushes().len(), 1);

        // The next tick executes normally, no group-wide stall.
        evaluate_pass(&ctx, &mut runtime, Utc::now()).await;
        assert_eq!(pusher.pushes().len(), 2);
        let snap = runtime.snapshot();
        assert!(snap.last_error.is_some());
        assert_eq!(snap.rules[0].last_error.as_deref(), Some("Evaluation error: backend unavailable"));
    }

    #[tokio::test]
    async fn alerting_rule_tracks_state_in_snapshot() {
        let evaluator = Arc::new(ScriptedEvaluator::default().ok("up == 0", vec![sample(0.0)]));
        let pusher = Arc::new(RecordingPusher::default());
        let ctx = ctx(evaluator, pusher);

        let mut runtime = GroupRuntime::new(group(vec![Rule::Alert {
            alert: "InstanceDown".to_string(),
            expr: "up == 0".to_string(),
            for_secs: 3600,
            labels: Labels::new(),
            annotations: Labels::new(),
        }]));
        evaluate_pass(&ctx, &mut runtime, Utc::now()).await;

        let snap = runtime.snapshot();
        assert_eq!(snap.rules[0].kind, RuleKind::Alerting);
        assert_eq!(snap.rules[0].alerts.len(), 1);
        assert_eq!(snap.rules[0].alerts[0].phase, AlertPhase::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_pass_in_flight_per_group() {
        let evaluator = Arc::new(ScriptedEvaluator {
            // Each pass takes 3 intervals; overlap would show up as
            // max_in_flight > 1.
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let pusher = Arc::new(RecordingPusher::default());
        let ctx = ctx(evaluator.clone(), pusher);

        let scheduler = GroupScheduler::start(group(vec![recording_rule("r1", "expr1")]), ctx);
        tokio::time::sleep(Duration::from_secs(120)).await;
        scheduler.stop(Duration::from_secs(60)).await;

        assert!(evaluator.calls().len() >= 2);
        assert_eq!(evaluator.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_skipped_while_pool_is_saturated_are_counted() {
        let evaluator = Arc::new(ScriptedEvaluator::default());
        let pusher = Arc::new(RecordingPusher::default());
        let ctx = Arc::new(EvalContext {
            evaluator: evaluator.clone(),
            pusher,
            notifiers: test_notifiers(),
            permits: Arc::new(Semaphore::new(1)),
        });
        // Hold the only permit across several intervals; the ticks due
        // in that window can never run.
        let held = ctx.permits.clone().acquire_owned().await.unwrap();
        let before = metrics::TICKS_DROPPED_TOTAL.get();

        let scheduler = GroupScheduler::start(group(vec![recording_rule("r1", "expr1")]), ctx);
        tokio::time::sleep(Duration::from_secs(55)).await;
        drop(held);
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.stop(Duration::from_secs(30)).await;

        // The first tick finally ran once the permit freed up.
        assert!(!evaluator.calls().is_empty());
        // With a 10s interval blocked for 55s, at least four ticks
        // came due while the first was still waiting for a permit.
        assert!(metrics::TICKS_DROPPED_TOTAL.get() - before >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn global_cap_bounds_in_flight_passes_across_groups() {
        let evaluator = Arc::new(ScriptedEvaluator {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let pusher = Arc::new(RecordingPusher::default());
        let ctx = Arc::new(EvalContext {
            evaluator: evaluator.clone(),
            pusher,
            notifiers: test_notifiers(),
            permits: Arc::new(Semaphore::new(2)),
        });

        // Four groups compete for two permits; every pass outlives the
        // interval, so the pool stays saturated.
        let schedulers: Vec<GroupScheduler> = (0..4)
            .map(|i| {
                let mut g = group(vec![recording_rule("r1", "expr1")]);
                g.id = GroupId::new("user1", "ns", &format!("g{i}"));
                GroupScheduler::start(g, ctx.clone())
            })
            .collect();
        tokio::time::sleep(Duration::from_secs(180)).await;
        for scheduler in schedulers {
            scheduler.stop(Duration::from_secs(60)).await;
        }

        assert!(evaluator.calls().len() >= 4);
        assert!(evaluator.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_in_flight_pass() {
        let evaluator = Arc::new(ScriptedEvaluator {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let pusher = Arc::new(RecordingPusher::default());
        let ctx = ctx(evaluator.clone(), pusher);

        let scheduler = GroupScheduler::start(group(vec![recording_rule("r1", "expr1")]), ctx);
        tokio::time::sleep(Duration::from_secs(15)).await;
        scheduler.stop(Duration::from_secs(30)).await;
        let calls_after_stop = evaluator.calls().len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(evaluator.calls().len(), calls_after_stop);
    }

    #[test]
    fn eval_offset_is_deterministic_and_bounded() {
        let id = GroupId::new("user1", "ns", "g1");
        let interval = Duration::from_secs(60);
        let a = eval_offset(&id, interval);
        let b = eval_offset(&id, interval);
        assert_eq!(a, b);
        assert!(a < interval);
        // A different group lands on a different offset (with these ids).
        let other = eval_offset(&GroupId::new("user2", "ns", "g2"), interval);
        assert_ne!(a, other);
    }
}
