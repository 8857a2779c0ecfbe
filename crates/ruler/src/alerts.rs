//! Alert state tracking for one alerting rule.
//!
//! Each label set produced by the rule's expression gets its own state
//! machine: `inactive → pending → firing → resolved → inactive`. A label
//! set that disappears moves straight to `resolved` from either `pending`
//! or `firing`, and is forgotten once its resolved notification has been
//! emitted. Every transition to `firing` or `resolved` emits exactly one
//! notification.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eval::Sample;
use crate::rules::Labels;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPhase {
    Pending,
    Firing,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// Live state for one (alerting rule, label set) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInstance {
    pub labels: Labels,
    pub phase: AlertPhase,
    pub active_since: DateTime<Utc>,
    pub fired_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub value: f64,
}

/// Outbound notification event for a `firing` or `resolved` transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub labels: Labels,
    pub annotations: Labels,
    pub status: AlertStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

/// State machine container for one alerting rule.
pub struct AlertTracker {
    rule_name: String,
    hold: Duration,
    rule_labels: Labels,
    annotations: Labels,
    active: HashMap<Labels, AlertInstance>,
}

impl AlertTracker {
    pub fn new(rule_name: &str, hold: Duration, rule_labels: Labels, annotations: Labels) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            hold,
            rule_labels,
            annotations,
            active: HashMap::new(),
        }
    }

    /// Advance every tracked label set against the current evaluation
    /// result and return the notifications produced by this pass.
    pub fn observe(&mut self, samples: &[Sample], now: DateTime<Utc>) -> Vec<AlertNotification> {
        let present: HashMap<Labels, f64> = samples
            .iter()
            .map(|s| (s.labels.clone(), s.value))
            .collect();

        let mut fired: Vec<Labels> = Vec::new();
        let mut resolved: Vec<Labels> = Vec::new();

        for (labels, value) in &present {
            match self.active.get_mut(labels) {
                None => {
                    // A zero hold duration skips pending entirely.
                    let firing = self.hold.is_zero();
                    self.active.insert(
                        labels.clone(),
                        AlertInstance {
                            labels: labels.clone(),
                            phase: if firing {
                                AlertPhase::Firing
                            } else {
                                AlertPhase::Pending
                            },
                            active_since: now,
                            fired_at: firing.then_some(now),
                            resolved_at: None,
                            value: *value,
                        },
                    );
                    if firing {
                        fired.push(labels.clone());
                    }
                }
                Some(instance) => {
                    instance.value = *value;
                    match instance.phase {
                        AlertPhase::Pending => {
                            let held = (now - instance.active_since)
                                .to_std()
                                .unwrap_or(Duration::ZERO);
                            if held >= self.hold {
                                instance.phase = AlertPhase::Firing;
                                instance.fired_at = Some(now);
                                fired.push(labels.clone());
                            }
                        }
                        AlertPhase::Firing => {}
                        // The label set came back before the resolved
                        // instance was swept; restart from scratch.
                        AlertPhase::Resolved => {
                            let firing = self.hold.is_zero();
                            *instance = AlertInstance {
                                labels: labels.clone(),
                                phase: if firing {
                                    AlertPhase::Firing
                                } else {
                                    AlertPhase::Pending
                                },
                                active_since: now,
                                fired_at: firing.then_some(now),
                                resolved_at: None,
                                value: *value,
                            };
                            if firing {
                                fired.push(labels.clone());
                            }
                        }
                    }
                }
            }
        }

        // Absent label sets resolve immediately; already-resolved ones
        // become inactive (forgotten) now that their notification is out.
        let mut swept: Vec<Labels> = Vec::new();
        for (labels, instance) in self.active.iter_mut() {
            if present.contains_key(labels) {
                continue;
            }
            match instance.phase {
                AlertPhase::Pending | AlertPhase::Firing => {
                    instance.phase = AlertPhase::Resolved;
                    instance.resolved_at = Some(now);
                    resolved.push(labels.clone());
                }
                AlertPhase::Resolved => {
                    swept.push(labels.clone());
                }
            }
        }
        for labels in &swept {
            self.active.remove(labels);
        }

        let mut notifications = Vec::with_capacity(fired.len() + resolved.len());
        for labels in &fired {
            notifications.push(self.notification(&self.active[labels], AlertStatus::Firing, None));
        }
        for labels in &resolved {
            notifications.push(self.notification(
                &self.active[labels],
                AlertStatus::Resolved,
                Some(now),
            ));
        }
        notifications
    }

    /// Resolve every pending or firing instance, emitting one resolved
    /// notification each. Used when the rule group is deleted from the
    /// store.
    pub fn resolve_all(&mut self, now: DateTime<Utc>) -> Vec<AlertNotification> {
        let mut notifications = Vec::new();
        for instance in self.active.values_mut() {
            if matches!(instance.phase, AlertPhase::Pending | AlertPhase::Firing) {
                instance.phase = AlertPhase::Resolved;
                instance.resolved_at = Some(now);
            }
        }
        for instance in self.active.values() {
            if instance.resolved_at == Some(now) {
                notifications.push(self.notification(instance, AlertStatus::Resolved, Some(now)));
            }
        }
        self.active.clear();
        notifications
    }

    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    /// Snapshot of the live instances, ordered by label set.
    pub fn instances(&self) -> Vec<AlertInstance> {
        let ordered: BTreeMap<&Labels, &AlertInstance> =
            self.active.iter().map(|(k, v)| (k, v)).collect();
        ordered.into_values().cloned().collect()
    }

    pub fn has_firing(&self) -> bool {
        self.active
            .values()
            .any(|i| i.phase == AlertPhase::Firing)
    }

    fn notification(
        &self,
        instance: &AlertInstance,
        status: AlertStatus,
        ends_at: Option<DateTime<Utc>>,
    ) -> AlertNotification {
        // Rule labels override expression output labels; the rule name
        // is attached under the conventional `alertname` label.
        let mut labels = instance.labels.clone();
        for (k, v) in &self.rule_labels {
            labels.insert(k.clone(), v.clone());
        }
        labels.insert("alertname".to_string(), self.rule_name.clone());
        AlertNotification {
            labels,
            annotations: self.annotations.clone(),
            status,
            starts_at: instance.active_since,
            ends_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::labels_from;

    fn sample(instance: &str, value: f64, at: DateTime<Utc>) -> Sample {
        Sample {
            labels: labels_from([("instance", instance)]),
            value,
            timestamp: at,
        }
    }

    fn tracker(hold_secs: u64) -> AlertTracker {
        AlertTracker::new(
            "HighErrorRate",
            Duration::from_secs(hold_secs),
            labels_from([("severity", "page")]),
            labels_from([("summary", "too many errors")]),
        )
    }

    #[test]
    fn never_fires_straight_from_inactive_with_nonzero_hold() {
        let mut t = tracker(60);
        let now = Utc::now();
        let notifs = t.observe(&[sample("a", 1.0, now)], now);
        assert!(notifs.is_empty());
        assert_eq!(t.instances()[0].phase, AlertPhase::Pending);
    }

    #[test]
    fn zero_hold_fires_immediately() {
        let mut t = tracker(0);
        let now = Utc::now();
        let notifs = t.observe(&[sample("a", 1.0, now)], now);
        assert_eq!(notifs.len(), 1);
        assert_eq!(notifs[0].status, AlertStatus::Firing);
        assert_eq!(t.instances()[0].phase, AlertPhase::Firing);
    }

    #[test]
    fn fires_after_hold_elapses() {
        let mut t = tracker(60);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);
        let t2 = t0 + chrono::Duration::seconds(60);

        assert!(t.observe(&[sample("a", 1.0, t0)], t0).is_empty());
        assert!(t.observe(&[sample("a", 1.0, t1)], t1).is_empty());
        let notifs = t.observe(&[sample("a", 1.0, t2)], t2);
        assert_eq!(notifs.len(), 1);
        assert_eq!(notifs[0].status, AlertStatus::Firing);
        assert_eq!(notifs[0].starts_at, t0);
        assert_eq!(notifs[0].labels.get("alertname").unwrap(), "HighErrorRate");
        assert_eq!(notifs[0].labels.get("severity").unwrap(), "page");
    }

    #[test]
    fn firing_notification_is_emitted_exactly_once() {
        let mut t = tracker(0);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);
        assert_eq!(t.observe(&[sample("a", 1.0, t0)], t0).len(), 1);
        // Still firing on the next pass, but no duplicate notification.
        assert!(t.observe(&[sample("a", 1.0, t1)], t1).is_empty());
    }

    #[test]
    fn absent_label_set_resolves_then_goes_inactive() {
        let mut t = tracker(0);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);
        let t2 = t0 + chrono::Duration::seconds(60);

        t.observe(&[sample("a", 1.0, t0)], t0);
        let notifs = t.observe(&[], t1);
        assert_eq!(notifs.len(), 1);
        assert_eq!(notifs[0].status, AlertStatus::Resolved);
        assert_eq!(notifs[0].ends_at, Some(t1));
        assert_eq!(t.instances()[0].phase, AlertPhase::Resolved);

        // One resolved notification has been sent; next pass sweeps it.
        assert!(t.observe(&[], t2).is_empty());
        assert!(t.instances().is_empty());
    }

    #[test]
    fn pending_resolves_immediately_when_absent() {
        let mut t = tracker(300);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);
        t.observe(&[sample("a", 1.0, t0)], t0);
        let notifs = t.observe(&[], t1);
        assert_eq!(notifs.len(), 1);
        assert_eq!(notifs[0].status, AlertStatus::Resolved);
    }

    #[test]
    fn label_sets_are_tracked_independently() {
        let mut t = tracker(0);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);

        let notifs = t.observe(&[sample("a", 1.0, t0), sample("b", 2.0, t0)], t0);
        assert_eq!(notifs.len(), 2);

        // "b" disappears, "a" keeps firing.
        let notifs = t.observe(&[sample("a", 1.0, t1)], t1);
        assert_eq!(notifs.len(), 1);
        assert_eq!(notifs[0].status, AlertStatus::Resolved);
        assert_eq!(t.instances().len(), 2);
        assert!(t.has_firing());
    }

    #[test]
    fn resolve_all_emits_one_resolved_per_active_instance() {
        let mut t = tracker(0);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);
        t.observe(&[sample("a", 1.0, t0), sample("b", 2.0, t0)], t0);

        let notifs = t.resolve_all(t1);
        assert_eq!(notifs.len(), 2);
        assert!(notifs.iter().all(|n| n.status == AlertStatus::Resolved));
        assert!(t.instances().is_empty());
    }

    #[test]
    fn rule_labels_override_sample_labels() {
        let mut t = AlertTracker::new(
            "A",
            Duration::ZERO,
            labels_from([("instance", "rule-wins")]),
            Labels::new(),
        );
        let now = Utc::now();
        let notifs = t.observe(&[sample("sample-loses", 1.0, now)], now);
        assert_eq!(notifs[0].labels.get("instance").unwrap(), "rule-wins");
    }
}
