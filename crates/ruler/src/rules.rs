//! Rule group data model.
//!
//! A rule group is identified by the (tenant, namespace, name) triple and
//! carries an ordered list of recording and alerting rules evaluated
//! together on one interval. Definitions are content-hashed so the store
//! adapter can diff cheaply.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Label sets are ordered maps so they hash and compare deterministically.
pub type Labels = BTreeMap<String, String>;

/// Build a label set from string pairs. Mostly useful in tests and fixtures.
pub fn labels_from<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Globally unique, immutable identity of a rule group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId {
    pub tenant: String,
    pub namespace: String,
    pub name: String,
}

impl GroupId {
    pub fn new(tenant: &str, namespace: &str, name: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Key hashed into the ring's token space to decide ownership.
    pub fn ring_key(&self) -> String {
        format!("{}/{}/{}", self.tenant, self.namespace, self.name)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    /// Derived metric written back to storage under `record`.
    Record {
        record: String,
        expr: String,
        #[serde(default)]
        labels: Labels,
    },
    /// Alert whose evaluation drives state transitions and notifications.
    Alert {
        alert: String,
        expr: String,
        /// Seconds the condition must hold before `pending` becomes
        /// `firing`. Zero skips `pending` entirely.
        #[serde(default)]
        for_secs: u64,
        #[serde(default)]
        labels: Labels,
        #[serde(default)]
        annotations: Labels,
    },
}

impl Rule {
    pub fn name(&self) -> &str {
        match self {
            Rule::Record { record, .. } => record,
            Rule::Alert { alert, .. } => alert,
        }
    }

    pub fn expr(&self) -> &str {
        match self {
            Rule::Record { expr, .. } | Rule::Alert { expr, .. } => expr,
        }
    }

    pub fn is_alerting(&self) -> bool {
        matches!(self, Rule::Alert { .. })
    }

    pub fn hold_duration(&self) -> Duration {
        match self {
            Rule::Record { .. } => Duration::ZERO,
            Rule::Alert { for_secs, .. } => Duration::from_secs(*for_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub id: GroupId,
    pub interval_secs: u64,
    /// Rules evaluate strictly in this order within one pass.
    pub rules: Vec<Rule>,
}

impl RuleGroup {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Content hash of the serialized definition. Any change to the
    /// interval, rule list, or a rule body changes the hash.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        // Serialization of our own types cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Validate the definition. Invalid groups are excluded from
    /// scheduling but never fatal to the instance.
    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: String| Err(crate::Error::Definition(self.id.to_string(), msg));

        if self.id.tenant.is_empty() || self.id.namespace.is_empty() || self.id.name.is_empty() {
            return fail("tenant, namespace and name must be non-empty".to_string());
        }
        if self.interval_secs == 0 {
            return fail("evaluation interval must be greater than zero".to_string());
        }
        if self.rules.is_empty() {
            return fail("rule group must contain at least one rule".to_string());
        }
        for rule in &self.rules {
            if rule.name().is_empty() {
                return fail("rule name must be non-empty".to_string());
            }
            if rule.expr().is_empty() {
                return fail(format!("rule {} has an empty expression", rule.name()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(rules: Vec<Rule>) -> RuleGroup {
        RuleGroup {
            id: GroupId::new("user1", "ns", "g1"),
            interval_secs: 30,
            rules,
        }
    }

    fn recording(record: &str) -> Rule {
        Rule::Record {
            record: record.to_string(),
            expr: "sum(rate(http_requests_total[1m]))".to_string(),
            labels: Labels::new(),
        }
    }

    #[test]
    fn content_hash_changes_with_interval() {
        let g1 = group(vec![recording("job:requests:rate1m")]);
        let mut g2 = g1.clone();
        g2.interval_secs = 60;
        assert_ne!(g1.content_hash(), g2.content_hash());
    }

    #[test]
    fn content_hash_changes_with_rule_body() {
        let g1 = group(vec![recording("job:requests:rate1m")]);
        let mut g2 = g1.clone();
        if let Rule::Record { expr, .. } = &mut g2.rules[0] {
            *expr = "sum(rate(http_requests_total[5m]))".to_string();
        }
        assert_ne!(g1.content_hash(), g2.content_hash());
    }

    #[test]
    fn content_hash_is_stable() {
        let g = group(vec![recording("job:requests:rate1m")]);
        assert_eq!(g.content_hash(), g.clone().content_hash());
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut g = group(vec![recording("r")]);
        g.interval_secs = 0;
        assert!(g.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_expression() {
        let g = group(vec![Rule::Record {
            record: "r".to_string(),
            expr: String::new(),
            labels: Labels::new(),
        }]);
        assert!(g.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_group() {
        let g = group(vec![
            recording("job:requests:rate1m"),
            Rule::Alert {
                alert: "HighErrorRate".to_string(),
                expr: "job:errors:rate1m > 0.5".to_string(),
                for_secs: 60,
                labels: labels_from([("severity", "page")]),
                annotations: Labels::new(),
            },
        ]);
        assert!(g.validate().is_ok());
    }
}
