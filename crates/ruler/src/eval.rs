//! Seams to the external query evaluator and the sample write path.
//!
//! The expression language itself is a black box: [`Evaluator`] turns an
//! expression into an instant vector of labeled values, [`SamplePusher`]
//! persists derived samples. HTTP-backed implementations are provided
//! for wiring the binary; tests substitute mocks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::Labels;
use crate::TENANT_ID_HEADER;

/// One labeled value of an instant vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub labels: Labels,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Evaluate `expr` for `tenant` at the instant `at`.
    async fn evaluate(&self, tenant: &str, expr: &str, at: DateTime<Utc>)
        -> crate::Result<Vec<Sample>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SamplePusher: Send + Sync {
    /// Persist a batch of samples on behalf of `tenant`.
    async fn push(&self, tenant: &str, samples: Vec<Sample>) -> crate::Result<()>;
}

/// Prometheus-compatible HTTP query API client.
pub struct HttpEvaluator {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<VectorEntry>,
}

#[derive(Deserialize)]
struct VectorEntry {
    metric: Labels,
    /// `[unix_seconds, "value"]` pair as emitted by the query API.
    value: (f64, String),
}

impl HttpEvaluator {
    pub fn new(base_url: &str) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(
        &self,
        tenant: &str,
        expr: &str,
        at: DateTime<Utc>,
    ) -> crate::Result<Vec<Sample>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header(TENANT_ID_HEADER, tenant)
            .query(&[("query", expr), ("time", &at.timestamp().to_string())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(crate::Error::Evaluation(format!(
                "query endpoint returned {status}"
            )));
        }

        let body: QueryResponse = resp.json().await?;
        if body.status != "success" {
            return Err(crate::Error::Evaluation(
                body.error.unwrap_or_else(|| "query failed".to_string()),
            ));
        }
        let data = body
            .data
            .ok_or_else(|| crate::Error::Evaluation("query response missing data".to_string()))?;
        if data.result_type != "vector" {
            return Err(crate::Error::Evaluation(format!(
                "expected instant vector, got {}",
                data.result_type
            )));
        }

        data.result
            .into_iter()
            .map(|entry| {
                let value = entry.value.1.parse::<f64>().map_err(|e| {
                    crate::Error::Evaluation(format!("malformed sample value: {e}"))
                })?;
                Ok(Sample {
                    labels: entry.metric,
                    value,
                    timestamp: at,
                })
            })
            .collect()
    }
}

/// JSON push client for the sample write path.
pub struct HttpPusher {
    client: reqwest::Client,
    url: String,
}

impl HttpPusher {
    pub fn new(url: &str) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl SamplePusher for HttpPusher {
    async fn push(&self, tenant: &str, samples: Vec<Sample>) -> crate::Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .header(TENANT_ID_HEADER, tenant)
            .json(&samples)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(crate::Error::Push(format!(
                "push endpoint returned {status}"
            )));
        }
        Ok(())
    }
}
