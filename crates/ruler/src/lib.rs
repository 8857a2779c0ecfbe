pub mod alerts;
pub mod config;
pub mod eval;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;
pub mod ring;
pub mod rules;
pub mod scheduler;
pub mod server;
pub mod store;

use thiserror::Error;

/// HTTP header carrying the tenant identity on every outbound
/// notification and every query-surface request.
pub const TENANT_ID_HEADER: &str = "X-Scope-OrgID";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Ring error: {0}")]
    Ring(String),
    #[error("Rule store error: {0}")]
    Store(String),
    #[error("Invalid rule group {0}: {1}")]
    Definition(String, String),
    #[error("Evaluation error: {0}")]
    Evaluation(String),
    #[error("Push error: {0}")]
    Push(String),
    #[error("Notification error: {0}")]
    Notification(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
