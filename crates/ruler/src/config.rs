use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub ring: RingConfig,
    pub store: StoreConfig,
    pub evaluation: EvaluationConfig,
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
    /// Per-peer timeout when fanning a rules query out across the fleet.
    pub peer_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    pub instance_id: String,
    /// Address peers use to reach this instance's query surface.
    pub instance_addr: String,
    pub num_tokens: usize,
    pub heartbeat_interval_secs: u64,
    /// Instances that miss heartbeats past this grace period are
    /// excluded from ownership computation.
    pub heartbeat_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Base URL of the external query evaluator.
    pub query_url: Option<String>,
    /// URL of the external sample push endpoint.
    pub push_url: Option<String>,
    /// Cap on concurrently in-flight evaluation passes across all
    /// rule groups on this instance.
    pub max_concurrent: usize,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Static receiver endpoints; the discovery refresh loop keeps the live set.
    pub receivers: Vec<String>,
    pub queue_capacity: usize,
    pub refresh_interval_secs: u64,
    pub send_timeout_secs: u64,
    pub max_retries: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Config {
            server: ServerConfig {
                addr: env_or("SERVER_ADDR", "0.0.0.0:8080"),
                peer_timeout_secs: env_parse("PEER_TIMEOUT_SECS", 2),
            },
            ring: RingConfig {
                instance_id: std::env::var("INSTANCE_ID")
                    .unwrap_or_else(|_| format!("ruler-{}", uuid::Uuid::new_v4())),
                instance_addr: env_or("INSTANCE_ADDR", "http://127.0.0.1:8080"),
                num_tokens: env_parse("RING_NUM_TOKENS", 128),
                heartbeat_interval_secs: env_parse("RING_HEARTBEAT_INTERVAL_SECS", 5),
                heartbeat_grace_secs: env_parse("RING_HEARTBEAT_GRACE_SECS", 30),
            },
            store: StoreConfig {
                sync_interval_secs: env_parse("STORE_SYNC_INTERVAL_SECS", 60),
            },
            evaluation: EvaluationConfig {
                query_url: std::env::var("EVALUATOR_URL").ok(),
                push_url: std::env::var("PUSH_URL").ok(),
                max_concurrent: env_parse("EVAL_MAX_CONCURRENT", 20),
                shutdown_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", 30),
            },
            notifier: NotifierConfig {
                receivers: std::env::var("NOTIFIER_RECEIVERS")
                    .map(|s| {
                        s.split(',')
                            .map(|u| u.trim().to_string())
                            .filter(|u| !u.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                queue_capacity: env_parse("NOTIFIER_QUEUE_CAPACITY", 1000),
                refresh_interval_secs: env_parse("NOTIFIER_REFRESH_SECS", 30),
                send_timeout_secs: env_parse("NOTIFIER_SEND_TIMEOUT_SECS", 10),
                max_retries: env_parse("NOTIFIER_MAX_RETRIES", 3),
                min_backoff_ms: env_parse("NOTIFIER_MIN_BACKOFF_MS", 100),
                max_backoff_ms: env_parse("NOTIFIER_MAX_BACKOFF_MS", 5000),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.ring.num_tokens == 0 {
            return Err(crate::Error::Config(
                "RING_NUM_TOKENS must be at least 1".to_string(),
            ));
        }
        if self.evaluation.max_concurrent == 0 {
            return Err(crate::Error::Config(
                "EVAL_MAX_CONCURRENT must be at least 1".to_string(),
            ));
        }
        if self.notifier.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "NOTIFIER_QUEUE_CAPACITY must be at least 1".to_string(),
            ));
        }
        if self.notifier.receivers.is_empty() {
            tracing::warn!("NOTIFIER_RECEIVERS is not set; alert notifications will be dropped");
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}

impl RingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_grace_secs)
    }
}

impl StoreConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

impl EvaluationConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl NotifierConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
                peer_timeout_secs: 2,
            },
            ring: RingConfig {
                instance_id: "ruler-local".to_string(),
                instance_addr: "http://127.0.0.1:8080".to_string(),
                num_tokens: 128,
                heartbeat_interval_secs: 5,
                heartbeat_grace_secs: 30,
            },
            store: StoreConfig {
                sync_interval_secs: 60,
            },
            evaluation: EvaluationConfig {
                query_url: None,
                push_url: None,
                max_concurrent: 20,
                shutdown_grace_secs: 30,
            },
            notifier: NotifierConfig {
                receivers: Vec::new(),
                queue_capacity: 1000,
                refresh_interval_secs: 30,
                send_timeout_secs: 10,
                max_retries: 3,
                min_backoff_ms: 100,
                max_backoff_ms: 5000,
            },
        }
    }
}
