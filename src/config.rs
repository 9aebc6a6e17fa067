use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::escrow::{EscrowConfig, RetryPolicy, WorkerConfig};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub server: ServerConfig,
    /// PostgreSQL connection URL. Absent runs on the in-memory store.
    #[serde(default)]
    pub postgres_url: Option<String>,
    pub jwt_secret: String,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub payment_gateway: PaymentGatewayConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default = "default_fee_bps")]
    pub platform_fee_bps: u32,
}

fn default_fee_bps() -> u32 {
    350
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Hex-encoded ed25519 public keys of the webhook senders
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    pub pg_public_key: Option<String>,
    pub courier_public_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentGatewayConfig {
    /// Absent selects the in-process mock gateway (`mock-api` builds only)
    pub base_url: Option<String>,
    pub api_key: String,
    pub timeout_ms: u64,
    pub provider: String,
}

impl Default for PaymentGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: String::new(),
            timeout_ms: 10_000,
            provider: "mock".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationConfig {
    /// Absent logs notifications instead of posting them
    pub chat_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            chat_url: None,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerSettings {
    pub sweep_interval_secs: u64,
    pub cancel_timeout_secs: u64,
    pub batch_size: usize,
    #[serde(default)]
    pub refund_retry: RefundRetrySettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            cancel_timeout_secs: 86_400,
            batch_size: 100,
            refund_retry: RefundRetrySettings::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RefundRetrySettings {
    pub max_attempts: i32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for RefundRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_secs: 60,
            max_backoff_secs: 3_600,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn escrow_config(&self) -> EscrowConfig {
        let retry = &self.worker.refund_retry;
        EscrowConfig {
            platform_fee_bps: self.platform_fee_bps,
            cancel_timeout: Duration::from_secs(self.worker.cancel_timeout_secs),
            refund_retry: RetryPolicy {
                max_attempts: retry.max_attempts,
                base_backoff: Duration::from_secs(retry.base_backoff_secs),
                max_backoff: Duration::from_secs(retry.max_backoff_secs),
            },
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            sweep_interval: Duration::from_secs(self.worker.sweep_interval_secs),
            batch_size: self.worker.batch_size,
        }
    }
}
