use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use crate::services::fulfillment::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    /// Decimal places between the gateway's major unit and the stored minor unit.
    #[serde(default)]
    pub currency_scale: u32,
    #[serde(default)]
    pub gateways: GatewaysConfig,
    pub panel: XuiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default = "default_webhook_wait_ms")]
    pub webhook_wait_ms: u64,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Public https origin gateways call back to, e.g. `https://shop.example.com`.
    pub public_base_url: String,
    pub internal_token: String,
    /// Extra path that serves the same webhook as `/payments/{gateway}`.
    #[serde(default)]
    pub legacy_callback_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaysConfig {
    pub zarinpal: Option<ZarinPalConfig>,
    pub cryptomus: Option<CryptomusConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZarinPalConfig {
    pub merchant_id: String,
    #[serde(default)]
    pub sandbox: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptomusConfig {
    pub merchant_id: String,
    pub payment_key: String,
    #[serde(default = "default_cryptomus_currency")]
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XuiConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            attempt_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    pub sweep_interval_secs: u64,
    /// How long an intent may sit in a non-terminal state before the sweep touches it.
    pub stall_grace_secs: u64,
    pub lease_ttl_secs: u64,
    pub ledger_check_interval_secs: u64,
    pub batch_size: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            stall_grace_secs: 120,
            lease_ttl_secs: 300,
            ledger_check_interval_secs: 3_600,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_max_connections() -> u32 {
    20
}

fn default_cryptomus_currency() -> String {
    "USD".to_string()
}

fn default_session_ttl_secs() -> u64 {
    1_800
}

fn default_webhook_wait_ms() -> u64 {
    5_000
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("{key} must be set when no panel.toml is present"))
}

impl PanelConfig {
    pub fn load() -> Result<Self> {
        let config_paths = ["/etc/vpnshop/panel.toml", "./panel.toml"];

        let mut loaded = None;
        for path in config_paths {
            if let Ok(contents) = fs::read_to_string(path) {
                tracing::info!("Loading config from {}", path);
                let config: Self =
                    toml::from_str(&contents).with_context(|| format!("Invalid config in {path}"))?;
                loaded = Some(config);
                break;
            }
        }

        let config = match loaded {
            Some(config) => config,
            None => {
                tracing::info!("Loading config from environment");
                Self::from_env()?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// The fulfillment lease must outlive the longest run the retry policy allows.
    pub fn validate(&self) -> Result<()> {
        let longest_run = RetryPolicy::from(self.retry.clone()).longest_run();
        if self.lease_ttl() <= longest_run {
            bail!(
                "reconciliation.lease_ttl_secs ({}s) must exceed the longest fulfillment run \
                 allowed by the retry policy ({}s)",
                self.reconciliation.lease_ttl_secs,
                longest_run.as_secs_f64()
            );
        }
        Ok(())
    }

    fn from_env() -> Result<Self> {
        let retry_defaults = RetryConfig::default();
        let recon_defaults = ReconciliationConfig::default();

        let zarinpal = std::env::var("ZARINPAL_MERCHANT_ID").ok().map(|merchant_id| ZarinPalConfig {
            merchant_id,
            sandbox: env_or("ZARINPAL_SANDBOX", false),
        });
        let cryptomus = match (
            std::env::var("CRYPTOMUS_MERCHANT_ID").ok(),
            std::env::var("CRYPTOMUS_PAYMENT_KEY").ok(),
        ) {
            (Some(merchant_id), Some(payment_key)) => Some(CryptomusConfig {
                merchant_id,
                payment_key,
                currency: env_or("CRYPTOMUS_CURRENCY", default_cryptomus_currency()),
            }),
            _ => None,
        };

        Ok(Self {
            server: ServerConfig {
                listen_port: env_or("LISTEN_PORT", default_listen_port()),
                public_base_url: env_required("PUBLIC_BASE_URL")?,
                internal_token: env_required("INTERNAL_API_TOKEN")?,
                legacy_callback_path: std::env::var("LEGACY_CALLBACK_PATH").ok(),
            },
            database: DatabaseConfig {
                url: env_required("DATABASE_URL")?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", default_max_connections()),
            },
            currency_scale: env_or("CURRENCY_SCALE", 0),
            gateways: GatewaysConfig { zarinpal, cryptomus },
            panel: XuiConfig {
                base_url: env_required("XUI_BASE_URL")?,
                username: env_required("XUI_USERNAME")?,
                password: env_required("XUI_PASSWORD")?,
                session_ttl_secs: env_or("XUI_SESSION_TTL_SECS", default_session_ttl_secs()),
            },
            retry: RetryConfig {
                max_attempts: env_or("PROVISION_MAX_ATTEMPTS", retry_defaults.max_attempts),
                base_delay_ms: env_or("PROVISION_BASE_DELAY_MS", retry_defaults.base_delay_ms),
                max_delay_ms: env_or("PROVISION_MAX_DELAY_MS", retry_defaults.max_delay_ms),
                attempt_timeout_ms: env_or(
                    "PROVISION_ATTEMPT_TIMEOUT_MS",
                    retry_defaults.attempt_timeout_ms,
                ),
            },
            reconciliation: ReconciliationConfig {
                sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", recon_defaults.sweep_interval_secs),
                stall_grace_secs: env_or("STALL_GRACE_SECS", recon_defaults.stall_grace_secs),
                lease_ttl_secs: env_or("LEASE_TTL_SECS", recon_defaults.lease_ttl_secs),
                ledger_check_interval_secs: env_or(
                    "LEDGER_CHECK_INTERVAL_SECS",
                    recon_defaults.ledger_check_interval_secs,
                ),
                batch_size: env_or("SWEEP_BATCH_SIZE", recon_defaults.batch_size),
            },
            webhook_wait_ms: env_or("WEBHOOK_WAIT_MS", default_webhook_wait_ms()),
            telegram: TelegramConfig {
                bot_token: std::env::var("BOT_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            },
        })
    }

    pub fn webhook_wait(&self) -> Duration {
        Duration::from_millis(self.webhook_wait_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.reconciliation.lease_ttl_secs)
    }
}

#[cfg(test)]
pub(crate) const TEST_CONFIG: &str = r#"
    [server]
    public_base_url = "https://shop.test"
    internal_token = "internal-secret"
    legacy_callback_path = "/payment/calback"

    [database]
    url = "postgres://localhost/vpnshop_test"

    [panel]
    base_url = "http://127.0.0.1:2053"
    username = "admin"
    password = "admin"
"#;
