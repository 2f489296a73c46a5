use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use watch_engine::{BscScanConfig, ReconcilerConfig, RegistryConfig, TelegramConfig};

pub const MIN_INTERVAL_SECS: u64 = 5;
pub const MAX_INTERVAL_SECS: u64 = 3_600;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/watch".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.bscscan.com".to_string(),
            api_key: None,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// `0` keeps subscriptions until they are removed explicitly.
    pub observation_window_secs: u64,
    pub notify_timeout_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            observation_window_secs: 24 * 60 * 60,
            notify_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    Log,
    Telegram,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub kind: NotifyKind,
    pub bot_token: Option<String>,
    pub api_base: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            kind: NotifyKind::Log,
            bot_token: None,
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
    /// `0` disables the limit.
    pub max_subscriptions_per_subscriber: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            max_subscriptions_per_subscriber: 20,
        }
    }
}

impl AppConfig {
    pub fn from_toml(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file: {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut cfg: AppConfig = toml::from_str(raw).context("failed parsing config toml")?;

        // Env overrides (explicit) first.
        override_from_env("WATCH_DB_PATH", &mut cfg.storage.path);
        override_from_env("WATCH_LISTEN_ADDR", &mut cfg.api.listen_addr);
        override_opt_from_env("BSCSCAN_KEY", &mut cfg.upstream.api_key);
        override_opt_from_env("TOKEN", &mut cfg.notify.bot_token);

        // Resolve env:VAR references.
        cfg.upstream.base_url = resolve_env_ref(&cfg.upstream.base_url)?;
        if let Some(key) = &cfg.upstream.api_key {
            cfg.upstream.api_key = Some(resolve_env_ref(key)?);
        }
        if let Some(token) = &cfg.notify.bot_token {
            cfg.notify.bot_token = Some(resolve_env_ref(token)?);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let interval = self.reconcile.interval_secs;
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval) {
            return Err(anyhow!(
                "reconcile.interval_secs must be within {MIN_INTERVAL_SECS}..={MAX_INTERVAL_SECS}, got {interval}"
            ));
        }
        if self.upstream.timeout_ms == 0 {
            return Err(anyhow!("upstream.timeout_ms must be > 0"));
        }
        if self.reconcile.notify_timeout_ms == 0 {
            return Err(anyhow!("reconcile.notify_timeout_ms must be > 0"));
        }
        if self.storage.path.trim().is_empty() {
            return Err(anyhow!("storage.path must not be empty"));
        }
        if self.notify.kind == NotifyKind::Telegram
            && self
                .notify
                .bot_token
                .as_deref()
                .map_or(true, |t| t.trim().is_empty())
        {
            return Err(anyhow!("notify.bot_token is required when notify.kind = \"telegram\""));
        }
        Ok(())
    }

    pub fn bscscan(&self) -> BscScanConfig {
        BscScanConfig {
            base_url: self.upstream.base_url.clone(),
            api_key: self.upstream.api_key.clone(),
            timeout_ms: self.upstream.timeout_ms,
        }
    }

    pub fn telegram(&self) -> TelegramConfig {
        TelegramConfig {
            api_base: self.notify.api_base.clone(),
            bot_token: self.notify.bot_token.clone().unwrap_or_default(),
            timeout_ms: self.reconcile.notify_timeout_ms,
        }
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            fetch_timeout: Duration::from_millis(self.upstream.timeout_ms),
            max_subscriptions_per_subscriber: self.api.max_subscriptions_per_subscriber,
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.reconcile.interval_secs),
            fetch_timeout: Duration::from_millis(self.upstream.timeout_ms),
            notify_timeout: Duration::from_millis(self.reconcile.notify_timeout_ms),
            observation_window_ms: self.reconcile.observation_window_secs.saturating_mul(1_000),
        }
    }

    /// Copy safe to print: credentials are masked.
    pub fn redacted(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.upstream.api_key.is_some() {
            cfg.upstream.api_key = Some("***".to_string());
        }
        if cfg.notify.bot_token.is_some() {
            cfg.notify.bot_token = Some("***".to_string());
        }
        cfg
    }
}

fn override_from_env(var: &str, target: &mut String) {
    if let Ok(v) = env::var(var) {
        if !v.trim().is_empty() {
            *target = v;
        }
    }
}

fn override_opt_from_env(var: &str, target: &mut Option<String>) {
    if let Ok(v) = env::var(var) {
        if !v.trim().is_empty() {
            *target = Some(v);
        }
    }
}

/// Expand an `env:NAME` value from the process environment; any other
/// value is returned unchanged.
pub fn resolve_env_ref(value: &str) -> Result<String> {
    let Some(name) = value.strip_prefix("env:").map(str::trim) else {
        return Ok(value.to_string());
    };
    if name.is_empty() {
        return Err(anyhow!("config value {value:?} names no environment variable"));
    }
    env::var(name).with_context(|| {
        format!("config value {value:?} refers to unset environment variable {name}")
    })
}
