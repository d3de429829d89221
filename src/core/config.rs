// Configuration Management for the Quote & Alert Engine
// JSON file + environment overrides, handed to the engine at construction

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub negotiate_url: String,

    // Reconnect policy
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,

    // Session health
    pub ping_interval_secs: u64,
    pub stale_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub request_timeout_seconds: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            negotiate_url: "https://tradecompanion3.azurewebsites.net/api/negotiate".to_string(),
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            ping_interval_secs: 15,
            stale_timeout_secs: 60,
            handshake_timeout_secs: 10,
            request_timeout_seconds: 10,
        }
    }
}

impl FeedConfig {
    /// Backoff before reconnect attempt `attempt` (0-based), capped
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.min(20));
        let delay_ms = self.reconnect_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.reconnect_max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub prev_close_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            prev_close_url: "https://tradecompanion3.azurewebsites.net/api/prevcloses".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertStoreConfig {
    pub alerts_url: String,
    pub auth_token: String,
}

impl Default for AlertStoreConfig {
    fn default() -> Self {
        Self {
            alerts_url: "http://localhost:3000/api/alerts/priceAlerts".to_string(),
            auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub event_history: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_logs: false,
            event_history: 1000,
        }
    }
}

/// Everything the engine needs at construction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub feed: FeedConfig,
    pub baseline: BaselineConfig,
    pub alerts: AlertStoreConfig,
    pub monitoring: MonitoringConfig,
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub negotiate_url: String,
    pub prev_close_url: String,
    pub alerts_url: String,
    pub has_alert_token: bool,
    pub max_reconnect_attempts: u32,
    pub log_level: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

pub struct ConfigManager {
    feed: Arc<RwLock<FeedConfig>>,
    baseline: Arc<RwLock<BaselineConfig>>,
    alerts: Arc<RwLock<AlertStoreConfig>>,
    monitoring: Arc<RwLock<MonitoringConfig>>,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self {
            feed: Arc::new(RwLock::new(FeedConfig::default())),
            baseline: Arc::new(RwLock::new(BaselineConfig::default())),
            alerts: Arc::new(RwLock::new(AlertStoreConfig::default())),
            monitoring: Arc::new(RwLock::new(MonitoringConfig::default())),
        };

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!("Configuration initialized");
        Ok(manager)
    }

    /// Load configuration from JSON file
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let config_data: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;

        if let Some(data) = config_data.get("feed") {
            match serde_json::from_value::<FeedConfig>(data.clone()) {
                Ok(feed) => *self.feed.write() = feed,
                Err(e) => warn!(error = %e, "Ignoring invalid feed section"),
            }
        }

        if let Some(data) = config_data.get("baseline") {
            match serde_json::from_value::<BaselineConfig>(data.clone()) {
                Ok(baseline) => *self.baseline.write() = baseline,
                Err(e) => warn!(error = %e, "Ignoring invalid baseline section"),
            }
        }

        if let Some(data) = config_data.get("alerts") {
            match serde_json::from_value::<AlertStoreConfig>(data.clone()) {
                Ok(alerts) => *self.alerts.write() = alerts,
                Err(e) => warn!(error = %e, "Ignoring invalid alerts section"),
            }
        }

        if let Some(data) = config_data.get("monitoring") {
            match serde_json::from_value::<MonitoringConfig>(data.clone()) {
                Ok(monitoring) => *self.monitoring.write() = monitoring,
                Err(e) => warn!(error = %e, "Ignoring invalid monitoring section"),
            }
        }

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Endpoint and credential overrides from the environment
    pub fn load_from_env(&mut self) {
        if let Ok(url) = std::env::var("QUOTE_ENGINE_NEGOTIATE_URL") {
            self.feed.write().negotiate_url = url;
        }
        if let Ok(url) = std::env::var("QUOTE_ENGINE_PREV_CLOSE_URL") {
            self.baseline.write().prev_close_url = url;
        }
        if let Ok(url) = std::env::var("QUOTE_ENGINE_ALERTS_URL") {
            self.alerts.write().alerts_url = url;
        }
        if let Ok(token) = std::env::var("QUOTE_ENGINE_ALERTS_TOKEN") {
            self.alerts.write().auth_token = token;
        }
        if let Ok(level) = std::env::var("QUOTE_ENGINE_LOG_LEVEL") {
            self.monitoring.write().log_level = level;
        }
    }

    /// Save configuration to JSON file (auth token excluded)
    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let mut alerts = self.alerts.read().clone();
        alerts.auth_token.clear();

        let mut config_map = HashMap::new();
        config_map.insert("feed", serde_json::to_value(&*self.feed.read())?);
        config_map.insert("baseline", serde_json::to_value(&*self.baseline.read())?);
        config_map.insert("alerts", serde_json::to_value(&alerts)?);
        config_map.insert("monitoring", serde_json::to_value(&*self.monitoring.read())?);

        if let Some(parent) = Path::new(config_path).parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&config_map)?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<bool, ConfigError> {
        let mut errors = Vec::new();
        let feed = self.feed.read();
        let baseline = self.baseline.read();

        if !is_http_url(&feed.negotiate_url) {
            errors.push(format!("negotiate_url must be http(s): '{}'", feed.negotiate_url));
        }
        if !is_http_url(&baseline.prev_close_url) {
            errors.push(format!("prev_close_url must be http(s): '{}'", baseline.prev_close_url));
        }
        if feed.reconnect_base_delay_ms == 0 {
            errors.push("reconnect_base_delay_ms must be positive".to_string());
        }
        if feed.reconnect_max_delay_ms < feed.reconnect_base_delay_ms {
            errors.push("reconnect_max_delay_ms must be >= reconnect_base_delay_ms".to_string());
        }
        if feed.stale_timeout_secs <= feed.ping_interval_secs {
            errors.push("stale_timeout_secs must exceed ping_interval_secs".to_string());
        }

        if !errors.is_empty() {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            return Ok(false);
        }

        info!("Configuration validated successfully");
        Ok(true)
    }

    pub fn get_summary(&self) -> ConfigSummary {
        let feed = self.feed.read();
        let baseline = self.baseline.read();
        let alerts = self.alerts.read();
        let monitoring = self.monitoring.read();

        ConfigSummary {
            negotiate_url: feed.negotiate_url.clone(),
            prev_close_url: baseline.prev_close_url.clone(),
            alerts_url: alerts.alerts_url.clone(),
            has_alert_token: !alerts.auth_token.is_empty(),
            max_reconnect_attempts: feed.max_reconnect_attempts,
            log_level: monitoring.log_level.clone(),
        }
    }

    pub fn feed(&self) -> FeedConfig {
        self.feed.read().clone()
    }

    pub fn baseline(&self) -> BaselineConfig {
        self.baseline.read().clone()
    }

    pub fn alerts(&self) -> AlertStoreConfig {
        self.alerts.read().clone()
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        self.monitoring.read().clone()
    }

    /// Snapshot of all sections for engine construction
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            feed: self.feed(),
            baseline: self.baseline(),
            alerts: self.alerts(),
            monitoring: self.monitoring(),
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let feed = FeedConfig::default();
        assert!(feed.negotiate_url.ends_with("/negotiate"));
        assert_eq!(feed.max_reconnect_attempts, 10);

        let baseline = BaselineConfig::default();
        assert!(baseline.prev_close_url.ends_with("/prevcloses"));
    }

    #[test]
    fn test_reconnect_delay_backoff() {
        let feed = FeedConfig {
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 1000,
            ..FeedConfig::default()
        };
        assert_eq!(feed.reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(feed.reconnect_delay(1), Duration::from_millis(200));
        assert_eq!(feed.reconnect_delay(3), Duration::from_millis(800));
        assert_eq!(feed.reconnect_delay(4), Duration::from_millis(1000));
        assert_eq!(feed.reconnect_delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_config_manager_defaults_validate() {
        let manager = ConfigManager::new(None).unwrap();
        assert!(manager.validate().unwrap());
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let feed: FeedConfig = serde_json::from_value(serde_json::json!({
            "negotiate_url": "http://localhost:7071/api/negotiate",
            "max_reconnect_attempts": 3
        })).unwrap();
        assert_eq!(feed.negotiate_url, "http://localhost:7071/api/negotiate");
        assert_eq!(feed.max_reconnect_attempts, 3);
        assert_eq!(feed.ping_interval_secs, FeedConfig::default().ping_interval_secs);
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let dir = std::env::temp_dir().join(format!("quote_engine_cfg_{}", std::process::id()));
        let path = dir.join("engine.json");
        let path_str = path.to_str().unwrap();

        fs::create_dir_all(&dir).unwrap();
        fs::write(&path, r#"{
            "feed": {"negotiate_url": "http://feed.local/negotiate"},
            "alerts": {"alerts_url": "http://store.local/alerts", "auth_token": "secret"}
        }"#).unwrap();

        let manager = ConfigManager::new(Some(path_str)).unwrap();
        assert_eq!(manager.feed().negotiate_url, "http://feed.local/negotiate");
        assert!(manager.get_summary().has_alert_token);

        manager.save_to_file(path_str).unwrap();
        let saved = fs::read_to_string(&path).unwrap();
        assert!(!saved.contains("secret"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_config_detected() {
        let manager = ConfigManager::new(None).unwrap();
        manager.feed.write().negotiate_url = "ftp://nope".to_string();
        assert!(!manager.validate().unwrap());
    }
}
