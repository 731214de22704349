use crate::error::{RateWatchError, Result};
use chrono::NaiveTime;
use log::{info, warn};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.fastforex.io/fetch-multi";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HEARTBEAT_SECS: u64 = 25;
const DEFAULT_THRESHOLDS: [(&str, f64); 3] = [("USD", 330.0), ("EUR", 780.0), ("GBP", 50.0)];

/// Process-wide alert thresholds, fixed at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdConfig {
    limits: BTreeMap<String, f64>,
}

impl ThresholdConfig {
    pub fn new(limits: BTreeMap<String, f64>) -> Result<Self> {
        for (currency, limit) in &limits {
            if !limit.is_finite() || *limit <= 0.0 {
                return Err(RateWatchError::Config(format!(
                    "threshold for {} must be a positive number, got {}",
                    currency, limit
                )));
            }
        }
        Ok(Self { limits })
    }

    pub fn get(&self, currency: &str) -> Option<f64> {
        self.limits.get(currency).copied()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.limits
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            limits: DEFAULT_THRESHOLDS
                .iter()
                .map(|(c, v)| (c.to_string(), *v))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub relay_url: String,
    pub relay_token: Option<String>,
    pub sender: String,
    pub recipient: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub api_key: String,
    pub port: u16,
    pub ws_port: u16,
    pub ledger_path: Option<PathBuf>,
    pub mail: Option<MailConfig>,
    pub schedule_at: NaiveTime,
    pub heartbeat: Duration,
    pub thresholds: ThresholdConfig,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        let config = Self::from_lookup(|key| env::var(key).ok())?;
        config.log_settings();
        Ok(config)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("FASTFOREX_API_KEY")
            .ok_or_else(|| RateWatchError::Config("FASTFOREX_API_KEY is not set".into()))?;
        let api_url = get("FASTFOREX_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let port = parse_or("PORT", get("PORT"), DEFAULT_PORT)?;
        let ws_port = parse_or("WS_PORT", get("WS_PORT"), port.saturating_add(1))?;

        let hour: u32 = parse_or("SCHEDULE_HOUR", get("SCHEDULE_HOUR"), 9)?;
        let minute: u32 = parse_or("SCHEDULE_MINUTE", get("SCHEDULE_MINUTE"), 0)?;
        let schedule_at = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| {
            RateWatchError::Config(format!("invalid schedule time {:02}:{:02}", hour, minute))
        })?;

        let heartbeat_secs = parse_or("HEARTBEAT_SECS", get("HEARTBEAT_SECS"), DEFAULT_HEARTBEAT_SECS)?;
        if heartbeat_secs == 0 {
            return Err(RateWatchError::Config("HEARTBEAT_SECS must be non-zero".into()));
        }

        let mut limits = BTreeMap::new();
        for (currency, default) in DEFAULT_THRESHOLDS {
            let key = format!("THRESHOLD_{}", currency);
            limits.insert(currency.to_string(), parse_or(&key, get(&key), default)?);
        }
        let thresholds = ThresholdConfig::new(limits)?;

        let mail = match (get("MAIL_RELAY_URL"), get("EMAIL_USER")) {
            (Some(relay_url), Some(sender)) => Some(MailConfig {
                relay_url,
                relay_token: get("MAIL_RELAY_TOKEN"),
                recipient: get("ALERT_EMAIL").unwrap_or_else(|| sender.clone()),
                sender,
            }),
            _ => None,
        };

        Ok(Self {
            api_url,
            api_key,
            port,
            ws_port,
            ledger_path: get("LEDGER_PATH").map(PathBuf::from),
            mail,
            schedule_at,
            heartbeat: Duration::from_secs(heartbeat_secs),
            thresholds,
        })
    }

    fn log_settings(&self) {
        info!("Quote provider: {}", self.api_url);
        info!("HTTP port {}, WebSocket port {}", self.port, self.ws_port);
        info!("Daily run at {}", self.schedule_at.format("%H:%M"));
        info!("Thresholds: {:?}", self.thresholds.as_map());
        match &self.ledger_path {
            Some(path) => info!("Ledger file: {}", path.display()),
            None => warn!("LEDGER_PATH not set, history is kept in memory only"),
        }
        if self.mail.is_none() {
            warn!("Mail relay not configured, alert emails are disabled");
        }
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|_| RateWatchError::Config(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[("FASTFOREX_API_KEY", "k")])).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.port, 3000);
        assert_eq!(config.ws_port, 3001);
        assert_eq!(config.heartbeat, Duration::from_secs(25));
        assert_eq!(config.schedule_at, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(config.thresholds, ThresholdConfig::default());
        assert!(config.mail.is_none());
        assert!(config.ledger_path.is_none());
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let err = Config::from_lookup(lookup(&[("FASTFOREX_API_KEY", "  ")])).unwrap_err();
        assert!(matches!(err, RateWatchError::Config(_)));
    }

    #[test]
    fn thresholds_and_mail_from_env() {
        let config = Config::from_lookup(lookup(&[
            ("FASTFOREX_API_KEY", "k"),
            ("THRESHOLD_GBP", "420"),
            ("MAIL_RELAY_URL", "https://relay.test/send"),
            ("EMAIL_USER", "ops@example.com"),
        ]))
        .unwrap();
        assert_eq!(config.thresholds.get("GBP"), Some(420.0));
        assert_eq!(config.thresholds.get("USD"), Some(330.0));
        let mail = config.mail.unwrap();
        assert_eq!(mail.recipient, "ops@example.com");
    }

    #[test]
    fn non_positive_threshold_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("FASTFOREX_API_KEY", "k"),
            ("THRESHOLD_USD", "-1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, RateWatchError::Config(_)));
    }
}
