use crate::error::{RateWatchError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub const BASE_CURRENCY: &str = "LKR";
pub const TARGET_CURRENCIES: [&str; 3] = ["USD", "EUR", "GBP"];

/// One fetched set of rates, expressed as target currency per unit of base.
///
/// Fields are private so a snapshot cannot change after `new` has validated it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateSnapshot {
    #[serde(flatten)]
    values: BTreeMap<String, f64>,
    thresholds: BTreeMap<String, f64>,
    timestamp: DateTime<Utc>,
    base: String,
}

impl RateSnapshot {
    pub fn new(
        values: BTreeMap<String, f64>,
        thresholds: BTreeMap<String, f64>,
        timestamp: DateTime<Utc>,
        base: impl Into<String>,
    ) -> Result<Self> {
        if values.is_empty() {
            return Err(RateWatchError::InvalidSnapshot("no currency values".into()));
        }
        for (currency, value) in &values {
            if !value.is_finite() || *value <= 0.0 {
                return Err(RateWatchError::InvalidSnapshot(format!(
                    "{} rate must be positive and finite, got {}",
                    currency, value
                )));
            }
        }
        let base = base.into();
        if base.is_empty() {
            return Err(RateWatchError::InvalidSnapshot("empty base currency".into()));
        }
        Ok(Self {
            values,
            thresholds,
            timestamp,
            base,
        })
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    #[cfg(test)]
    pub fn rate(&self, currency: &str) -> Option<f64> {
        self.values.get(currency).copied()
    }

    pub fn thresholds(&self) -> &BTreeMap<String, f64> {
        &self.thresholds
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Copy of this snapshot with every value rounded to two decimals.
    ///
    /// Rates below half a cent are stored as `0.01` so the copy stays positive.
    pub fn rounded(&self) -> Result<Self> {
        let values = self
            .values
            .iter()
            .map(|(currency, value)| (currency.clone(), round2(*value).max(MIN_STORED_RATE)))
            .collect();
        Self::new(values, self.thresholds.clone(), self.timestamp, self.base.clone())
    }
}

/// Smallest rate a two-decimal ledger can hold.
pub const MIN_STORED_RATE: f64 = 0.01;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breach {
    pub currency: String,
    pub rate: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl AlertPayload {
    pub fn triggered() -> Self {
        Self {
            message: "Threshold alert triggered".to_string(),
            currency: None,
            rate: None,
            threshold: None,
        }
    }

    pub fn for_breach(breach: &Breach) -> Self {
        Self {
            currency: Some(breach.currency.clone()),
            rate: Some(round2(breach.rate)),
            threshold: Some(breach.threshold),
            ..Self::triggered()
        }
    }
}

/// Everything pushed to subscribers. Serialized as `{"type": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Connected {
        #[serde(rename = "clientId")]
        client_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    RatesUpdate {
        data: RateSnapshot,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Alert {
        data: AlertPayload,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn connected(client_id: &str) -> Self {
        Event::Connected {
            client_id: client_id.to_string(),
            message: "SSE connection established".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn rates_update(snapshot: RateSnapshot) -> Self {
        Event::RatesUpdate {
            data: snapshot,
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        Event::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    pub fn alert(payload: AlertPayload) -> Self {
        Event::Alert {
            data: payload,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::RatesUpdate { .. } => "ratesUpdate",
            Event::Heartbeat { .. } => "heartbeat",
            Event::Alert { .. } => "alert",
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_snapshot(usd: f64, eur: f64, gbp: f64) -> RateSnapshot {
    let values = BTreeMap::from([
        ("USD".to_string(), usd),
        ("EUR".to_string(), eur),
        ("GBP".to_string(), gbp),
    ]);
    let thresholds = BTreeMap::from([
        ("USD".to_string(), 330.0),
        ("EUR".to_string(), 780.0),
        ("GBP".to_string(), 50.0),
    ]);
    RateSnapshot::new(values, thresholds, Utc::now(), BASE_CURRENCY).unwrap()
}
