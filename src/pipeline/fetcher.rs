use crate::api::fastforex::rest::QuoteProvider;
use crate::config::ThresholdConfig;
use crate::error::{RateWatchError, Result};
use crate::types::{RateSnapshot, BASE_CURRENCY, TARGET_CURRENCIES};
use chrono::Utc;
use log::{error, info};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Turns provider quotes (base per target) into a snapshot of target per base.
pub struct RateFetcher {
    provider: Arc<dyn QuoteProvider>,
}

impl RateFetcher {
    pub fn new(provider: Arc<dyn QuoteProvider>) -> Self {
        Self { provider }
    }

    pub async fn fetch(&self, thresholds: &ThresholdConfig) -> Result<RateSnapshot> {
        let raw = match self.provider.fetch_multi(BASE_CURRENCY, &TARGET_CURRENCIES).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Error fetching currency rates: {}", e);
                return Err(e);
            }
        };

        let mut values = BTreeMap::new();
        for currency in TARGET_CURRENCIES {
            let factor = raw.get(currency).copied().ok_or_else(|| {
                RateWatchError::Fetch(format!("Invalid API response: no quote for {}", currency))
            })?;
            if !factor.is_finite() || factor <= 0.0 {
                return Err(RateWatchError::Fetch(format!(
                    "Invalid API response: {} quote {} is not positive",
                    currency, factor
                )));
            }
            values.insert(currency.to_string(), 1.0 / factor);
        }

        let snapshot = RateSnapshot::new(
            values,
            thresholds.as_map().clone(),
            Utc::now(),
            BASE_CURRENCY,
        )?;
        info!("Fetched rates {:?}", snapshot.values());
        Ok(snapshot)
    }
}
