use crate::error::{RateWatchError, Result};
use crate::pipeline::store::{Document, DocumentStore, SortOrder};
use crate::types::RateSnapshot;
use chrono::{DateTime, Local, TimeZone, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Number of most recent snapshots kept.
pub const RETENTION: usize = 7;

const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// On-disk layout of one ledger document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PersistedEntry {
    values: BTreeMap<String, f64>,
    thresholds: BTreeMap<String, f64>,
    timestamp: Value,
    base: String,
}

impl PersistedEntry {
    fn from_snapshot(snapshot: &RateSnapshot) -> Result<Self> {
        let entry = Self {
            values: snapshot.values().clone(),
            thresholds: snapshot.thresholds().clone(),
            timestamp: serde_json::to_value(snapshot.timestamp())?,
            base: snapshot.base().to_string(),
        };
        entry.validate()?;
        Ok(entry)
    }

    fn validate(&self) -> Result<()> {
        if self.values.is_empty() {
            return Err(RateWatchError::InvalidEntry("no currency values".into()));
        }
        for (currency, value) in &self.values {
            if !value.is_finite() || *value <= 0.0 {
                return Err(RateWatchError::InvalidEntry(format!(
                    "{} value {} is not a positive number",
                    currency, value
                )));
            }
            let cents = value * 100.0;
            if (cents - cents.round()).abs() > 1e-6 {
                return Err(RateWatchError::InvalidEntry(format!(
                    "{} value {} has more than two decimals",
                    currency, value
                )));
            }
        }
        for (currency, threshold) in &self.thresholds {
            if !threshold.is_finite() || *threshold <= 0.0 {
                return Err(RateWatchError::InvalidEntry(format!(
                    "{} threshold {} is not a positive number",
                    currency, threshold
                )));
            }
        }
        if self.base.is_empty() {
            return Err(RateWatchError::InvalidEntry("empty base currency".into()));
        }
        if !self.timestamp.is_string() {
            return Err(RateWatchError::InvalidEntry("timestamp is not canonical".into()));
        }
        Ok(())
    }
}

/// A stored snapshot with its identifier and storage instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: String,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
    pub thresholds: BTreeMap<String, f64>,
    #[serde(serialize_with = "display_instant")]
    pub timestamp: DateTime<Utc>,
    pub base: String,
    #[serde(rename = "storedAt")]
    pub stored_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn from_document(doc: &Document) -> Result<Self> {
        let persisted: PersistedEntry = serde_json::from_value(doc.body.clone())?;
        Ok(Self {
            id: doc.id.clone(),
            values: persisted.values,
            thresholds: persisted.thresholds,
            timestamp: normalize_instant(&persisted.timestamp),
            base: persisted.base,
            stored_at: doc.created_at,
        })
    }

    pub fn snapshot(&self) -> Result<RateSnapshot> {
        RateSnapshot::new(
            self.values.clone(),
            self.thresholds.clone(),
            self.timestamp,
            self.base.clone(),
        )
    }
}

fn display_instant<S>(instant: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&instant.with_timezone(&Local).format(DISPLAY_FORMAT))
}

/// Reads back any timestamp encoding found in stored documents.
///
/// Accepts RFC 3339 strings (what this service writes), epoch milliseconds, and
/// `{_seconds, _nanoseconds}` / `{seconds, nanos}` objects written by other tools.
/// Anything else falls back to the current time.
pub fn normalize_instant(raw: &Value) -> DateTime<Utc> {
    let parsed = match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(map) => {
            let seconds = map
                .get("_seconds")
                .or_else(|| map.get("seconds"))
                .and_then(Value::as_i64);
            let nanos = map
                .get("_nanoseconds")
                .or_else(|| map.get("nanos"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            seconds.and_then(|s| Utc.timestamp_opt(s, nanos as u32).single())
        }
        _ => None,
    };
    parsed.unwrap_or_else(|| {
        debug!("Unrecognized timestamp {}, using current time", raw);
        Utc::now()
    })
}

/// Append-only snapshot history with a fixed retention window.
pub struct Ledger {
    store: Arc<dyn DocumentStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Persists a rounded copy of `snapshot`, then prunes beyond [`RETENTION`].
    ///
    /// A failed prune is logged and does not fail the store.
    pub async fn store(&self, snapshot: &RateSnapshot) -> Result<LedgerEntry> {
        let rounded = snapshot.rounded()?;
        let persisted = PersistedEntry::from_snapshot(&rounded)?;
        let body = serde_json::to_value(&persisted)?;

        let doc = self
            .store
            .append(rounded.timestamp(), body)
            .await
            .map_err(|e| {
                error!("Error storing rates: {}", e);
                match e {
                    RateWatchError::Store(_) => e,
                    other => RateWatchError::Store(other.to_string()),
                }
            })?;

        if let Err(e) = self.prune().await {
            warn!("Error maintaining latest records: {}", e);
        }

        Ok(LedgerEntry {
            id: doc.id,
            values: persisted.values,
            thresholds: persisted.thresholds,
            timestamp: rounded.timestamp(),
            base: persisted.base,
            stored_at: doc.created_at,
        })
    }

    /// Deletes every entry past the newest [`RETENTION`], oldest first by ordering.
    pub async fn prune(&self) -> Result<usize> {
        let docs = self
            .store
            .query(SortOrder::Descending, None)
            .await
            .map_err(|e| RateWatchError::Prune(e.to_string()))?;
        if docs.len() <= RETENTION {
            return Ok(0);
        }

        let stale = &docs[RETENTION..];
        let results = join_all(stale.iter().map(|doc| self.store.delete(&doc.id))).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err().map(|e| e.to_string()))
            .collect();
        if !failures.is_empty() {
            return Err(RateWatchError::Prune(failures.join("; ")));
        }

        info!("Deleted {} old records, keeping {} latest", stale.len(), RETENTION);
        Ok(stale.len())
    }

    /// Up to [`RETENTION`] most recent entries, oldest first.
    pub async fn history(&self) -> Result<Vec<LedgerEntry>> {
        let docs = self.store.query(SortOrder::Descending, Some(RETENTION)).await?;

        let mut entries: Vec<LedgerEntry> = docs
            .iter()
            .filter_map(|doc| match LedgerEntry::from_document(doc) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable ledger document {}: {}", doc.id, e);
                    None
                }
            })
            .collect();
        entries.reverse();

        info!("Retrieved {} rate records from history", entries.len());
        Ok(entries)
    }
}
