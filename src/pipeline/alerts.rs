use crate::config::ThresholdConfig;
use crate::pipeline::broadcast::Broadcaster;
use crate::pipeline::notifier::Notifier;
use crate::types::{round2, AlertPayload, Breach, Event, RateSnapshot};
use log::{info, warn};
use std::sync::Arc;

/// What happened to the side effects of one breach.
#[derive(Debug, Clone, PartialEq)]
pub struct BreachOutcome {
    pub breach: Breach,
    pub notified: bool,
    pub delivered: usize,
}

/// Currencies whose rate is strictly above their configured threshold.
///
/// Only currency values are inspected; currencies without a threshold are skipped.
pub fn find_breaches(snapshot: &RateSnapshot, thresholds: &ThresholdConfig) -> Vec<Breach> {
    snapshot
        .values()
        .iter()
        .filter_map(|(currency, rate)| {
            let threshold = thresholds.get(currency)?;
            (*rate > threshold).then(|| Breach {
                currency: currency.clone(),
                rate: *rate,
                threshold,
            })
        })
        .collect()
}

pub struct ThresholdEvaluator {
    notifier: Arc<Notifier>,
    broadcaster: Arc<Broadcaster>,
}

impl ThresholdEvaluator {
    pub fn new(notifier: Arc<Notifier>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            notifier,
            broadcaster,
        }
    }

    /// Emails and broadcasts every breach. Side-effect failures are recorded, never raised.
    pub async fn evaluate(
        &self,
        snapshot: &RateSnapshot,
        thresholds: &ThresholdConfig,
    ) -> Vec<BreachOutcome> {
        let breaches = find_breaches(snapshot, thresholds);
        let mut outcomes = Vec::with_capacity(breaches.len());

        for breach in breaches {
            info!(
                "{} at {:.2} is above threshold {}",
                breach.currency, breach.rate, breach.threshold
            );
            let notified = self
                .notifier
                .alert(&breach.currency, round2(breach.rate), breach.threshold)
                .await;
            if !notified {
                warn!("No alert email delivered for {}", breach.currency);
            }
            let delivered = self
                .broadcaster
                .publish(&Event::alert(AlertPayload::for_breach(&breach)));

            outcomes.push(BreachOutcome {
                breach,
                notified,
                delivered,
            });
        }
        outcomes
    }
}
