use std::sync::Arc;

use chrono::Duration;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregator::{EventAggregator, Resolution};
use crate::db::AlertDb;
use crate::error::{Result, StoreError};
use crate::matcher::Matcher;

/// Stats from a reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub alerts_scanned: u64,
    pub events_created: u64,
    pub events_joined: u64,
    /// Alerts whose event already held them and every candidate.
    pub unchanged: u64,
    pub events_merged: u64,
    pub events_retired: u64,
    pub unclustered: u64,
    pub cancelled: bool,
}

impl ReconcileStats {
    fn record(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::Unclustered => self.unclustered += 1,
            Resolution::Created(_) => self.events_created += 1,
            Resolution::Joined(_) => self.events_joined += 1,
            Resolution::Unchanged(_) => self.unchanged += 1,
            Resolution::Merged { retired, .. } => {
                self.events_merged += 1;
                self.events_retired += retired.len() as u64;
            }
        }
    }
}

impl std::fmt::Display for ReconcileStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Reconcile: {} scanned, {} created, {} joined, {} merged ({} retired), {} unchanged, \
             {} unclustered{}",
            self.alerts_scanned,
            self.events_created,
            self.events_joined,
            self.events_merged,
            self.events_retired,
            self.unchanged,
            self.unclustered,
            if self.cancelled { " [cancelled]" } else { "" },
        )
    }
}

/// Re-runs matching and aggregation over every stored alert.
///
/// Fixes events split by concurrent ingestion. The scan holds one pooled
/// connection while matching uses others, so the pool needs at least
/// `MIN_MAX_CONNECTIONS`; `connect` refuses anything smaller.
pub struct Reconciler {
    db: Arc<dyn AlertDb>,
    matcher: Matcher,
    aggregator: EventAggregator,
}

impl Reconciler {
    pub fn new(db: Arc<dyn AlertDb>, event_timeframe: Duration) -> Self {
        Self {
            matcher: Matcher::new(db.clone(), event_timeframe),
            aggregator: EventAggregator::new(db.clone()),
            db,
        }
    }

    /// Cancellation ends the pass early with the stats gathered so far.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let mut alerts = self.db.stream_all_alerts(cancel.clone());

        while let Some(alert) = alerts.try_next().await? {
            let Some(alert_id) = alert.id else { continue };
            stats.alerts_scanned += 1;

            let step = async {
                let candidates = self.matcher.find_candidates(&alert, cancel).await?;
                self.aggregator.resolve(alert_id, &candidates, cancel).await
            };

            match step.await {
                Ok(resolution) => stats.record(&resolution),
                Err(StoreError::Cancelled { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        stats.cancelled = cancel.is_cancelled();
        info!("{stats}");
        Ok(stats)
    }
}
