use std::sync::Arc;

use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use newshound_common::{Alert, AlertId};

use crate::aggregator::{EventAggregator, Resolution};
use crate::db::AlertDb;
use crate::error::Result;
use crate::matcher::Matcher;

/// Result of ingesting one alert.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub alert_id: AlertId,
    /// Candidate ids in match order (timestamp, then id).
    pub candidates: Vec<AlertId>,
    pub resolution: Resolution,
}

/// Ingestion pipeline: store the alert, find its candidates, fold into events.
///
/// Two alerts about the same happening ingested concurrently may miss each
/// other and land in separate events; [`crate::Reconciler`] repairs that.
#[derive(Clone)]
pub struct Ingestor {
    db: Arc<dyn AlertDb>,
    matcher: Matcher,
    aggregator: EventAggregator,
}

impl Ingestor {
    pub fn new(db: Arc<dyn AlertDb>, event_timeframe: Duration) -> Self {
        Self {
            matcher: Matcher::new(db.clone(), event_timeframe),
            aggregator: EventAggregator::new(db.clone()),
            db,
        }
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub async fn ingest(&self, mut alert: Alert, cancel: &CancellationToken) -> Result<IngestOutcome> {
        let alert_id = self.db.put_alert(&alert, cancel).await?;
        alert.id = Some(alert_id);

        let candidates = self.matcher.find_candidates(&alert, cancel).await?;
        let resolution = self.aggregator.resolve(alert_id, &candidates, cancel).await?;

        info!(
            alert_id,
            candidates = candidates.len(),
            event_id = ?resolution.event_id(),
            "Ingested alert"
        );

        Ok(IngestOutcome {
            alert_id,
            candidates: candidates.iter().filter_map(|c| c.id).collect(),
            resolution,
        })
    }
}
