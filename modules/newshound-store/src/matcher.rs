use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use newshound_common::Alert;

use crate::db::{AlertDb, CandidateQuery};
use crate::error::Result;

/// Finds stored alerts that plausibly report the same happening as a new one.
///
/// A candidate must fall inside `[timestamp - W, timestamp + W]`, must not be
/// the alert itself, and its stored phrases must contain every one of the new
/// alert's match tags. Containment is one-directional on purpose: it is cheap
/// and GIN-indexable in Postgres.
#[derive(Clone)]
pub struct Matcher {
    db: Arc<dyn AlertDb>,
    event_timeframe: Duration,
}

impl Matcher {
    pub fn new(db: Arc<dyn AlertDb>, event_timeframe: Duration) -> Self {
        Self {
            db,
            event_timeframe,
        }
    }

    /// Inclusive time window around `timestamp`, saturating at the bounds
    /// of `DateTime<Utc>`.
    pub fn window(&self, timestamp: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = timestamp
            .checked_sub_signed(self.event_timeframe)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = timestamp
            .checked_add_signed(self.event_timeframe)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (start, end)
    }

    pub fn query_for(&self, alert: &Alert) -> CandidateQuery {
        let (start, end) = self.window(alert.timestamp);
        CandidateQuery {
            tags: alert.match_tags().clone(),
            start,
            end,
            exclude: alert.id,
        }
    }

    /// Candidates ordered by timestamp, then id.
    pub async fn find_candidates(
        &self,
        alert: &Alert,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>> {
        let query = self.query_for(alert);
        let mut candidates = self.db.find_alerts_containing(&query, cancel).await?;

        // Self-exclusion and ordering hold whatever the backend returns.
        candidates.retain(|c| query.matches(c));
        candidates.sort_by_key(|c| (c.timestamp, c.id));

        debug!(
            alert_id = ?alert.id,
            tags = query.tags.len(),
            candidates = candidates.len(),
            "Matched candidates"
        );
        Ok(candidates)
    }
}
