// Storage capability set for alerts, sentences and events.
//
// PgAlertDb is the production backend. MemoryAlertDb (crate::testing) mirrors
// its semantics so the matcher and aggregator can be tested without Postgres.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio_util::sync::CancellationToken;

use newshound_common::{Alert, AlertId, Event, EventId, PhraseSet, Sentence};

use crate::error::{Result, StoreError};

/// Lazy, finite scan over every stored alert.
pub type AlertStream = Pin<Box<dyn Stream<Item = Result<Alert>> + Send>>;

/// Filter for candidate duplicates of an alert.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    /// Every one of these must appear in a candidate's stored phrases.
    pub tags: PhraseSet,
    /// Inclusive lower bound on the candidate timestamp.
    pub start: DateTime<Utc>,
    /// Inclusive upper bound on the candidate timestamp.
    pub end: DateTime<Utc>,
    pub exclude: Option<AlertId>,
}

impl CandidateQuery {
    pub fn matches(&self, alert: &Alert) -> bool {
        alert.timestamp >= self.start
            && alert.timestamp <= self.end
            && (self.exclude.is_none() || alert.id != self.exclude)
            && alert.top_phrases.contains_all(&self.tags)
    }
}

#[async_trait]
pub trait AlertDb: Send + Sync {
    // --- Alerts ---

    /// Store an alert with its sentences and top-sentence reference in one
    /// transaction. Returns the new alert id.
    async fn put_alert(&self, alert: &Alert, cancel: &CancellationToken) -> Result<AlertId>;

    /// Batch point lookup, ascending by id, sentences included. Unknown ids
    /// are skipped.
    async fn get_alerts_by_id(
        &self,
        ids: &[AlertId],
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>>;

    /// Sentences owned by an alert, in insertion order.
    async fn sentences_for_alert(
        &self,
        alert_id: AlertId,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sentence>>;

    /// Alerts with `start <= timestamp <= end`, ascending by timestamp.
    async fn find_alerts_by_timeframe(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>>;

    /// Stream every alert by id. Ends without an error item when `cancel`
    /// fires; dropping the stream releases the underlying cursor.
    fn stream_all_alerts(&self, cancel: CancellationToken) -> AlertStream;

    /// Alerts matching `query`, ascending by timestamp then id.
    async fn find_alerts_containing(
        &self,
        query: &CandidateQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>>;

    // --- Events ---

    /// Events whose membership intersects `alert_ids`, ascending by id.
    async fn find_events_by_alert_ids(
        &self,
        alert_ids: &[AlertId],
        cancel: &CancellationToken,
    ) -> Result<Vec<Event>>;

    /// Insert the event when it has no id, otherwise replace its membership.
    async fn upsert_event(&self, event: &Event, cancel: &CancellationToken) -> Result<EventId>;

    /// Remove events by id. Unknown ids are ignored.
    async fn delete_events(&self, ids: &[EventId], cancel: &CancellationToken) -> Result<()>;
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    op: &'static str,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled { op }),
        res = fut => res,
    }
}
