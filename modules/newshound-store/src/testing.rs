// In-memory AlertDb for tests.
//
// MemoryAlertDb keeps the same observable behavior as PgAlertDb: ids come
// from per-table counters, `put_alert` is all-or-nothing, range reads and
// candidate lookups return un-hydrated alert rows, and the full scan is lazy
// (one alert per poll) so cancellation and cursor release can be observed.
//
// Plus helpers for building alerts in tests.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use newshound_common::{
    Alert, AlertId, Event, EventId, PhraseSet, SenderId, Sentence, SentenceId,
};

use crate::db::{cancellable, AlertDb, AlertStream, CandidateQuery};
use crate::error::{Result, StoreError};

// ---------------------------------------------------------------------------
// MemoryAlertDb
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    senders: HashMap<String, SenderId>,
    alerts: BTreeMap<AlertId, Alert>,
    sentences: BTreeMap<SentenceId, Sentence>,
    events: BTreeMap<EventId, Event>,
    next_sender: SenderId,
    next_alert: AlertId,
    next_sentence: SentenceId,
    next_event: EventId,
    /// Fail `put_alert` when inserting the sentence at this index.
    fail_on_sentence: Option<usize>,
}

impl Inner {
    fn next_id(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }
}

/// Stateful in-memory store. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryAlertDb {
    inner: Arc<Mutex<Inner>>,
    open_cursors: Arc<AtomicUsize>,
}

impl MemoryAlertDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sender name (builder form).
    pub fn with_sender(self, name: &str) -> Self {
        self.add_sender(name);
        self
    }

    /// Register a sender name and return its id. Names are case-insensitive.
    pub fn add_sender(&self, name: &str) -> SenderId {
        let mut inner = self.lock();
        let key = name.to_lowercase();
        if let Some(id) = inner.senders.get(&key) {
            return *id;
        }
        let id = Inner::next_id(&mut inner.next_sender);
        inner.senders.insert(key, id);
        id
    }

    /// Make the next `put_alert` calls fail while inserting sentence `index`.
    pub fn fail_on_sentence(&self, index: usize) {
        self.lock().fail_on_sentence = Some(index);
    }

    pub fn alert_count(&self) -> usize {
        self.lock().alerts.len()
    }

    pub fn sentence_count(&self) -> usize {
        self.lock().sentences.len()
    }

    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    /// Every stored event, ascending by id.
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.values().cloned().collect()
    }

    /// Full scans that have started and not yet been dropped.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn hydrate(inner: &Inner, mut alert: Alert) -> Alert {
    let Some(id) = alert.id else { return alert };
    alert.sentences = inner
        .sentences
        .values()
        .filter(|s| s.alert_id == Some(id))
        .cloned()
        .collect();
    if let Some(top) = alert
        .sentences
        .iter()
        .find(|s| s.id.is_some() && s.id == alert.top_sentence_id)
    {
        alert.top_sentence = top.value.clone();
    }
    alert
}

struct CursorGuard(Arc<AtomicUsize>);

impl CursorGuard {
    fn open(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertDb for MemoryAlertDb {
    async fn put_alert(&self, alert: &Alert, cancel: &CancellationToken) -> Result<AlertId> {
        const OP: &str = "put_alert";
        cancellable(OP, cancel, async {
            let mut inner = self.lock();

            let sender_id = *inner
                .senders
                .get(&alert.sender.to_lowercase())
                .ok_or_else(|| {
                    StoreError::constraint(OP, format!("unknown sender '{}'", alert.sender))
                })?;

            // Stage everything, then publish in one step.
            let mut next_alert = inner.next_alert;
            let alert_id = Inner::next_id(&mut next_alert);
            let mut next_sentence = inner.next_sentence;
            let mut staged = Vec::with_capacity(alert.sentences.len());
            let top_index = alert.top_sentence_index();
            let mut top_sentence_id = None;

            for (index, sentence) in alert.sentences.iter().enumerate() {
                if inner.fail_on_sentence == Some(index) {
                    return Err(StoreError::from_sqlx(
                        OP,
                        sqlx::Error::Protocol(format!("injected failure at sentence {index}")),
                    ));
                }
                let sentence_id = Inner::next_id(&mut next_sentence);
                if top_index == Some(index) {
                    top_sentence_id = Some(sentence_id);
                }
                staged.push(Sentence {
                    id: Some(sentence_id),
                    alert_id: Some(alert_id),
                    value: sentence.value.clone(),
                    phrases: sentence.phrases.clone(),
                });
            }

            let row = Alert {
                id: Some(alert_id),
                sender: String::new(),
                sender_id: Some(sender_id),
                article_url: alert.article_url.clone(),
                timestamp: alert.timestamp,
                top_phrases: alert.top_phrases.clone(),
                tags: PhraseSet::new(),
                subject: alert.subject.clone(),
                raw_body: alert.raw_body.clone(),
                body: alert.body.clone(),
                sentences: Vec::new(),
                top_sentence: String::new(),
                top_sentence_id,
            };

            inner.next_alert = next_alert;
            inner.next_sentence = next_sentence;
            inner.alerts.insert(alert_id, row);
            for sentence in staged {
                if let Some(id) = sentence.id {
                    inner.sentences.insert(id, sentence);
                }
            }
            Ok(alert_id)
        })
        .await
    }

    async fn get_alerts_by_id(
        &self,
        ids: &[AlertId],
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>> {
        cancellable("get_alerts_by_id", cancel, async {
            let inner = self.lock();
            let mut wanted = ids.to_vec();
            wanted.sort_unstable();
            wanted.dedup();
            Ok(wanted
                .into_iter()
                .filter_map(|id| inner.alerts.get(&id).cloned())
                .map(|alert| hydrate(&inner, alert))
                .collect())
        })
        .await
    }

    async fn sentences_for_alert(
        &self,
        alert_id: AlertId,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sentence>> {
        cancellable("sentences_for_alert", cancel, async {
            let inner = self.lock();
            Ok(inner
                .sentences
                .values()
                .filter(|s| s.alert_id == Some(alert_id))
                .cloned()
                .collect())
        })
        .await
    }

    async fn find_alerts_by_timeframe(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>> {
        cancellable("find_alerts_by_timeframe", cancel, async {
            let inner = self.lock();
            let mut alerts: Vec<Alert> = inner
                .alerts
                .values()
                .filter(|a| a.timestamp >= start && a.timestamp <= end)
                .cloned()
                .collect();
            alerts.sort_by_key(|a| (a.timestamp, a.id));
            Ok(alerts)
        })
        .await
    }

    fn stream_all_alerts(&self, cancel: CancellationToken) -> AlertStream {
        let db = self.clone();

        Box::pin(async_stream::try_stream! {
            let _cursor = CursorGuard::open(db.open_cursors.clone());
            let mut last: Option<AlertId> = None;

            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let next = {
                    let inner = db.lock();
                    let lower = match last {
                        Some(id) => Bound::Excluded(id),
                        None => Bound::Unbounded,
                    };
                    inner
                        .alerts
                        .range((lower, Bound::Unbounded))
                        .next()
                        .map(|(_, alert)| alert.clone())
                };
                let Some(alert) = next else { break };
                last = alert.id;
                yield alert;
                tokio::task::yield_now().await;
            }
        })
    }

    async fn find_alerts_containing(
        &self,
        query: &CandidateQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>> {
        cancellable("find_alerts_containing", cancel, async {
            let inner = self.lock();
            let mut alerts: Vec<Alert> = inner
                .alerts
                .values()
                .filter(|a| query.matches(a))
                .cloned()
                .collect();
            alerts.sort_by_key(|a| (a.timestamp, a.id));
            Ok(alerts)
        })
        .await
    }

    async fn find_events_by_alert_ids(
        &self,
        alert_ids: &[AlertId],
        cancel: &CancellationToken,
    ) -> Result<Vec<Event>> {
        cancellable("find_events_by_alert_ids", cancel, async {
            let inner = self.lock();
            Ok(inner
                .events
                .values()
                .filter(|e| e.intersects(alert_ids))
                .cloned()
                .collect())
        })
        .await
    }

    async fn upsert_event(&self, event: &Event, cancel: &CancellationToken) -> Result<EventId> {
        const OP: &str = "upsert_event";
        cancellable(OP, cancel, async {
            let mut inner = self.lock();
            match event.id {
                None => {
                    let id = Inner::next_id(&mut inner.next_event);
                    inner.events.insert(id, event.clone().with_id(id));
                    Ok(id)
                }
                Some(id) => match inner.events.get_mut(&id) {
                    Some(stored) => {
                        stored.alert_ids = event.alert_ids.clone();
                        Ok(id)
                    }
                    None => Err(StoreError::constraint(
                        OP,
                        format!("event {id} does not exist"),
                    )),
                },
            }
        })
        .await
    }

    async fn delete_events(&self, ids: &[EventId], cancel: &CancellationToken) -> Result<()> {
        cancellable("delete_events", cancel, async {
            let mut inner = self.lock();
            for id in ids {
                inner.events.remove(id);
            }
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Alert from a registered sender with the given phrases and no sentences.
pub fn alert_at(sender: &str, timestamp: DateTime<Utc>, phrases: &[&str]) -> Alert {
    Alert::new(
        sender,
        format!("https://news.example.com/{}", timestamp.timestamp()),
        timestamp,
    )
    .with_subject(format!("Alert at {timestamp}"))
    .with_top_phrases(phrases.iter().copied())
}
