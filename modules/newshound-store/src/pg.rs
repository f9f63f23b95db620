//! PgAlertDb: alert, sentence and event persistence backed by Postgres.
//!
//! `put_alert` is the only multi-statement write. The alert row is inserted
//! first (its id is needed by the sentences), then the sentences, then the
//! alert's `top_sentence` column is pointed back at the matching sentence.
//! All three happen in one transaction; dropping it on error or cancellation
//! rolls everything back.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use newshound_common::{
    Alert, AlertId, Event, EventId, PhraseSet, SenderId, Sentence, SentenceId, StoreConfig,
};

use crate::db::{cancellable, AlertDb, AlertStream, CandidateQuery};
use crate::error::{Result, StoreError};

const ALERT_COLUMNS: &str = r#"id, sender_id, url, "timestamp", top_phrases, subject, raw_body, body, top_sentence"#;

/// Build a connection pool from configuration.
pub async fn connect(config: &StoreConfig) -> Result<PgPool> {
    config.validate()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| StoreError::from_sqlx("connect", e))?;

    info!(max_connections = config.max_connections, "Connected to alert store");
    Ok(pool)
}

#[derive(Clone)]
pub struct PgAlertDb {
    pool: PgPool,
}

impl PgAlertDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    id: AlertId,
    sender_id: SenderId,
    url: String,
    timestamp: DateTime<Utc>,
    top_phrases: Vec<String>,
    subject: String,
    raw_body: String,
    body: String,
    top_sentence: Option<SentenceId>,
}

impl AlertRow {
    fn into_alert(self) -> Alert {
        Alert {
            id: Some(self.id),
            sender: String::new(),
            sender_id: Some(self.sender_id),
            article_url: self.url,
            timestamp: self.timestamp,
            top_phrases: PhraseSet::from(self.top_phrases),
            tags: PhraseSet::new(),
            subject: self.subject,
            raw_body: self.raw_body,
            body: self.body,
            sentences: Vec::new(),
            top_sentence: String::new(),
            top_sentence_id: self.top_sentence,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SentenceRow {
    id: SentenceId,
    text: String,
    phrases: Vec<String>,
    alert_id: AlertId,
}

impl SentenceRow {
    fn into_sentence(self) -> Sentence {
        Sentence {
            id: Some(self.id),
            alert_id: Some(self.alert_id),
            value: self.text,
            phrases: PhraseSet::from(self.phrases),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: EventId,
    alert_ids: Vec<AlertId>,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event::new(self.alert_ids).with_id(self.id)
    }
}

// ---------------------------------------------------------------------------
// AlertDb
// ---------------------------------------------------------------------------

#[async_trait]
impl AlertDb for PgAlertDb {
    async fn put_alert(&self, alert: &Alert, cancel: &CancellationToken) -> Result<AlertId> {
        const OP: &str = "put_alert";
        let err = |e: sqlx::Error| StoreError::from_sqlx(OP, e);

        cancellable(OP, cancel, async {
            let mut tx = self.pool.begin().await.map_err(err)?;

            let alert_id = sqlx::query_scalar::<_, AlertId>(
                r#"
                INSERT INTO newshound.alert
                    (sender_id, url, "timestamp", top_phrases, subject, raw_body, body)
                VALUES (
                    (SELECT id FROM newshound.sender WHERE lower(name) = lower($1)),
                    $2, $3, $4, $5, $6, $7
                )
                RETURNING id
                "#,
            )
            .bind(&alert.sender)
            .bind(&alert.article_url)
            .bind(alert.timestamp)
            .bind(alert.top_phrases.to_vec())
            .bind(&alert.subject)
            .bind(&alert.raw_body)
            .bind(&alert.body)
            .fetch_one(&mut *tx)
            .await
            .map_err(err)?;

            let top_index = alert.top_sentence_index();
            let mut top_sentence_id = None;
            for (index, sentence) in alert.sentences.iter().enumerate() {
                let sentence_id = sqlx::query_scalar::<_, SentenceId>(
                    r#"
                    INSERT INTO newshound.sentence (text, phrases, alert_id)
                    VALUES ($1, $2, $3)
                    RETURNING id
                    "#,
                )
                .bind(&sentence.value)
                .bind(sentence.phrases.to_vec())
                .bind(alert_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(err)?;

                if top_index == Some(index) {
                    top_sentence_id = Some(sentence_id);
                }
            }

            match top_sentence_id {
                Some(sentence_id) => {
                    sqlx::query("UPDATE newshound.alert SET top_sentence = $1 WHERE id = $2")
                        .bind(sentence_id)
                        .bind(alert_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(err)?;
                }
                None if !alert.top_sentence.is_empty() => warn!(
                    alert_id,
                    sentences = alert.sentences.len(),
                    "No sentence matches the alert's top sentence; leaving reference unset"
                ),
                None => {}
            }

            tx.commit().await.map_err(err)?;

            debug!(alert_id, sentences = alert.sentences.len(), "Stored alert");
            Ok(alert_id)
        })
        .await
    }

    async fn get_alerts_by_id(
        &self,
        ids: &[AlertId],
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>> {
        const OP: &str = "get_alerts_by_id";
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        cancellable(OP, cancel, async {
            let rows = sqlx::query_as::<_, AlertRow>(&format!(
                "SELECT {ALERT_COLUMNS} FROM newshound.alert WHERE id = ANY($1) ORDER BY id"
            ))
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;

            let sentences = sqlx::query_as::<_, SentenceRow>(
                r#"
                SELECT id, text, phrases, alert_id
                FROM newshound.sentence
                WHERE alert_id = ANY($1)
                ORDER BY id
                "#,
            )
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;

            let mut by_alert: HashMap<AlertId, Vec<Sentence>> = HashMap::new();
            for row in sentences {
                by_alert
                    .entry(row.alert_id)
                    .or_default()
                    .push(row.into_sentence());
            }

            Ok(rows
                .into_iter()
                .map(|row| {
                    let mut alert = row.into_alert();
                    if let Some(id) = alert.id {
                        alert.sentences = by_alert.remove(&id).unwrap_or_default();
                    }
                    if let Some(top) = alert
                        .sentences
                        .iter()
                        .find(|s| s.id.is_some() && s.id == alert.top_sentence_id)
                    {
                        alert.top_sentence = top.value.clone();
                    }
                    alert
                })
                .collect())
        })
        .await
    }

    async fn sentences_for_alert(
        &self,
        alert_id: AlertId,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sentence>> {
        const OP: &str = "sentences_for_alert";
        cancellable(OP, cancel, async {
            let rows = sqlx::query_as::<_, SentenceRow>(
                r#"
                SELECT id, text, phrases, alert_id
                FROM newshound.sentence
                WHERE alert_id = $1
                ORDER BY id
                "#,
            )
            .bind(alert_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;

            Ok(rows.into_iter().map(SentenceRow::into_sentence).collect())
        })
        .await
    }

    async fn find_alerts_by_timeframe(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>> {
        const OP: &str = "find_alerts_by_timeframe";
        cancellable(OP, cancel, async {
            let rows = sqlx::query_as::<_, AlertRow>(&format!(
                r#"
                SELECT {ALERT_COLUMNS}
                FROM newshound.alert
                WHERE "timestamp" BETWEEN $1 AND $2
                ORDER BY "timestamp", id
                "#
            ))
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;

            Ok(rows.into_iter().map(AlertRow::into_alert).collect())
        })
        .await
    }

    fn stream_all_alerts(&self, cancel: CancellationToken) -> AlertStream {
        const OP: &str = "stream_all_alerts";
        let pool = self.pool.clone();

        Box::pin(async_stream::try_stream! {
            let sql = format!("SELECT {ALERT_COLUMNS} FROM newshound.alert ORDER BY id");
            let mut rows = sqlx::query_as::<_, AlertRow>(&sql).fetch(&pool);
            let mut streamed = 0u64;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    row = rows.try_next() => Some(row),
                };
                let Some(row) = next else {
                    debug!(streamed, "Alert scan cancelled");
                    break;
                };

                match row.map_err(|e| StoreError::from_sqlx(OP, e))? {
                    Some(row) => {
                        streamed += 1;
                        yield row.into_alert();
                    }
                    None => break,
                }
            }
        })
    }

    async fn find_alerts_containing(
        &self,
        query: &CandidateQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Alert>> {
        const OP: &str = "find_alerts_containing";
        cancellable(OP, cancel, async {
            let rows = sqlx::query_as::<_, AlertRow>(&format!(
                r#"
                SELECT {ALERT_COLUMNS}
                FROM newshound.alert
                WHERE "timestamp" BETWEEN $1 AND $2
                  AND id IS DISTINCT FROM $3
                  AND top_phrases @> $4
                ORDER BY "timestamp", id
                "#
            ))
            .bind(query.start)
            .bind(query.end)
            .bind(query.exclude)
            .bind(query.tags.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;

            Ok(rows.into_iter().map(AlertRow::into_alert).collect())
        })
        .await
    }

    async fn find_events_by_alert_ids(
        &self,
        alert_ids: &[AlertId],
        cancel: &CancellationToken,
    ) -> Result<Vec<Event>> {
        const OP: &str = "find_events_by_alert_ids";
        if alert_ids.is_empty() {
            return Ok(Vec::new());
        }

        cancellable(OP, cancel, async {
            let rows = sqlx::query_as::<_, EventRow>(
                r#"
                SELECT id, alert_ids
                FROM newshound.event
                WHERE alert_ids && $1
                ORDER BY id
                "#,
            )
            .bind(alert_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(OP, e))?;

            Ok(rows.into_iter().map(EventRow::into_event).collect())
        })
        .await
    }

    async fn upsert_event(&self, event: &Event, cancel: &CancellationToken) -> Result<EventId> {
        const OP: &str = "upsert_event";
        cancellable(OP, cancel, async {
            let members = event.alert_id_vec();
            match event.id {
                None => sqlx::query_scalar::<_, EventId>(
                    "INSERT INTO newshound.event (alert_ids) VALUES ($1) RETURNING id",
                )
                .bind(&members)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx(OP, e)),
                Some(id) => {
                    let result =
                        sqlx::query("UPDATE newshound.event SET alert_ids = $2 WHERE id = $1")
                            .bind(id)
                            .bind(&members)
                            .execute(&self.pool)
                            .await
                            .map_err(|e| StoreError::from_sqlx(OP, e))?;

                    if result.rows_affected() == 0 {
                        return Err(StoreError::constraint(
                            OP,
                            format!("event {id} does not exist"),
                        ));
                    }
                    Ok(id)
                }
            }
        })
        .await
    }

    async fn delete_events(&self, ids: &[EventId], cancel: &CancellationToken) -> Result<()> {
        const OP: &str = "delete_events";
        if ids.is_empty() {
            return Ok(());
        }

        cancellable(OP, cancel, async {
            sqlx::query("DELETE FROM newshound.event WHERE id = ANY($1)")
                .bind(ids)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx(OP, e))?;
            Ok(())
        })
        .await
    }
}
