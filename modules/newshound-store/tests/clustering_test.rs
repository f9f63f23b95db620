//! Matcher, EventAggregator, Ingestor and Reconciler over the in-memory store.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use newshound_common::{AlertId, Event};
use newshound_store::testing::{alert_at, MemoryAlertDb};
use newshound_store::{
    AlertDb, EventAggregator, Ingestor, Matcher, ReconcileStats, Reconciler, Resolution,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn window() -> Duration {
    Duration::hours(4)
}

fn setup() -> (MemoryAlertDb, Arc<dyn AlertDb>) {
    let mem = MemoryAlertDb::new().with_sender("nyt");
    let db: Arc<dyn AlertDb> = Arc::new(mem.clone());
    (mem, db)
}

async fn put(db: &Arc<dyn AlertDb>, at: DateTime<Utc>, phrases: &[&str]) -> AlertId {
    db.put_alert(&alert_at("nyt", at, phrases), &CancellationToken::new())
        .await
        .unwrap()
}

fn ids(events: &[Event]) -> Vec<Vec<AlertId>> {
    events.iter().map(|e| e.alert_id_vec()).collect()
}

// =========================================================================
// Matcher
// =========================================================================

#[tokio::test]
async fn candidates_must_contain_every_tag() {
    let (_, db) = setup();
    let cancel = CancellationToken::new();
    let superset = put(&db, t0(), &["p1", "p2"]).await;
    let _subset = put(&db, t0(), &["p2"]).await;

    let matcher = Matcher::new(db.clone(), window());
    let mut incoming = alert_at("nyt", t0() + Duration::minutes(10), &["p1", "p2", "p3"])
        .with_tags(["p1", "p2"]);
    incoming.id = Some(put(&db, incoming.timestamp, &["p1", "p2", "p3"]).await);

    let found = matcher.find_candidates(&incoming, &cancel).await.unwrap();
    let found: Vec<_> = found.iter().map(|a| a.id.unwrap()).collect();
    assert_eq!(found, vec![superset]);
}

#[tokio::test]
async fn candidates_never_include_the_alert_itself() {
    let (_, db) = setup();
    let cancel = CancellationToken::new();
    let id = put(&db, t0(), &["p1"]).await;

    let stored = db.get_alerts_by_id(&[id], &cancel).await.unwrap().remove(0);
    let found = Matcher::new(db.clone(), window())
        .find_candidates(&stored, &cancel)
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn candidates_respect_the_window_edges() {
    let (_, db) = setup();
    let cancel = CancellationToken::new();
    let at_lower = put(&db, t0() - window(), &["p1"]).await;
    let _too_early = put(&db, t0() - window() - Duration::seconds(1), &["p1"]).await;
    let at_upper = put(&db, t0() + window(), &["p1"]).await;
    let _too_late = put(&db, t0() + window() + Duration::seconds(1), &["p1"]).await;

    let incoming = alert_at("nyt", t0(), &["p1"]);
    let found = Matcher::new(db.clone(), window())
        .find_candidates(&incoming, &cancel)
        .await
        .unwrap();
    let found: Vec<_> = found.iter().map(|a| a.id.unwrap()).collect();
    assert_eq!(found, vec![at_lower, at_upper]);
}

#[tokio::test]
async fn candidates_are_ordered_by_timestamp() {
    let (_, db) = setup();
    let cancel = CancellationToken::new();
    let later = put(&db, t0() + Duration::hours(1), &["p1"]).await;
    let earlier = put(&db, t0() - Duration::hours(1), &["p1"]).await;

    let incoming = alert_at("nyt", t0(), &["p1"]);
    let found = Matcher::new(db.clone(), window())
        .find_candidates(&incoming, &cancel)
        .await
        .unwrap();
    let found: Vec<_> = found.iter().map(|a| a.id.unwrap()).collect();
    assert_eq!(found, vec![earlier, later]);
}

// =========================================================================
// EventAggregator
// =========================================================================

#[tokio::test]
async fn no_candidates_creates_nothing() {
    let (mem, db) = setup();
    let cancel = CancellationToken::new();
    let a = put(&db, t0(), &["p1"]).await;

    let resolution = EventAggregator::new(db.clone())
        .resolve(a, &[], &cancel)
        .await
        .unwrap();

    assert_eq!(resolution, Resolution::Unclustered);
    assert_eq!(resolution.event_id(), None);
    assert_eq!(mem.event_count(), 0);
}

#[tokio::test]
async fn single_event_absorbs_the_alert() {
    let (mem, db) = setup();
    let cancel = CancellationToken::new();
    let a = put(&db, t0(), &["p1"]).await;
    let b = put(&db, t0(), &["p1"]).await;
    let c = put(&db, t0(), &["p1"]).await;
    let event_id = db.upsert_event(&Event::new([a, b]), &cancel).await.unwrap();

    let candidates = db.get_alerts_by_id(&[a, b], &cancel).await.unwrap();
    let resolution = EventAggregator::new(db.clone())
        .resolve(c, &candidates, &cancel)
        .await
        .unwrap();

    assert_eq!(resolution, Resolution::Joined(event_id));
    assert_eq!(ids(&mem.events()), vec![vec![a, b, c]]);
}

#[tokio::test]
async fn complete_event_is_left_unchanged() {
    let (mem, db) = setup();
    let cancel = CancellationToken::new();
    let a = put(&db, t0(), &["p1"]).await;
    let b = put(&db, t0(), &["p1"]).await;
    let event_id = db.upsert_event(&Event::new([a, b]), &cancel).await.unwrap();

    let candidates = db.get_alerts_by_id(&[a], &cancel).await.unwrap();
    let resolution = EventAggregator::new(db.clone())
        .resolve(b, &candidates, &cancel)
        .await
        .unwrap();

    assert_eq!(resolution, Resolution::Unchanged(event_id));
    assert_eq!(resolution.event_id(), Some(event_id));
    assert_eq!(ids(&mem.events()), vec![vec![a, b]]);
}

#[tokio::test]
async fn multiple_events_merge_into_the_lowest_id() {
    let (mem, db) = setup();
    let cancel = CancellationToken::new();
    let a = put(&db, t0(), &["p1"]).await;
    let b = put(&db, t0(), &["p1"]).await;
    let c = put(&db, t0(), &["p1"]).await;
    let d = put(&db, t0(), &["p1"]).await;
    let e = put(&db, t0(), &["p1"]).await;
    let first = db.upsert_event(&Event::new([a, b]), &cancel).await.unwrap();
    let second = db.upsert_event(&Event::new([c, d]), &cancel).await.unwrap();

    let candidates = db.get_alerts_by_id(&[b, c], &cancel).await.unwrap();
    let resolution = EventAggregator::new(db.clone())
        .resolve(e, &candidates, &cancel)
        .await
        .unwrap();

    assert_eq!(
        resolution,
        Resolution::Merged {
            survivor: first,
            retired: vec![second],
        }
    );
    assert_eq!(ids(&mem.events()), vec![vec![a, b, c, d, e]]);
    assert!(db
        .find_events_by_alert_ids(&[c], &cancel)
        .await
        .unwrap()
        .iter()
        .all(|ev| ev.id == Some(first)));
}

// =========================================================================
// Ingestor
// =========================================================================

#[tokio::test]
async fn end_to_end_two_alerts_form_an_event() {
    let (mem, db) = setup();
    let cancel = CancellationToken::new();
    let ingestor = Ingestor::new(db.clone(), window());

    // A: phrases {p1, p2} at T.
    let a = ingestor
        .ingest(alert_at("nyt", t0(), &["p1", "p2"]), &cancel)
        .await
        .unwrap();
    assert_eq!(a.resolution, Resolution::Unclustered);
    assert!(db
        .find_events_by_alert_ids(&[a.alert_id], &cancel)
        .await
        .unwrap()
        .is_empty());

    // B: tags {p1} at T + 10min.
    let b_alert = alert_at("nyt", t0() + Duration::minutes(10), &["p1", "p3"]).with_tags(["p1"]);
    let candidates = ingestor
        .matcher()
        .find_candidates(&b_alert, &cancel)
        .await
        .unwrap();
    let candidate_ids: Vec<_> = candidates.iter().map(|c| c.id).collect();
    assert_eq!(candidate_ids, vec![Some(a.alert_id)]);

    let b = ingestor.ingest(b_alert, &cancel).await.unwrap();
    assert_eq!(b.candidates, vec![a.alert_id]);
    let Resolution::Created(event_id) = b.resolution else {
        panic!("expected a new event, got {:?}", b.resolution);
    };

    let events = db.find_events_by_alert_ids(&[a.alert_id], &cancel).await.unwrap();
    assert_eq!(events, vec![Event::new([a.alert_id, b.alert_id]).with_id(event_id)]);
    assert_eq!(mem.event_count(), 1);
}

#[tokio::test]
async fn every_alert_ends_in_at_most_one_event() {
    let (mem, db) = setup();
    let cancel = CancellationToken::new();
    let ingestor = Ingestor::new(db.clone(), window());

    let alerts = [
        alert_at("nyt", t0(), &["quake", "chile"]),
        alert_at("nyt", t0(), &["vote", "senate"]),
        alert_at("nyt", t0() + Duration::minutes(5), &["quake", "chile", "tsunami"])
            .with_tags(["quake"]),
        alert_at("nyt", t0() + Duration::minutes(7), &["vote", "senate"]).with_tags(["senate"]),
        alert_at("nyt", t0() + Duration::minutes(9), &["chile"]).with_tags(["chile"]),
    ];
    for alert in alerts {
        ingestor.ingest(alert, &cancel).await.unwrap();
    }

    let events = mem.events();
    let mut seen = std::collections::HashSet::new();
    for event in &events {
        for id in &event.alert_ids {
            assert!(seen.insert(*id), "alert {id} is in more than one event");
        }
    }
    assert_eq!(events.len(), 2);
}

// =========================================================================
// Reconciler
// =========================================================================

#[tokio::test]
async fn reconcile_merges_events_split_by_concurrent_ingestion() {
    let (mem, db) = setup();
    let cancel = CancellationToken::new();
    let a = put(&db, t0(), &["p1", "p2"]).await;
    let b = put(&db, t0() + Duration::minutes(1), &["p1", "p2"]).await;
    let c = put(&db, t0() + Duration::minutes(2), &["p1", "p2"]).await;
    // Two ingestions that raced: each saw only part of the picture.
    db.upsert_event(&Event::new([a, b]), &cancel).await.unwrap();
    db.upsert_event(&Event::new([c]), &cancel).await.unwrap();

    let stats = Reconciler::new(db.clone(), window()).run(&cancel).await.unwrap();

    assert_eq!(stats.alerts_scanned, 3);
    assert_eq!(stats.events_merged, 1);
    assert_eq!(stats.events_retired, 1);
    // After the merge on `a`, `b` and `c` find nothing left to repair.
    assert_eq!(stats.events_joined, 0);
    assert_eq!(stats.unchanged, 2);
    assert!(!stats.cancelled);
    assert_eq!(ids(&mem.events()), vec![vec![a, b, c]]);
}

#[tokio::test]
async fn reconcile_on_empty_store_does_nothing() {
    let (_, db) = setup();
    let stats = Reconciler::new(db, window())
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats, ReconcileStats::default());
}

#[tokio::test]
async fn cancelled_reconcile_returns_partial_stats() {
    let (mem, db) = setup();
    put(&db, t0(), &["p1"]).await;
    put(&db, t0(), &["p1"]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let stats = Reconciler::new(db, window()).run(&cancel).await.unwrap();

    assert!(stats.cancelled);
    assert_eq!(stats.alerts_scanned, 0);
    assert_eq!(mem.open_cursors(), 0);
    assert!(stats.to_string().contains("[cancelled]"));
}
