//! Alert persistence and event clustering for newshound.
//!
//! Alerts are written atomically together with their sentences, matched
//! against recent alerts by keyphrase containment, and folded into events.
//! Everything that touches storage goes through [`AlertDb`]; [`PgAlertDb`] is
//! the Postgres backend and [`testing::MemoryAlertDb`] the in-memory one.

pub mod aggregator;
pub mod db;
pub mod error;
pub mod ingest;
pub mod matcher;
pub mod pg;
pub mod reconcile;
pub mod testing;

pub use aggregator::{EventAggregator, Resolution};
pub use db::{AlertDb, AlertStream, CandidateQuery};
pub use error::{Result, StoreError};
pub use ingest::{IngestOutcome, Ingestor};
pub use matcher::Matcher;
pub use pg::{connect, PgAlertDb};
pub use reconcile::{ReconcileStats, Reconciler};
