//! EventAggregator: folds matched alerts into events.
//!
//! For one alert and its candidates, the events touching any of them decide
//! what happens:
//! - **none**: a new event is created from the alert plus its candidates
//!   (nothing is created when there are no candidates either);
//! - **one**: the alert and any unclustered candidates join that event
//!   (no write when they are all members already);
//! - **several**: the lowest event id survives with the union of every
//!   membership, and the others are deleted.
//!
//! The survivor is upserted before the others are deleted. A failure between
//! the two leaves an alert in two events until the reconciliation pass folds
//! them back together.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use newshound_common::{Alert, AlertId, Event, EventId};

use crate::db::AlertDb;
use crate::error::Result;

/// What the aggregator did with an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No candidates and no existing event; the alert stays on its own.
    Unclustered,
    Created(EventId),
    Joined(EventId),
    /// The alert and its candidates were already members of this event.
    Unchanged(EventId),
    Merged {
        survivor: EventId,
        retired: Vec<EventId>,
    },
}

impl Resolution {
    /// The event the alert ended up in, if any.
    pub fn event_id(&self) -> Option<EventId> {
        match self {
            Resolution::Unclustered => None,
            Resolution::Created(id) | Resolution::Joined(id) | Resolution::Unchanged(id) => {
                Some(*id)
            }
            Resolution::Merged { survivor, .. } => Some(*survivor),
        }
    }
}

#[derive(Clone)]
pub struct EventAggregator {
    db: Arc<dyn AlertDb>,
}

impl EventAggregator {
    pub fn new(db: Arc<dyn AlertDb>) -> Self {
        Self { db }
    }

    pub async fn resolve(
        &self,
        alert_id: AlertId,
        candidates: &[Alert],
        cancel: &CancellationToken,
    ) -> Result<Resolution> {
        let candidate_ids: BTreeSet<AlertId> = candidates
            .iter()
            .filter_map(|c| c.id)
            .filter(|id| *id != alert_id)
            .collect();

        // The alert itself is looked up too so a re-run (reconciliation) sees
        // the event it already belongs to.
        let mut lookup: Vec<AlertId> = Vec::with_capacity(candidate_ids.len() + 1);
        lookup.push(alert_id);
        lookup.extend(candidate_ids.iter().copied());

        let mut found = self.db.find_events_by_alert_ids(&lookup, cancel).await?;
        found.sort_by_key(|e| e.id);

        match found.len() {
            0 if candidate_ids.is_empty() => {
                debug!(alert_id, "No candidates; alert left unclustered");
                Ok(Resolution::Unclustered)
            }
            0 => {
                let event = Event::new(lookup.iter().copied());
                let id = self.db.upsert_event(&event, cancel).await?;
                info!(alert_id, event_id = id, members = event.alert_ids.len(), "Created event");
                Ok(Resolution::Created(id))
            }
            1 => {
                let mut event = found.remove(0);
                let before = event.alert_ids.len();
                event.alert_ids.extend(lookup.iter().copied());

                if let Some(id) = event.id.filter(|_| event.alert_ids.len() == before) {
                    debug!(alert_id, event_id = id, "Event membership already complete");
                    return Ok(Resolution::Unchanged(id));
                }

                let id = self.db.upsert_event(&event, cancel).await?;
                info!(alert_id, event_id = id, members = event.alert_ids.len(), "Joined event");
                Ok(Resolution::Joined(id))
            }
            _ => {
                let mut survivor = found.remove(0);
                let retired: Vec<EventId> = found.iter().filter_map(|e| e.id).collect();
                for event in &found {
                    survivor.alert_ids.extend(event.alert_ids.iter().copied());
                }
                survivor.alert_ids.extend(lookup.iter().copied());

                let id = self.db.upsert_event(&survivor, cancel).await?;
                self.db.delete_events(&retired, cancel).await?;

                info!(
                    alert_id,
                    event_id = id,
                    retired = retired.len(),
                    members = survivor.alert_ids.len(),
                    "Merged events"
                );
                Ok(Resolution::Merged {
                    survivor: id,
                    retired,
                })
            }
        }
    }
}
