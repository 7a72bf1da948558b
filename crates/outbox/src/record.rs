use chrono::{DateTime, Utc};
use common::AggregateId;
use events::DomainEvent;
use serde::{Deserialize, Serialize};

use crate::{EventId, Result};

/// A domain event as persisted in the outbox, plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxRecord {
    pub id: EventId,
    pub event_type: String,
    pub aggregate_id: Option<AggregateId>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub error: Option<String>,
    /// Insertion order; breaks ties between equal `occurred_at` values.
    pub sequence: i64,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Builds a fresh, unprocessed record for an event.
    ///
    /// `sequence` is assigned by the store on insert.
    pub fn from_event(event: &DomainEvent) -> Result<Self> {
        Ok(Self {
            id: event.id(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id(),
            payload: event.payload().to_json()?,
            occurred_at: event.occurred_at(),
            processed_at: None,
            attempt: 0,
            error: None,
            sequence: 0,
            locked_by: None,
            locked_until: None,
        })
    }

    /// Rebuilds the domain event with its original id and timestamp.
    pub fn to_event(&self) -> Result<DomainEvent> {
        Ok(DomainEvent::restore(
            self.id,
            &self.event_type,
            self.payload.clone(),
            self.occurred_at,
            self.aggregate_id,
        )?)
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Unprocessed and out of attempts.
    pub fn is_dead_letter(&self, max_attempts: u32) -> bool {
        !self.is_processed() && self.attempt >= max_attempts
    }

    /// Eligible for dispatch at `now`: unprocessed, under the attempt cap and not leased.
    pub fn is_pending(&self, max_attempts: u32, now: DateTime<Utc>) -> bool {
        !self.is_processed()
            && self.attempt < max_attempts
            && self.locked_until.is_none_or(|until| until < now)
    }
}
