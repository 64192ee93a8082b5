use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope for a published event.
///
/// Notes:
/// - `sequence_number` is monotonically increasing per publisher (one
///   orchestrator), so subscribers can detect gaps or reorder.
/// - `occurred_at` is wall-clock time at publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    sequence_number: u64,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        sequence_number: u64,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            sequence_number,
            occurred_at,
            payload,
        }
    }

    /// Wrap `payload` with a fresh UUIDv7 and the current time.
    pub fn now(sequence_number: u64, payload: E) -> Self {
        Self::new(Uuid::now_v7(), sequence_number, Utc::now(), payload)
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
