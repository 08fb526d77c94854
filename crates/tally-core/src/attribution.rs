//! Deferred attribution: merging late-arriving properties into the most
//! recent pending event of a type.
//!
//! A `failed` record whose retry time has passed is pending again and can be
//! a target. Only the single latest pending record is touched, and only
//! while it is fresh: its timestamp must lie within the session timeout of
//! `now`. Stale or missing targets make the merge a no-op; the attribution
//! is lost.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::event_type::EventType;
use crate::store::{EventStore, StoreError};
use crate::types::EventId;
use crate::value::Properties;

/// What a deferred merge did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(EventId),
    /// No pending event of the type exists (or it vanished mid-merge).
    NoTarget,
    /// The latest pending event is older than the freshness window.
    Stale(EventId),
}

impl MergeOutcome {
    pub const fn is_merged(&self) -> bool {
        matches!(self, Self::Merged(_))
    }
}

/// Merges deferred properties into the latest pending event of a type.
#[derive(Debug, Clone, Copy)]
pub struct AttributionMerger {
    window: Duration,
}

impl AttributionMerger {
    pub const fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Applies `properties` to the latest pending `event_type` record if it
    /// is still fresh at `now`.
    ///
    /// Only storage failures are returned as errors; a record flushed
    /// between lookup and update is reported as [`MergeOutcome::NoTarget`].
    pub fn apply(
        &self,
        store: &dyn EventStore,
        event_type: &EventType,
        properties: &Properties,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, StoreError> {
        let Some(target) = store.query_latest_pending(event_type, now)? else {
            debug!(%event_type, "no pending event for deferred properties");
            return Ok(MergeOutcome::NoTarget);
        };

        let age = now.signed_duration_since(target.timestamp);
        if age > self.window {
            debug!(
                event_id = %target.id,
                %event_type,
                age_ms = age.num_milliseconds(),
                "deferred properties arrived after freshness window"
            );
            return Ok(MergeOutcome::Stale(target.id));
        }

        match store.update(&target.id, properties) {
            Ok(()) => {
                debug!(event_id = %target.id, %event_type, keys = properties.len(), "merged deferred properties");
                Ok(MergeOutcome::Merged(target.id))
            }
            Err(err @ (StoreError::NotFound(_) | StoreError::Conflict { .. })) => {
                debug!(event_id = %target.id, error = %err, "merge target claimed before update");
                Ok(MergeOutcome::NoTarget)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::event::{CustomerIds, NewEvent};
    use crate::memory::MemoryStore;
    use crate::types::ProjectToken;

    fn insert(store: &MemoryStore, event_type: EventType, order: i64, at: DateTime<Utc>) -> EventId {
        store
            .insert(
                NewEvent::new(
                    ProjectToken::new("token").unwrap(),
                    CustomerIds::new(),
                    event_type,
                    Properties::new().insert("order", order),
                )
                .at(at),
            )
            .unwrap()
            .id
    }

    fn utm() -> Properties {
        Properties::new().insert("utm_campaign", "mycampaign")
    }

    #[test]
    fn missing_target_is_a_no_op() {
        let store = MemoryStore::new();
        let merger = AttributionMerger::new(Duration::seconds(6));
        let outcome = merger
            .apply(&store, &EventType::SessionStart, &utm(), Utc::now())
            .unwrap();
        assert_eq!(outcome, MergeOutcome::NoTarget);
    }

    #[test]
    fn only_latest_event_of_type_gains_properties() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for order in 1..=3 {
            insert(&store, EventType::SessionEnd, order, now);
        }
        insert(&store, EventType::Payment, 4, now);

        let merger = AttributionMerger::new(Duration::seconds(6));
        let outcome = merger
            .apply(&store, &EventType::SessionEnd, &utm(), now)
            .unwrap();
        assert!(outcome.is_merged());

        for event in store.query_all().unwrap() {
            let order = event.properties.get("order").and_then(|v| v.as_f64());
            let merged = event.properties.contains_key("utm_campaign");
            assert_eq!(merged, order == Some(3.0), "event {order:?}");
        }
    }

    #[test]
    fn stale_target_is_left_untouched() {
        let store = MemoryStore::new();
        let started = Utc::now();
        let id = insert(&store, EventType::SessionStart, 1, started);

        let merger = AttributionMerger::new(Duration::seconds(6));
        let outcome = merger
            .apply(
                &store,
                &EventType::SessionStart,
                &utm(),
                started + Duration::seconds(7),
            )
            .unwrap();

        assert_eq!(outcome, MergeOutcome::Stale(id));
        assert!(
            !store.query_all().unwrap()[0]
                .properties
                .contains_key("utm_campaign")
        );
    }

    #[test]
    fn fresh_target_gains_properties() {
        let store = MemoryStore::new();
        let started = Utc::now();
        insert(&store, EventType::SessionStart, 1, started);

        let merger = AttributionMerger::new(Duration::seconds(6));
        merger
            .apply(
                &store,
                &EventType::SessionStart,
                &utm(),
                started + Duration::seconds(2),
            )
            .unwrap();

        let stored = &store.query_all().unwrap()[0];
        assert_eq!(
            stored.properties.get("utm_campaign").and_then(|v| v.as_str()),
            Some("mycampaign")
        );
    }

    proptest! {
        #[test]
        fn merge_targets_greatest_sequence(types in proptest::collection::vec(0_u8..3, 1..20)) {
            let store = MemoryStore::new();
            let now = Utc::now();
            let kinds = [EventType::SessionStart, EventType::SessionEnd, EventType::Payment];
            for (order, kind) in types.iter().enumerate() {
                insert(&store, kinds[usize::from(*kind)].clone(), i64::try_from(order).unwrap(), now);
            }

            let merger = AttributionMerger::new(Duration::seconds(6));
            let outcome = merger.apply(&store, &EventType::SessionEnd, &utm(), now).unwrap();

            let events = store.query_all().unwrap();
            let expected = events
                .iter()
                .filter(|event| event.event_type == EventType::SessionEnd)
                .max_by_key(|event| event.created_at)
                .map(|event| event.id.clone());

            match expected {
                Some(id) => prop_assert_eq!(&outcome, &MergeOutcome::Merged(id)),
                None => prop_assert_eq!(&outcome, &MergeOutcome::NoTarget),
            }
            for event in &events {
                let merged = event.properties.contains_key("utm_campaign");
                let is_target = matches!(&outcome, MergeOutcome::Merged(id) if *id == event.id);
                prop_assert_eq!(merged, is_target);
            }
        }
    }

    #[test]
    fn failed_target_due_for_retry_gains_properties() {
        let store = MemoryStore::new();
        let started = Utc::now();
        let id = insert(&store, EventType::SessionStart, 1, started);
        store.mark_in_flight(&id).unwrap();
        store.mark_failed(&id, "503", started).unwrap();

        let merger = AttributionMerger::new(Duration::seconds(6));
        let outcome = merger
            .apply(
                &store,
                &EventType::SessionStart,
                &utm(),
                started + Duration::seconds(2),
            )
            .unwrap();

        assert_eq!(outcome, MergeOutcome::Merged(id));
        assert!(
            store.query_all().unwrap()[0]
                .properties
                .contains_key("utm_campaign")
        );
    }
}
