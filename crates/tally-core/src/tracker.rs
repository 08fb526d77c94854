//! The public tracking surface.
//!
//! A [`Tracker`] ties one project token, an [`EventStore`] and a
//! [`Transport`] together with the session, attribution, flush and token
//! rotation logic. It is cheap to clone and safe to share across tasks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::attribution::{AttributionMerger, MergeOutcome};
use crate::campaign::CampaignData;
use crate::config::{FlushMode, TrackerConfig};
use crate::error::TrackError;
use crate::event::{CustomerIds, EventRecord, NewEvent};
use crate::event_type::EventType;
use crate::flush::{FlushController, FlushReport};
use crate::rotation::TokenRotation;
use crate::session::{SessionManager, SessionSnapshot, SessionState, StartDecision};
use crate::store::EventStore;
use crate::transport::Transport;
use crate::types::ProjectToken;
use crate::value::Properties;

/// Tracker state that outlives a single process: session continuation data
/// and the default customer identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerState {
    #[serde(default)]
    pub sessions: SessionSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_ids: Option<CustomerIds>,
}

struct TrackerInner {
    config: TrackerConfig,
    project_token: ProjectToken,
    store: Arc<dyn EventStore>,
    sessions: SessionManager,
    merger: AttributionMerger,
    flush: FlushController,
    rotation: TokenRotation,
    customer_ids: RwLock<CustomerIds>,
}

#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("project_token", &self.inner.project_token)
            .field("flush_mode", &self.inner.config.flush_mode)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Creates a tracker with fresh session state and an anonymous identity.
    ///
    /// In periodic mode the flush timer starts right away if a Tokio runtime
    /// is running.
    pub fn new(
        config: TrackerConfig,
        store: Arc<dyn EventStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, TrackError> {
        Self::restore(config, store, transport, TrackerState::default())
    }

    /// Creates a tracker that continues from previously saved state.
    pub fn restore(
        config: TrackerConfig,
        store: Arc<dyn EventStore>,
        transport: Arc<dyn Transport>,
        state: TrackerState,
    ) -> Result<Self, TrackError> {
        let project_token = ProjectToken::new(config.project_token.clone())?;
        let timeout = config.session_timeout();
        let flush = FlushController::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            config.retry_policy(),
        );
        let tracker = Self {
            inner: Arc::new(TrackerInner {
                project_token,
                store,
                sessions: SessionManager::from_snapshot(timeout, state.sessions),
                merger: AttributionMerger::new(timeout),
                flush,
                rotation: TokenRotation::new(transport),
                customer_ids: RwLock::new(state.customer_ids.unwrap_or_else(CustomerIds::anonymous)),
                config,
            }),
        };
        if tracker.inner.config.flush_mode == FlushMode::Periodic {
            tracker.start_periodic_flush();
        }
        Ok(tracker)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn project_token(&self) -> &ProjectToken {
        &self.inner.project_token
    }

    pub fn customer_ids(&self) -> CustomerIds {
        self.inner.customer_ids.read().clone()
    }

    /// Replaces the identity used by session, campaign and payment events.
    pub fn identify(&self, customer_ids: CustomerIds) {
        *self.inner.customer_ids.write() = customer_ids;
    }

    pub fn state(&self) -> TrackerState {
        TrackerState {
            sessions: self.inner.sessions.snapshot(),
            customer_ids: Some(self.customer_ids()),
        }
    }

    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.inner.sessions.snapshot()
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.sessions.state(&self.inner.project_token)
    }

    /// Forgets the current session, as on app teardown.
    pub fn clear_session(&self) {
        self.inner.sessions.clear(&self.inner.project_token);
    }

    /// Records an event for `customer_ids`. A missing timestamp means now.
    pub fn track(
        &self,
        event_type: EventType,
        properties: Properties,
        customer_ids: CustomerIds,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<EventRecord, TrackError> {
        let mut event = NewEvent::new(
            self.inner.project_token.clone(),
            customer_ids,
            event_type,
            properties,
        );
        event.timestamp = timestamp;
        self.record(event)
    }

    fn track_default(
        &self,
        event_type: EventType,
        properties: Properties,
        timestamp: DateTime<Utc>,
    ) -> Result<EventRecord, TrackError> {
        self.track(event_type, properties, self.customer_ids(), Some(timestamp))
    }

    fn record(&self, event: NewEvent) -> Result<EventRecord, TrackError> {
        let record = self.inner.store.insert(event)?;
        debug!(event_id = %record.id, event_type = %record.event_type, "tracked event");
        if self.inner.config.flush_mode == FlushMode::Immediate {
            self.inner.flush.deliver_in_background(record.id.clone());
        }
        Ok(record)
    }

    /// Applies a session start signal. Returns the new `session_start`
    /// record, or `None` when the previous session continues.
    pub fn track_session_start(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<EventRecord>, TrackError> {
        match self.inner.sessions.start(&self.inner.project_token, now) {
            StartDecision::New { started_at } => {
                let properties = Properties::new().insert("is_new_session", true);
                self.track_default(EventType::SessionStart, properties, started_at)
                    .map(Some)
            }
            StartDecision::Continued { started_at } => {
                debug!(%started_at, "session continued");
                Ok(None)
            }
        }
    }

    /// Applies a session end signal. A `session_end` event is recorded even
    /// when no session was active; it carries `duration` in seconds when the
    /// session start is known.
    pub fn track_session_end(&self, now: DateTime<Utc>) -> Result<EventRecord, TrackError> {
        let decision = self.inner.sessions.end(&self.inner.project_token, now);
        let mut properties = Properties::new();
        match decision.duration {
            Some(duration) => {
                #[expect(
                    clippy::cast_precision_loss,
                    reason = "session lengths are far below f64's exact integer range"
                )]
                let secs = duration.num_milliseconds() as f64 / 1000.0;
                properties.set("duration", secs);
            }
            None => debug!("session end without an active session"),
        }
        self.track_default(EventType::SessionEnd, properties, now)
    }

    /// Merges `properties` into the latest pending `event_type` record if it
    /// is still within the session timeout of `now`.
    pub fn apply_deferred_properties(
        &self,
        event_type: &EventType,
        properties: &Properties,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, TrackError> {
        let outcome = self
            .inner
            .merger
            .apply(self.inner.store.as_ref(), event_type, properties, now)?;
        if let MergeOutcome::Stale(id) = &outcome {
            warn!(event_id = %id, %event_type, "deferred properties arrived too late, discarding");
        }
        Ok(outcome)
    }

    /// Records a campaign link open.
    ///
    /// The link's `utm*` parameters are attributed to the current
    /// `session_start` and a `campaign_click` event is recorded.
    pub fn track_campaign_click(
        &self,
        url: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<EventRecord, TrackError> {
        let campaign = CampaignData::parse(url)?;
        let now = timestamp.unwrap_or_else(Utc::now);

        let utm = campaign.utm_properties();
        if !utm.is_empty() {
            self.apply_deferred_properties(&EventType::SessionStart, &utm, now)?;
        }

        let properties = campaign.click_properties(&self.inner.config.platform);
        self.track_default(EventType::CampaignClick, properties, now)
    }

    pub fn track_payment(
        &self,
        properties: Properties,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<EventRecord, TrackError> {
        self.track_default(
            EventType::Payment,
            properties,
            timestamp.unwrap_or_else(Utc::now),
        )
    }

    /// Every stored record, oldest first.
    pub fn events(&self) -> Result<Vec<EventRecord>, TrackError> {
        Ok(self.inner.store.query_all()?)
    }

    pub async fn flush(&self) -> Result<FlushReport, TrackError> {
        Ok(self.inner.flush.flush().await?)
    }

    /// Rotates `token` through the collector and returns its replacement.
    ///
    /// Records already queued keep the token they were tracked with.
    pub async fn rotate_token(&self, token: &ProjectToken) -> Result<ProjectToken, TrackError> {
        self.inner.rotation.rotate(token).await
    }

    pub async fn revoke_token(&self, token: &ProjectToken) -> Result<(), TrackError> {
        self.inner.rotation.revoke(token).await
    }

    pub fn start_periodic_flush(&self) -> bool {
        self.inner
            .flush
            .start_periodic(self.inner.config.flush_period())
    }

    pub async fn stop_periodic_flush(&self) {
        self.inner.flush.stop_periodic().await;
    }

    /// Stops the periodic timer and waits for outstanding immediate-mode
    /// deliveries.
    pub async fn shutdown(&self) {
        self.inner.flush.stop_periodic().await;
        self.inner.flush.wait_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::event::EventStatus;
    use crate::memory::MemoryStore;
    use crate::transport::TransportError;
    use crate::value::PropertyValue;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<EventRecord>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, event: &EventRecord) -> Result<(), TransportError> {
            self.sent.lock().push(event.clone());
            Ok(())
        }

        async fn rotate_token(&self, token: &ProjectToken) -> Result<String, TransportError> {
            Ok(format!("{token}-rotated"))
        }

        async fn revoke_token(&self, _token: &ProjectToken) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn config(flush_mode: FlushMode) -> TrackerConfig {
        TrackerConfig {
            project_token: "project".to_string(),
            session_timeout_secs: 6.0,
            flush_mode,
            flush_period_secs: 1,
            ..TrackerConfig::default()
        }
    }

    fn tracker(flush_mode: FlushMode) -> (Tracker, Arc<MemoryStore>, Arc<RecordingTransport>) {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::default());
        let tracker = Tracker::new(
            config(flush_mode),
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .unwrap();
        (tracker, store, transport)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn count(store: &MemoryStore, event_type: &EventType) -> usize {
        store
            .query_all()
            .unwrap()
            .iter()
            .filter(|event| &event.event_type == event_type)
            .count()
    }

    #[test]
    fn blank_project_token_is_rejected() {
        let err = Tracker::new(
            TrackerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingTransport::default()),
        )
        .unwrap_err();
        assert!(matches!(err, TrackError::Validation(_)));
    }

    #[test]
    fn session_start_within_timeout_continues() {
        let (tracker, store, _) = tracker(FlushMode::Manual);

        let first = tracker.track_session_start(at(0)).unwrap().unwrap();
        assert_eq!(
            first.properties.get("is_new_session"),
            Some(&PropertyValue::Bool(true))
        );
        tracker.track_session_end(at(10)).unwrap();

        assert!(tracker.track_session_start(at(15)).unwrap().is_none());
        assert_eq!(count(&store, &EventType::SessionStart), 1);

        tracker.track_session_end(at(20)).unwrap();
        assert!(tracker.track_session_start(at(27)).unwrap().is_some());
        assert_eq!(count(&store, &EventType::SessionStart), 2);
    }

    #[test]
    fn session_end_carries_duration() {
        let (tracker, _, _) = tracker(FlushMode::Manual);
        tracker.track_session_start(at(0)).unwrap();
        let end = tracker
            .track_session_end(at(0) + chrono::Duration::milliseconds(2500))
            .unwrap();
        assert_eq!(end.properties.get("duration"), Some(&PropertyValue::Float(2.5)));
    }

    #[test]
    fn session_end_without_start_records_one_event() {
        let (tracker, store, _) = tracker(FlushMode::Manual);
        let end = tracker.track_session_end(at(0)).unwrap();

        assert!(!end.properties.contains_key("duration"));
        assert_eq!(count(&store, &EventType::SessionEnd), 1);
        assert_eq!(store.query_all().unwrap().len(), 1);
    }

    #[test]
    fn campaign_click_attributes_fresh_session_start() {
        let (tracker, store, _) = tracker(FlushMode::Manual);
        let start = tracker.track_session_start(at(0)).unwrap().unwrap();

        tracker
            .track_campaign_click(
                "https://example.com/promo?utm_campaign=mycampaign&utm_source=mail&ref=x",
                Some(at(2)),
            )
            .unwrap();

        let events = store.query_all().unwrap();
        let session = events.iter().find(|event| event.id == start.id).unwrap();
        assert_eq!(
            session.properties.get("utm_campaign").and_then(PropertyValue::as_str),
            Some("mycampaign")
        );
        assert!(!session.properties.contains_key("ref"));

        let click = events
            .iter()
            .find(|event| event.event_type == EventType::CampaignClick)
            .unwrap();
        assert_eq!(click.timestamp, at(2));
        assert!(click.properties.contains_key("url"));
    }

    #[test]
    fn late_campaign_click_leaves_session_start_untouched() {
        let (tracker, store, _) = tracker(FlushMode::Manual);
        tracker.track_session_start(at(0)).unwrap();

        tracker
            .track_campaign_click("https://example.com/?utm_campaign=mycampaign", Some(at(7)))
            .unwrap();

        let session = store
            .query_latest_pending(&EventType::SessionStart, at(7))
            .unwrap()
            .unwrap();
        assert!(!session.properties.contains_key("utm_campaign"));
        assert_eq!(count(&store, &EventType::CampaignClick), 1);
    }

    #[test]
    fn invalid_campaign_url_is_an_error() {
        let (tracker, store, _) = tracker(FlushMode::Manual);
        let err = tracker.track_campaign_click("::nope::", None).unwrap_err();
        assert!(matches!(err, TrackError::InvalidUrl(_)));
        assert!(store.query_all().unwrap().is_empty());
    }

    #[test]
    fn identify_applies_to_later_events() {
        let (tracker, _, _) = tracker(FlushMode::Manual);
        assert!(tracker.customer_ids().get("cookie").is_some());

        tracker.identify(CustomerIds::new().with("registered", "jane@example.com"));
        let payment = tracker
            .track_payment(Properties::new().insert("total_price", 9.99), None)
            .unwrap();

        assert_eq!(payment.event_type, EventType::Payment);
        assert_eq!(payment.customer_ids.get("registered"), Some("jane@example.com"));
    }

    #[test]
    fn restored_state_keeps_continuation_and_identity() {
        let (tracker, store, transport) = tracker(FlushMode::Manual);
        tracker.track_session_start(at(0)).unwrap();
        tracker.track_session_end(at(5)).unwrap();
        let saved: TrackerState =
            serde_json::from_str(&serde_json::to_string(&tracker.state()).unwrap()).unwrap();

        let restored = Tracker::restore(
            config(FlushMode::Manual),
            store.clone(),
            transport,
            saved,
        )
        .unwrap();

        assert_eq!(restored.customer_ids(), tracker.customer_ids());
        assert!(restored.track_session_start(at(8)).unwrap().is_none());
        assert_eq!(count(&store, &EventType::SessionStart), 1);
    }

    #[tokio::test]
    async fn manual_flush_delivers_and_empties_store() {
        let (tracker, store, transport) = tracker(FlushMode::Manual);
        tracker.track_session_start(at(0)).unwrap();
        tracker
            .track_payment(Properties::new().insert("total_price", 10), Some(at(1)))
            .unwrap();

        let report = tracker.flush().await.unwrap();

        assert_eq!(report.sent, 2);
        let sent = transport.sent.lock();
        assert_eq!(sent[0].event_type, EventType::SessionStart);
        assert_eq!(sent[1].event_type, EventType::Payment);
        assert!(store.query_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn immediate_mode_delivers_without_flush() {
        let (tracker, store, transport) = tracker(FlushMode::Immediate);
        tracker
            .track(
                EventType::Custom("purchase".to_string()),
                Properties::new(),
                CustomerIds::new().with("registered", "a"),
                None,
            )
            .unwrap();

        tracker.shutdown().await;

        assert_eq!(transport.sent.lock().len(), 1);
        assert!(store.query_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn periodic_mode_starts_timer() {
        let (tracker, store, transport) = tracker(FlushMode::Periodic);
        tracker.track_payment(Properties::new(), None).unwrap();

        tokio::time::sleep(Duration::from_millis(1300)).await;
        tracker.shutdown().await;

        assert_eq!(transport.sent.lock().len(), 1);
        assert!(store.query_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rotation_keeps_queued_records_on_old_token() {
        let (tracker, store, transport) = tracker(FlushMode::Manual);
        tracker.track_payment(Properties::new(), None).unwrap();

        let rotated = tracker.rotate_token(tracker.project_token()).await.unwrap();
        assert_eq!(rotated.as_str(), "project-rotated");

        let queued = store.query_all().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, EventStatus::Pending);
        assert_eq!(queued[0].project_token.as_str(), "project");

        tracker.flush().await.unwrap();
        assert_eq!(transport.sent.lock()[0].project_token.as_str(), "project");
    }
}
