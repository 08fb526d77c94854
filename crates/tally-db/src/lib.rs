//! SQLite-backed event store for the tally client.
//!
//! Provides a durable [`EventStore`] using `rusqlite`.
//!
//! # Thread Safety
//!
//! A `rusqlite::Connection` is `Send` but not `Sync`, so [`Database`] keeps
//! it behind a mutex. Every store operation holds the lock for its whole
//! read-check-write sequence, which is what makes
//! [`EventStore::mark_in_flight`] an atomic check-and-set.
//!
//! # Schema
//!
//! ## Ordering
//!
//! `seq` is an `AUTOINCREMENT` rowid. SQLite never reuses such values, even
//! after the newest row is deleted, so it serves as the strictly increasing
//! `created_at` of each record.
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 format with millisecond precision
//! (e.g. `2024-01-15T10:30:00.000Z`). RFC 3339 only has four-digit years, so
//! event times outside years 0 to 9999 are rejected before anything is
//! written, and retry times past the end of year 9999 are clamped to it.
//!
//! ## Payload Storage
//!
//! `customer_ids` and `properties` hold JSON objects. Property values keep
//! their variant through the round trip (integers stay integers, floats stay
//! floats).
//!
//! ## Durability
//!
//! File databases run in WAL mode with `synchronous = FULL`, so a write has
//! reached disk when the call returns. Records a crashed process left
//! `in_flight` are returned to `pending` when the database is opened.
//!
//! ## Damaged Rows
//!
//! A row that cannot be decoded fails [`EventStore::query_all`], but flush
//! candidate and merge target lookups skip it with a warning so the rest of
//! the queue keeps moving.

use std::path::Path;

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tally_core::{
    CustomerIds, EventId, EventRecord, EventStatus, EventStore, EventType, NewEvent,
    ProjectToken, Properties, StoreError,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp for event {event_id}: {timestamp}")]
    TimestampParse {
        event_id: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// The timestamp cannot be stored as an RFC 3339 string.
    #[error("timestamp {timestamp} is outside the storable range (years 0 to 9999)")]
    TimestampOutOfRange { timestamp: DateTime<Utc> },
    /// A stored column could not be decoded.
    #[error("invalid event data for {event_id}: {message}")]
    InvalidEventData { event_id: String, message: String },
    /// The operation was refused by the store contract.
    #[error(transparent)]
    Rejected(#[from] StoreError),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Rejected(err) => err,
            DbError::Sqlite(err) => Self::Storage(Box::new(err)),
            err @ DbError::TimestampOutOfRange { .. } => Self::Storage(Box::new(err)),
            DbError::TimestampParse { ref event_id, .. } => Self::Corrupt {
                id: event_id.clone(),
                message: err.to_string(),
            },
            DbError::InvalidEventData { event_id, message } => Self::Corrupt {
                id: event_id,
                message,
            },
        }
    }
}

/// SQLite event store.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// `9999-12-31T23:59:59.999Z`, the last instant the timestamp columns hold.
const MAX_STORED_MILLIS: i64 = 253_402_300_799_999;

const COLUMNS: &str = "seq, id, project_token, customer_ids, type, properties, timestamp, \
                       status, attempts, last_error, retry_at";

/// A row as stored, before decoding.
struct StoredRow {
    seq: i64,
    id: String,
    project_token: String,
    customer_ids: String,
    kind: String,
    properties: String,
    timestamp: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    retry_at: Option<String>,
}

impl StoredRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            project_token: row.get(2)?,
            customer_ids: row.get(3)?,
            kind: row.get(4)?,
            properties: row.get(5)?,
            timestamp: row.get(6)?,
            status: row.get(7)?,
            attempts: row.get(8)?,
            last_error: row.get(9)?,
            retry_at: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<EventRecord, DbError> {
        let invalid = |message: String| DbError::InvalidEventData {
            event_id: self.id.clone(),
            message,
        };

        let customer_ids: CustomerIds = serde_json::from_str(&self.customer_ids)
            .map_err(|err| invalid(format!("customer_ids: {err}")))?;
        let properties: Properties = serde_json::from_str(&self.properties)
            .map_err(|err| invalid(format!("properties: {err}")))?;
        let event_type: EventType = self
            .kind
            .parse()
            .map_err(|err| invalid(format!("type: {err}")))?;
        let status: EventStatus = self
            .status
            .parse()
            .map_err(|err| invalid(format!("status: {err}")))?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| invalid(format!("attempts out of range: {}", self.attempts)))?;
        let project_token = ProjectToken::new(self.project_token.clone())
            .map_err(|err| invalid(format!("project_token: {err}")))?;
        let timestamp = parse_timestamp(&self.timestamp, &self.id)?;
        let retry_at = self
            .retry_at
            .as_deref()
            .map(|value| parse_timestamp(value, &self.id))
            .transpose()?;
        let id = EventId::new(self.id.clone()).map_err(|err| invalid(format!("id: {err}")))?;

        Ok(EventRecord {
            id,
            project_token,
            customer_ids,
            event_type,
            properties,
            timestamp,
            created_at: self.seq,
            status,
            attempts,
            last_error: self.last_error,
            retry_at,
        })
    }
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The schema is initialized on first open and interrupted deliveries
    /// are released back to `pending`.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        db.recover_in_flight()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.lock().execute_batch(
            "
            -- seq: insertion order, never reused
            -- customer_ids, properties: JSON objects
            -- timestamp, retry_at: RFC 3339 with milliseconds
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                project_token TEXT NOT NULL,
                customer_ids TEXT NOT NULL,
                type TEXT NOT NULL,
                properties TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                retry_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);
            CREATE INDEX IF NOT EXISTS idx_events_type_status ON events(type, status);
            ",
        )?;
        Ok(())
    }

    fn recover_in_flight(&self) -> Result<usize, DbError> {
        let released = self.conn.lock().execute(
            "UPDATE events SET status = 'pending' WHERE status = 'in_flight'",
            [],
        )?;
        if released > 0 {
            info!(released, "released events left in flight by a previous run");
        }
        Ok(released)
    }

    fn insert_event(&self, event: NewEvent) -> Result<EventRecord, DbError> {
        let id = EventId::generate();
        let stored_timestamp = encode_timestamp(event.timestamp.unwrap_or_else(Utc::now))?;
        // Read back at stored precision.
        let timestamp = parse_timestamp(&stored_timestamp, id.as_str())?;
        let customer_ids = to_json(&event.customer_ids, &id)?;
        let properties = to_json(&event.properties, &id)?;

        let conn = self.conn.lock();
        conn.execute(
            "
            INSERT INTO events (id, project_token, customer_ids, type, properties, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
            params![
                id.as_str(),
                event.project_token.as_str(),
                customer_ids,
                event.event_type.as_str(),
                properties,
                stored_timestamp,
            ],
        )?;
        let seq = conn.last_insert_rowid();

        Ok(EventRecord {
            id,
            project_token: event.project_token,
            customer_ids: event.customer_ids,
            event_type: event.event_type,
            properties: event.properties,
            timestamp,
            created_at: seq,
            status: EventStatus::Pending,
            attempts: 0,
            last_error: None,
            retry_at: None,
        })
    }

    /// Every event in insertion order. Fails on the first row that cannot
    /// be decoded.
    fn all_events(&self) -> Result<Vec<EventRecord>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM events ORDER BY seq ASC"))?;
        let rows = stmt.query_map([], StoredRow::read)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?.into_record()?);
        }
        Ok(events)
    }

    /// Decodes rows matching `filter` in `order`, keeping those `keep`
    /// accepts. Rows that fail to decode are logged and skipped.
    fn scan_events(
        &self,
        filter: &str,
        order: &str,
        params: impl rusqlite::Params,
        mut keep: impl FnMut(&EventRecord) -> bool,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM events {filter} ORDER BY seq {order}"
        ))?;
        let mut rows = stmt.query(params)?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            match StoredRow::read(row)?.into_record() {
                Ok(event) if keep(&event) => events.push(event),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "skipping event that cannot be decoded"),
            }
            if limit.is_some_and(|limit| events.len() >= limit) {
                break;
            }
        }
        Ok(events)
    }

    fn deliverable(&self, now: DateTime<Utc>) -> Result<Vec<EventRecord>, DbError> {
        self.scan_events(
            "WHERE status IN ('pending', 'failed')",
            "ASC",
            [],
            |event| event.is_deliverable(now),
            None,
        )
    }

    fn latest_pending(
        &self,
        event_type: &EventType,
        now: DateTime<Utc>,
    ) -> Result<Option<EventRecord>, DbError> {
        let mut found = self.scan_events(
            "WHERE type = ? AND status IN ('pending', 'failed')",
            "DESC",
            [event_type.as_str()],
            |event| event.is_deliverable(now),
            Some(1),
        )?;
        Ok(found.pop())
    }

    fn merge_properties(&self, id: &EventId, properties: &Properties) -> Result<(), DbError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut record = fetch(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.clone()))?;
        if !matches!(record.status, EventStatus::Pending | EventStatus::Failed) {
            return Err(StoreError::Conflict {
                id: id.clone(),
                status: record.status,
            }
            .into());
        }
        record.properties.merge(properties);
        tx.execute(
            "UPDATE events SET properties = ? WHERE id = ?",
            params![to_json(&record.properties, id)?, id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn claim(&self, id: &EventId) -> Result<EventRecord, DbError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE events SET status = 'in_flight'
             WHERE id = ? AND status IN ('pending', 'failed')",
            [id.as_str()],
        )?;
        if changed == 0 {
            return Err(rejection(&conn, id)?);
        }
        fetch(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.clone()).into())
    }

    fn set_sent(&self, id: &EventId) -> Result<(), DbError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE events SET status = 'sent' WHERE id = ? AND status = 'in_flight'",
            [id.as_str()],
        )?;
        if changed == 0 {
            return Err(rejection(&conn, id)?);
        }
        Ok(())
    }

    fn set_failed(
        &self,
        id: &EventId,
        reason: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, DbError> {
        let retry_at = DateTime::from_timestamp_millis(MAX_STORED_MILLIS)
            .map_or(retry_at, |max| retry_at.min(max));
        let retry_at = encode_timestamp(retry_at)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE events
             SET status = 'failed', attempts = attempts + 1, last_error = ?, retry_at = ?
             WHERE id = ? AND status != 'sent'",
            params![reason, retry_at, id.as_str()],
        )?;
        if changed == 0 {
            return Err(rejection(&conn, id)?);
        }
        let attempts: i64 = conn.query_row(
            "SELECT attempts FROM events WHERE id = ?",
            [id.as_str()],
            |row| row.get(0),
        )?;
        u32::try_from(attempts).map_err(|_| DbError::InvalidEventData {
            event_id: id.to_string(),
            message: format!("attempts out of range: {attempts}"),
        })
    }

    fn remove(&self, id: &EventId) -> Result<(), DbError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM events WHERE id = ? AND status IN ('sent', 'failed')",
            [id.as_str()],
        )?;
        if changed == 0 {
            return match status_of(&conn, id)? {
                None => Err(StoreError::NotFound(id.clone()).into()),
                Some(status) => Err(StoreError::NotDeletable {
                    id: id.clone(),
                    status,
                }
                .into()),
            };
        }
        debug!(event_id = %id, "deleted event");
        Ok(())
    }

    fn remove_sent(&self) -> Result<usize, DbError> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM events WHERE status = 'sent'", [])?;
        Ok(removed)
    }
}

impl EventStore for Database {
    fn insert(&self, event: NewEvent) -> Result<EventRecord, StoreError> {
        Ok(self.insert_event(event)?)
    }

    fn query_all(&self) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.all_events()?)
    }

    fn query_latest_pending(
        &self,
        event_type: &EventType,
        now: DateTime<Utc>,
    ) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.latest_pending(event_type, now)?)
    }

    fn query_deliverable(&self, now: DateTime<Utc>) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.deliverable(now)?)
    }

    fn update(&self, id: &EventId, properties: &Properties) -> Result<(), StoreError> {
        Ok(self.merge_properties(id, properties)?)
    }

    fn mark_in_flight(&self, id: &EventId) -> Result<EventRecord, StoreError> {
        Ok(self.claim(id)?)
    }

    fn mark_sent(&self, id: &EventId) -> Result<(), StoreError> {
        Ok(self.set_sent(id)?)
    }

    fn mark_failed(
        &self,
        id: &EventId,
        reason: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        Ok(self.set_failed(id, reason, retry_at)?)
    }

    fn delete(&self, id: &EventId) -> Result<(), StoreError> {
        Ok(self.remove(id)?)
    }

    fn delete_sent(&self) -> Result<usize, StoreError> {
        Ok(self.remove_sent()?)
    }
}

fn fetch(conn: &Connection, id: &EventId) -> Result<Option<EventRecord>, DbError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM events WHERE id = ?"),
        [id.as_str()],
        StoredRow::read,
    )
    .optional()?
    .map(StoredRow::into_record)
    .transpose()
}

fn status_of(conn: &Connection, id: &EventId) -> Result<Option<EventStatus>, DbError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM events WHERE id = ?",
            [id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    status
        .map(|status| {
            status.parse().map_err(|err| DbError::InvalidEventData {
                event_id: id.to_string(),
                message: format!("status: {err}"),
            })
        })
        .transpose()
}

/// Explains why a conditional status update matched no row.
fn rejection(conn: &Connection, id: &EventId) -> Result<DbError, DbError> {
    Ok(match status_of(conn, id)? {
        None => StoreError::NotFound(id.clone()).into(),
        Some(status) => StoreError::Conflict {
            id: id.clone(),
            status,
        }
        .into(),
    })
}

fn to_json<T: serde::Serialize>(value: &T, id: &EventId) -> Result<String, DbError> {
    serde_json::to_string(value).map_err(|err| DbError::InvalidEventData {
        event_id: id.to_string(),
        message: err.to_string(),
    })
}

fn parse_timestamp(timestamp: &str, event_id: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            event_id: event_id.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn encode_timestamp(timestamp: DateTime<Utc>) -> Result<String, DbError> {
    if !(0..=9999).contains(&timestamp.year()) {
        return Err(DbError::TimestampOutOfRange { timestamp });
    }
    Ok(format_timestamp(timestamp))
}
