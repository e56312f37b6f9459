//! SQLite Signaling-Store
//!
//! Geteilte SQLite-Datei als Dokument-Store: zwei Prozesse (Anrufer und
//! Angerufener) können dieselbe Datei öffnen. Abonnements pollen die Datei
//! im konfigurierten Intervall.

use super::records::{
    CallId, CallRecord, CallRole, CallStatus, CandidateSide, IceCandidate, SdpType,
    SessionDescription,
};
use super::store::{CancelHandle, SignalingError, SignalingStore, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Standard-Intervall für das Polling der Abonnements
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Kürzestes erlaubtes Polling-Intervall; kleinere Werte werden angehoben
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// SQLITE STORE
// ============================================================================

/// SQLite-Datenbank für Call-Records (Thread-safe durch Mutex)
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    namespace: String,
    poll_interval: Duration,
}

impl SqliteStore {
    /// Öffnet oder erstellt die Datenbank
    pub fn open(
        path: &Path,
        namespace: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self, SignalingError> {
        // Parent-Verzeichnis erstellen
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SignalingError::Unavailable(e.to_string()))?;
        }

        tracing::info!("Opening signaling store at {:?}", path);

        let conn = Connection::open(path)?;
        // Zwei Prozesse teilen sich die Datei
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn, namespace.into(), poll_interval)
    }

    /// In-Memory Datenbank (nur innerhalb des Prozesses geteilt)
    pub fn open_in_memory(namespace: impl Into<String>) -> Result<Self, SignalingError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, namespace.into(), DEFAULT_POLL_INTERVAL)
    }

    /// Setzt das Polling-Intervall für neue Abonnements
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn from_connection(
        conn: Connection,
        namespace: String,
        poll_interval: Duration,
    ) -> Result<Self, SignalingError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            namespace,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), SignalingError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                namespace TEXT NOT NULL,
                id TEXT NOT NULL,
                status TEXT NOT NULL,
                offer_type TEXT,
                offer_sdp TEXT,
                answer_type TEXT,
                answer_sdp TEXT,
                offered_by TEXT,
                answered_by TEXT,
                created_at TEXT NOT NULL,
                answered_at TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (namespace, id)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                call_id TEXT NOT NULL,
                side TEXT NOT NULL,
                candidate TEXT NOT NULL,
                sdp_mid TEXT,
                sdp_mline_index INTEGER,
                username_fragment TEXT
            )
            "#,
            [],
        )?;

        // Index für das Polling pro Collection
        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_candidates_call
            ON candidates(namespace, call_id, side, seq)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Interne Hilfsfunktion mit Connection-Referenz
    fn read_record(
        conn: &Connection,
        namespace: &str,
        id: &CallId,
    ) -> Result<Option<(i64, CallRecord)>, SignalingError> {
        let row = conn
            .query_row(
                r#"
                SELECT id, status, offer_type, offer_sdp, answer_type, answer_sdp,
                       offered_by, answered_by, created_at, answered_at, version
                FROM calls
                WHERE namespace = ?1 AND id = ?2
                "#,
                params![namespace, id.as_str()],
                RawRecord::from_row,
            )
            .optional()?;

        row.map(|raw| raw.into_record()).transpose()
    }

    /// Candidates einer Collection mit Sequenznummer größer `after`
    fn read_candidates(
        conn: &Connection,
        namespace: &str,
        id: &CallId,
        side: CandidateSide,
        after: i64,
    ) -> Result<Vec<(i64, IceCandidate)>, SignalingError> {
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT seq, candidate, sdp_mid, sdp_mline_index, username_fragment
            FROM candidates
            WHERE namespace = ?1 AND call_id = ?2 AND side = ?3 AND seq > ?4
            ORDER BY seq ASC
            "#,
        )?;

        let rows = stmt
            .query_map(
                params![namespace, id.as_str(), side.as_str(), after],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        IceCandidate {
                            candidate: row.get(1)?,
                            sdp_mid: row.get(2)?,
                            sdp_mline_index: row.get(3)?,
                            username_fragment: row.get(4)?,
                        },
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    fn record_exists(conn: &Connection, namespace: &str, id: &CallId) -> Result<bool, SignalingError> {
        let found = conn
            .query_row(
                "SELECT 1 FROM calls WHERE namespace = ?1 AND id = ?2",
                params![namespace, id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

struct RawRecord {
    id: String,
    status: String,
    offer_type: Option<String>,
    offer_sdp: Option<String>,
    answer_type: Option<String>,
    answer_sdp: Option<String>,
    offered_by: Option<String>,
    answered_by: Option<String>,
    created_at: String,
    answered_at: Option<String>,
    version: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            offer_type: row.get(2)?,
            offer_sdp: row.get(3)?,
            answer_type: row.get(4)?,
            answer_sdp: row.get(5)?,
            offered_by: row.get(6)?,
            answered_by: row.get(7)?,
            created_at: row.get(8)?,
            answered_at: row.get(9)?,
            version: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<(i64, CallRecord), SignalingError> {
        let status = CallStatus::parse(&self.status)
            .ok_or_else(|| SignalingError::Serialization(format!("status {}", self.status)))?;

        let record = CallRecord {
            id: CallId::from(self.id),
            status,
            offer: description(self.offer_type, self.offer_sdp)?,
            answer: description(self.answer_type, self.answer_sdp)?,
            offered_by: self.offered_by.as_deref().and_then(CallRole::parse),
            answered_by: self.answered_by.as_deref().and_then(CallRole::parse),
            created_at: timestamp(&self.created_at)?,
            answered_at: self.answered_at.as_deref().map(timestamp).transpose()?,
        };
        Ok((self.version, record))
    }
}

fn description(
    sdp_type: Option<String>,
    sdp: Option<String>,
) -> Result<Option<SessionDescription>, SignalingError> {
    match (sdp_type, sdp) {
        (Some(sdp_type), Some(sdp)) => {
            let sdp_type = SdpType::parse(&sdp_type)
                .ok_or_else(|| SignalingError::Serialization(format!("sdp type {}", sdp_type)))?;
            Ok(Some(SessionDescription { sdp_type, sdp }))
        }
        _ => Ok(None),
    }
}

fn timestamp(value: &str) -> Result<DateTime<Utc>, SignalingError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SignalingError::Serialization(e.to_string()))
}

// ============================================================================
// STORE IMPLEMENTATION
// ============================================================================

/// Führt eine Datenbank-Operation auf dem Blocking-Pool aus.
/// `busy_timeout` kann bis zu 5s warten, das darf keinen Runtime-Worker blockieren.
async fn blocking<T, F>(conn: &Arc<Mutex<Connection>>, op: F) -> Result<T, SignalingError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, SignalingError> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || op(&conn.lock()))
        .await
        .map_err(|e| SignalingError::Unavailable(format!("database task failed: {}", e)))?
}

#[async_trait]
impl SignalingStore for SqliteStore {
    async fn create_call_record(&self) -> Result<CallId, SignalingError> {
        let record = CallRecord::new(CallId::generate());
        let namespace = self.namespace.clone();
        let id = record.id.clone();

        blocking(&self.conn, move |conn| {
            conn.execute(
                r#"
                INSERT INTO calls (namespace, id, status, created_at, version)
                VALUES (?1, ?2, ?3, ?4, 0)
                "#,
                params![
                    namespace,
                    id.as_str(),
                    record.status.as_str(),
                    record.created_at.to_rfc3339()
                ],
            )?;
            tracing::debug!("Created call record {} in '{}'", id, namespace);
            Ok(id)
        })
        .await
    }

    async fn get_call_record(&self, id: &CallId) -> Result<Option<CallRecord>, SignalingError> {
        let namespace = self.namespace.clone();
        let id = id.clone();
        blocking(&self.conn, move |conn| {
            Ok(Self::read_record(conn, &namespace, &id)?.map(|(_, record)| record))
        })
        .await
    }

    async fn set_offer(
        &self,
        id: &CallId,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        let namespace = self.namespace.clone();
        let id = id.clone();

        blocking(&self.conn, move |conn| {
            let updated = conn.execute(
                r#"
                UPDATE calls
                SET offer_type = ?3, offer_sdp = ?4, offered_by = ?5, status = ?6,
                    version = version + 1
                WHERE namespace = ?1 AND id = ?2 AND offer_sdp IS NULL
                "#,
                params![
                    namespace,
                    id.as_str(),
                    offer.sdp_type.as_str(),
                    offer.sdp,
                    CallRole::Caller.as_str(),
                    CallStatus::Offered.as_str()
                ],
            )?;

            if updated == 0 {
                if Self::record_exists(conn, &namespace, &id)? {
                    return Err(SignalingError::DuplicateOffer(id.to_string()));
                }
                return Err(SignalingError::CallNotFound(id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn set_answer(
        &self,
        id: &CallId,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        let namespace = self.namespace.clone();
        let id = id.clone();

        blocking(&self.conn, move |conn| {
            let updated = conn.execute(
                r#"
                UPDATE calls
                SET answer_type = ?3, answer_sdp = ?4, answered_by = ?5, status = ?6,
                    answered_at = ?7, version = version + 1
                WHERE namespace = ?1 AND id = ?2
                  AND offer_sdp IS NOT NULL AND answer_sdp IS NULL
                "#,
                params![
                    namespace,
                    id.as_str(),
                    answer.sdp_type.as_str(),
                    answer.sdp,
                    CallRole::Answerer.as_str(),
                    CallStatus::Answered.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )?;

            if updated == 0 {
                return match Self::read_record(conn, &namespace, &id)? {
                    None => Err(SignalingError::CallNotFound(id.to_string())),
                    Some((_, record)) if record.offer.is_none() => {
                        Err(SignalingError::OfferNotFound)
                    }
                    Some(_) => Err(SignalingError::DuplicateAnswer(id.to_string())),
                };
            }
            Ok(())
        })
        .await
    }

    async fn append_candidate(
        &self,
        id: &CallId,
        side: CandidateSide,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let namespace = self.namespace.clone();
        let id = id.clone();

        blocking(&self.conn, move |conn| {
            if !Self::record_exists(conn, &namespace, &id)? {
                return Err(SignalingError::CallNotFound(id.to_string()));
            }
            conn.execute(
                r#"
                INSERT INTO candidates
                    (namespace, call_id, side, candidate, sdp_mid, sdp_mline_index, username_fragment)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    namespace,
                    id.as_str(),
                    side.as_str(),
                    candidate.candidate,
                    candidate.sdp_mid,
                    candidate.sdp_mline_index,
                    candidate.username_fragment
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn subscribe_call_record(
        &self,
        id: &CallId,
    ) -> Result<Subscription<CallRecord>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let namespace = self.namespace.clone();
        let id = id.clone();

        // Aktuellen Stand sofort liefern
        let snapshot = {
            let namespace = namespace.clone();
            let id = id.clone();
            blocking(&self.conn, move |conn| Self::read_record(conn, &namespace, &id)).await?
        };
        let mut last_version = match snapshot {
            Some((version, record)) => {
                let _ = tx.send(record);
                version
            }
            None => -1,
        };

        let conn = Arc::clone(&self.conn);
        let poll_interval = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    break;
                }

                let latest = {
                    let namespace = namespace.clone();
                    let id = id.clone();
                    blocking(&conn, move |conn| Self::read_record(conn, &namespace, &id)).await
                };
                match latest {
                    Ok(Some((version, record))) if version > last_version => {
                        last_version = version;
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Polling call record {} failed: {}", id, e),
                }
            }
        });

        Ok(Subscription::new(rx, CancelHandle::new(move || task.abort())))
    }

    async fn subscribe_candidates(
        &self,
        id: &CallId,
        side: CandidateSide,
    ) -> Result<Subscription<IceCandidate>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let namespace = self.namespace.clone();
        let id = id.clone();

        let existing = {
            let namespace = namespace.clone();
            let id = id.clone();
            blocking(&self.conn, move |conn| {
                Self::read_candidates(conn, &namespace, &id, side, 0)
            })
            .await?
        };
        let mut last_seq = 0;
        for (seq, candidate) in existing {
            last_seq = seq;
            let _ = tx.send(candidate);
        }

        let conn = Arc::clone(&self.conn);
        let poll_interval = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    break;
                }

                let fresh = {
                    let namespace = namespace.clone();
                    let id = id.clone();
                    blocking(&conn, move |conn| {
                        Self::read_candidates(conn, &namespace, &id, side, last_seq)
                    })
                    .await
                };
                match fresh {
                    Ok(rows) => {
                        for (seq, candidate) in rows {
                            last_seq = seq;
                            if tx.send(candidate).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::warn!("Polling {} of {} failed: {}", side.as_str(), id, e),
                }
            }
        });

        Ok(Subscription::new(rx, CancelHandle::new(move || task.abort())))
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("namespace", &self.namespace)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
