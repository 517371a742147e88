//! presence-store: SQLite persistence of face enrollment records.
//!
//! One row per user in `face_profiles`; re-enrollment overwrites the row's
//! descriptor instead of adding a second one. Descriptors use the core's
//! little-endian encoding (`presence_core::codec`).

use chrono::{DateTime, Utc};
use presence_core::codec::{self, CodecError};
use presence_core::{Embedding, EnrollmentSource, StoredEnrollment, UserId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS face_profiles (
        id           TEXT PRIMARY KEY,
        user_id      INTEGER NOT NULL UNIQUE,
        organization TEXT,
        embedding    BLOB NOT NULL,
        is_active    INTEGER NOT NULL DEFAULT 1,
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL,
        last_used    TEXT
    );
    CREATE INDEX IF NOT EXISTS face_profiles_organization ON face_profiles (organization);
";

const RECORD_COLUMNS: &str =
    "id, user_id, organization, embedding, is_active, created_at, updated_at, last_used";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store connection lock poisoned")]
    LockPoisoned,
}

/// One user's enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentRecord {
    pub id: String,
    pub user: UserId,
    pub organization: Option<String>,
    /// Encoded descriptor as stored.
    #[serde(skip)]
    pub descriptor: Vec<u8>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

impl EnrollmentRecord {
    pub fn embedding(&self) -> Result<Embedding, CodecError> {
        codec::decode(&self.descriptor)
    }
}

/// SQLite-backed enrollment store.
pub struct EnrollmentStore {
    conn: Mutex<Connection>,
}

impl EnrollmentStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened enrollment store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Store `embedding` as the user's active enrollment, replacing any previous one.
    pub fn enroll(
        &self,
        user: UserId,
        organization: Option<&str>,
        embedding: &Embedding,
    ) -> Result<EnrollmentRecord, StoreError> {
        let now = Utc::now().to_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO face_profiles (id, user_id, organization, embedding, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                     organization = COALESCE(excluded.organization, face_profiles.organization),
                     embedding = excluded.embedding,
                     is_active = 1,
                     updated_at = excluded.updated_at",
                params![id, user.0, organization, codec::encode(embedding), now],
            )?;
        }
        tracing::info!(user = %user, organization, dim = embedding.dim(), "enrollment stored");

        self.get(user)?.ok_or(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    pub fn get(&self, user: UserId) -> Result<Option<EnrollmentRecord>, StoreError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM face_profiles WHERE user_id = ?1"),
                [user.0],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All records, most recently updated first.
    pub fn list(&self) -> Result<Vec<EnrollmentRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM face_profiles ORDER BY updated_at DESC, user_id ASC"
        ))?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Record a successful match. Returns false if the user has no enrollment.
    pub fn touch_last_used(&self, user: UserId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE face_profiles SET last_used = ?1 WHERE user_id = ?2",
            params![Utc::now().to_rfc3339(), user.0],
        )?;
        Ok(changed > 0)
    }

    /// Include or exclude a user's enrollment from index rebuilds.
    pub fn set_active(&self, user: UserId, active: bool) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE face_profiles SET is_active = ?1, updated_at = ?2 WHERE user_id = ?3",
            params![active, Utc::now().to_rfc3339(), user.0],
        )?;
        Ok(changed > 0)
    }

    pub fn remove(&self, user: UserId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM face_profiles WHERE user_id = ?1", [user.0])?;
        if removed > 0 {
            tracing::info!(user = %user, "enrollment removed");
        }
        Ok(removed > 0)
    }

    /// Delete every enrollment belonging to `organization`.
    pub fn purge_organization(&self, organization: &str) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM face_profiles WHERE organization = ?1",
            [organization],
        )?;
        tracing::info!(organization, removed, "organization face data purged");
        Ok(removed)
    }
}

impl EnrollmentSource for EnrollmentStore {
    fn load_active(&self) -> Result<Vec<StoredEnrollment>, Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, user_id, embedding FROM face_profiles WHERE is_active = 1")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredEnrollment {
                    record_id: row.get(0)?,
                    user: UserId(row.get(1)?),
                    descriptor: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<EnrollmentRecord> {
    Ok(EnrollmentRecord {
        id: row.get(0)?,
        user: UserId(row.get(1)?),
        organization: row.get(2)?,
        descriptor: row.get(3)?,
        is_active: row.get(4)?,
        created_at: timestamp(row, 5)?,
        updated_at: timestamp(row, 6)?,
        last_used: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_timestamp(&s, 7))
            .transpose()?,
    })
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(&row.get::<_, String>(idx)?, idx)
}

fn parse_timestamp(s: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
