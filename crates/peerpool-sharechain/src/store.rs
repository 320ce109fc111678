//! Durable share storage over SQLite.
//!
//! One `shares` table keyed by the 32-byte share hash, plus a `meta` table
//! holding the tip pointer. All access goes through a single connection
//! behind a mutex: writers serialize, and readers always observe a fully
//! written share because each `add` is one SQL statement.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use peerpool_types::share::{Share, ShareDecodeError};

const TIP_KEY: &str = "tip";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("share already exists")]
    DuplicateShare,

    #[error("store corruption: {0}")]
    Corruption(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<ShareDecodeError> for StoreError {
    fn from(e: ShareDecodeError) -> Self {
        StoreError::Corruption(e.to_string())
    }
}

/// Persistent keyed store of shares with a named tip pointer.
pub struct ShareStore {
    conn: Mutex<Connection>,
}

impl ShareStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS shares (
                hash      BLOB PRIMARY KEY,
                prev_hash BLOB NOT NULL,
                payload   BLOB NOT NULL
            ) WITHOUT ROWID;
            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist a share. Fails with [`StoreError::DuplicateShare`] if a share
    /// with the same hash is already stored.
    pub fn add(&self, share: &Share) -> Result<(), StoreError> {
        let hash = share.hash();
        let payload = share.encode();
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO shares (hash, prev_hash, payload) VALUES (?1, ?2, ?3)",
            params![&hash[..], &share.prev_share_hash[..], &payload],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateShare)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a share by hash.
    pub fn get(&self, hash: &[u8; 32]) -> Result<Option<Share>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT payload FROM shares WHERE hash = ?1",
                params![&hash[..]],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(bytes) => Ok(Some(Share::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// True iff a share with this hash is stored.
    pub fn has(&self, hash: &[u8; 32]) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM shares WHERE hash = ?1",
                params![&hash[..]],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Persist the tip pointer.
    pub fn set_tip(&self, hash: &[u8; 32]) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![TIP_KEY, &hash[..]],
        )?;
        Ok(())
    }

    /// The tip share, if the chain is non-empty. A tip pointer that does not
    /// resolve to a stored share is corruption.
    pub fn tip(&self) -> Result<Option<Share>, StoreError> {
        let hash = match self.tip_hash()? {
            Some(h) => h,
            None => return Ok(None),
        };
        match self.get(&hash)? {
            Some(share) => Ok(Some(share)),
            None => Err(StoreError::Corruption(
                "tip pointer references a missing share".into(),
            )),
        }
    }

    /// The raw tip hash, if set.
    pub fn tip_hash(&self) -> Result<Option<[u8; 32]>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![TIP_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            None => Ok(None),
            Some(v) => {
                let hash: [u8; 32] = v
                    .try_into()
                    .map_err(|_| StoreError::Corruption("tip pointer is not 32 bytes".into()))?;
                Ok(Some(hash))
            }
        }
    }

    /// Walk backwards from `start_hash` via `prev_share_hash`, returning up
    /// to `max` shares including the start, newest first. Stops at genesis
    /// or at a missing parent.
    pub fn get_ancestors(&self, start_hash: &[u8; 32], max: usize) -> Result<Vec<Share>, StoreError> {
        let mut result = Vec::new();
        let mut current = *start_hash;

        while result.len() < max {
            if current == [0u8; 32] {
                break;
            }
            match self.get(&current)? {
                Some(share) => {
                    current = share.prev_share_hash;
                    result.push(share);
                }
                None => break,
            }
        }

        Ok(result)
    }

    /// Total number of stored shares.
    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM shares", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
