//! SQLite-backed [`KeyValueStore`] for on-device persistence.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, instrument};

use super::kv::{
    list_output, logical_key, raw_key, KeyValueStore, KvError, KvOperation, KvOutput, KvResult,
    StorageErrorCode, MAX_LIST_LIMIT, MAX_VALUE_SIZE,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS kv_entries (
        key TEXT PRIMARY KEY,
        data BLOB NOT NULL
    ) WITHOUT ROWID;
"#;

impl From<rusqlite::Error> for KvError {
    fn from(e: rusqlite::Error) -> Self {
        let code = match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => StorageErrorCode::Corrupted,
                ErrorCode::CannotOpen => StorageErrorCode::ConnectionFailed,
                ErrorCode::SystemIoFailure => StorageErrorCode::IoError,
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }
}

/// Likes and other user data in a single SQLite table.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    #[instrument]
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        let store = Self::init(conn)?;
        info!(%mode, "kv store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, KvError> {
        self.conn
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "sqlite connection lock poisoned"))
    }
}

impl KeyValueStore for SqliteKvStore {
    fn execute(&self, op: KvOperation) -> KvResult {
        let conn = self.lock()?;

        match op {
            KvOperation::Get { key } => {
                let data = conn
                    .query_row(
                        "SELECT data FROM kv_entries WHERE key = ?1",
                        params![key.raw()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(KvOutput::Value(data))
            }
            KvOperation::Set { key, value } => {
                if value.len() > MAX_VALUE_SIZE {
                    return Err(KvError::ValueTooLarge {
                        size: value.len(),
                        max: MAX_VALUE_SIZE,
                    });
                }
                conn.execute(
                    "INSERT INTO kv_entries (key, data) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET data = excluded.data",
                    params![key.raw(), value],
                )?;
                Ok(KvOutput::Written)
            }
            KvOperation::Delete { key } => {
                let removed = conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key.raw()])?;
                Ok(KvOutput::Deleted {
                    existed: removed > 0,
                })
            }
            KvOperation::List {
                prefix,
                limit,
                cursor,
            } => {
                let full_prefix = raw_key(&prefix);
                let after = cursor.as_deref().map(raw_key).unwrap_or_default();
                let limit = limit.min(MAX_LIST_LIMIT);

                let mut stmt = conn.prepare(
                    "SELECT key FROM kv_entries
                     WHERE substr(key, 1, length(?1)) = ?1 AND key > ?2
                     ORDER BY key
                     LIMIT ?3",
                )?;
                let keys = stmt
                    .query_map(params![full_prefix, after, limit + 1], |row| {
                        row.get::<_, String>(0)
                    })?
                    .map(|key| key.map(|k| logical_key(&k).to_string()))
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(list_output(keys, limit as usize))
            }
        }
    }
}
