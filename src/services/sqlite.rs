use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};

use super::{DocumentStore, SavedDocument, ServiceError};

const SERVICE: &str = "documents";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS user_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    vector_id TEXT NOT NULL UNIQUE,
    data_type TEXT NOT NULL,
    data_value TEXT NOT NULL,
    chunk_index INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS user_data_user_id ON user_data (user_id);
";

/// Durable [`DocumentStore`] in a SQLite file.
///
/// One row per saved item, keyed by an autoincrement id and unique on
/// `vector_id`. Calls run on the blocking pool behind a single connection.
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteDocumentStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(&path, flags).map_err(|e| ServiceError::transport(SERVICE, e))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| ServiceError::transport(SERVICE, e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| ServiceError::transport(SERVICE, e))?
            .map_err(|e| ServiceError::transport(SERVICE, e))
    }

    /// Saved items of `user_id`, newest first.
    pub async fn for_user(&self, user_id: &str) -> Result<Vec<SavedDocument>, ServiceError> {
        let user_id = user_id.to_string();
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, vector_id, data_type, data_value, chunk_index, created_at
                     FROM user_data WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
                )?;
                let rows = stmt
                    .query_map(params![user_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, u32>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(user_id, vector_id, data_type, data_value, chunk_index, created_at)| {
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| ServiceError::decode(SERVICE, format!("bad created_at '{}': {}", created_at, e)))?
                    .with_timezone(&Utc);
                Ok(SavedDocument {
                    user_id,
                    vector_id,
                    data_type,
                    data_value,
                    chunk_index,
                    created_at,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn record(&self, doc: SavedDocument) -> Result<String, ServiceError> {
        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO user_data (user_id, vector_id, data_type, data_value, chunk_index, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        doc.user_id,
                        doc.vector_id,
                        doc.data_type,
                        doc.data_value,
                        doc.chunk_index,
                        doc.created_at.to_rfc3339(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id.to_string())
    }

    async fn ping(&self) -> Result<(), ServiceError> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|_| ())
    }
}
