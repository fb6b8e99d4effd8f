use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[cfg(feature = "sqlite-state")]
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
#[cfg(feature = "sqlite-state")]
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

pub const DEFAULT_SEQUENCE: &str = "0";

/// Identity-scoped login state. Written at authentication, touched again at
/// logout, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub subject: String,
    pub connection_id: String,
    pub token: String,
    pub login_time: u64,
    /// `0` until the subject's connection terminates for the first time.
    pub last_logout_time: u64,
    pub sequence: String,
}

impl SessionRecord {
    pub fn login(subject: &str, connection_id: &str, token: &str, login_time: u64) -> Self {
        Self {
            subject: subject.to_owned(),
            connection_id: connection_id.to_owned(),
            token: token.to_owned(),
            login_time,
            last_logout_time: 0,
            sequence: DEFAULT_SEQUENCE.to_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session state io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session state encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session state backend failed: {0}")]
    Backend(String),
}

/// Keyed session persistence. Last write wins per subject.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, subject: &str) -> Result<Option<SessionRecord>, StoreError>;
    async fn set(&self, subject: &str, record: SessionRecord) -> Result<(), StoreError>;
}

pub struct SessionStateStore {
    backend: SessionStateBackend,
}

enum SessionStateBackend {
    Memory {
        sessions: RwLock<HashMap<String, SessionRecord>>,
    },
    Json {
        path: PathBuf,
        sessions: RwLock<HashMap<String, SessionRecord>>,
        persist: Mutex<()>,
    },
    #[cfg(feature = "sqlite-state")]
    Sqlite { path: PathBuf, lock: Mutex<()> },
}

impl SessionStateStore {
    pub fn in_memory() -> Self {
        Self {
            backend: SessionStateBackend::Memory {
                sessions: RwLock::new(HashMap::new()),
            },
        }
    }

    /// Opens the backend implied by `path`: empty or `:memory:` keeps records in
    /// process, `.db`/`.sqlite` selects SQLite, anything else is a JSON file.
    pub async fn open(path: &Path) -> Result<Self> {
        let raw = path.to_string_lossy();
        if raw.trim().is_empty() || raw.trim() == ":memory:" {
            return Ok(Self::in_memory());
        }
        let path = path.to_path_buf();

        if is_sqlite_path(&path) {
            #[cfg(feature = "sqlite-state")]
            {
                init_sqlite(path.clone()).await?;
                return Ok(Self {
                    backend: SessionStateBackend::Sqlite {
                        path,
                        lock: Mutex::new(()),
                    },
                });
            }

            #[cfg(not(feature = "sqlite-state"))]
            {
                anyhow::bail!(
                    "sqlite session backend requested for {} but binary was built without \
                     `sqlite-state` feature",
                    path.display()
                );
            }
        }

        let sessions = if path.exists() {
            let text = tokio::fs::read_to_string(&path).await?;
            if text.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str::<HashMap<String, SessionRecord>>(&text).map_err(|err| {
                    anyhow::anyhow!("failed parsing session state {}: {err}", path.display())
                })?
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            backend: SessionStateBackend::Json {
                path,
                sessions: RwLock::new(sessions),
                persist: Mutex::new(()),
            },
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            SessionStateBackend::Memory { .. } => "memory",
            SessionStateBackend::Json { .. } => "json",
            #[cfg(feature = "sqlite-state")]
            SessionStateBackend::Sqlite { .. } => "sqlite",
        }
    }
}

#[async_trait]
impl SessionStore for SessionStateStore {
    async fn get(&self, subject: &str) -> Result<Option<SessionRecord>, StoreError> {
        match &self.backend {
            SessionStateBackend::Memory { sessions } | SessionStateBackend::Json { sessions, .. } => {
                let read_guard = sessions.read().await;
                Ok(read_guard.get(subject).cloned())
            }
            #[cfg(feature = "sqlite-state")]
            SessionStateBackend::Sqlite { path, lock } => {
                let _guard = lock.lock().await;
                let path = path.clone();
                let key = subject.to_owned();
                tokio::task::spawn_blocking(move || -> Result<Option<SessionRecord>, StoreError> {
                    let conn = Connection::open(&path).map_err(sqlite_err)?;
                    conn.query_row(
                        "SELECT subject, connection_id, token, login_time, last_logout_time, sequence
                         FROM session_record WHERE subject = ?1",
                        params![key],
                        |row| {
                            Ok(SessionRecord {
                                subject: row.get(0)?,
                                connection_id: row.get(1)?,
                                token: row.get(2)?,
                                login_time: row.get::<_, i64>(3)? as u64,
                                last_logout_time: row.get::<_, i64>(4)? as u64,
                                sequence: row.get(5)?,
                            })
                        },
                    )
                    .optional()
                    .map_err(sqlite_err)
                })
                .await
                .map_err(|err| StoreError::Backend(format!("sqlite get join error: {err}")))?
            }
        }
    }

    async fn set(&self, subject: &str, record: SessionRecord) -> Result<(), StoreError> {
        match &self.backend {
            SessionStateBackend::Memory { sessions } => {
                sessions.write().await.insert(subject.to_owned(), record);
                Ok(())
            }
            SessionStateBackend::Json {
                path,
                sessions,
                persist,
            } => {
                // Readers only see the record once it is on disk.
                let _persist_guard = persist.lock().await;
                let snapshot = {
                    let mut next = sessions.read().await.clone();
                    next.insert(subject.to_owned(), record.clone());
                    serde_json::to_vec_pretty(&next)?
                };
                persist_json(path, snapshot).await?;
                sessions.write().await.insert(subject.to_owned(), record);
                Ok(())
            }
            #[cfg(feature = "sqlite-state")]
            SessionStateBackend::Sqlite { path, lock } => {
                let _guard = lock.lock().await;
                let path = path.clone();
                let key = subject.to_owned();
                tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
                    let conn = Connection::open(&path).map_err(sqlite_err)?;
                    conn.execute(
                        "INSERT INTO session_record (
                            subject,
                            connection_id,
                            token,
                            login_time,
                            last_logout_time,
                            sequence
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                        ON CONFLICT(subject) DO UPDATE SET
                            connection_id=excluded.connection_id,
                            token=excluded.token,
                            login_time=excluded.login_time,
                            last_logout_time=excluded.last_logout_time,
                            sequence=excluded.sequence",
                        params![
                            key,
                            record.connection_id,
                            record.token,
                            record.login_time as i64,
                            record.last_logout_time as i64,
                            record.sequence
                        ],
                    )
                    .map_err(sqlite_err)?;
                    Ok(())
                })
                .await
                .map_err(|err| StoreError::Backend(format!("sqlite set join error: {err}")))?
            }
        }
    }
}

#[cfg(feature = "sqlite-state")]
const SESSION_RECORD_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_record (
    subject TEXT PRIMARY KEY,
    connection_id TEXT NOT NULL,
    token TEXT NOT NULL,
    login_time INTEGER NOT NULL,
    last_logout_time INTEGER NOT NULL,
    sequence TEXT NOT NULL
);
";

#[cfg(feature = "sqlite-state")]
async fn init_sqlite(path: PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::task::spawn_blocking(move || -> Result<()> {
        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .with_context(|| "set WAL mode")?;
        conn.execute_batch(SESSION_RECORD_SCHEMA)
            .with_context(|| "ensure session_record schema")?;
        Ok(())
    })
    .await
    .with_context(|| "sqlite init join error")??;
    Ok(())
}

#[cfg(feature = "sqlite-state")]
fn sqlite_err(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

async fn persist_json(path: &Path, snapshot: Vec<u8>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, snapshot).await?;
    Ok(())
}

fn is_sqlite_path(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|s| s.to_ascii_lowercase())
            .as_deref(),
        Some("db") | Some("sqlite") | Some("sqlite3")
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{SessionRecord, SessionStateStore, SessionStore, StoreError, DEFAULT_SEQUENCE};

    fn temp_state_path(name: &str, ext: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        p.push(format!("channel-gateway-state-{name}-{stamp}.{ext}"));
        p
    }

    #[test]
    fn login_record_starts_fresh() {
        let record = SessionRecord::login("alice", "conn-1", "tok", 1_700);
        assert_eq!(record.last_logout_time, 0);
        assert_eq!(record.login_time, 1_700);
        assert_eq!(record.sequence, DEFAULT_SEQUENCE);
    }

    #[tokio::test]
    async fn memory_backend_overwrites_last_writer() {
        let store = SessionStateStore::open(&PathBuf::from(":memory:"))
            .await
            .expect("store");
        assert_eq!(store.backend_name(), "memory");
        assert!(store.get("alice").await.expect("get").is_none());

        store
            .set("alice", SessionRecord::login("alice", "conn-1", "t1", 10))
            .await
            .expect("set");
        store
            .set("alice", SessionRecord::login("alice", "conn-2", "t2", 20))
            .await
            .expect("set");
        let record = store.get("alice").await.expect("get").expect("record");
        assert_eq!(record.connection_id, "conn-2");
        assert_eq!(record.token, "t2");
    }

    #[tokio::test]
    async fn json_backend_survives_reopen() {
        let path = temp_state_path("reopen", "json");
        {
            let store = SessionStateStore::open(&path).await.expect("store");
            assert_eq!(store.backend_name(), "json");
            let mut record = SessionRecord::login("bob", "conn-9", "tok", 100);
            record.last_logout_time = 250;
            store.set("bob", record).await.expect("set");
        }

        let reopened = SessionStateStore::open(&path).await.expect("reopen");
        let record = reopened.get("bob").await.expect("get").expect("record");
        assert_eq!(record.connection_id, "conn-9");
        assert_eq!(record.last_logout_time, 250);
        let _ = tokio::fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn json_write_failure_leaves_no_record_behind() {
        let blocker = temp_state_path("blocker", "file");
        tokio::fs::write(&blocker, b"not a directory")
            .await
            .expect("write blocker");
        let path = blocker.join("sessions.json");
        let store = SessionStateStore::open(&path).await.expect("store");

        let result = store
            .set("alice", SessionRecord::login("alice", "c1", "t", 1))
            .await;
        assert!(matches!(result, Err(StoreError::Io(_))));
        assert!(store.get("alice").await.expect("get").is_none());
        let _ = tokio::fs::remove_file(&blocker).await;
    }

    #[tokio::test]
    async fn json_write_failure_keeps_previous_record() {
        let path = temp_state_path("previous", "json");
        let store = SessionStateStore::open(&path).await.expect("store");
        store
            .set("alice", SessionRecord::login("alice", "c1", "t1", 1))
            .await
            .expect("first set");

        // Replace the state file with a directory so the next write fails.
        tokio::fs::remove_file(&path).await.expect("remove state");
        tokio::fs::create_dir(&path).await.expect("block state");
        assert!(store
            .set("alice", SessionRecord::login("alice", "c2", "t2", 2))
            .await
            .is_err());

        let record = store.get("alice").await.expect("get").expect("record");
        assert_eq!(record.connection_id, "c1");
        let _ = tokio::fs::remove_dir(&path).await;
    }

    #[tokio::test]
    async fn json_backend_rejects_corrupt_state() {
        let path = temp_state_path("corrupt", "json");
        tokio::fs::write(&path, b"{not json").await.expect("write");
        assert!(SessionStateStore::open(&path).await.is_err());
        let _ = tokio::fs::remove_file(path).await;
    }

    #[cfg(not(feature = "sqlite-state"))]
    #[tokio::test]
    async fn sqlite_path_requires_feature() {
        let path = temp_state_path("sqlite-off", "db");
        let err = SessionStateStore::open(&path)
            .await
            .err()
            .expect("feature error");
        assert!(err.to_string().contains("sqlite-state"));
    }

    #[cfg(feature = "sqlite-state")]
    #[tokio::test]
    async fn sqlite_backend_upserts_and_survives_reopen() {
        let path = temp_state_path("sqlite", "db");
        {
            let store = SessionStateStore::open(&path).await.expect("store");
            assert_eq!(store.backend_name(), "sqlite");
            store
                .set("carol", SessionRecord::login("carol", "conn-1", "a", 1))
                .await
                .expect("set");
            store
                .set("carol", SessionRecord::login("carol", "conn-2", "b", 2))
                .await
                .expect("set");
        }
        let reopened = SessionStateStore::open(&path).await.expect("reopen");
        let record = reopened.get("carol").await.expect("get").expect("record");
        assert_eq!(record.connection_id, "conn-2");
        assert_eq!(record.login_time, 2);
        let _ = tokio::fs::remove_file(&path).await;
        let _ = tokio::fs::remove_file(format!("{}-wal", path.display())).await;
        let _ = tokio::fs::remove_file(format!("{}-shm", path.display())).await;
    }
}
