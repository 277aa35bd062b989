//! Sqlite persistence for sessions and their scored summaries. All access
//! goes through a dedicated worker thread holding the one connection; async
//! callers hand it closures over a command queue and await the reply.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::oneshot;

mod migrations;

use crate::models::{SessionRecord, SessionStatus};
use crate::summary::SessionSummary;
use migrations::run_migrations;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

fn status_from_str(value: &str) -> Result<SessionStatus> {
    match value {
        "Running" => Ok(SessionStatus::Running),
        "Completed" => Ok(SessionStatus::Completed),
        "Interrupted" => Ok(SessionStatus::Interrupted),
        _ => Err(anyhow!("unknown session status '{value}'")),
    }
}

fn session_from_row(row: &Row<'_>) -> Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        game_name: row.get(1)?,
        started_at: parse_datetime(&row.get::<_, String>(2)?)?,
        stopped_at: row
            .get::<_, Option<String>>(3)?
            .map(|s| parse_datetime(&s))
            .transpose()?,
        status: status_from_str(&row.get::<_, String>(4)?)?,
        target_device_ids: serde_json::from_str(&row.get::<_, String>(5)?)
            .context("invalid target_device_ids JSON")?,
        goal_shots_per_target: serde_json::from_str(&row.get::<_, String>(6)?)
            .context("invalid goal_shots_per_target JSON")?,
        duration_secs: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?)?,
        updated_at: parse_datetime(&row.get::<_, String>(9)?)?,
    })
}

const SESSION_COLUMNS: &str = "id, game_name, started_at, stopped_at, status, \
     target_device_ids, goal_shots_per_target, duration_secs, created_at, updated_at";

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("hitlink-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Database initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    pub async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, game_name, started_at, stopped_at, status, target_device_ids, goal_shots_per_target, duration_secs, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.game_name,
                    record.started_at.to_rfc3339(),
                    record.stopped_at.as_ref().map(|dt| dt.to_rfc3339()),
                    record.status.as_str(),
                    serde_json::to_string(&record.target_device_ids)?,
                    serde_json::to_string(&record.goal_shots_per_target)?,
                    record.duration_secs,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to insert session")?;
            Ok(())
        })
        .await
    }

    pub async fn mark_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        stopped_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET status = ?1,
                     stopped_at = ?2,
                     updated_at = ?3
                 WHERE id = ?4",
                params![
                    status.as_str(),
                    stopped_at.map(|dt| dt.to_rfc3339()),
                    updated_at.to_rfc3339(),
                    session_id,
                ],
            )
            .with_context(|| "failed to update session status")?;
            Ok(())
        })
        .await
    }

    /// Store the scored summary as one JSON document. Serializing the whole
    /// record keeps the opaque passthrough context intact on the way back
    /// out.
    pub async fn insert_summary(
        &self,
        summary: &SessionSummary,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = summary.game_id.clone();
        let payload = serde_json::to_string(summary).context("failed to serialize summary")?;
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO session_summaries (session_id, completed_at, summary)
                 VALUES (?1, ?2, ?3)",
                params![session_id, completed_at.to_rfc3339(), payload],
            )
            .with_context(|| "failed to insert session summary")?;
            Ok(())
        })
        .await
    }

    pub async fn get_summary(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT summary FROM session_summaries WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;

            payload
                .map(|p| serde_json::from_str(&p).context("invalid summary JSON"))
                .transpose()
        })
        .await
    }

    pub async fn list_recent_sessions(&self, limit: u32) -> Result<Vec<SessionRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 ORDER BY started_at DESC
                 LIMIT ?1"
            ))?;

            let mut rows = stmt.query(params![limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(session_from_row(row)?);
            }

            Ok(sessions)
        })
        .await
    }

    /// Crash recovery: any session still `Running` in the store belongs to a
    /// previous process and can no longer complete. Returns how many rows
    /// were flipped.
    pub async fn mark_interrupted_sessions(&self, updated_at: DateTime<Utc>) -> Result<usize> {
        self.execute(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions
                     SET status = ?1,
                         updated_at = ?2
                     WHERE status = ?3",
                    params![
                        SessionStatus::Interrupted.as_str(),
                        updated_at.to_rfc3339(),
                        SessionStatus::Running.as_str(),
                    ],
                )
                .with_context(|| "failed to mark interrupted sessions")?;
            Ok(changed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summary::{CrossTargetStats, DeviceResult};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::new(dir.path().join("test.db")).expect("database should open")
    }

    fn record(id: &str, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            game_name: Some("Bill Drill".to_string()),
            started_at: t0(),
            stopped_at: None,
            status,
            target_device_ids: vec!["d1".to_string(), "d2".to_string()],
            goal_shots_per_target: [("d1".to_string(), 3u32)].into_iter().collect(),
            duration_secs: Some(120),
            created_at: t0(),
            updated_at: t0(),
        }
    }

    #[tokio::test]
    async fn session_rows_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        db.insert_session(&record("s1", SessionStatus::Running))
            .await
            .unwrap();

        let sessions = db.list_recent_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert_eq!(session.id, "s1");
        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.target_device_ids, vec!["d1", "d2"]);
        assert_eq!(session.goal_shots_per_target.get("d1"), Some(&3));
    }

    #[tokio::test]
    async fn marking_status_updates_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        db.insert_session(&record("s1", SessionStatus::Running))
            .await
            .unwrap();
        db.mark_session_status(
            "s1",
            SessionStatus::Completed,
            Some(t0() + chrono::Duration::seconds(90)),
            t0() + chrono::Duration::seconds(90),
        )
        .await
        .unwrap();

        let sessions = db.list_recent_sessions(10).await.unwrap();
        assert_eq!(sessions[0].status, SessionStatus::Completed);
        assert_eq!(
            sessions[0].stopped_at,
            Some(t0() + chrono::Duration::seconds(90))
        );
    }

    #[tokio::test]
    async fn summary_round_trips_with_passthrough_context() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        db.insert_session(&record("s1", SessionStatus::Completed))
            .await
            .unwrap();

        let summary = SessionSummary {
            game_id: "s1".to_string(),
            game_name: Some("Bill Drill".to_string()),
            start_time: t0(),
            end_time: t0() + chrono::Duration::seconds(90),
            total_hits: 4,
            actual_duration_secs: 90.0,
            device_results: vec![DeviceResult {
                device_id: "d1".to_string(),
                device_name: "Alpha".to_string(),
                hit_count: 4,
                goal: Some(3),
                goal_reached: true,
            }],
            target_stats: Vec::new(),
            cross_target_stats: CrossTargetStats::default(),
            splits: Vec::new(),
            transitions: Vec::new(),
            hit_history: Vec::new(),
            context: json!({"roomId": "range-3", "presetId": "p9", "desiredDuration": 120}),
        };
        db.insert_summary(&summary, summary.end_time).await.unwrap();

        let loaded = db.get_summary("s1").await.unwrap().expect("summary exists");
        assert_eq!(loaded.total_hits, 4);
        assert_eq!(loaded.context, summary.context);
        assert_eq!(loaded.device_results[0].device_name, "Alpha");

        assert!(db.get_summary("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recovery_marks_running_sessions_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        db.insert_session(&record("s1", SessionStatus::Running))
            .await
            .unwrap();
        db.insert_session(&{
            let mut r = record("s2", SessionStatus::Completed);
            r.started_at = t0() + chrono::Duration::seconds(10);
            r
        })
        .await
        .unwrap();

        let marked = db.mark_interrupted_sessions(Utc::now()).await.unwrap();
        assert_eq!(marked, 1);

        let sessions = db.list_recent_sessions(10).await.unwrap();
        let s1 = sessions.iter().find(|s| s.id == "s1").unwrap();
        let s2 = sessions.iter().find(|s| s.id == "s2").unwrap();
        assert_eq!(s1.status, SessionStatus::Interrupted);
        assert_eq!(s2.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn reopening_an_existing_database_is_a_no_op_migration() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = open_db(&dir);
            db.insert_session(&record("s1", SessionStatus::Completed))
                .await
                .unwrap();
        }

        let db = Database::new(dir.path().join("test.db")).unwrap();
        let sessions = db.list_recent_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 1);
    }
}
