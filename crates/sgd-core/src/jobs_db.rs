//! Persistent job table (SQLite via sqlx).
//!
//! The in-memory `JobStore` is the source of truth while the process runs;
//! this table is its durable shadow, written after every state transition
//! and on throttled progress steps, and read once at startup for
//! crash recovery. Login secrets are never stored; only the mode and
//! username columns exist.

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::job::{Credentials, FailureDetail, Job, JobId, JobState, Platform};

/// Handle to the SQLite-backed job table.
///
/// The database file is stored under the XDG state directory:
/// `~/.local/state/sgd/jobs.db` unless a state dir override is configured.
#[derive(Clone)]
pub struct JobsDb {
    pool: Pool<Sqlite>,
}

impl JobsDb {
    /// Open (or create) the job database under `state_dir` and run migrations.
    pub async fn open_at(state_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        let db_path: PathBuf = state_dir.join("jobs.db");

        let uri = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await?;

        let db = JobsDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database (tests; no disk I/O). Single connection so the
    /// pool never hands back a different empty DB.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = JobsDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        // Single jobs table. Ids come from the in-memory store, so the
        // column is a plain PRIMARY KEY, not AUTOINCREMENT.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY,
                app_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                install_dir TEXT NOT NULL,
                platform TEXT NOT NULL,
                anonymous INTEGER NOT NULL,
                username TEXT,
                validate_files INTEGER NOT NULL,
                state TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                speed TEXT,
                eta TEXT,
                error_json TEXT,
                attempt INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Promotion order of the queued jobs, mirrored from the admission
        // queue. Stale ids (promoted or terminal jobs) are filtered at load.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_order (
                position INTEGER PRIMARY KEY,
                job_id INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write the full record for a job (insert or overwrite).
    pub async fn upsert(&self, job: &Job) -> Result<()> {
        let now = unix_timestamp();
        let error_json = match &job.error {
            Some(detail) => Some(serde_json::to_string(detail)?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO jobs (
                id, app_id, name, install_dir, platform,
                anonymous, username, validate_files,
                state, progress, speed, eta, error_json, attempt,
                created_at, started_at, ended_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                      ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
        )
        .bind(job.id)
        .bind(job.app_id as i64)
        .bind(&job.name)
        .bind(job.install_dir.to_string_lossy().as_ref())
        .bind(job.platform.as_steam_str())
        .bind(job.credentials.is_anonymous() as i64)
        .bind(job.credentials.username())
        .bind(job.validate as i64)
        .bind(job.state.as_str())
        .bind(job.progress as f64)
        .bind(&job.speed)
        .bind(&job.eta)
        .bind(error_json)
        .bind(job.attempt as i64)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.ended_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load every stored job, oldest id first.
    pub async fn load_all(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, app_id, name, install_dir, platform,
                   anonymous, username, validate_files,
                   state, progress, speed, eta, error_json, attempt,
                   created_at, started_at, ended_at
            FROM jobs
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row_to_job(&row)?);
        }
        Ok(out)
    }

    /// Crash recovery: any job left in a slot-holding state has lost its
    /// supervising process. Demote Starting/Downloading/Validating to
    /// Queued with progress reset; complete Cancelling to Cancelled (the
    /// user's intent was cancellation). Returns how many rows changed.
    pub async fn recover(&self) -> Result<u64> {
        let now = unix_timestamp();
        let demoted = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'queued',
                progress = 0,
                speed = NULL,
                eta = NULL,
                started_at = NULL,
                updated_at = ?1
            WHERE state IN ('starting', 'downloading', 'validating')
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let cancelled = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'cancelled',
                ended_at = ?1,
                updated_at = ?1
            WHERE state = 'cancelling'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(demoted + cancelled)
    }

    /// Permanently remove a job row (history eviction/clearing only).
    pub async fn remove(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the stored promotion order with `ids` (head first).
    pub async fn save_queue_order(&self, ids: &[JobId]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue_order").execute(&mut *tx).await?;
        for (position, id) in ids.iter().enumerate() {
            sqlx::query("INSERT INTO queue_order (position, job_id) VALUES (?1, ?2)")
                .bind(position as i64)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Stored promotion order, head first. May contain ids of jobs that have
    /// since moved on; callers filter against the live job table.
    pub async fn load_queue_order(&self) -> Result<Vec<JobId>> {
        let rows = sqlx::query("SELECT job_id FROM queue_order ORDER BY position ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("job_id")).collect())
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let anonymous: i64 = row.get("anonymous");
    let username: Option<String> = row.get("username");
    // Secrets are not persisted; a recovered account job re-authenticates
    // through SteamCMD's cached session for this username.
    let credentials = if anonymous != 0 {
        Credentials::Anonymous
    } else {
        Credentials::Account {
            username: username.unwrap_or_default(),
            password: String::new(),
            guard_code: None,
        }
    };

    let state_str: String = row.get("state");
    let platform_str: String = row.get("platform");
    let error_json: Option<String> = row.get("error_json");
    let error: Option<FailureDetail> = match error_json.as_deref() {
        Some(json) if !json.is_empty() => Some(serde_json::from_str(json)?),
        _ => None,
    };
    let install_dir: String = row.get("install_dir");
    let app_id: i64 = row.get("app_id");
    let progress: f64 = row.get("progress");
    let attempt: i64 = row.get("attempt");

    Ok(Job {
        id: row.get("id"),
        app_id: app_id as u32,
        name: row.get("name"),
        install_dir: PathBuf::from(install_dir),
        platform: Platform::from_str(&platform_str).unwrap_or_default(),
        credentials,
        validate: row.get::<i64, _>("validate_files") != 0,
        state: JobState::from_str(&state_str),
        progress: progress as f32,
        speed: row.get("speed"),
        eta: row.get("eta"),
        error,
        attempt: attempt as u32,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    })
}

pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FailureKind;

    fn sample_job(id: JobId, state: JobState) -> Job {
        Job {
            id,
            app_id: 730,
            name: "Counter-Strike 2".into(),
            install_dir: format!("/tmp/downloads/app_730_{id}").into(),
            platform: Platform::Linux,
            credentials: Credentials::Account {
                username: "gamer".into(),
                password: "hunter2".into(),
                guard_code: Some("XJ9QK".into()),
            },
            validate: true,
            state,
            progress: 42.5,
            speed: Some("5.3 MB/s".into()),
            eta: Some("00:02:00".into()),
            error: None,
            attempt: 1,
            created_at: 1000,
            started_at: Some(1001),
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn upsert_and_load_roundtrip() {
        let db = JobsDb::open_memory().await.unwrap();
        let job = sample_job(1, JobState::Queued);
        db.upsert(&job).await.unwrap();

        let jobs = db.load_all().await.unwrap();
        assert_eq!(jobs.len(), 1);
        let loaded = &jobs[0];
        assert_eq!(loaded.id, 1);
        assert_eq!(loaded.app_id, 730);
        assert_eq!(loaded.name, "Counter-Strike 2");
        assert_eq!(loaded.platform, Platform::Linux);
        assert_eq!(loaded.state, JobState::Queued);
        assert!(loaded.validate);
        assert_eq!(loaded.progress, 42.5);
        assert_eq!(loaded.speed.as_deref(), Some("5.3 MB/s"));
        assert_eq!(loaded.credentials.username(), Some("gamer"));
    }

    #[tokio::test]
    async fn secrets_never_reach_the_database() {
        let db = JobsDb::open_memory().await.unwrap();
        db.upsert(&sample_job(1, JobState::Downloading)).await.unwrap();

        let row = sqlx::query("SELECT * FROM jobs WHERE id = 1")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        for i in 0..row.len() {
            if let Ok(Some(text)) = row.try_get::<Option<String>, _>(i) {
                assert!(!text.contains("hunter2"), "password leaked to column {i}");
                assert!(!text.contains("XJ9QK"), "guard code leaked to column {i}");
            }
        }

        let loaded = &db.load_all().await.unwrap()[0];
        match &loaded.credentials {
            Credentials::Account {
                password,
                guard_code,
                ..
            } => {
                assert!(password.is_empty());
                assert!(guard_code.is_none());
            }
            Credentials::Anonymous => panic!("login mode lost"),
        }
    }

    #[tokio::test]
    async fn recover_demotes_interrupted_jobs() {
        let db = JobsDb::open_memory().await.unwrap();
        db.upsert(&sample_job(1, JobState::Downloading)).await.unwrap();
        db.upsert(&sample_job(2, JobState::Starting)).await.unwrap();
        db.upsert(&sample_job(3, JobState::Cancelling)).await.unwrap();
        db.upsert(&sample_job(4, JobState::Completed)).await.unwrap();

        let changed = db.recover().await.unwrap();
        assert_eq!(changed, 3);

        let jobs = db.load_all().await.unwrap();
        assert_eq!(jobs[0].state, JobState::Queued);
        assert_eq!(jobs[0].progress, 0.0);
        assert!(jobs[0].speed.is_none());
        assert!(jobs[0].started_at.is_none());
        assert_eq!(jobs[1].state, JobState::Queued);
        assert_eq!(jobs[2].state, JobState::Cancelled);
        assert!(jobs[2].ended_at.is_some());
        // Terminal jobs are untouched.
        assert_eq!(jobs[3].state, JobState::Completed);
        assert_eq!(jobs[3].progress, 42.5);
    }

    #[tokio::test]
    async fn failure_detail_roundtrips_as_json() {
        let db = JobsDb::open_memory().await.unwrap();
        let mut job = sample_job(1, JobState::Failed);
        job.error = Some(FailureDetail {
            kind: FailureKind::Auth,
            message: "invalid password or account name".into(),
        });
        job.ended_at = Some(1100);
        db.upsert(&job).await.unwrap();

        let loaded = &db.load_all().await.unwrap()[0];
        let detail = loaded.error.as_ref().unwrap();
        assert_eq!(detail.kind, FailureKind::Auth);
        assert_eq!(detail.message, "invalid password or account name");
    }

    #[tokio::test]
    async fn queue_order_roundtrip_and_overwrite() {
        let db = JobsDb::open_memory().await.unwrap();
        assert!(db.load_queue_order().await.unwrap().is_empty());

        db.save_queue_order(&[3, 1, 2]).await.unwrap();
        assert_eq!(db.load_queue_order().await.unwrap(), vec![3, 1, 2]);

        // Each save replaces the whole order, dropping stale ids.
        db.save_queue_order(&[2]).await.unwrap();
        assert_eq!(db.load_queue_order().await.unwrap(), vec![2]);

        db.save_queue_order(&[]).await.unwrap();
        assert!(db.load_queue_order().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_row() {
        let db = JobsDb::open_memory().await.unwrap();
        db.upsert(&sample_job(1, JobState::Completed)).await.unwrap();
        db.upsert(&sample_job(2, JobState::Completed)).await.unwrap();
        db.remove(1).await.unwrap();
        let jobs = db.load_all().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, 2);
    }
}
