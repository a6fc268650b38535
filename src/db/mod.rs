//! 任务存储层
//!
//! 以任务名为键的同步 sqlite 存储。状态机的每次变更都有对应的
//! 命名方法，调用方不直接改写字段。

pub mod models;
pub use models::*;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::error::SyncError;

/// 任务记录存储
#[derive(Clone)]
pub struct JobStore {
    db: Arc<SqlitePool>,
}

impl JobStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// 按名称加载单个任务
    pub async fn get(&self, name: &str) -> Result<Option<Job>, SyncError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM sync_jobs WHERE name = ?")
            .bind(name)
            .fetch_optional(&*self.db)
            .await?;

        match row {
            Some(r) => Ok(Some(r.try_into().map_err(|e: anyhow::Error| {
                SyncError::Config(format!("任务记录损坏: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    /// 加载全部任务
    pub async fn get_all(&self) -> Result<Vec<Job>, SyncError> {
        let rows = sqlx::query_as::<_, JobRow>("SELECT * FROM sync_jobs ORDER BY created_at ASC")
            .fetch_all(&*self.db)
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(row.try_into().map_err(|e: anyhow::Error| {
                SyncError::Config(format!("任务记录损坏: {}", e))
            })?);
        }
        Ok(jobs)
    }

    /// 新建任务，重名时报错
    pub async fn insert(&self, job: &Job) -> Result<(), SyncError> {
        if self.get(&job.name).await?.is_some() {
            return Err(SyncError::JobExists(job.name.clone()));
        }
        self.write(job, true).await
    }

    /// 覆盖保存既有任务
    pub async fn save(&self, job: &Job) -> Result<(), SyncError> {
        self.write(job, false).await
    }

    async fn write(&self, job: &Job, create: bool) -> Result<(), SyncError> {
        let excludes = serde_json::to_string(&job.exclude_patterns)
            .map_err(|e| SyncError::Config(format!("排除规则序列化失败: {}", e)))?;

        let sql = if create {
            r#"INSERT INTO sync_jobs
               (name, host, username, remote_path, local_path, ssh_port, ssh_key_path,
                ssh_timeout, use_compression, delete_extraneous, track_progress,
                bandwidth_limit, exclude_patterns, cron_schedule, direction, status,
                last_run_at, last_error, last_duration_seconds, last_bytes_transferred,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#
        } else {
            r#"UPDATE sync_jobs SET
                   host = ?2, username = ?3, remote_path = ?4, local_path = ?5,
                   ssh_port = ?6, ssh_key_path = ?7, ssh_timeout = ?8,
                   use_compression = ?9, delete_extraneous = ?10, track_progress = ?11,
                   bandwidth_limit = ?12, exclude_patterns = ?13, cron_schedule = ?14,
                   direction = ?15, status = ?16, last_run_at = ?17, last_error = ?18,
                   last_duration_seconds = ?19, last_bytes_transferred = ?20,
                   created_at = ?21, updated_at = ?22
               WHERE name = ?1"#
        };

        sqlx::query(sql)
            .bind(&job.name)
            .bind(&job.host)
            .bind(&job.username)
            .bind(&job.remote_path)
            .bind(job.local_path.to_string_lossy().into_owned())
            .bind(job.ssh_port as i64)
            .bind(
                job.ssh_key_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            )
            .bind(job.ssh_timeout as i64)
            .bind(job.use_compression)
            .bind(job.delete_extraneous)
            .bind(job.track_progress)
            .bind(job.bandwidth_limit.map(|v| v as i64))
            .bind(&excludes)
            .bind(&job.cron_schedule)
            .bind(job.direction.as_str())
            .bind(job.status.as_str())
            .bind(job.last_run_at)
            .bind(&job.last_error)
            .bind(job.last_duration_seconds)
            .bind(job.last_bytes_transferred.map(|v| v as i64))
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&*self.db)
            .await?;

        Ok(())
    }

    /// 删除任务，返回是否确实存在
    pub async fn remove(&self, name: &str) -> Result<bool, SyncError> {
        let result = sqlx::query("DELETE FROM sync_jobs WHERE name = ?")
            .bind(name)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// 状态变更：传入错误时一并记录；成功完成时清空上次错误
    pub async fn update_status(
        &self,
        name: &str,
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<(), SyncError> {
        let now = chrono::Utc::now().timestamp();
        match error {
            Some(message) => {
                sqlx::query(
                    "UPDATE sync_jobs SET status = ?, last_error = ?, updated_at = ? WHERE name = ?",
                )
                .bind(status.as_str())
                .bind(message)
                .bind(now)
                .bind(name)
                .execute(&*self.db)
                .await?;
            }
            None if status == SyncStatus::Completed => {
                sqlx::query(
                    "UPDATE sync_jobs SET status = ?, last_error = NULL, updated_at = ? WHERE name = ?",
                )
                .bind(status.as_str())
                .bind(now)
                .bind(name)
                .execute(&*self.db)
                .await?;
            }
            None => {
                sqlx::query("UPDATE sync_jobs SET status = ?, updated_at = ? WHERE name = ?")
                    .bind(status.as_str())
                    .bind(now)
                    .bind(name)
                    .execute(&*self.db)
                    .await?;
            }
        }
        Ok(())
    }

    /// 成功同步的收尾：状态置 COMPLETED，记录时长与字节数，清空错误
    pub async fn update_last_run(
        &self,
        name: &str,
        timestamp: i64,
        duration_seconds: f64,
        bytes_transferred: u64,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"UPDATE sync_jobs SET
                   status = ?, last_run_at = ?, last_duration_seconds = ?,
                   last_bytes_transferred = ?, last_error = NULL, updated_at = ?
               WHERE name = ?"#,
        )
        .bind(SyncStatus::Completed.as_str())
        .bind(timestamp)
        .bind(duration_seconds)
        .bind(bytes_transferred as i64)
        .bind(chrono::Utc::now().timestamp())
        .bind(name)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// 追加一条运行历史
    #[allow(clippy::too_many_arguments)]
    pub async fn record_run(
        &self,
        job_name: &str,
        started_at: i64,
        finished_at: i64,
        status: SyncStatus,
        bytes_transferred: u64,
        duration_seconds: f64,
        error_message: Option<&str>,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"INSERT INTO sync_runs
               (job_name, started_at, finished_at, status, bytes_transferred,
                duration_seconds, error_message)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job_name)
        .bind(started_at)
        .bind(finished_at)
        .bind(status.as_str())
        .bind(bytes_transferred as i64)
        .bind(duration_seconds)
        .bind(error_message)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// 最近的运行历史，按开始时间倒序
    pub async fn recent_runs(&self, job_name: &str, limit: u32) -> Result<Vec<RunRecord>, SyncError> {
        let rows = sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM sync_runs WHERE job_name = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(job_name)
        .bind(limit as i64)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> JobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        JobStore::new(Arc::new(pool))
    }

    fn sample_job(name: &str) -> Job {
        Job::new(JobParams::new(
            name,
            "example.com",
            "alice",
            "/srv/music",
            "/backups",
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let store = memory_store().await;
        let mut job = sample_job("music");
        job.exclude_patterns = vec!["*.tmp".into(), ".git/".into()];
        job.bandwidth_limit = Some(500);
        store.insert(&job).await.unwrap();

        let loaded = store.get("music").await.unwrap().unwrap();
        assert_eq!(loaded.host, "example.com");
        assert_eq!(loaded.exclude_patterns, vec!["*.tmp", ".git/"]);
        assert_eq!(loaded.bandwidth_limit, Some(500));
        assert_eq!(loaded.status, SyncStatus::NeverRun);

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_duplicate_rejected() {
        let store = memory_store().await;
        store.insert(&sample_job("music")).await.unwrap();
        match store.insert(&sample_job("music")).await {
            Err(SyncError::JobExists(name)) => assert_eq!(name, "music"),
            other => panic!("expected JobExists, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let store = memory_store().await;
        store.insert(&sample_job("music")).await.unwrap();

        store
            .update_status("music", SyncStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(
            store.get("music").await.unwrap().unwrap().status,
            SyncStatus::Running
        );

        store
            .update_status("music", SyncStatus::Failed, Some("rsync 失败"))
            .await
            .unwrap();
        let failed = store.get("music").await.unwrap().unwrap();
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("rsync 失败"));

        // 成功收尾后错误被清空
        store
            .update_last_run("music", 1_700_000_000, 12.5, 4096)
            .await
            .unwrap();
        let done = store.get("music").await.unwrap().unwrap();
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.last_run_at, Some(1_700_000_000));
        assert_eq!(done.last_bytes_transferred, Some(4096));
        assert!(done.last_error.is_none());
    }

    #[tokio::test]
    async fn test_run_history() {
        let store = memory_store().await;
        store.insert(&sample_job("music")).await.unwrap();

        store
            .record_run("music", 100, 160, SyncStatus::Completed, 2048, 60.0, None)
            .await
            .unwrap();
        store
            .record_run(
                "music",
                200,
                210,
                SyncStatus::Failed,
                0,
                10.0,
                Some("连接超时"),
            )
            .await
            .unwrap();

        let runs = store.recent_runs("music", 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].started_at, 200);
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[1].bytes_transferred, 2048);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = memory_store().await;
        store.insert(&sample_job("music")).await.unwrap();
        assert!(store.remove("music").await.unwrap());
        assert!(!store.remove("music").await.unwrap());
    }
}
