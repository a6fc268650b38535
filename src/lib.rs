use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;

pub use crate::core::{
    Archiver, JobRunner, ProgressEvent, RetryPolicy, RsyncConfig, RsyncManager, SyncManager,
    SyncOptions, TarArchiver, TransferResult,
};
pub use crate::db::models::{Job, JobParams, SyncDirection, SyncStatus};
pub use crate::error::SyncError;

/// 应用状态：数据库连接与装配好的同步管理器
///
/// 协作方全部在这里显式构造并注入，核心层不摸任何全局状态。
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub data_dir: PathBuf,
    pub manager: Arc<SyncManager>,
}

impl AppState {
    pub async fn new() -> anyhow::Result<Self> {
        let data_dir = config::data_dir();
        std::fs::create_dir_all(&data_dir)?;

        // sqlite 连接串里的 Windows 反斜杠需要转正斜杠
        let db_path = data_dir.join("synckeeper.db");
        let db_path_str = db_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid database path"))?
            .replace('\\', "/");

        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("sqlite:{}?mode=rwc", db_path_str))
            .await?;

        sqlx::migrate!("./migrations").run(&db).await?;

        let db = Arc::new(db);
        let store = db::JobStore::new(db.clone());
        let locks = core::SyncLockManager::new(data_dir.join("locks"))?;
        let runner = Arc::new(
            RsyncManager::new(RsyncConfig::default(), RetryPolicy::default()).await,
        );
        let archiver = Arc::new(TarArchiver::default());
        let manager = Arc::new(SyncManager::new(store, runner, locks, archiver));

        Ok(Self {
            db,
            data_dir,
            manager,
        })
    }

    /// 应用退出前的资源清理
    pub async fn cleanup(&self) {
        tracing::debug!("关闭数据库连接池...");
        self.db.close().await;
    }
}

/// 平台目录辅助，不引入额外依赖
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }

    pub fn home_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("USERPROFILE").ok().map(PathBuf::from)
        } else {
            std::env::var("HOME").ok().map(PathBuf::from)
        }
    }
}
