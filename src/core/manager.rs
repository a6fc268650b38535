//! 同步编排与任务管理门面
//!
//! 所有协作方（存储、执行器、锁、归档）在构造时显式传入。
//! 一次同步的生命周期：取锁 -> 置 RUNNING -> 执行 -> 写回结果 ->
//! 释放锁，锁覆盖包括重试与双向两趟在内的整个过程。

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::core::compression::Archiver;
use crate::core::executor::{JobRunner, SyncOptions, TransferResult};
use crate::core::lock::SyncLockManager;
use crate::core::progress::ProgressEvent;
use crate::db::{
    normalize_local_path, Job, JobParams, JobStore, RunRecord, SyncDirection, SyncStatus,
};
use crate::error::SyncError;

/// 解析 cron 表达式
///
/// cron 库要求带秒字段，标准五段表达式自动在前面补一个 0。
pub fn parse_schedule(expr: &str) -> Result<Schedule, SyncError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| SyncError::Config(format!("无效的 cron 表达式 '{}': {}", expr, e)))
}

/// 对既有任务的修改；None 表示保持原值
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub host: Option<String>,
    pub username: Option<String>,
    pub remote_path: Option<String>,
    pub local_path: Option<PathBuf>,
    pub use_compression: Option<bool>,
    pub delete_extraneous: Option<bool>,
    pub track_progress: Option<bool>,
    /// Some(None) 表示清除带宽限制
    pub bandwidth_limit: Option<Option<u32>>,
    pub exclude_patterns: Option<Vec<String>>,
    /// Some(None) 表示清除调度
    pub cron_schedule: Option<Option<String>>,
    pub direction: Option<SyncDirection>,
}

/// 同步任务管理门面
pub struct SyncManager {
    store: JobStore,
    runner: Arc<dyn JobRunner>,
    locks: SyncLockManager,
    archiver: Arc<dyn Archiver>,
}

impl SyncManager {
    pub fn new(
        store: JobStore,
        runner: Arc<dyn JobRunner>,
        locks: SyncLockManager,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Self {
            store,
            runner,
            locks,
            archiver,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// 新建任务：校验、查重、落库
    pub async fn add_job(&self, params: JobParams) -> Result<Job, SyncError> {
        if let Some(expr) = &params.cron_schedule {
            parse_schedule(expr)?;
        }
        let job = Job::new(params)?;
        self.store.insert(&job).await?;
        info!("已创建任务 '{}'（{} -> {}）", job.name, job.remote_path, job.local_path.display());
        Ok(job)
    }

    /// 删除任务，可级联删除本地目录与归档
    pub async fn remove_job(&self, name: &str, remove_files: bool) -> Result<bool, SyncError> {
        let job = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| SyncError::JobNotFound(name.to_string()))?;

        if remove_files {
            if job.local_path.exists() {
                if job.local_path.is_dir() {
                    std::fs::remove_dir_all(&job.local_path)?;
                } else {
                    std::fs::remove_file(&job.local_path)?;
                }
            }
            if job.use_compression {
                let archive = self.archiver.archive_path(&job.local_path);
                if archive.exists() {
                    std::fs::remove_file(&archive)?;
                }
            }
            info!("已删除任务 '{}' 的本地文件", name);
        }

        let removed = self.store.remove(name).await?;
        info!("已删除任务 '{}'", name);
        Ok(removed)
    }

    /// 修改任务，处理牵连的文件操作
    pub async fn update_job(&self, name: &str, update: JobUpdate) -> Result<Job, SyncError> {
        let mut job = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| SyncError::JobNotFound(name.to_string()))?;

        // 先校验 cron，避免半途失败留下不一致状态
        if let Some(Some(expr)) = &update.cron_schedule {
            parse_schedule(expr)?;
        }

        let new_remote = update.remote_path.clone().unwrap_or_else(|| job.remote_path.clone());

        // 本地路径变更需要搬移已同步的目录与归档
        if let Some(new_local) = &update.local_path {
            let normalized = normalize_local_path(new_local, &new_remote)?;
            if normalized != job.local_path {
                if job.local_path.exists() {
                    if let Some(parent) = normalized.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::rename(&job.local_path, &normalized)?;
                }
                if job.use_compression {
                    let old_archive = self.archiver.archive_path(&job.local_path);
                    if old_archive.exists() {
                        let new_archive = self.archiver.archive_path(&normalized);
                        std::fs::rename(&old_archive, &new_archive)?;
                    }
                }
                job.local_path = normalized;
            }
        }

        // 远端变更意味着内容不再对应，同步状态归零
        if update.host.is_some() || update.remote_path.is_some() {
            job.last_run_at = None;
            job.status = SyncStatus::NeverRun;
        }

        // 压缩开关切换时就地转换现有内容
        if let Some(flag) = update.use_compression {
            if flag != job.use_compression {
                if flag {
                    if job.local_path.is_dir() {
                        self.archiver.compress_and_cleanup(&job.local_path).await?;
                    }
                } else {
                    let archive = self.archiver.archive_path(&job.local_path);
                    if archive.exists() {
                        let dest = job
                            .local_path
                            .parent()
                            .map(Path::to_path_buf)
                            .unwrap_or_else(|| PathBuf::from("/"));
                        self.archiver.extract_archive(&archive, &dest).await?;
                        std::fs::remove_file(&archive)?;
                    }
                }
                job.use_compression = flag;
            }
        }

        if let Some(host) = update.host {
            job.host = host;
        }
        if let Some(username) = update.username {
            job.username = username;
        }
        if let Some(remote_path) = update.remote_path {
            job.remote_path = remote_path;
        }
        if let Some(flag) = update.delete_extraneous {
            job.delete_extraneous = flag;
        }
        if let Some(flag) = update.track_progress {
            job.track_progress = flag;
        }
        if let Some(limit) = update.bandwidth_limit {
            job.bandwidth_limit = limit;
        }
        if let Some(patterns) = update.exclude_patterns {
            job.exclude_patterns = patterns;
        }
        if let Some(schedule) = update.cron_schedule {
            job.cron_schedule = schedule;
        }
        if let Some(direction) = update.direction {
            job.direction = direction;
        }

        job.updated_at = Utc::now().timestamp();
        self.store.save(&job).await?;
        info!("已更新任务 '{}'", name);
        Ok(job)
    }

    /// 同步一个任务
    ///
    /// 失败会写回 FAILED 状态后原样上抛；同步成功后按需压缩，压缩
    /// 失败只记日志（数据已经传完，不改变同步结果）。
    pub async fn sync_job(
        &self,
        name: &str,
        opts: SyncOptions,
    ) -> Result<TransferResult, SyncError> {
        let job = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| SyncError::JobNotFound(name.to_string()))?;

        // 锁覆盖整个同步过程，守卫在本函数所有出口释放
        let _guard = self.locks.acquire(name)?;

        let started_at = Utc::now().timestamp();
        self.store
            .update_status(name, SyncStatus::Running, None)
            .await?;

        let effective = opts.direction.unwrap_or(job.direction);
        info!("开始同步任务 '{}'（方向: {}）", name, effective.as_str());

        match self.runner.run(&job, &opts).await {
            Ok(result) => {
                let finished_at = Utc::now().timestamp();
                self.store
                    .update_last_run(
                        name,
                        finished_at,
                        result.duration_seconds,
                        result.bytes_transferred,
                    )
                    .await?;
                self.append_run_record(
                    name,
                    started_at,
                    finished_at,
                    SyncStatus::Completed,
                    result.bytes_transferred,
                    result.duration_seconds,
                    None,
                )
                .await;

                // 压缩只对拉取结果有意义：归档的是刚落到本地的内容
                if job.use_compression && effective == SyncDirection::Pull {
                    opts.send_status("正在压缩本地目录...").await;
                    if let Err(e) = self.archiver.compress_and_cleanup(&job.local_path).await {
                        error!("任务 '{}' 同步后压缩失败（数据已同步）: {}", name, e);
                    }
                }

                info!(
                    "任务 '{}' 同步完成，{} 字节，耗时 {:.1} 秒",
                    name, result.bytes_transferred, result.duration_seconds
                );
                Ok(result)
            }
            Err(e) => {
                let finished_at = Utc::now().timestamp();
                let message = e.to_string();
                if let Err(persist_err) = self
                    .store
                    .update_status(name, SyncStatus::Failed, Some(&message))
                    .await
                {
                    warn!("写回失败状态时出错: {}", persist_err);
                }
                self.append_run_record(
                    name,
                    started_at,
                    finished_at,
                    SyncStatus::Failed,
                    0,
                    (finished_at - started_at) as f64,
                    Some(&message),
                )
                .await;
                error!("任务 '{}' 同步失败: {}", name, message);
                Err(e)
            }
        }
    }

    /// 运行历史是辅助数据，写失败只告警
    #[allow(clippy::too_many_arguments)]
    async fn append_run_record(
        &self,
        name: &str,
        started_at: i64,
        finished_at: i64,
        status: SyncStatus,
        bytes: u64,
        duration: f64,
        error_message: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .record_run(
                name,
                started_at,
                finished_at,
                status,
                bytes,
                duration,
                error_message,
            )
            .await
        {
            warn!("记录任务 '{}' 运行历史失败: {}", name, e);
        }
    }

    /// 任务是否到期：无调度永不到期，从未跑过立即到期，
    /// 否则看上次成功之后的下一个触发点是否已过
    pub fn is_due(job: &Job, now: DateTime<Utc>) -> bool {
        let Some(expr) = &job.cron_schedule else {
            return false;
        };
        let Ok(schedule) = parse_schedule(expr) else {
            // 入库时已校验过，损坏的表达式按不到期处理
            return false;
        };
        let Some(last_run) = job.last_run_at else {
            return true;
        };
        let Some(last_run) = DateTime::<Utc>::from_timestamp(last_run, 0) else {
            return true;
        };
        match schedule.after(&last_run).next() {
            Some(next) => next <= now,
            None => false,
        }
    }

    /// 同步所有到期任务，返回成功完成的任务名列表
    ///
    /// 单个任务失败或正被其他进程同步都不阻断其余任务。
    pub async fn sync_all_due(
        &self,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<Vec<String>, SyncError> {
        let jobs = self.store.get_all().await?;
        let now = Utc::now();
        let mut synced = Vec::new();

        for job in jobs {
            if !Self::is_due(&job, now) {
                continue;
            }
            let opts = SyncOptions {
                progress: progress.clone(),
                ..Default::default()
            };
            match self.sync_job(&job.name, opts).await {
                Ok(result) if result.success => synced.push(job.name.clone()),
                Ok(_) => {}
                Err(SyncError::AlreadyRunning(_)) => {
                    info!("任务 '{}' 正在运行，本轮跳过", job.name);
                }
                Err(e) => {
                    error!("到期任务 '{}' 同步失败: {}", job.name, e);
                }
            }
        }

        Ok(synced)
    }

    /// 全部任务及各自的下一次调度时间
    pub async fn jobs_with_next_run(
        &self,
    ) -> Result<Vec<(Job, Option<DateTime<Utc>>)>, SyncError> {
        let jobs = self.store.get_all().await?;
        let result = jobs
            .into_iter()
            .map(|job| {
                let next = job.cron_schedule.as_deref().and_then(|expr| {
                    let schedule = parse_schedule(expr).ok()?;
                    match job.last_run_at.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)) {
                        Some(last) => schedule.after(&last).next(),
                        None => schedule.upcoming(Utc).next(),
                    }
                });
                (job, next)
            })
            .collect();
        Ok(result)
    }

    /// 任务的运行历史
    pub async fn run_history(&self, name: &str, limit: u32) -> Result<Vec<RunRecord>, SyncError> {
        if self.store.get(name).await?.is_none() {
            return Err(SyncError::JobNotFound(name.to_string()));
        }
        self.store.recent_runs(name, limit).await
    }

    /// 本地目录的 ASCII 树形预览；压缩任务先解包到临时目录
    pub async fn directory_tree(
        &self,
        name: &str,
        max_depth: usize,
    ) -> Result<Vec<String>, SyncError> {
        let job = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| SyncError::JobNotFound(name.to_string()))?;

        if job.use_compression {
            let archive = self.archiver.archive_path(&job.local_path);
            if !archive.exists() {
                return Ok(vec!["[归档文件不存在]".into()]);
            }
            let tmp = tempfile::tempdir()?;
            match self.archiver.extract_archive(&archive, tmp.path()).await {
                Ok(_) => Ok(render_tree(tmp.path(), max_depth, 0, "")),
                Err(e) => Ok(vec![format!("[解压归档失败: {}]", e)]),
            }
        } else if job.local_path.exists() {
            Ok(render_tree(&job.local_path, max_depth, 0, ""))
        } else {
            Ok(vec!["[目录不存在]".into()])
        }
    }

    /// 解包任务归档，默认解到本地目录的父目录
    pub async fn extract_job_archive(
        &self,
        name: &str,
        dest: Option<PathBuf>,
    ) -> Result<PathBuf, SyncError> {
        let job = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| SyncError::JobNotFound(name.to_string()))?;

        if !job.use_compression {
            return Err(SyncError::Config(format!(
                "任务 '{}' 未开启压缩，没有归档可解",
                name
            )));
        }

        let archive = self.archiver.archive_path(&job.local_path);
        let dest = dest.unwrap_or_else(|| {
            job.local_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });
        self.archiver.extract_archive(&archive, &dest).await
    }
}

/// 递归渲染目录树，目录排在文件前面
fn render_tree(path: &Path, max_depth: usize, current_depth: usize, prefix: &str) -> Vec<String> {
    if current_depth > max_depth {
        return vec![format!("{}...", prefix)];
    }

    let mut result = Vec::new();
    let mut entries: Vec<_> = match std::fs::read_dir(path) {
        Ok(iter) => iter.filter_map(|e| e.ok()).collect(),
        Err(e) => {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                return vec![format!("{}[没有访问权限]", prefix)];
            }
            return vec![format!("{}[读取失败: {}]", prefix, e)];
        }
    };

    entries.sort_by_key(|e| {
        let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
        (!is_dir, e.file_name())
    });

    let count = entries.len();
    for (i, entry) in entries.into_iter().enumerate() {
        let is_last = i == count - 1;
        let item_prefix = if is_last { "└── " } else { "├── " };
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let suffix = if is_dir { "/" } else { "" };
        result.push(format!(
            "{}{}{}{}",
            prefix,
            item_prefix,
            entry.file_name().to_string_lossy(),
            suffix
        ));

        if is_dir && current_depth < max_depth {
            let child_prefix = format!("{}{}", prefix, if is_last { "    " } else { "│   " });
            result.extend(render_tree(
                &entry.path(),
                max_depth,
                current_depth + 1,
                &child_prefix,
            ));
        }
    }

    result
}
