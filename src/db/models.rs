//! 数据模型与校验
//!
//! Job 是唯一持久化的配置实体，以 name 为主键。所有字段在进库前
//! 完成校验，状态变更只通过 JobStore 的命名方法进行。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::SyncError;

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// 远端 -> 本地
    Pull,
    /// 本地 -> 远端
    Push,
    /// 两次非破坏性单向同步（先拉后推）
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Pull => "pull",
            SyncDirection::Push => "push",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }
}

impl TryFrom<&str> for SyncDirection {
    type Error = anyhow::Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim_matches('"') {
            "pull" => Ok(SyncDirection::Pull),
            "push" => Ok(SyncDirection::Push),
            "bidirectional" => Ok(SyncDirection::Bidirectional),
            other => Err(anyhow::anyhow!("Invalid sync direction: {}", other)),
        }
    }
}

/// 同步状态机
///
/// NEVER_RUN/COMPLETED/FAILED -> RUNNING -> COMPLETED | FAILED。
/// 进程崩溃会留下陈旧的 RUNNING，下一次尝试直接覆盖。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NeverRun,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::NeverRun => "never_run",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<&str> for SyncStatus {
    type Error = anyhow::Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim_matches('"') {
            "never_run" => Ok(SyncStatus::NeverRun),
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "cancelled" => Ok(SyncStatus::Cancelled),
            other => Err(anyhow::anyhow!("Invalid sync status: {}", other)),
        }
    }
}

/// 同步任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// 唯一标识，创建后不可变
    pub name: String,
    pub host: String,
    pub username: String,
    pub remote_path: String,
    /// 绝对路径，末段与远端目录同名
    pub local_path: PathBuf,
    pub ssh_port: u16,
    pub ssh_key_path: Option<PathBuf>,
    /// SSH 连接超时（秒）
    pub ssh_timeout: u64,
    /// 同步成功后压缩本地目录为归档
    pub use_compression: bool,
    /// 删除目标端多余文件（双向模式下强制关闭）
    pub delete_extraneous: bool,
    pub track_progress: bool,
    /// 带宽上限（KB/s）
    pub bandwidth_limit: Option<u32>,
    pub exclude_patterns: Vec<String>,
    pub cron_schedule: Option<String>,
    pub direction: SyncDirection,
    pub status: SyncStatus,
    /// 最近一次成功同步的 Unix 时间戳
    pub last_run_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_duration_seconds: Option<f64>,
    pub last_bytes_transferred: Option<u64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 创建任务的输入参数
#[derive(Debug, Clone)]
pub struct JobParams {
    pub name: String,
    pub host: String,
    pub username: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub ssh_port: u16,
    pub ssh_key_path: Option<PathBuf>,
    pub ssh_timeout: u64,
    pub use_compression: bool,
    pub delete_extraneous: bool,
    pub track_progress: bool,
    pub bandwidth_limit: Option<u32>,
    pub exclude_patterns: Vec<String>,
    pub cron_schedule: Option<String>,
    pub direction: SyncDirection,
}

impl JobParams {
    /// 仅要求必填字段，其余取常用默认值
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        remote_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            username: username.into(),
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            ssh_port: 22,
            ssh_key_path: None,
            ssh_timeout: 30,
            use_compression: false,
            delete_extraneous: true,
            track_progress: true,
            bandwidth_limit: None,
            exclude_patterns: Vec::new(),
            cron_schedule: None,
            direction: SyncDirection::Pull,
        }
    }
}

impl Job {
    /// 校验参数并构造新任务，初始状态 NEVER_RUN
    ///
    /// cron 表达式的校验在 SyncManager 层完成（调度属于核心层职责）。
    pub fn new(params: JobParams) -> Result<Self, SyncError> {
        validate_name(&params.name)?;

        if params.host.trim().is_empty() {
            return Err(SyncError::Config("主机地址不能为空".into()));
        }
        if params.username.trim().is_empty() {
            return Err(SyncError::Config("用户名不能为空".into()));
        }
        if params.remote_path.trim().is_empty() {
            return Err(SyncError::Config("远端路径不能为空".into()));
        }
        if params.ssh_port == 0 {
            return Err(SyncError::Config("SSH 端口必须在 1-65535 之间".into()));
        }
        if !(5..=300).contains(&params.ssh_timeout) {
            return Err(SyncError::Config("SSH 超时必须在 5-300 秒之间".into()));
        }

        let ssh_key_path = match params.ssh_key_path {
            Some(path) => {
                let expanded = expand_home(&path);
                if !expanded.exists() {
                    return Err(SyncError::Config(format!(
                        "SSH 密钥不存在: {}",
                        expanded.display()
                    )));
                }
                Some(expanded)
            }
            None => None,
        };

        let local_path = normalize_local_path(&params.local_path, &params.remote_path)?;

        let now = chrono::Utc::now().timestamp();
        Ok(Job {
            name: params.name,
            host: params.host,
            username: params.username,
            remote_path: params.remote_path,
            local_path,
            ssh_port: params.ssh_port,
            ssh_key_path,
            ssh_timeout: params.ssh_timeout,
            use_compression: params.use_compression,
            delete_extraneous: params.delete_extraneous,
            track_progress: params.track_progress,
            bandwidth_limit: params.bandwidth_limit,
            exclude_patterns: params.exclude_patterns,
            cron_schedule: params.cron_schedule,
            direction: params.direction,
            status: SyncStatus::NeverRun,
            last_run_at: None,
            last_error: None,
            last_duration_seconds: None,
            last_bytes_transferred: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// 任务名限制为 1-64 位字母数字、下划线与连字符
pub fn validate_name(name: &str) -> Result<(), SyncError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(SyncError::Config(format!(
            "任务名 '{}' 无效，仅允许 1-64 位字母、数字、下划线和连字符",
            name
        )))
    }
}

/// 远端路径的末段目录名（"/data/music/" -> "music"）
pub fn remote_basename(remote_path: &str) -> Option<String> {
    Path::new(remote_path.trim_end_matches('/'))
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// 规范化本地路径：展开 ~、转为绝对路径、补齐远端目录名后缀
pub fn normalize_local_path(local: &Path, remote_path: &str) -> Result<PathBuf, SyncError> {
    let expanded = expand_home(local);
    let mut absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map_err(|e| SyncError::Config(format!("无法获取当前目录: {}", e)))?
            .join(expanded)
    };

    if let Some(basename) = remote_basename(remote_path) {
        let already_suffixed = absolute
            .file_name()
            .map(|n| n.to_string_lossy() == basename.as_str())
            .unwrap_or(false);
        if !already_suffixed {
            absolute = absolute.join(&basename);
        }
    }

    Ok(absolute)
}

/// 展开开头的 ~ 为用户主目录
pub fn expand_home(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return crate::dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = crate::dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub name: String,
    pub host: String,
    pub username: String,
    pub remote_path: String,
    pub local_path: String,
    pub ssh_port: i64,
    pub ssh_key_path: Option<String>,
    pub ssh_timeout: i64,
    pub use_compression: bool,
    pub delete_extraneous: bool,
    pub track_progress: bool,
    pub bandwidth_limit: Option<i64>,
    pub exclude_patterns: String,
    pub cron_schedule: Option<String>,
    pub direction: String,
    pub status: String,
    pub last_run_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_duration_seconds: Option<f64>,
    pub last_bytes_transferred: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let direction = SyncDirection::try_from(row.direction.as_str())?;
        let status = SyncStatus::try_from(row.status.as_str())?;

        // 兼容空串与 JSON 数组两种历史格式
        let exclude_patterns: Vec<String> = if row.exclude_patterns.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&row.exclude_patterns)?
        };

        Ok(Job {
            name: row.name,
            host: row.host,
            username: row.username,
            remote_path: row.remote_path,
            local_path: PathBuf::from(row.local_path),
            ssh_port: row.ssh_port as u16,
            ssh_key_path: row.ssh_key_path.map(PathBuf::from),
            ssh_timeout: row.ssh_timeout as u64,
            use_compression: row.use_compression,
            delete_extraneous: row.delete_extraneous,
            track_progress: row.track_progress,
            bandwidth_limit: row.bandwidth_limit.map(|v| v as u32),
            exclude_patterns,
            cron_schedule: row.cron_schedule,
            direction,
            status,
            last_run_at: row.last_run_at,
            last_error: row.last_error,
            last_duration_seconds: row.last_duration_seconds,
            last_bytes_transferred: row.last_bytes_transferred.map(|v| v as u64),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 单次同步的历史记录
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub job_name: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub status: String,
    pub bytes_transferred: i64,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("music-backup_01").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("日志").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
        assert!(validate_name(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn test_remote_basename() {
        assert_eq!(remote_basename("/data/music/"), Some("music".into()));
        assert_eq!(remote_basename("/data/music"), Some("music".into()));
        assert_eq!(remote_basename("/"), None);
    }

    #[test]
    fn test_normalize_local_path_appends_basename() {
        let normalized = normalize_local_path(Path::new("/backups"), "/srv/media/music/").unwrap();
        assert_eq!(normalized, PathBuf::from("/backups/music"));

        // 已经以远端目录名结尾时不重复追加
        let normalized =
            normalize_local_path(Path::new("/backups/music"), "/srv/media/music").unwrap();
        assert_eq!(normalized, PathBuf::from("/backups/music"));
    }

    #[test]
    fn test_job_new_validates() {
        let params = JobParams::new("music", "example.com", "alice", "/srv/music", "/backups");
        let job = Job::new(params).unwrap();
        assert_eq!(job.status, SyncStatus::NeverRun);
        assert_eq!(job.local_path, PathBuf::from("/backups/music"));
        assert!(job.last_run_at.is_none());

        let mut bad = JobParams::new("m", "example.com", "alice", "/srv/music", "/backups");
        bad.ssh_timeout = 3;
        assert!(matches!(Job::new(bad), Err(SyncError::Config(_))));

        let bad = JobParams::new("bad name", "example.com", "alice", "/srv/music", "/backups");
        assert!(Job::new(bad).is_err());
    }

    #[test]
    fn test_direction_roundtrip() {
        for d in [
            SyncDirection::Pull,
            SyncDirection::Push,
            SyncDirection::Bidirectional,
        ] {
            assert_eq!(SyncDirection::try_from(d.as_str()).unwrap(), d);
        }
        assert!(SyncDirection::try_from("sideways").is_err());
    }
}
