//! 错误类型定义
//!
//! 同步流程中的失败原因必须可区分：重试控制器依赖错误分类决定
//! 是否自动重试，认证失败永不重试。

use thiserror::Error;

/// rsync 退出码与含义对照（摘自 rsync 手册 EXIT VALUES 一节）
const RSYNC_EXIT_CODES: &[(i32, &str)] = &[
    (1, "Syntax or usage error"),
    (2, "Protocol incompatibility"),
    (3, "Errors selecting input/output files, dirs"),
    (4, "Requested action not supported"),
    (5, "Error starting client-server protocol"),
    (6, "Daemon unable to append to log-file"),
    (10, "Error in socket I/O"),
    (11, "Error in file I/O"),
    (12, "Error in rsync protocol data stream"),
    (13, "Errors with program diagnostics"),
    (14, "Error in IPC code"),
    (20, "Received SIGUSR1 or SIGINT"),
    (21, "Some error returned by waitpid()"),
    (22, "Error allocating core memory buffers"),
    (23, "Partial transfer due to error"),
    (24, "Partial transfer due to vanished source files"),
    (25, "The --max-delete limit stopped deletions"),
    (30, "Timeout in data send/receive"),
    (35, "Timeout waiting for daemon connection"),
];

/// 可自动重试的退出码：部分传输（23）、源文件消失（24）、数据超时（30）
const RECOVERABLE_EXIT_CODES: &[i32] = &[23, 24, 30];

/// 查退出码含义，未知码返回通用描述
pub fn rsync_exit_meaning(code: i32) -> String {
    RSYNC_EXIT_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, m)| (*m).to_string())
        .unwrap_or_else(|| format!("Unknown error (code {code})"))
}

/// 同步操作的错误分类
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("任务 '{0}' 不存在")]
    JobNotFound(String),

    #[error("任务 '{0}' 已存在")]
    JobExists(String),

    /// 锁竞争：同名任务正被其他进程同步
    #[error("任务 '{0}' 正在被其他进程同步")]
    AlreadyRunning(String),

    /// SSH 认证失败，永不自动重试
    #[error("SSH 认证失败: {0}")]
    Authentication(String),

    /// 连接超时，总是可重试
    #[error("连接 {host} 超时（{seconds} 秒）")]
    Timeout { host: String, seconds: u64 },

    /// 主机不可达、拒绝连接、host key 不匹配等
    #[error("SSH 连接失败: {0}")]
    Connection(String),

    /// rsync 以非零退出码结束
    #[error("rsync 失败: {meaning}（退出码 {exit_code}）")]
    Transfer {
        exit_code: i32,
        meaning: String,
        /// 最后若干行输出，用于诊断
        detail: String,
        recoverable: bool,
    },

    /// 同步成功后的压缩失败不会推翻同步结果，仅记录
    #[error("压缩/解压失败: {0}")]
    Compression(String),

    #[error("配置无效: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// 按退出码构造传输错误，自动标注是否可重试
    pub fn transfer(exit_code: i32, detail: String) -> Self {
        SyncError::Transfer {
            exit_code,
            meaning: rsync_exit_meaning(exit_code),
            detail,
            recoverable: RECOVERABLE_EXIT_CODES.contains(&exit_code),
        }
    }

    /// 重试控制器据此决定是否继续：超时总是重试，
    /// 传输错误看退出码，其余一律立即上抛
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Timeout { .. } => true,
            SyncError::Transfer { recoverable, .. } => *recoverable,
            _ => false,
        }
    }

    /// 诊断详情（若有）
    pub fn detail(&self) -> Option<&str> {
        match self {
            SyncError::Transfer { detail, .. } if !detail.is_empty() => Some(detail),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_meaning() {
        assert_eq!(rsync_exit_meaning(23), "Partial transfer due to error");
        assert_eq!(rsync_exit_meaning(99), "Unknown error (code 99)");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(SyncError::transfer(23, String::new()).is_recoverable());
        assert!(SyncError::transfer(24, String::new()).is_recoverable());
        assert!(SyncError::transfer(30, String::new()).is_recoverable());
        assert!(!SyncError::transfer(1, String::new()).is_recoverable());
        assert!(!SyncError::transfer(12, String::new()).is_recoverable());

        assert!(SyncError::Timeout {
            host: "example.com".into(),
            seconds: 30
        }
        .is_recoverable());
        assert!(!SyncError::Authentication("denied".into()).is_recoverable());
        assert!(!SyncError::Connection("refused".into()).is_recoverable());
    }
}
