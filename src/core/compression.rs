//! 归档压缩与解压
//!
//! 对核心流程来说这只是两个原子操作：把目录压成归档并在成功后删除
//! 源目录、把归档解开到目录。实际工作交给外部 tar 子进程。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::SyncError;

/// 归档协作方接口
#[async_trait]
pub trait Archiver: Send + Sync {
    /// 压缩目录为归档，成功后删除源目录，返回归档路径。
    /// 压缩本身失败时不做任何删除。
    async fn compress_and_cleanup(&self, source_dir: &Path) -> Result<PathBuf, SyncError>;

    /// 解包归档到指定目录，返回该目录
    async fn extract_archive(&self, archive: &Path, dest_dir: &Path) -> Result<PathBuf, SyncError>;

    /// 目录对应的归档文件路径（同级目录下的 <名称>.tar.gz）
    fn archive_path(&self, local_path: &Path) -> PathBuf;
}

/// 基于外部 tar 的归档实现
pub struct TarArchiver {
    /// 单次 tar 调用的时间上限
    timeout: Duration,
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
        }
    }
}

impl TarArchiver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run_tar(&self, args: &[String], what: &str) -> Result<(), SyncError> {
        let mut cmd = Command::new("tar");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                SyncError::Compression(format!("{}超时（{} 秒）", what, self.timeout.as_secs()))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Compression(format!(
                "{}失败: {}",
                what,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Archiver for TarArchiver {
    async fn compress_and_cleanup(&self, source_dir: &Path) -> Result<PathBuf, SyncError> {
        if !source_dir.exists() {
            return Err(SyncError::Compression(format!(
                "待压缩目录不存在: {}",
                source_dir.display()
            )));
        }

        let archive = self.archive_path(source_dir);
        let parent = source_dir
            .parent()
            .ok_or_else(|| SyncError::Compression("待压缩目录没有父目录".into()))?;
        let dir_name = source_dir
            .file_name()
            .ok_or_else(|| SyncError::Compression("待压缩目录名无效".into()))?;

        // -C 到父目录，归档里只保留相对路径
        let args = vec![
            "-czf".to_string(),
            archive.to_string_lossy().into_owned(),
            "-C".to_string(),
            parent.to_string_lossy().into_owned(),
            dir_name.to_string_lossy().into_owned(),
        ];
        self.run_tar(&args, "压缩").await?;

        // 归档确认落盘后才删除源目录；删除失败不算压缩失败
        if archive.exists() {
            if let Err(e) = std::fs::remove_dir_all(source_dir) {
                warn!("压缩完成但删除源目录失败: {}", e);
            }
        }

        debug!("目录已压缩: {} -> {}", source_dir.display(), archive.display());
        Ok(archive)
    }

    async fn extract_archive(&self, archive: &Path, dest_dir: &Path) -> Result<PathBuf, SyncError> {
        if !archive.exists() {
            return Err(SyncError::Compression(format!(
                "归档文件不存在: {}",
                archive.display()
            )));
        }

        std::fs::create_dir_all(dest_dir)?;

        let args = vec![
            "-xzf".to_string(),
            archive.to_string_lossy().into_owned(),
            "-C".to_string(),
            dest_dir.to_string_lossy().into_owned(),
        ];
        self.run_tar(&args, "解压").await?;

        debug!("归档已解压: {} -> {}", archive.display(), dest_dir.display());
        Ok(dest_dir.to_path_buf())
    }

    fn archive_path(&self, local_path: &Path) -> PathBuf {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".into());
        local_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{}.tar.gz", name))
    }
}
