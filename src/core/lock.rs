//! 跨进程的任务互斥锁
//!
//! 每个任务名对应一个锁文件，独占 flock 保证同名任务在多个进程里
//! 不会同时驱动 rsync。获取是非阻塞的：拿不到直接报"正在运行"，
//! 不排队。释放时连锁文件一并删掉，避免锁目录越积越多。

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::SyncError;

/// 任务锁管理器
#[derive(Debug, Clone)]
pub struct SyncLockManager {
    lock_dir: PathBuf,
}

impl SyncLockManager {
    pub fn new(lock_dir: PathBuf) -> Result<Self, SyncError> {
        std::fs::create_dir_all(&lock_dir)?;
        Ok(Self { lock_dir })
    }

    fn lock_path(&self, job_name: &str) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", job_name))
    }

    /// 尝试获取任务的独占锁
    ///
    /// 已被占用时返回 AlreadyRunning。返回的守卫在 Drop 时释放锁
    /// 并删除锁文件，覆盖成功、失败与 panic 的所有退出路径。
    pub fn acquire(&self, job_name: &str) -> Result<JobLockGuard, SyncError> {
        let path = self.lock_path(job_name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            let contended = e.raw_os_error() == fs2::lock_contended_error().raw_os_error();
            if contended {
                return Err(SyncError::AlreadyRunning(job_name.to_string()));
            }
            return Err(SyncError::Io(e));
        }

        debug!("已获取任务锁: {}", path.display());
        Ok(JobLockGuard {
            file: Some(file),
            path,
        })
    }
}

/// 任务锁守卫
#[derive(Debug)]
pub struct JobLockGuard {
    file: Option<File>,
    path: PathBuf,
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                warn!("释放任务锁失败: {}", e);
            }
            drop(file);
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("清理锁文件失败: {}", e);
                }
            }
            debug!("已释放任务锁: {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SyncLockManager::new(dir.path().to_path_buf()).unwrap();

        let guard = manager.acquire("jobA").unwrap();
        match manager.acquire("jobA") {
            Err(SyncError::AlreadyRunning(name)) => assert_eq!(name, "jobA"),
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|_| ())),
        }

        drop(guard);
        // 释放后可以重新获取
        let _again = manager.acquire("jobA").unwrap();
    }

    #[test]
    fn test_different_jobs_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SyncLockManager::new(dir.path().to_path_buf()).unwrap();

        let _a = manager.acquire("jobA").unwrap();
        let _b = manager.acquire("jobB").unwrap();
    }

    #[test]
    fn test_lock_file_removed_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SyncLockManager::new(dir.path().to_path_buf()).unwrap();
        let lock_path = dir.path().join("jobA.lock");

        let guard = manager.acquire("jobA").unwrap();
        assert!(lock_path.exists());
        drop(guard);
        assert!(!lock_path.exists());
    }
}
