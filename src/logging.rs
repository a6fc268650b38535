//! 日志模块 - 应用日志的文件输出与大小轮转
//!
//! 应用日志写到数据目录下的 synckeeper.log，超过大小上限轮转为
//! .old 文件只保留一代。每次传输尝试的 rsync 输出另走独立文件，
//! 见 transfer_log_dir。

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

/// 日志配置，存放在 config.json 的 log 节
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写文件日志
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 日志文件大小上限（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error" / "warn" / "info" / "debug" / "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从 config.json 的 log 节加载，缺失或损坏时取默认值
    pub fn load(config_dir: &Path) -> Self {
        crate::config::read_config_section(config_dir, "log").unwrap_or_default()
    }

    /// 写回 config.json 的 log 节
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        crate::config::write_config_section(config_dir, "log", self)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 带大小上限的日志写入器
///
/// 超限时把当前文件改名为 synckeeper.log.old（覆盖旧备份）再重开。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join("synckeeper.log");
        let max_size = (max_size_mb as u64) * 1024 * 1024;
        let writer = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
        // 启动时如果上一轮文件已超限，先轮转
        if let Ok(metadata) = fs::metadata(file_path) {
            if metadata.len() > max_size {
                Self::rotate(file_path)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(file_path)?;
        Ok(BufWriter::new(file))
    }

    fn rotate(file_path: &Path) -> io::Result<()> {
        let backup = file_path.with_extension("log.old");
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(file_path, &backup)
    }
}

/// 每次 make_writer 返回的轻量句柄，写入后检查是否需要轮转
pub struct LogWriter {
    inner: Arc<Mutex<Option<BufWriter<File>>>>,
    file_path: PathBuf,
    max_size: u64,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::other("日志写入器不可用"));
        };
        let written = writer.write(buf)?;
        writer.flush()?;

        // 超限则关闭、轮转、重开
        let oversized = fs::metadata(&self.file_path)
            .map(|m| m.len() > self.max_size)
            .unwrap_or(false);
        if oversized {
            if let Some(mut old) = guard.take() {
                let _ = old.flush();
            }
            let _ = SizeRotatingWriter::rotate(&self.file_path);
            if let Ok(reopened) = SizeRotatingWriter::open_file(&self.file_path, self.max_size) {
                *guard = Some(reopened);
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        match guard.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}

/// 日志目录（跟随数据目录）
pub fn get_log_dir() -> PathBuf {
    crate::config::data_dir().join("logs")
}

/// 每次传输尝试的 rsync 输出日志目录
pub fn transfer_log_dir() -> PathBuf {
    get_log_dir().join("transfers")
}
