//! 同步执行引擎
//!
//! 把构建好的 rsync 命令跑成子进程，逐行消费合并后的输出流：
//! 每行进结果日志、按需落到尝试日志文件、喂给进度解析器。
//! 退出码在这里完成分类，供重试控制器决定去留。

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::command::{BuiltCommand, RsyncCommandBuilder, RsyncDialect};
use crate::core::progress::{ProgressEvent, ProgressParser};
use crate::core::retry::{run_with_retry, RetryPolicy};
use crate::core::ssh::{probe_connection, SshConfig};
use crate::db::{Job, SyncDirection};
use crate::error::SyncError;

/// 双向同步日志里两趟之间的分隔行
pub const TWO_WAY_LOG_SEPARATOR: &str = "----- 推送阶段（本地 -> 远端） -----";

/// 一次同步的结果
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub success: bool,
    /// 进度事件中观测到的最大字节数
    pub bytes_transferred: u64,
    pub duration_seconds: f64,
    /// 原始输出，按产生顺序只增不改
    pub log_lines: Vec<String>,
    pub error_message: Option<String>,
}

/// 调用方可选项
#[derive(Clone)]
pub struct SyncOptions {
    /// 进度事件接收端，仅在任务开启进度跟踪时投递
    pub progress: Option<mpsc::Sender<ProgressEvent>>,
    /// 阶段性状态消息接收端
    pub status: Option<mpsc::Sender<String>>,
    pub use_retry: bool,
    /// 覆盖任务自身的同步方向
    pub direction: Option<SyncDirection>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            progress: None,
            status: None,
            use_retry: true,
            direction: None,
        }
    }
}

impl SyncOptions {
    pub(crate) async fn send_status(&self, message: impl Into<String>) {
        if let Some(tx) = &self.status {
            let _ = tx.send(message.into()).await;
        }
    }
}

/// 传输执行器接口，编排层通过它驱动一次完整的任务同步
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &Job, opts: &SyncOptions) -> Result<TransferResult, SyncError>;
}

/// 执行器配置
#[derive(Debug, Clone)]
pub struct RsyncConfig {
    pub rsync_program: String,
    /// 单次传输的硬性时间上限，超过即强杀子进程
    pub transfer_timeout: Option<Duration>,
    /// 尝试日志文件目录
    pub log_dir: PathBuf,
    /// 失败时随错误携带的末尾行数
    pub error_tail_lines: usize,
}

impl Default for RsyncConfig {
    fn default() -> Self {
        Self {
            rsync_program: "rsync".into(),
            transfer_timeout: None,
            log_dir: crate::logging::transfer_log_dir(),
            error_tail_lines: 10,
        }
    }
}

/// rsync 驱动的传输执行器
pub struct RsyncManager {
    config: RsyncConfig,
    builder: RsyncCommandBuilder,
    parser: ProgressParser,
    retry: RetryPolicy,
}

impl RsyncManager {
    /// 探测本机 rsync 方言后构造
    pub async fn new(config: RsyncConfig, retry: RetryPolicy) -> Self {
        let dialect = super::command::detect_dialect(&config.rsync_program).await;
        Self::with_dialect(config, retry, dialect)
    }

    /// 指定方言构造（方言已知或测试场景）
    pub fn with_dialect(config: RsyncConfig, retry: RetryPolicy, dialect: RsyncDialect) -> Self {
        let builder = RsyncCommandBuilder {
            dialect,
            rsync_program: config.rsync_program.clone(),
        };
        Self {
            config,
            builder,
            parser: ProgressParser::new(),
            retry,
        }
    }

    pub fn dialect(&self) -> RsyncDialect {
        self.builder.dialect
    }

    /// 单次同步尝试：探测（可跳过）-> 构建命令 -> 驱动子进程
    ///
    /// 包装脚本在尝试结束后无条件清理，不论成败。
    async fn execute_sync(
        &self,
        job: &Job,
        direction: SyncDirection,
        two_way_pass: bool,
        skip_probe: bool,
        opts: &SyncOptions,
    ) -> Result<TransferResult, SyncError> {
        let started = Instant::now();

        if !skip_probe {
            opts.send_status("正在测试 SSH 连接...").await;
            probe_connection(&SshConfig::from_job(job)).await?;
        }

        let mut built = self.builder.build(job, direction, two_way_pass)?;
        let wrapper = built.wrapper.take();
        let _wrapper_cleanup = scopeguard::guard(wrapper, |wrapper| {
            if let Some(script) = wrapper {
                script.cleanup();
            }
        });

        opts.send_status(match direction {
            SyncDirection::Pull => "正在从远端拉取...",
            SyncDirection::Push => "正在向远端推送...",
            SyncDirection::Bidirectional => unreachable!("构建前已拆分"),
        })
        .await;

        self.run_transfer(job, &built, started, opts).await
    }

    /// 驱动子进程并流式消费输出
    async fn run_transfer(
        &self,
        job: &Job,
        built: &BuiltCommand,
        started: Instant,
        opts: &SyncOptions,
    ) -> Result<TransferResult, SyncError> {
        debug!("执行: {} {}", built.program, built.args.join(" "));

        let mut child = Command::new(&built.program)
            .args(&built.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // stdout/stderr 合并进同一条通道，保持行产生顺序
        let (tx, mut rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_pump(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(stderr, tx.clone());
        }
        drop(tx);

        let mut attempt_log = self.open_attempt_log(job);
        let mut log_lines: Vec<String> = Vec::new();
        let mut max_bytes: u64 = 0;

        let consume = async {
            while let Some(line) = rx.recv().await {
                if let Some(writer) = attempt_log.as_mut() {
                    let _ = writeln!(writer, "{}", line);
                }
                if let Some(event) = self.parser.parse_line(&line) {
                    if event.bytes_transferred > max_bytes {
                        max_bytes = event.bytes_transferred;
                    }
                    if job.track_progress {
                        if let Some(sender) = &opts.progress {
                            let _ = sender.send(event).await;
                        }
                    }
                }
                log_lines.push(line);
            }
            child.wait().await
        };

        let waited = match self.config.transfer_timeout {
            Some(limit) => tokio::time::timeout(limit, consume).await,
            None => Ok(consume.await),
        };

        let status = match waited {
            Ok(wait_result) => wait_result?,
            Err(_) => {
                // 硬超时：强杀子进程
                let _ = child.kill().await;
                let seconds = self
                    .config
                    .transfer_timeout
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                warn!("任务 '{}' 传输超时（{} 秒），子进程已终止", job.name, seconds);
                return Err(SyncError::Timeout {
                    host: job.host.clone(),
                    seconds,
                });
            }
        };

        if let Some(writer) = attempt_log.as_mut() {
            let _ = writer.flush();
        }

        let duration_seconds = started.elapsed().as_secs_f64();

        if status.success() {
            Ok(TransferResult {
                success: true,
                bytes_transferred: max_bytes,
                duration_seconds,
                log_lines,
                error_message: None,
            })
        } else {
            let code = status.code().unwrap_or(-1);
            let tail = tail_lines(&log_lines, self.config.error_tail_lines);
            Err(SyncError::transfer(code, tail))
        }
    }

    /// 双向模式：共用一次探测，先拉后推，两趟各自重试
    ///
    /// 任一趟失败整体失败；第一趟成功而第二趟失败时不做补偿回滚，
    /// 本地会领先于远端，由下一次同步收敛。
    async fn execute_bidirectional(
        &self,
        job: &Job,
        opts: &SyncOptions,
    ) -> Result<TransferResult, SyncError> {
        opts.send_status("正在测试 SSH 连接...").await;
        probe_connection(&SshConfig::from_job(job)).await?;

        opts.send_status("双向同步第一趟：拉取远端更新...").await;
        let pull = self
            .run_two_way_pass(job, SyncDirection::Pull, opts)
            .await
            .inspect_err(|e| warn!("任务 '{}' 拉取趟失败: {}", job.name, e))?;

        opts.send_status("双向同步第二趟：推送本地更新...").await;
        let push = match self.run_two_way_pass(job, SyncDirection::Push, opts).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    "任务 '{}' 推送趟失败，本地已包含远端更新但远端未收敛: {}",
                    job.name, e
                );
                return Err(e);
            }
        };

        let mut log_lines = pull.log_lines;
        log_lines.push(TWO_WAY_LOG_SEPARATOR.to_string());
        log_lines.extend(push.log_lines);

        info!(
            "任务 '{}' 双向同步完成，拉取 {} 字节，推送 {} 字节",
            job.name, pull.bytes_transferred, push.bytes_transferred
        );

        Ok(TransferResult {
            success: true,
            bytes_transferred: pull.bytes_transferred + push.bytes_transferred,
            duration_seconds: pull.duration_seconds + push.duration_seconds,
            log_lines,
            error_message: None,
        })
    }

    async fn run_two_way_pass(
        &self,
        job: &Job,
        direction: SyncDirection,
        opts: &SyncOptions,
    ) -> Result<TransferResult, SyncError> {
        if opts.use_retry {
            run_with_retry(&self.retry, &job.name, || {
                self.execute_sync(job, direction, true, true, opts)
            })
            .await
        } else {
            self.execute_sync(job, direction, true, true, opts).await
        }
    }

    /// 开启进度跟踪的任务把输出同步落到独立的尝试日志文件。
    /// 日志文件属于辅助输出，打开失败只告警。
    fn open_attempt_log(&self, job: &Job) -> Option<BufWriter<File>> {
        if !job.track_progress {
            return None;
        }
        if let Err(e) = std::fs::create_dir_all(&self.config.log_dir) {
            warn!("创建传输日志目录失败: {}", e);
            return None;
        }
        let path = self.config.log_dir.join(format!(
            "{}_{}.log",
            job.name,
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ));
        match File::create(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                warn!("创建传输日志文件失败: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl JobRunner for RsyncManager {
    async fn run(&self, job: &Job, opts: &SyncOptions) -> Result<TransferResult, SyncError> {
        let direction = opts.direction.unwrap_or(job.direction);
        match direction {
            SyncDirection::Bidirectional => self.execute_bidirectional(job, opts).await,
            single => {
                if opts.use_retry {
                    run_with_retry(&self.retry, &job.name, || {
                        self.execute_sync(job, single, false, false, opts)
                    })
                    .await
                } else {
                    self.execute_sync(job, single, false, false, opts).await
                }
            }
        }
    }
}

/// 把一路输出逐行送进通道；接收端关闭即停
fn spawn_line_pump<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    });
}

/// 末尾 n 行拼成诊断详情
fn tail_lines(lines: &[String], n: usize) -> String {
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobParams;

    fn test_manager(log_dir: PathBuf, transfer_timeout: Option<Duration>) -> RsyncManager {
        let config = RsyncConfig {
            rsync_program: "rsync".into(),
            transfer_timeout,
            log_dir,
            error_tail_lines: 3,
        };
        RsyncManager::with_dialect(config, RetryPolicy::default(), RsyncDialect::Gnu)
    }

    fn shell_command(script: &str) -> BuiltCommand {
        BuiltCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            wrapper: None,
        }
    }

    fn quiet_job() -> Job {
        let mut params = JobParams::new("demo", "example.com", "alice", "/srv/demo", "/tmp/demo");
        params.track_progress = false;
        Job::new(params).unwrap()
    }

    #[tokio::test]
    async fn test_run_transfer_collects_lines_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_path_buf(), None);
        let mut job = quiet_job();
        job.track_progress = true;

        let (tx, mut rx) = mpsc::channel(16);
        let opts = SyncOptions {
            progress: Some(tx),
            ..Default::default()
        };

        let script = "echo 'sending incremental file list'; \
                      echo '      512,000  50%    1.00MB/s    0:00:01'; \
                      echo '    1,238,459  99%   14.98MB/s    0:01:23'";
        let result = manager
            .run_transfer(&job, &shell_command(script), Instant::now(), &opts)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.bytes_transferred, 1_238_459);
        assert_eq!(result.log_lines.len(), 3);
        assert_eq!(result.log_lines[0], "sending incremental file list");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.percent, 50);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.percent, 99);
    }

    #[tokio::test]
    async fn test_run_transfer_classifies_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_path_buf(), None);
        let job = quiet_job();

        let script = "echo line1; echo line2; echo line3; echo line4; exit 23";
        let err = manager
            .run_transfer(&job, &shell_command(script), Instant::now(), &SyncOptions::default())
            .await
            .unwrap_err();

        match err {
            SyncError::Transfer {
                exit_code,
                recoverable,
                detail,
                ..
            } => {
                assert_eq!(exit_code, 23);
                assert!(recoverable);
                // 只保留末尾 3 行
                assert_eq!(detail, "line2\nline3\nline4");
            }
            other => panic!("expected Transfer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_transfer_hard_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_path_buf(), Some(Duration::from_millis(100)));
        let job = quiet_job();

        let started = Instant::now();
        let err = manager
            .run_transfer(
                &job,
                &shell_command("sleep 30"),
                Instant::now(),
                &SyncOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_stderr_merged_into_log() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_path_buf(), None);
        let job = quiet_job();

        let script = "echo out; echo err >&2";
        let result = manager
            .run_transfer(&job, &shell_command(script), Instant::now(), &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(result.log_lines.len(), 2);
        assert!(result.log_lines.contains(&"out".to_string()));
        assert!(result.log_lines.contains(&"err".to_string()));
    }

    #[tokio::test]
    async fn test_attempt_log_written_when_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path().to_path_buf(), None);
        let mut job = quiet_job();
        job.track_progress = true;

        manager
            .run_transfer(
                &job,
                &shell_command("echo hello"),
                Instant::now(),
                &SyncOptions::default(),
            )
            .await
            .unwrap();

        let logs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("demo_"))
            .collect();
        assert_eq!(logs.len(), 1);
        let content = std::fs::read_to_string(logs[0].path()).unwrap();
        assert!(content.contains("hello"));
    }
}
