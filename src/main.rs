use std::path::PathBuf;

use clap::{Parser, Subcommand};
use synckeeper::core::JobUpdate;
use synckeeper::db::{JobParams, SyncDirection};
use synckeeper::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use synckeeper::{commands, AppState};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(
    name = "synckeeper",
    version,
    about = "管理基于 rsync/ssh 的周期性目录同步任务"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 新建同步任务
    Add {
        /// 任务名（字母、数字、下划线、连字符）
        name: String,
        /// 远端主机
        host: String,
        /// SSH 用户名
        username: String,
        /// 远端目录
        remote_path: String,
        /// 本地目录（自动追加远端目录名）
        local_path: PathBuf,
        /// SSH 端口
        #[arg(long, default_value_t = 22)]
        port: u16,
        /// SSH 私钥路径
        #[arg(long)]
        key: Option<PathBuf>,
        /// SSH 连接超时（秒）
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// 同步成功后压缩本地目录
        #[arg(long)]
        compress: bool,
        /// 不删除目标端多余文件
        #[arg(long)]
        no_delete: bool,
        /// 关闭进度跟踪
        #[arg(long)]
        no_progress: bool,
        /// 带宽上限（KB/s）
        #[arg(long)]
        bwlimit: Option<u32>,
        /// 排除规则，可多次指定
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        /// cron 调度表达式
        #[arg(long)]
        schedule: Option<String>,
        /// 同步方向: pull / push / bidirectional
        #[arg(long, default_value = "pull")]
        direction: String,
    },
    /// 列出全部任务
    List,
    /// 修改任务
    Edit {
        name: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        remote_path: Option<String>,
        #[arg(long)]
        local_path: Option<PathBuf>,
        /// 新的 cron 调度表达式
        #[arg(long)]
        schedule: Option<String>,
        /// 清除调度
        #[arg(long, conflicts_with = "schedule")]
        clear_schedule: bool,
        #[arg(long)]
        direction: Option<String>,
        /// 开关同步后压缩（true/false）
        #[arg(long)]
        compress: Option<bool>,
        #[arg(long)]
        bwlimit: Option<u32>,
        /// 清除带宽限制
        #[arg(long, conflicts_with = "bwlimit")]
        clear_bwlimit: bool,
    },
    /// 删除任务
    Remove {
        name: String,
        /// 连同本地目录与归档一起删除
        #[arg(long)]
        remove_files: bool,
    },
    /// 立即同步一个任务
    Sync {
        name: String,
        /// 覆盖任务自身的方向: pull / push / bidirectional
        #[arg(long)]
        direction: Option<String>,
        /// 失败时不自动重试
        #[arg(long)]
        no_retry: bool,
    },
    /// 同步所有到期任务
    SyncDue,
    /// 树形预览任务的本地目录
    Tree {
        name: String,
        #[arg(long, default_value_t = 2)]
        depth: usize,
    },
    /// 解包任务归档
    Extract {
        name: String,
        /// 解压目标目录，默认为本地目录的父目录
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// 查看任务运行历史
    History {
        name: String,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// 设置数据目录
    SetDataPath { path: PathBuf },
}

/// 初始化日志系统：文件输出带大小轮转，debug 构建同时打到控制台
fn init_logging() {
    let log_dir = get_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);

    let config = LogConfig::load(&crate_config_dir());
    if !config.enabled {
        let subscriber = tracing_subscriber::registry();
        let _ = tracing::subscriber::set_global_default(subscriber);
        return;
    }

    let level = config.tracing_level();
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("sqlx=warn".parse().unwrap());

    if let Ok(file_writer) = SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(false);

        #[cfg(debug_assertions)]
        {
            let console_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false);
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(console_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
        }

        #[cfg(not(debug_assertions))]
        {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer);
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    } else {
        // 文件日志不可用时退回到 stderr
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

fn crate_config_dir() -> PathBuf {
    synckeeper::config::config_dir()
}

fn parse_direction(s: &str) -> anyhow::Result<SyncDirection> {
    SyncDirection::try_from(s).map_err(|e| anyhow::anyhow!("{}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    // 数据目录设置不依赖数据库
    if let Command::SetDataPath { path } = &cli.command {
        return commands::job::set_data_path(path);
    }

    let state = AppState::new().await?;
    let result = dispatch(&state, cli.command).await;
    state.cleanup().await;
    result
}

async fn dispatch(state: &AppState, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Add {
            name,
            host,
            username,
            remote_path,
            local_path,
            port,
            key,
            timeout,
            compress,
            no_delete,
            no_progress,
            bwlimit,
            excludes,
            schedule,
            direction,
        } => {
            let mut params = JobParams::new(name, host, username, remote_path, local_path);
            params.ssh_port = port;
            params.ssh_key_path = key;
            params.ssh_timeout = timeout;
            params.use_compression = compress;
            params.delete_extraneous = !no_delete;
            params.track_progress = !no_progress;
            params.bandwidth_limit = bwlimit;
            params.exclude_patterns = excludes;
            params.cron_schedule = schedule;
            params.direction = parse_direction(&direction)?;
            commands::job::create_job(state, params).await
        }
        Command::List => commands::job::list_jobs(state).await,
        Command::Edit {
            name,
            host,
            username,
            remote_path,
            local_path,
            schedule,
            clear_schedule,
            direction,
            compress,
            bwlimit,
            clear_bwlimit,
        } => {
            let update = JobUpdate {
                host,
                username,
                remote_path,
                local_path,
                use_compression: compress,
                delete_extraneous: None,
                track_progress: None,
                bandwidth_limit: if clear_bwlimit {
                    Some(None)
                } else {
                    bwlimit.map(Some)
                },
                exclude_patterns: None,
                cron_schedule: if clear_schedule {
                    Some(None)
                } else {
                    schedule.map(Some)
                },
                direction: direction.as_deref().map(parse_direction).transpose()?,
            };
            commands::job::edit_job(state, &name, update).await
        }
        Command::Remove { name, remove_files } => {
            commands::job::delete_job(state, &name, remove_files).await
        }
        Command::Sync {
            name,
            direction,
            no_retry,
        } => {
            let direction = direction.as_deref().map(parse_direction).transpose()?;
            commands::sync::start_sync(state, &name, direction, no_retry).await
        }
        Command::SyncDue => commands::sync::sync_due(state).await,
        Command::Tree { name, depth } => commands::sync::show_tree(state, &name, depth).await,
        Command::Extract { name, dest } => commands::sync::extract(state, &name, dest).await,
        Command::History { name, limit } => {
            commands::job::show_history(state, &name, limit).await
        }
        Command::SetDataPath { .. } => unreachable!("已在 main 中处理"),
    }
}
