//! 同步执行命令

use std::io::Write;
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::core::{ProgressEvent, SyncOptions};
use crate::db::SyncDirection;
use crate::AppState;

/// 同步单个任务，进度与阶段消息打到终端
pub async fn start_sync(
    state: &AppState,
    name: &str,
    direction: Option<SyncDirection>,
    no_retry: bool,
) -> anyhow::Result<()> {
    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressEvent>(64);
    let (status_tx, mut status_rx) = mpsc::channel::<String>(16);

    let printer = tokio::spawn(async move {
        let mut printed_progress = false;
        let mut status_open = true;
        let mut progress_open = true;
        while status_open || progress_open {
            tokio::select! {
                status = status_rx.recv(), if status_open => match status {
                    Some(message) => {
                        if printed_progress {
                            println!();
                            printed_progress = false;
                        }
                        println!("{}", message);
                    }
                    None => status_open = false,
                },
                event = progress_rx.recv(), if progress_open => match event {
                    Some(event) => {
                        print!(
                            "\r{:>3}%  {:<12}  剩余 {}",
                            event.percent, event.transfer_rate, event.eta
                        );
                        let _ = std::io::stdout().flush();
                        printed_progress = true;
                    }
                    None => progress_open = false,
                },
            }
        }
        if printed_progress {
            println!();
        }
    });

    let opts = SyncOptions {
        progress: Some(progress_tx),
        status: Some(status_tx),
        use_retry: !no_retry,
        direction,
    };
    let result = state.manager.sync_job(name, opts).await;
    let _ = printer.await;

    match result {
        Ok(result) => {
            println!(
                "同步完成: {} 字节，耗时 {:.1} 秒",
                result.bytes_transferred, result.duration_seconds
            );
            Ok(())
        }
        Err(e) => {
            if let Some(detail) = e.detail() {
                eprintln!("--- rsync 末尾输出 ---");
                eprintln!("{}", detail);
            }
            Err(e.into())
        }
    }
}

/// 同步所有到期任务
pub async fn sync_due(state: &AppState) -> anyhow::Result<()> {
    let synced = state.manager.sync_all_due(None).await?;
    if synced.is_empty() {
        println!("没有到期的任务");
    } else {
        println!("已同步 {} 个任务: {}", synced.len(), synced.join(", "));
    }
    Ok(())
}

/// 打印任务本地目录的树形结构
pub async fn show_tree(state: &AppState, name: &str, depth: usize) -> anyhow::Result<()> {
    let lines = state.manager.directory_tree(name, depth).await?;
    println!("{}/", name);
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

/// 解包任务归档
pub async fn extract(state: &AppState, name: &str, dest: Option<PathBuf>) -> anyhow::Result<()> {
    let dest = state.manager.extract_job_archive(name, dest).await?;
    println!("归档已解压到 {}", dest.display());
    Ok(())
}
