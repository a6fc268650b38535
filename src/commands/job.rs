//! 任务管理命令

use std::path::Path;

use anyhow::bail;

use super::format_timestamp;
use crate::config::DataConfig;
use crate::core::JobUpdate;
use crate::db::JobParams;
use crate::AppState;

/// 新建任务
pub async fn create_job(state: &AppState, params: JobParams) -> anyhow::Result<()> {
    let job = state.manager.add_job(params).await?;
    println!(
        "已创建任务 '{}'：{}@{}:{} -> {}",
        job.name,
        job.username,
        job.host,
        job.remote_path,
        job.local_path.display()
    );
    match &job.cron_schedule {
        Some(expr) => println!("调度: {}（配合 sync-due 使用）", expr),
        None => println!("未设置调度，需要手动执行 sync {}", job.name),
    }
    Ok(())
}

/// 列出全部任务及下一次调度时间
pub async fn list_jobs(state: &AppState) -> anyhow::Result<()> {
    let jobs = state.manager.jobs_with_next_run().await?;
    if jobs.is_empty() {
        println!("还没有任何同步任务");
        return Ok(());
    }

    for (job, next) in jobs {
        println!(
            "{}  [{}]  {}  {}@{}:{} -> {}",
            job.name,
            job.status.as_str(),
            job.direction.as_str(),
            job.username,
            job.host,
            job.remote_path,
            job.local_path.display()
        );
        if let Some(ts) = job.last_run_at {
            println!("    上次同步: {}", format_timestamp(ts));
        }
        if let Some(err) = &job.last_error {
            println!("    上次错误: {}", err);
        }
        if let Some(next) = next {
            println!(
                "    下次调度: {}",
                next.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(())
}

/// 修改任务
pub async fn edit_job(state: &AppState, name: &str, update: JobUpdate) -> anyhow::Result<()> {
    let job = state.manager.update_job(name, update).await?;
    println!("已更新任务 '{}'", job.name);
    Ok(())
}

/// 删除任务
pub async fn delete_job(state: &AppState, name: &str, remove_files: bool) -> anyhow::Result<()> {
    state.manager.remove_job(name, remove_files).await?;
    if remove_files {
        println!("已删除任务 '{}' 及其本地文件", name);
    } else {
        println!("已删除任务 '{}'（本地文件保留）", name);
    }
    Ok(())
}

/// 查看运行历史
pub async fn show_history(state: &AppState, name: &str, limit: u32) -> anyhow::Result<()> {
    let runs = state.manager.run_history(name, limit).await?;
    if runs.is_empty() {
        println!("任务 '{}' 还没有运行记录", name);
        return Ok(());
    }

    for run in runs {
        let outcome = run
            .error_message
            .map(|e| format!("  {}", e))
            .unwrap_or_default();
        println!(
            "{}  [{}]  {} 字节  {:.1} 秒{}",
            format_timestamp(run.started_at),
            run.status,
            run.bytes_transferred,
            run.duration_seconds,
            outcome
        );
    }
    Ok(())
}

/// 设置数据目录（数据库、日志、锁文件的存放处）
pub fn set_data_path(path: &Path) -> anyhow::Result<()> {
    if !path.is_dir() {
        bail!("目录不存在: {}", path.display());
    }
    let config = DataConfig {
        data_path: Some(path.display().to_string()),
    };
    config.save(&crate::config::config_dir())?;
    println!("数据目录已设置为 {}", path.display());
    Ok(())
}
