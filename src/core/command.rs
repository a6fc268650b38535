//! rsync 命令构建与方言适配
//!
//! 同一个 Job 在 GNU rsync 与 BSD openrsync 下需要不同的参数：
//! openrsync 只认简单的 --progress，也无法解析 -e 里的复合命令串，
//! 后者通过生成一次性的 shell 包装脚本绕过。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::ssh::SshConfig;
use crate::db::{Job, SyncDirection};
use crate::error::SyncError;

/// 外部传输工具的方言
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsyncDialect {
    /// GNU rsync，支持 --info=progress2 与复合 -e 命令串
    Gnu,
    /// BSD openrsync（macOS 自带），只支持基础参数
    Openrsync,
}

/// 运行 `rsync --version` 识别方言，探测失败时按 GNU 处理
pub async fn detect_dialect(rsync_program: &str) -> RsyncDialect {
    let output = Command::new(rsync_program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    match output {
        Ok(out) => {
            let banner = String::from_utf8_lossy(&out.stdout).to_lowercase();
            if banner.contains("openrsync") {
                debug!("检测到 openrsync 方言");
                RsyncDialect::Openrsync
            } else {
                RsyncDialect::Gnu
            }
        }
        Err(e) => {
            warn!("无法运行 {} --version（{}），按 GNU rsync 处理", rsync_program, e);
            RsyncDialect::Gnu
        }
    }
}

/// openrsync 用的一次性 ssh 包装脚本
///
/// 权限 0700，尝试结束后由调用方无条件清理；漏网的实例靠 Drop 兜底。
#[derive(Debug)]
pub struct WrapperScript {
    path: PathBuf,
}

impl WrapperScript {
    /// 在系统临时目录生成脚本，内容为 `exec ssh <参数> "$@"`
    pub fn create(job_name: &str, ssh: &SshConfig) -> Result<Self, SyncError> {
        let path = std::env::temp_dir().join(format!(
            "synckeeper-ssh-{}-{}.sh",
            job_name,
            std::process::id()
        ));

        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "#!/bin/sh")?;
        writeln!(file, "exec {} \"$@\"", ssh.command_string())?;
        file.sync_all()?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        }

        debug!("生成 ssh 包装脚本: {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 删除脚本文件
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("清理 ssh 包装脚本失败: {}", e);
            }
        }
    }
}

impl Drop for WrapperScript {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// 构建好的一次传输命令
#[derive(Debug)]
pub struct BuiltCommand {
    pub program: String,
    pub args: Vec<String>,
    /// openrsync 方言下生成的包装脚本，尝试结束后清理
    pub wrapper: Option<WrapperScript>,
}

/// 传输命令构建器
#[derive(Debug, Clone)]
pub struct RsyncCommandBuilder {
    pub dialect: RsyncDialect,
    pub rsync_program: String,
}

impl RsyncCommandBuilder {
    pub fn new(dialect: RsyncDialect) -> Self {
        Self {
            dialect,
            rsync_program: "rsync".into(),
        }
    }

    /// 按 Job 与生效方向产出参数列表
    ///
    /// `two_way_pass` 表示这是双向模式中的一趟：禁用删除并加上
    /// --update，保证两侧都可能有新文件时互不破坏。
    /// 方向必须已经解析为 PULL 或 PUSH。
    pub fn build(
        &self,
        job: &Job,
        direction: SyncDirection,
        two_way_pass: bool,
    ) -> Result<BuiltCommand, SyncError> {
        if direction == SyncDirection::Bidirectional {
            return Err(SyncError::Config(
                "双向同步需要拆成两次单向调用，不能直接构建命令".into(),
            ));
        }

        // 归档、详细输出、人类可读字节数
        let mut args: Vec<String> = vec!["-avh".into()];

        // 进度参数按方言选择：openrsync 只认 --progress
        if job.track_progress {
            match self.dialect {
                RsyncDialect::Gnu => {
                    args.push("--info=progress2".into());
                    args.push("--no-inc-recursive".into());
                }
                RsyncDialect::Openrsync => args.push("--progress".into()),
            }
        }

        // 传输期压缩
        args.push("-z".into());

        // 双向模式下两侧都可能合法新增，删除不安全
        if job.delete_extraneous && !two_way_pass {
            args.push("--delete".into());
        }

        args.push("--itemize-changes".into());

        if two_way_pass {
            // 仅当源端更新时覆盖，按修改时间做 last-write-wins
            args.push("--update".into());
        }

        if let Some(limit) = job.bandwidth_limit {
            args.push("--bwlimit".into());
            args.push(limit.to_string());
        }

        for pattern in &job.exclude_patterns {
            args.push("--exclude".into());
            args.push(pattern.clone());
        }

        // 远程访问子命令
        let ssh = SshConfig::from_job(job);
        let wrapper = match self.dialect {
            RsyncDialect::Gnu => {
                args.push("-e".into());
                args.push(ssh.command_string());
                None
            }
            RsyncDialect::Openrsync => {
                let script = WrapperScript::create(&job.name, &ssh)?;
                args.push("-e".into());
                args.push(script.path().to_string_lossy().into_owned());
                Some(script)
            }
        };

        // 源与目标都带尾部斜杠，复制目录内容而不是目录本身
        let remote = format!(
            "{}@{}:{}",
            job.username,
            job.host,
            with_trailing_slash(&job.remote_path)
        );
        let local = local_with_trailing_slash(&job.local_path);

        match direction {
            SyncDirection::Pull => {
                // 目标父目录缺失时补建
                if let Some(parent) = job.local_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                args.push(remote);
                args.push(local);
            }
            SyncDirection::Push => {
                if !job.local_path.exists() {
                    return Err(SyncError::Config(format!(
                        "推送源目录不存在: {}",
                        job.local_path.display()
                    )));
                }
                args.push(local);
                args.push(remote);
            }
            SyncDirection::Bidirectional => unreachable!("前面已拦截"),
        }

        Ok(BuiltCommand {
            program: self.rsync_program.clone(),
            args,
            wrapper,
        })
    }
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

fn local_with_trailing_slash(path: &Path) -> String {
    with_trailing_slash(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobParams;

    fn pull_job(local_root: &Path) -> Job {
        Job::new(JobParams::new(
            "music",
            "example.com",
            "alice",
            "/srv/media/music",
            local_root,
        ))
        .unwrap()
    }

    #[test]
    fn test_pull_source_and_destination() {
        let dir = tempfile::tempdir().unwrap();
        let job = pull_job(dir.path());
        let built = RsyncCommandBuilder::new(RsyncDialect::Gnu)
            .build(&job, SyncDirection::Pull, false)
            .unwrap();

        let source = &built.args[built.args.len() - 2];
        let dest = &built.args[built.args.len() - 1];
        assert!(source.starts_with("alice@example.com:"));
        assert!(source.ends_with('/'));
        assert!(dest.starts_with(&job.local_path.to_string_lossy().into_owned()));
        assert!(dest.ends_with('/'));
        // 目标目录在 local_path 之下
        assert!(dest.contains("music"));
        assert!(built.args.contains(&"--delete".to_string()));
        assert!(built.args.contains(&"--info=progress2".to_string()));
        assert!(built.wrapper.is_none());
    }

    #[test]
    fn test_push_requires_existing_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = pull_job(dir.path());
        job.direction = SyncDirection::Push;
        // local_path/music 尚不存在
        let result = RsyncCommandBuilder::new(RsyncDialect::Gnu).build(
            &job,
            SyncDirection::Push,
            false,
        );
        assert!(matches!(result, Err(SyncError::Config(_))));

        std::fs::create_dir_all(&job.local_path).unwrap();
        let built = RsyncCommandBuilder::new(RsyncDialect::Gnu)
            .build(&job, SyncDirection::Push, false)
            .unwrap();
        let dest = built.args.last().unwrap();
        assert!(dest.starts_with("alice@example.com:"));
    }

    #[test]
    fn test_two_way_pass_is_non_destructive() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = pull_job(dir.path());
        job.delete_extraneous = true;
        std::fs::create_dir_all(&job.local_path).unwrap();

        for direction in [SyncDirection::Pull, SyncDirection::Push] {
            let built = RsyncCommandBuilder::new(RsyncDialect::Gnu)
                .build(&job, direction, true)
                .unwrap();
            assert!(!built.args.contains(&"--delete".to_string()));
            assert!(built.args.contains(&"--update".to_string()));
        }
    }

    #[test]
    fn test_bidirectional_direction_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let job = pull_job(dir.path());
        let result = RsyncCommandBuilder::new(RsyncDialect::Gnu).build(
            &job,
            SyncDirection::Bidirectional,
            false,
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_bandwidth_and_excludes_appended_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = pull_job(dir.path());
        job.bandwidth_limit = Some(750);
        job.exclude_patterns = vec!["*.tmp".into(), ".cache/".into()];

        let built = RsyncCommandBuilder::new(RsyncDialect::Gnu)
            .build(&job, SyncDirection::Pull, false)
            .unwrap();
        let joined = built.args.join(" ");
        assert!(joined.contains("--bwlimit 750"));
        assert!(joined.contains("--exclude *.tmp"));
        assert!(joined.contains("--exclude .cache/"));
    }

    #[test]
    fn test_openrsync_uses_wrapper_script_and_simple_progress() {
        let dir = tempfile::tempdir().unwrap();
        let job = pull_job(dir.path());
        let built = RsyncCommandBuilder::new(RsyncDialect::Openrsync)
            .build(&job, SyncDirection::Pull, false)
            .unwrap();

        assert!(built.args.contains(&"--progress".to_string()));
        assert!(!built.args.contains(&"--info=progress2".to_string()));

        let wrapper = built.wrapper.as_ref().unwrap();
        assert!(wrapper.path().exists());
        let content = std::fs::read_to_string(wrapper.path()).unwrap();
        assert!(content.starts_with("#!/bin/sh"));
        assert!(content.contains("exec ssh"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(wrapper.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        let path = wrapper.path().to_path_buf();
        wrapper.cleanup();
        assert!(!path.exists());
    }
}
