//! SSH 连接参数与连通性探测
//!
//! 探测在任何传输尝试之前进行：跑一条最小的远程命令并回显标记串，
//! 仅凭退出码 0 不足以判定成功（shell 配置异常时可能假成功）。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::db::Job;
use crate::error::SyncError;

/// 连通性探测的回显标记
pub const PROBE_MARKER: &str = "synckeeper-connection-probe";

/// 一个任务的 SSH 连接参数
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub username: String,
    pub port: u16,
    pub key_path: Option<PathBuf>,
    /// 连接超时（秒）
    pub connect_timeout: u64,
    /// 连接复用，减少多次调用的握手开销
    pub use_multiplexing: bool,
}

impl SshConfig {
    pub fn from_job(job: &Job) -> Self {
        Self {
            host: job.host.clone(),
            username: job.username.clone(),
            port: job.ssh_port,
            key_path: job.ssh_key_path.clone(),
            connect_timeout: job.ssh_timeout,
            use_multiplexing: true,
        }
    }

    /// ssh 参数列表（不含目标主机）
    pub fn ssh_args(&self) -> Vec<String> {
        let mut parts: Vec<String> = Vec::new();

        if self.port != 22 {
            parts.push("-p".into());
            parts.push(self.port.to_string());
        }

        if let Some(key) = &self.key_path {
            parts.push("-i".into());
            parts.push(key.to_string_lossy().into_owned());
        }

        parts.push("-o".into());
        parts.push(format!("ConnectTimeout={}", self.connect_timeout));
        parts.push("-o".into());
        parts.push("ServerAliveInterval=10".into());
        parts.push("-o".into());
        parts.push("ServerAliveCountMax=3".into());
        // 无交互模式：凭证不可用时直接失败而不是挂在密码提示上
        parts.push("-o".into());
        parts.push("BatchMode=yes".into());

        if self.use_multiplexing {
            parts.push("-o".into());
            parts.push(format!(
                "ControlPath=~/.ssh/synckeeper-{}-%r@%h:%p",
                self.host
            ));
            parts.push("-o".into());
            parts.push("ControlMaster=auto".into());
            parts.push("-o".into());
            parts.push("ControlPersist=600".into());
        }

        parts.push("-o".into());
        parts.push("StrictHostKeyChecking=accept-new".into());

        parts
    }

    /// 拼成 rsync -e 可用的单串命令（带 shell 引用）
    pub fn command_string(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.ssh_args());
        parts
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// 最小化的 POSIX shell 引用：安全字符原样保留，其余单引号包裹
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(b, b'-' | b'_' | b'.' | b'/' | b'=' | b':' | b'@' | b'~' | b'%' | b',')
        });
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// 探测远端可达性与认证
///
/// 成功要求退出码为 0 且输出中出现标记串；失败按诊断文本分类，
/// 整体耗时超过 connect_timeout + 5 秒按超时处理。
pub async fn probe_connection(config: &SshConfig) -> Result<(), SyncError> {
    let mut cmd = Command::new("ssh");
    cmd.args(config.ssh_args())
        .arg(config.destination())
        .arg("echo")
        .arg(PROBE_MARKER)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("探测 SSH 连通性: {}", config.destination());

    let deadline = Duration::from_secs(config.connect_timeout + 5);
    let output = match tokio::time::timeout(deadline, cmd.output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(SyncError::Timeout {
                host: config.host.clone(),
                seconds: config.connect_timeout,
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() && stdout.contains(PROBE_MARKER) {
        debug!("SSH 连通性正常: {}", config.destination());
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(classify_probe_failure(config, &stderr, output.status.success()))
}

/// 按优先级匹配常见 SSH 诊断文本
fn classify_probe_failure(config: &SshConfig, stderr: &str, exit_ok: bool) -> SyncError {
    let lowered = stderr.to_lowercase();

    if lowered.contains("permission denied") {
        return SyncError::Authentication(format!(
            "{} 拒绝了凭证，请检查 SSH 密钥或账号权限",
            config.destination()
        ));
    }
    if lowered.contains("host key verification failed") {
        return SyncError::Connection(format!(
            "{} 的 host key 校验失败，可执行 ssh-keyscan {} >> ~/.ssh/known_hosts 后重试",
            config.host, config.host
        ));
    }
    if lowered.contains("connection refused") {
        return SyncError::Connection(format!(
            "{}:{} 拒绝连接，请确认 SSH 服务在运行",
            config.host, config.port
        ));
    }
    if lowered.contains("no route to host") || lowered.contains("network is unreachable") {
        return SyncError::Connection(format!("无法到达主机 {}，请检查网络", config.host));
    }

    if exit_ok {
        // 退出码为 0 但没有标记串，远端 shell 行为异常
        return SyncError::Connection(format!(
            "{} 的探测命令未回显预期标记，远端 shell 配置可能有问题",
            config.destination()
        ));
    }

    SyncError::Connection(format!("SSH 连接失败: {}", stderr.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SshConfig {
        SshConfig {
            host: "example.com".into(),
            username: "alice".into(),
            port: 2222,
            key_path: Some(PathBuf::from("/home/alice/.ssh/id_ed25519")),
            connect_timeout: 30,
            use_multiplexing: true,
        }
    }

    #[test]
    fn test_ssh_args_include_connection_parameters() {
        let args = config().ssh_args();
        let joined = args.join(" ");
        assert!(joined.contains("-p 2222"));
        assert!(joined.contains("-i /home/alice/.ssh/id_ed25519"));
        assert!(joined.contains("ConnectTimeout=30"));
        assert!(joined.contains("BatchMode=yes"));
        assert!(joined.contains("ControlMaster=auto"));
        assert!(joined.contains("StrictHostKeyChecking=accept-new"));
    }

    #[test]
    fn test_default_port_omitted() {
        let mut c = config();
        c.port = 22;
        assert!(!c.ssh_args().join(" ").contains("-p "));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ssh"), "ssh");
        assert_eq!(shell_quote("ConnectTimeout=30"), "ConnectTimeout=30");
        assert_eq!(shell_quote("my key.pem"), "'my key.pem'");
        assert_eq!(shell_quote("a'b"), r#"'a'\''b'"#);
    }

    #[test]
    fn test_classify_probe_failure_priority() {
        let c = config();
        assert!(matches!(
            classify_probe_failure(&c, "alice@example.com: Permission denied (publickey).", false),
            SyncError::Authentication(_)
        ));
        assert!(matches!(
            classify_probe_failure(&c, "Host key verification failed.", false),
            SyncError::Connection(_)
        ));
        assert!(matches!(
            classify_probe_failure(&c, "connect to host example.com port 2222: Connection refused", false),
            SyncError::Connection(_)
        ));
        // 退出码 0 但没有标记串
        assert!(matches!(
            classify_probe_failure(&c, "", true),
            SyncError::Connection(_)
        ));
    }
}
