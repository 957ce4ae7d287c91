//! 基于系统 `ssh`/`scp` 的传输实现
//!
//! 每个会话启动一个 ControlMaster 主连接，后续命令和文件传输复用同一个控制套接字，
//! `close` 时发送 `-O exit` 结束主连接。全程 `BatchMode=yes`，不会弹出交互式提示。

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandOutput, RemoteSession, RemoteTransport};
use crate::error::{ConnectionError, ExecutionError, TransferError};
use crate::registry::ServerRecord;
use crate::utils::expand_tilde;

/// ssh 自身出错（而非远程命令失败）时的退出码
const SSH_ERROR_STATUS: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_program: String,
    scp_program: String,
    default_key: Option<PathBuf>,
    socket_dir: PathBuf,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SshTransport {
    pub fn new(default_key: Option<PathBuf>) -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
            default_key,
            socket_dir: std::env::temp_dir(),
        }
    }

    fn key_for(&self, record: &ServerRecord) -> Option<PathBuf> {
        record
            .auth_key_path
            .as_ref()
            .or(self.default_key.as_ref())
            .map(|p| expand_tilde(p))
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn connect(
        &self,
        record: &ServerRecord,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, ConnectionError> {
        let endpoint = record.endpoint();
        let id = uuid::Uuid::new_v4().simple().to_string();
        // unix socket 路径长度有限，保持文件名短
        let control_path = self.socket_dir.join(format!("haven-{}.sock", &id[..12]));
        // 连接 future 被外层超时丢弃时，临时日志随 TempPath 一起删除
        let log_path = tempfile::Builder::new()
            .prefix("haven-")
            .suffix(".log")
            .tempfile_in(&self.socket_dir)
            .map_err(|e| ConnectionError::NetworkUnreachable {
                endpoint: endpoint.clone(),
                message: format!("failed to create ssh log file: {}", e),
            })?
            .into_temp_path();
        let destination = format!("{}@{}", record.user, record.host);

        let mut cmd = Command::new(&self.ssh_program);
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-E")
            .arg(log_path.as_os_str())
            .args(["-f", "-N", "-p"])
            .arg(record.port.to_string());
        if let Some(key) = self.key_for(record) {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!(endpoint = %endpoint, control_path = %control_path.display(), "Starting ssh control master");

        let status = match cmd.status().await {
            Ok(status) => status,
            Err(e) => {
                return Err(ConnectionError::NetworkUnreachable {
                    endpoint,
                    message: format!("failed to spawn {}: {}", self.ssh_program, e),
                });
            }
        };
        let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
        if let Err(e) = log_path.close() {
            debug!(error = %e, "Failed to remove ssh log file");
        }

        if !status.success() {
            return Err(classify_connect_failure(&endpoint, timeout, &log));
        }

        Ok(Box::new(SshSession {
            ssh_program: self.ssh_program.clone(),
            scp_program: self.scp_program.clone(),
            endpoint,
            destination,
            port: record.port,
            control_path,
        }))
    }
}

/// 把 ssh 握手阶段的错误输出归类到连接错误
pub fn classify_connect_failure(endpoint: &str, timeout: Duration, stderr: &str) -> ConnectionError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("permission denied")
        || lower.contains("host key verification failed")
        || lower.contains("too many authentication failures")
    {
        ConnectionError::AuthFailure {
            endpoint: endpoint.to_string(),
            message,
        }
    } else if lower.contains("timed out") {
        ConnectionError::ConnectTimeout {
            endpoint: endpoint.to_string(),
            timeout,
        }
    } else {
        ConnectionError::NetworkUnreachable {
            endpoint: endpoint.to_string(),
            message: if message.is_empty() {
                "ssh exited without a diagnostic".to_string()
            } else {
                message
            },
        }
    }
}

/// 把 scp 的错误输出归类到传输错误
pub fn classify_transfer_failure(remote: &str, status: Option<i32>, stderr: &str) -> TransferError {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied") {
        TransferError::PermissionDenied {
            path: remote.to_string(),
        }
    } else if status == Some(SSH_ERROR_STATUS)
        || lower.contains("connection closed")
        || lower.contains("broken pipe")
        || lower.contains("lost connection")
    {
        TransferError::Disconnected {
            path: remote.to_string(),
        }
    } else {
        TransferError::Io {
            path: remote.to_string(),
            message: stderr.trim().to_string(),
        }
    }
}

struct SshSession {
    ssh_program: String,
    scp_program: String,
    endpoint: String,
    destination: String,
    port: u16,
    control_path: PathBuf,
}

impl SshSession {
    fn control_opt(&self) -> String {
        format!("ControlPath={}", self.control_path.display())
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, ExecutionError> {
        let out = Command::new(&self.ssh_program)
            .args(["-o", "BatchMode=yes", "-o"])
            .arg(self.control_opt())
            .arg("-p")
            .arg(self.port.to_string())
            .arg(&self.destination)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutionError::Disconnected {
                message: format!("failed to spawn {}: {}", self.ssh_program, e),
            })?;

        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
        let code = out.status.code().unwrap_or(-1);

        if code == SSH_ERROR_STATUS {
            return Err(ExecutionError::Disconnected {
                message: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput {
            exit_code: code,
            stdout,
            stderr,
        })
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        if let Err(e) = tokio::fs::metadata(local).await {
            return Err(TransferError::Io {
                path: local.display().to_string(),
                message: e.to_string(),
            });
        }

        let out = Command::new(&self.scp_program)
            .args(["-q", "-o", "BatchMode=yes", "-o"])
            .arg(self.control_opt())
            .arg("-P")
            .arg(self.port.to_string())
            .arg(local)
            .arg(format!("{}:{}", self.destination, remote))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TransferError::Io {
                path: remote.to_string(),
                message: format!("failed to spawn {}: {}", self.scp_program, e),
            })?;

        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        Err(classify_transfer_failure(remote, out.status.code(), &stderr))
    }

    async fn close(&self) {
        let result = Command::new(&self.ssh_program)
            .arg("-o")
            .arg(self.control_opt())
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match result {
            Ok(_) => debug!(endpoint = %self.endpoint, "ssh control master closed"),
            Err(e) => warn!(endpoint = %self.endpoint, error = %e, "Failed to close ssh control master"),
        }
        let _ = tokio::fs::remove_file(&self.control_path).await;
    }
}
