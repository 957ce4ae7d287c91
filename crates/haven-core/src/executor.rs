//! 远程执行器
//!
//! 在 [`RemoteTransport`] 之上统一处理连接重试、命令超时和会话释放。
//! 会话由 [`SessionGuard`] 持有：显式 `close` 之外，guard 被丢弃时（出错、超时、
//! 取消、future 被 drop）也会在运行时上调度关闭，保证会话不泄漏。

use futures::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backoff::RetryPolicy;
use crate::config::SshConfig;
use crate::error::{ConnectionError, ExecutionError, Result, TransferError};
use crate::registry::ServerRecord;
use crate::transport::{CommandOutput, RemoteSession, RemoteTransport};

/// 会话守卫，释放责任唯一
pub struct SessionGuard {
    endpoint: String,
    session: Option<Box<dyn RemoteSession>>,
}

impl SessionGuard {
    fn new(session: Box<dyn RemoteSession>) -> Self {
        Self {
            endpoint: session.endpoint().to_string(),
            session: Some(session),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn session(&self) -> std::result::Result<&dyn RemoteSession, ExecutionError> {
        self.session
            .as_deref()
            .ok_or_else(|| ExecutionError::Disconnected {
                message: format!("session to {} already closed", self.endpoint),
            })
    }

    /// 显式关闭并等待完成
    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
            debug!(endpoint = %self.endpoint, "Session closed");
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(endpoint = %self.endpoint, "Session guard dropped, scheduling close");
                handle.spawn(async move {
                    session.close().await;
                });
            }
            Err(_) => {
                warn!(endpoint = %self.endpoint, "Session dropped outside a runtime; close skipped");
            }
        }
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("endpoint", &self.endpoint)
            .field("open", &self.session.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn RemoteTransport>,
    retry: RetryPolicy,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl RemoteExecutor {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        retry: RetryPolicy,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            retry,
            connect_timeout,
            command_timeout,
        }
    }

    pub fn from_config(transport: Arc<dyn RemoteTransport>, cfg: &SshConfig) -> Self {
        Self::new(
            transport,
            RetryPolicy::from(&cfg.retry),
            cfg.connect_timeout(),
            cfg.command_timeout(),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// 建立会话；网络类错误按重试策略退避重试，认证失败立即返回
    pub async fn connect(&self, record: &ServerRecord) -> Result<SessionGuard> {
        let timeout = self.connect_timeout;
        let transport = self.transport.clone();
        let endpoint = record.endpoint();

        let session = self
            .retry
            .retry(
                || {
                    let transport = transport.clone();
                    let endpoint = endpoint.clone();
                    async move {
                        match tokio::time::timeout(timeout, transport.connect(record, timeout))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ConnectionError::ConnectTimeout { endpoint, timeout }),
                        }
                    }
                },
                |e: &ConnectionError| e.is_retriable(),
            )
            .await?;

        debug!(server = %record.name, endpoint = %endpoint, "Session established");
        Ok(SessionGuard::new(session))
    }

    pub async fn run_command(&self, session: &SessionGuard, command: &str) -> Result<CommandOutput> {
        self.run_command_with_timeout(session, command, self.command_timeout)
            .await
    }

    pub async fn run_command_with_timeout(
        &self,
        session: &SessionGuard,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let remote = session.session()?;
        debug!(endpoint = %session.endpoint(), command = %command, "Running remote command");
        match tokio::time::timeout(timeout, remote.exec(command)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ExecutionError::CommandTimeout {
                command: command.to_string(),
                timeout,
            }
            .into()),
        }
    }

    /// 同 `run_command`，非零退出码视为 `NonZeroExit`
    pub async fn run_checked(&self, session: &SessionGuard, command: &str) -> Result<CommandOutput> {
        let output = self.run_command(session, command).await?;
        if !output.success() {
            return Err(ExecutionError::NonZeroExit {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    pub async fn copy_file(&self, session: &SessionGuard, local: &Path, remote: &str) -> Result<()> {
        let remote_session = session
            .session()
            .map_err(|_| TransferError::Disconnected {
                path: remote.to_string(),
            })?;
        debug!(endpoint = %session.endpoint(), local = %local.display(), remote = %remote, "Copying file");
        match tokio::time::timeout(self.command_timeout, remote_session.put_file(local, remote)).await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransferError::Io {
                path: remote.to_string(),
                message: format!("transfer timed out after {:?}", self.command_timeout),
            }
            .into()),
        }
    }

    /// 在一个独占会话内执行 `body`，无论结果如何都会释放会话
    pub async fn with_session<T, F>(&self, record: &ServerRecord, body: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s SessionGuard) -> BoxFuture<'s, Result<T>>,
    {
        let session = self.connect(record).await?;
        let result = body(&session).await;
        session.close().await;
        result
    }

    /// 连接并做一次 `echo` 往返，返回耗时
    pub async fn test_connection(&self, record: &ServerRecord) -> Result<Duration> {
        let started = Instant::now();
        let executor = self.clone();
        let elapsed = self
            .with_session(record, move |session| {
                Box::pin(async move {
                    let out = executor.run_checked(session, "echo haven-ok").await?;
                    if out.stdout.trim() != "haven-ok" {
                        return Err(ExecutionError::Disconnected {
                            message: format!("unexpected echo reply: {}", out.stdout.trim()),
                        }
                        .into());
                    }
                    Ok(started.elapsed())
                })
            })
            .await?;
        info!(server = %record.name, elapsed_ms = elapsed.as_millis() as u64, "Connection test passed");
        Ok(elapsed)
    }
}
