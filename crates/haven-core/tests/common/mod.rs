//! 集成测试共用的内存传输实现
#![allow(dead_code)]

use async_trait::async_trait;
use haven_core::backoff::{RetryConfig, RetryPolicy};
use haven_core::error::{ConnectionError, ExecutionError, TransferError};
use haven_core::executor::RemoteExecutor;
use haven_core::registry::{ServerRecord, ServerRegistry};
use haven_core::transport::{CommandOutput, RemoteSession, RemoteTransport};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// 单台模拟主机的行为
#[derive(Debug, Clone, Default)]
pub struct HostBehavior {
    /// 建立连接的耗时
    pub connect_delay: Duration,
    /// 每条命令/每次传输的耗时
    pub step_delay: Duration,
    /// 命令包含该子串时以退出码 1 失败
    pub fail_command: Option<String>,
    pub auth_failure: bool,
    /// 前 N 次连接返回 NetworkUnreachable
    pub unreachable_attempts: u32,
    /// 关闭会话的耗时
    pub close_delay: Duration,
}

#[derive(Debug, Default)]
struct HostState {
    files: HashMap<String, String>,
    commands: Vec<String>,
    connect_attempts: u32,
    puts: usize,
    open_sessions: usize,
}

#[derive(Debug, Default)]
struct Inner {
    behaviors: HashMap<String, HostBehavior>,
    hosts: HashMap<String, HostState>,
    open_total: usize,
    max_open_total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, host: &str, behavior: HostBehavior) {
        self.lock().behaviors.insert(host.to_string(), behavior);
    }

    pub fn set_file(&self, host: &str, path: &str, content: &str) {
        self.lock()
            .hosts
            .entry(host.to_string())
            .or_default()
            .files
            .insert(path.to_string(), content.to_string());
    }

    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        self.lock()
            .hosts
            .get(host)
            .and_then(|h| h.files.get(path).cloned())
    }

    pub fn puts(&self, host: &str) -> usize {
        self.lock().hosts.get(host).map_or(0, |h| h.puts)
    }

    pub fn connect_attempts(&self, host: &str) -> u32 {
        self.lock().hosts.get(host).map_or(0, |h| h.connect_attempts)
    }

    pub fn commands(&self, host: &str) -> Vec<String> {
        self.lock()
            .hosts
            .get(host)
            .map(|h| h.commands.clone())
            .unwrap_or_default()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_total
    }

    pub fn max_open_sessions(&self) -> usize {
        self.lock().max_open_total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn behavior(&self, host: &str) -> HostBehavior {
        self.lock().behaviors.get(host).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn connect(
        &self,
        record: &ServerRecord,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, ConnectionError> {
        let host = record.host.clone();
        let behavior = self.behavior(&host);
        let attempt = {
            let mut inner = self.lock();
            let state = inner.hosts.entry(host.clone()).or_default();
            state.connect_attempts += 1;
            state.connect_attempts
        };

        if !behavior.connect_delay.is_zero() {
            tokio::time::sleep(behavior.connect_delay).await;
        }
        if behavior.auth_failure {
            return Err(ConnectionError::AuthFailure {
                endpoint: record.endpoint(),
                message: "Permission denied (publickey)".into(),
            });
        }
        if attempt <= behavior.unreachable_attempts {
            return Err(ConnectionError::NetworkUnreachable {
                endpoint: record.endpoint(),
                message: "No route to host".into(),
            });
        }

        {
            let mut inner = self.lock();
            inner.hosts.entry(host.clone()).or_default().open_sessions += 1;
            inner.open_total += 1;
            inner.max_open_total = inner.max_open_total.max(inner.open_total);
        }

        Ok(Box::new(MockSession {
            transport: self.clone(),
            host,
            endpoint: record.endpoint(),
            behavior,
            closed: Mutex::new(false),
        }))
    }
}

struct MockSession {
    transport: MockTransport,
    host: String,
    endpoint: String,
    behavior: HostBehavior,
    closed: Mutex<bool>,
}

/// 取出第 n 个单引号包裹的片段
fn quoted(command: &str, n: usize) -> Option<String> {
    command.split('\'').nth(2 * n + 1).map(str::to_string)
}

#[async_trait]
impl RemoteSession for MockSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, ExecutionError> {
        if !self.behavior.step_delay.is_zero() {
            tokio::time::sleep(self.behavior.step_delay).await;
        }
        let mut inner = self.transport.lock();
        let state = inner.hosts.entry(self.host.clone()).or_default();
        state.commands.push(command.to_string());

        if let Some(fail) = &self.behavior.fail_command {
            if command.contains(fail.as_str()) {
                return Ok(CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("{}: simulated failure", fail),
                });
            }
        }

        if command.starts_with("cat '") {
            let path = quoted(command, 0).unwrap_or_default();
            return Ok(match state.files.get(&path) {
                Some(content) => CommandOutput {
                    exit_code: 0,
                    stdout: content.clone(),
                    stderr: String::new(),
                },
                None => CommandOutput {
                    exit_code: 1,
                    ..Default::default()
                },
            });
        }

        if command.contains("printf '%s'") {
            // mkdir -p '<dir>' && printf '%s' '<digest>' > '<path>'
            let digest = quoted(command, 2).unwrap_or_default();
            let path = quoted(command, 3).unwrap_or_default();
            state.files.insert(path, digest);
            return Ok(CommandOutput::default());
        }

        if command.starts_with("echo ") {
            return Ok(CommandOutput {
                exit_code: 0,
                stdout: format!("{}\n", command.trim_start_matches("echo ")),
                stderr: String::new(),
            });
        }

        Ok(CommandOutput {
            exit_code: 0,
            stdout: format!("ran: {}\n", command),
            stderr: String::new(),
        })
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        if !self.behavior.step_delay.is_zero() {
            tokio::time::sleep(self.behavior.step_delay).await;
        }
        let content = std::fs::read_to_string(local).map_err(|e| TransferError::Io {
            path: local.display().to_string(),
            message: e.to_string(),
        })?;
        let mut inner = self.transport.lock();
        let state = inner.hosts.entry(self.host.clone()).or_default();
        state.puts += 1;
        state.files.insert(remote.to_string(), content);
        Ok(())
    }

    async fn close(&self) {
        if !self.behavior.close_delay.is_zero() {
            tokio::time::sleep(self.behavior.close_delay).await;
        }
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return;
        }
        *closed = true;
        let mut inner = self.transport.lock();
        if let Some(state) = inner.hosts.get_mut(&self.host) {
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        inner.open_total = inner.open_total.saturating_sub(1);
    }
}

pub fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::from(&RetryConfig {
        max_attempts,
        initial_interval_ms: 10,
        max_interval_ms: 20,
        multiplier: 1.0,
        randomization_factor: 0.0,
    })
}

pub fn executor(transport: &MockTransport, max_attempts: u32) -> RemoteExecutor {
    RemoteExecutor::new(
        Arc::new(transport.clone()),
        quick_retry(max_attempts),
        Duration::from_secs(30),
        Duration::from_secs(60),
    )
}

/// 建一个临时注册表，主机名与服务器名相同
pub fn registry_with(names: &[&str]) -> (TempDir, Arc<ServerRegistry>) {
    let dir = TempDir::new().unwrap();
    let registry = ServerRegistry::open(dir.path().join("servers.toml")).unwrap();
    for name in names {
        registry
            .add(ServerRecord::new(*name, *name, "admin").with_tags(["fleet"]))
            .unwrap();
    }
    (dir, Arc::new(registry))
}
