//! 远程通道抽象
//!
//! `RemoteTransport` 负责建立会话，`RemoteSession` 负责在会话上执行命令和传输文件。
//! 超时、重试和会话释放由上层的 [`crate::executor::RemoteExecutor`] 统一处理，
//! 这里的实现只需要如实报告错误类别。

pub mod ssh;

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::error::{ConnectionError, ExecutionError, TransferError};
use crate::registry::ServerRecord;

pub use ssh::SshTransport;

/// 远程命令的执行结果
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// 建立到目标的会话；`timeout` 传给底层实现用于握手
    async fn connect(
        &self,
        record: &ServerRecord,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, ConnectionError>;
}

/// 一个已建立的会话，只属于一个任务，不在任务之间共享
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn exec(&self, command: &str) -> Result<CommandOutput, ExecutionError>;

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), TransferError>;

    /// 释放会话；重复调用或连接已断开时不报错
    async fn close(&self);
}
