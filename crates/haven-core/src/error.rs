//! 统一错误处理系统
//!
//! 错误分为两大类：
//! - 请求本身不合法（`Config` / `Validation`）：在触碰网络之前立即中止整个调用；
//! - 单个目标上的连接/执行/传输失败：被捕获进该目标的部署结果，不影响同批次其他目标。

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// 进程退出码
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const PARTIAL_FAILURE: i32 = 3;
}

/// 核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Config error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("I/O error: {path} - {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 请求校验错误（未知目标、重名等）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("server '{0}' already exists")]
    DuplicateName(String),

    #[error("server '{0}' not found")]
    NotFound(String),

    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("target selector cannot be empty")]
    EmptySelector,

    #[error("selector '{0}' matched no enabled servers")]
    NoTargets(String),

    #[error("concurrency limit must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid server record '{name}': {reason}")]
    InvalidRecord { name: String, reason: String },
}

/// 建立会话阶段的错误
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionError {
    #[error("authentication failed for {endpoint}: {message}")]
    AuthFailure { endpoint: String, message: String },

    #[error("connection to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("network unreachable for {endpoint}: {message}")]
    NetworkUnreachable { endpoint: String, message: String },
}

impl ConnectionError {
    /// 只有网络类的瞬态错误才值得重试；认证失败永远不重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectTimeout { .. } | ConnectionError::NetworkUnreachable { .. }
        )
    }
}

/// 命令执行阶段的错误
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("command `{command}` exited with status {exit_code}: {stderr}")]
    NonZeroExit {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("command `{command}` timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("session disconnected: {message}")]
    Disconnected { message: String },
}

/// 文件传输阶段的错误
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferError {
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("permission denied writing {path}")]
    PermissionDenied { path: String },

    #[error("session disconnected during transfer of {path}")]
    Disconnected { path: String },
}

impl CoreError {
    pub fn config(message: impl Into<String>) -> Self {
        CoreError::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::Validation(_) => exit_code::USAGE,
            _ => exit_code::GENERIC,
        }
    }
}

/// Core 操作的 Result 类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 单个部署目标上被捕获的失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("target timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled before completion")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl From<CoreError> for TaskError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Connection(e) => TaskError::Connection(e),
            CoreError::Execution(e) => TaskError::Execution(e),
            CoreError::Transfer(e) => TaskError::Transfer(e),
            other => TaskError::Other(other.to_string()),
        }
    }
}
