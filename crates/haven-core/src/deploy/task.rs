use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::core_types::ServerName;
use crate::error::TaskError;
use crate::registry::ServerRecord;

/// 单个目标上的部署状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeploymentState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl DeploymentState {
    /// 检查状态是否为终端状态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Succeeded
                | DeploymentState::Failed
                | DeploymentState::TimedOut
                | DeploymentState::Cancelled
        )
    }

    /// 状态只能单调前进，终端状态不可再离开
    pub fn can_transition_to(&self, next: DeploymentState) -> bool {
        use DeploymentState::*;
        match (self, next) {
            (Pending, Running | Cancelled | TimedOut) => true,
            (Running, Succeeded | Failed | TimedOut | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Pending => "pending",
            DeploymentState::Running => "running",
            DeploymentState::Succeeded => "succeeded",
            DeploymentState::Failed => "failed",
            DeploymentState::TimedOut => "timed out",
            DeploymentState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid deployment state transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: DeploymentState,
    pub to: DeploymentState,
}

/// 一次调用中某个目标的部署任务
#[derive(Debug, Clone)]
pub struct DeploymentTask {
    target: ServerRecord,
    state: DeploymentState,
}

impl DeploymentTask {
    pub fn new(target: ServerRecord) -> Self {
        Self {
            target,
            state: DeploymentState::Pending,
        }
    }

    pub fn target(&self) -> &ServerRecord {
        &self.target
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// 转换状态
    pub fn transition_to(&mut self, next: DeploymentState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// 单个目标的最终结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub target: ServerName,
    pub final_state: DeploymentState,
    pub output: String,
    pub error: Option<TaskError>,
    /// 目标上已是同一版本载荷，未做任何修改
    pub no_op: bool,
    pub duration: Duration,
}

impl DeploymentResult {
    pub fn is_success(&self) -> bool {
        self.final_state == DeploymentState::Succeeded
    }

    pub(crate) fn timed_out(target: ServerName, after: Duration, elapsed: Duration) -> Self {
        Self {
            target,
            final_state: DeploymentState::TimedOut,
            output: String::new(),
            error: Some(TaskError::TimedOut(after)),
            no_op: false,
            duration: elapsed,
        }
    }
}
