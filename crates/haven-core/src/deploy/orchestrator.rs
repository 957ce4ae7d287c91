//! 部署编排
//!
//! 选择器解析和参数校验在触碰网络之前完成；之后每个目标一个任务，
//! 由 `buffer_unordered` 限制并发，结果按完成顺序逐个产出。
//! 总超时到达时，所有尚未产出结果的目标（运行中或尚未开始）都以 `TimedOut` 结束，流随即终止。

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::payload::{
    DeploymentPayload, chmod_command, marker_read_command, marker_write_command, mkdir_command,
};
use super::task::{DeploymentResult, DeploymentState, DeploymentTask};
use crate::config::DeployConfig;
use crate::core_types::{DeploymentId, ServerName};
use crate::error::{Result, TaskError, ValidationError};
use crate::executor::{RemoteExecutor, SessionGuard};
use crate::registry::{ServerRecord, ServerRegistry};
use crate::selector::TargetSelector;
use crate::utils::truncate_output_preview;

/// 结果确定后关闭会话的最长等待
const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// 按完成顺序产出的结果流，每个目标恰好一个结果
pub type DeploymentStream = BoxStream<'static, DeploymentResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployOptions {
    pub concurrency_limit: usize,
    pub per_target_timeout: Duration,
    pub overall_timeout: Option<Duration>,
}

impl DeployOptions {
    pub fn from_config(cfg: &DeployConfig) -> Self {
        Self {
            concurrency_limit: cfg.concurrency_limit,
            per_target_timeout: Duration::from_secs(cfg.per_target_timeout_sec),
            overall_timeout: (cfg.overall_timeout_sec > 0)
                .then(|| Duration::from_secs(cfg.overall_timeout_sec)),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.concurrency_limit == 0 {
            return Err(ValidationError::InvalidConcurrency(self.concurrency_limit));
        }
        Ok(())
    }
}

pub struct DeploymentOrchestrator {
    registry: Arc<ServerRegistry>,
    executor: RemoteExecutor,
}

impl DeploymentOrchestrator {
    pub fn new(registry: Arc<ServerRegistry>, executor: RemoteExecutor) -> Self {
        Self { registry, executor }
    }

    /// 校验请求并返回惰性结果流；校验失败时不会建立任何连接
    pub fn deploy(
        &self,
        selector: &TargetSelector,
        payload: Arc<DeploymentPayload>,
        options: DeployOptions,
        token: CancellationToken,
    ) -> Result<DeploymentStream> {
        options.validate()?;
        let targets = selector.resolve(&self.registry)?;

        let deployment_id = DeploymentId::generate();
        info!(
            deployment_id = %deployment_id,
            payload = %payload.name(),
            checksum = %payload.checksum(),
            targets = targets.len(),
            concurrency = options.concurrency_limit,
            "Starting deployment"
        );

        let outstanding: Vec<ServerName> = targets.iter().map(|t| t.name.clone()).collect();
        let executor = self.executor.clone();
        let per_target_timeout = options.per_target_timeout;

        let inner = stream::iter(targets)
            .map(move |record| {
                run_target(
                    executor.clone(),
                    record,
                    payload.clone(),
                    per_target_timeout,
                    token.clone(),
                )
            })
            .buffer_unordered(options.concurrency_limit)
            .boxed();

        let started = Instant::now();
        let state = StreamState {
            inner,
            deadline: options.overall_timeout.map(|t| (started + t, t)),
            started,
            outstanding,
            expired: VecDeque::new(),
            finished: false,
        };
        Ok(stream::unfold(state, next_result).boxed())
    }
}

struct StreamState {
    inner: DeploymentStream,
    deadline: Option<(Instant, Duration)>,
    started: Instant,
    /// 尚未产出结果的目标，保持提交顺序
    outstanding: Vec<ServerName>,
    expired: VecDeque<DeploymentResult>,
    finished: bool,
}

enum Next {
    Item(Option<DeploymentResult>),
    Expired(Duration),
}

async fn next_result(mut st: StreamState) -> Option<(DeploymentResult, StreamState)> {
    if let Some(result) = st.expired.pop_front() {
        return Some((result, st));
    }
    if st.finished {
        return None;
    }

    let next = match st.deadline {
        Some((deadline, after)) => tokio::select! {
            item = st.inner.next() => Next::Item(item),
            _ = tokio::time::sleep_until(deadline) => Next::Expired(after),
        },
        None => Next::Item(st.inner.next().await),
    };

    match next {
        Next::Item(Some(result)) => {
            st.outstanding.retain(|name| name != &result.target);
            Some((result, st))
        }
        Next::Item(None) => None,
        Next::Expired(after) => {
            warn!(
                remaining = st.outstanding.len(),
                timeout_ms = after.as_millis() as u64,
                "Overall deployment timeout reached"
            );
            st.finished = true;
            // 丢弃内部流即取消所有进行中的任务，会话由 guard 负责释放
            st.inner = stream::empty().boxed();
            let elapsed = st.started.elapsed();
            st.expired = st
                .outstanding
                .drain(..)
                .map(|name| DeploymentResult::timed_out(name, after, elapsed))
                .collect();
            let first = st.expired.pop_front()?;
            Some((first, st))
        }
    }
}

/// 应用成功后的报告
struct ApplyReport {
    output: String,
    no_op: bool,
}

async fn run_target(
    executor: RemoteExecutor,
    record: ServerRecord,
    payload: Arc<DeploymentPayload>,
    timeout: Duration,
    token: CancellationToken,
) -> DeploymentResult {
    let started = Instant::now();
    let mut task = DeploymentTask::new(record);
    let name = task.target().name.clone();

    let mut session = None;
    let (next, report, error) = if token.is_cancelled() {
        debug!(server = %name, "Deployment cancelled before start");
        (DeploymentState::Cancelled, None, Some(TaskError::Cancelled))
    } else {
        let _ = task.transition_to(DeploymentState::Running);
        debug!(server = %name, endpoint = %task.target().endpoint(), "Deploying to target");

        // 超时只覆盖连接和应用步骤，关闭会话不计入
        let apply = apply_payload(&executor, task.target(), &payload, &token);
        match tokio::time::timeout(timeout, apply).await {
            Ok(Ok((guard, applied))) => {
                session = Some(guard);
                match applied {
                    Ok(report) => (DeploymentState::Succeeded, Some(report), None),
                    Err(TaskError::Cancelled) => {
                        (DeploymentState::Cancelled, None, Some(TaskError::Cancelled))
                    }
                    Err(e) => (DeploymentState::Failed, None, Some(e)),
                }
            }
            Ok(Err(TaskError::Cancelled)) => {
                (DeploymentState::Cancelled, None, Some(TaskError::Cancelled))
            }
            Ok(Err(e)) => (DeploymentState::Failed, None, Some(e)),
            Err(_) => (
                DeploymentState::TimedOut,
                None,
                Some(TaskError::TimedOut(timeout)),
            ),
        }
    };

    if let Err(e) = task.transition_to(next) {
        warn!(server = %name, error = %e, "Unexpected deployment state transition");
    }

    let duration = started.elapsed();
    match &error {
        None => info!(server = %name, duration_ms = duration.as_millis() as u64, "Deployment succeeded"),
        Some(e) => warn!(server = %name, state = %task.state(), error = %e, "Deployment did not succeed"),
    }

    if let Some(session) = session {
        if tokio::time::timeout(SESSION_CLOSE_GRACE, session.close())
            .await
            .is_err()
        {
            warn!(server = %name, grace_ms = SESSION_CLOSE_GRACE.as_millis() as u64, "Session close exceeded grace period");
        }
    }

    let (output, no_op) = report.map(|r| (r.output, r.no_op)).unwrap_or_default();
    DeploymentResult {
        target: name,
        final_state: task.state(),
        output,
        error,
        no_op,
        duration,
    }
}

fn checkpoint(token: &CancellationToken) -> std::result::Result<(), TaskError> {
    if token.is_cancelled() {
        Err(TaskError::Cancelled)
    } else {
        Ok(())
    }
}

/// 连接并应用；会话连同应用结果一起交还，由调用方在超时之外关闭
async fn apply_payload(
    executor: &RemoteExecutor,
    record: &ServerRecord,
    payload: &DeploymentPayload,
    token: &CancellationToken,
) -> std::result::Result<(SessionGuard, std::result::Result<ApplyReport, TaskError>), TaskError> {
    let session = executor.connect(record).await?;
    let result = apply_steps(executor, &session, payload, token).await;
    Ok((session, result))
}

/// 标记比对 → 建目录 → 传文件 → chmod → 初始化命令 → 写标记
async fn apply_steps(
    executor: &RemoteExecutor,
    session: &SessionGuard,
    payload: &DeploymentPayload,
    token: &CancellationToken,
) -> std::result::Result<ApplyReport, TaskError> {
    checkpoint(token)?;
    let marker_path = payload.marker_path();
    let marker = executor
        .run_command(session, &marker_read_command(&marker_path))
        .await?;
    if marker.success() && marker.stdout.trim() == payload.checksum() {
        debug!(endpoint = %session.endpoint(), payload = %payload.name(), "Payload already applied");
        return Ok(ApplyReport {
            output: "already up to date".to_string(),
            no_op: true,
        });
    }

    let dirs = payload.remote_dirs();
    if !dirs.is_empty() {
        checkpoint(token)?;
        executor.run_checked(session, &mkdir_command(&dirs)).await?;
    }

    for file in payload.files() {
        checkpoint(token)?;
        executor.copy_file(session, &file.local, &file.remote).await?;
    }

    if !payload.files().is_empty() {
        checkpoint(token)?;
        executor
            .run_checked(session, &chmod_command(payload.files()))
            .await?;
    }

    let mut output = Vec::new();
    for command in payload.setup_commands() {
        checkpoint(token)?;
        let out = executor.run_checked(session, command).await?;
        debug!(
            endpoint = %session.endpoint(),
            command = %command,
            output = %truncate_output_preview(&out.stdout),
            "Setup command finished"
        );
        let text = out.stdout.trim();
        if !text.is_empty() {
            output.push(text.to_string());
        }
    }

    checkpoint(token)?;
    executor
        .run_checked(session, &marker_write_command(&marker_path, payload.checksum()))
        .await?;

    Ok(ApplyReport {
        output: output.join("\n"),
        no_op: false,
    })
}
