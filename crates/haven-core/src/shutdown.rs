//! 协作式取消
//!
//! Ctrl+C / SIGTERM 被转换为一个 [`CancellationToken`]；部署任务在步骤之间检查它，
//! 监控循环在等待 tick 时响应它。

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 中断信号到取消令牌的桥接
#[derive(Debug, Clone, Default)]
pub struct GracefulShutdown {
    token: CancellationToken,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待 SIGINT/SIGTERM，收到后取消令牌
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            _ = ctrl_c => info!("Received Ctrl+C signal"),
            _ = terminate => info!("Received SIGTERM signal"),
        }

        info!("Interrupt received, finishing in-flight work...");
        self.token.cancel();
    }

    /// 在后台监听中断信号，返回对应的令牌
    pub fn listen(&self) -> CancellationToken {
        let this = self.clone();
        tokio::spawn(async move { this.wait_for_signal().await });
        self.token()
    }
}
