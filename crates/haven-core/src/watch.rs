//! 周期性诊断
//!
//! 每个 [`WatchHandle`] 只有一个协作式循环：`interval` 触发后在循环内直接等待本轮采样完成，
//! 因此同一时刻最多只有一个采样在进行。采样耗时超过周期时，错过的 tick 被跳过（并计数），
//! 不会排队补发。

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::{DiagnosticReport, Rule, ThresholdSet, evaluate};
use crate::error::{CoreError, Result};
use crate::probe::{ProbeTarget, SnapshotSource};

/// 一台主机在某轮采样中的结果
#[derive(Debug, Clone)]
pub struct HostSample {
    pub target: String,
    pub result: std::result::Result<DiagnosticReport, String>,
}

/// 一轮采样
#[derive(Debug, Clone)]
pub struct WatchSample {
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    pub hosts: Vec<HostSample>,
}

impl WatchSample {
    pub fn has_critical(&self) -> bool {
        self.hosts
            .iter()
            .any(|h| matches!(&h.result, Ok(report) if report.has_critical()))
    }
}

#[derive(Debug, Default)]
pub struct WatchStats {
    samples: AtomicU64,
    skipped_ticks: AtomicU64,
}

impl WatchStats {
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct WatchScheduler {
    source: Arc<dyn SnapshotSource>,
    rules: Arc<[Rule]>,
    thresholds: ThresholdSet,
}

impl WatchScheduler {
    pub fn new(source: Arc<dyn SnapshotSource>, rules: &[Rule], thresholds: ThresholdSet) -> Self {
        Self {
            source,
            rules: Arc::from(rules),
            thresholds,
        }
    }

    /// 采样一轮：并发采集所有目标，逐台评估
    pub async fn sample_once(&self, sequence: u64, targets: &[ProbeTarget]) -> WatchSample {
        let taken_at = Utc::now();
        let hosts = join_all(targets.iter().map(|target| async move {
            let name = target.name().to_string();
            let result = match self.source.snapshot(target).await {
                Ok(snapshot) => {
                    let thresholds = self.thresholds.for_host(&name);
                    let findings = evaluate(&snapshot, &self.rules, &thresholds);
                    Ok(DiagnosticReport::new(name.clone(), findings))
                }
                Err(e) => {
                    warn!(host = %name, error = %e, "Failed to collect power snapshot");
                    Err(e.to_string())
                }
            };
            HostSample {
                target: name,
                result,
            }
        }))
        .await;

        WatchSample {
            sequence,
            taken_at,
            hosts,
        }
    }

    /// 启动监控循环；`on_sample` 在循环内同步调用
    pub fn start<F>(
        &self,
        interval: Duration,
        targets: Vec<ProbeTarget>,
        on_sample: F,
    ) -> Result<WatchHandle>
    where
        F: Fn(WatchSample) + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(CoreError::config("watch interval must be greater than zero"));
        }
        if targets.is_empty() {
            return Err(CoreError::config("watch needs at least one target"));
        }

        let token = CancellationToken::new();
        let stats = Arc::new(WatchStats::default());
        let scheduler = self.clone();
        let loop_token = token.clone();
        let loop_stats = stats.clone();

        info!(
            interval_ms = interval.as_millis() as u64,
            targets = targets.len(),
            "Starting watch loop"
        );
        let join = tokio::spawn(async move {
            scheduler
                .run(interval, targets, loop_token, loop_stats, on_sample)
                .await;
        });

        Ok(WatchHandle {
            token,
            join: Some(join),
            stats,
        })
    }

    async fn run<F>(
        self,
        period: Duration,
        targets: Vec<ProbeTarget>,
        token: CancellationToken,
        stats: Arc<WatchStats>,
        on_sample: F,
    ) where
        F: Fn(WatchSample) + Send + Sync + 'static,
    {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick: Option<Instant> = None;
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            let tick = Instant::now();

            if let Some(prev) = last_tick {
                let periods = (tick - prev).as_nanos() / period.as_nanos().max(1);
                let skipped = periods.saturating_sub(1) as u64;
                if skipped > 0 {
                    stats.skipped_ticks.fetch_add(skipped, Ordering::Relaxed);
                    debug!(skipped, "Sample overran the interval, ticks skipped");
                }
            }
            last_tick = Some(tick);

            let sample = self.sample_once(sequence, &targets).await;
            if token.is_cancelled() {
                debug!(sequence, "Watch stopped during sample, dropping result");
                break;
            }
            on_sample(sample);
            stats.samples.fetch_add(1, Ordering::Relaxed);
            sequence += 1;
        }

        info!(
            samples = stats.samples(),
            skipped_ticks = stats.skipped_ticks(),
            "Watch loop stopped"
        );
    }
}

/// 监控循环的句柄
pub struct WatchHandle {
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
    stats: Arc<WatchStats>,
}

impl WatchHandle {
    pub fn stats(&self) -> &WatchStats {
        &self.stats
    }

    /// 停止循环：等待进行中的采样最多 `grace`，超时则中止；返回后不会再有回调
    pub async fn stop(mut self, grace: Duration) {
        self.token.cancel();
        let Some(mut join) = self.join.take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut join).await {
            Ok(_) => debug!("Watch loop finished within grace period"),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Watch sample exceeded grace period, aborting");
                join.abort();
                let _ = join.await;
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::standard_rules;
    use crate::snapshot::PowerSnapshot;
    use async_trait::async_trait;

    struct Fixed(PowerSnapshot);

    #[async_trait]
    impl SnapshotSource for Fixed {
        async fn snapshot(&self, _target: &ProbeTarget) -> Result<PowerSnapshot> {
            Ok(self.0.clone())
        }
    }

    fn scheduler(snapshot: PowerSnapshot) -> WatchScheduler {
        WatchScheduler::new(
            Arc::new(Fixed(snapshot)),
            standard_rules(),
            ThresholdSet::default(),
        )
    }

    #[tokio::test]
    async fn test_sample_once_evaluates_each_target() {
        let snapshot = PowerSnapshot {
            hibernate_mode: Some(3),
            ..PowerSnapshot::server_ready()
        };
        let sample = scheduler(snapshot)
            .sample_once(7, &[ProbeTarget::Local])
            .await;
        assert_eq!(sample.sequence, 7);
        assert_eq!(sample.hosts.len(), 1);
        assert!(sample.has_critical());
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let err = scheduler(PowerSnapshot::server_ready())
            .start(Duration::ZERO, vec![ProbeTarget::Local], |_| {})
            .err();
        assert!(matches!(err, Some(CoreError::Config { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_callback_after_stop() {
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let handle = scheduler(PowerSnapshot::server_ready())
            .start(Duration::from_secs(1), vec![ProbeTarget::Local], move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        handle.stop(Duration::from_secs(1)).await;
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }
}
