use serde::{Deserialize, Serialize};

use super::task::{DeploymentResult, DeploymentState};
use crate::error::exit_code;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOutcome {
    AllSucceeded,
    PartialFailure,
    TotalFailure,
}

/// 一批部署结果的汇总
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub no_op: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn collect<'a>(results: impl IntoIterator<Item = &'a DeploymentResult>) -> Self {
        let mut summary = BatchSummary::default();
        for result in results {
            summary.record(result);
        }
        summary
    }

    pub fn record(&mut self, result: &DeploymentResult) {
        self.total += 1;
        match result.final_state {
            DeploymentState::Succeeded => {
                self.succeeded += 1;
                if result.no_op {
                    self.no_op += 1;
                }
            }
            DeploymentState::TimedOut => self.timed_out += 1,
            DeploymentState::Cancelled => self.cancelled += 1,
            DeploymentState::Failed | DeploymentState::Pending | DeploymentState::Running => {
                self.failed += 1
            }
        }
    }

    pub fn outcome(&self) -> BatchOutcome {
        if self.succeeded == self.total {
            BatchOutcome::AllSucceeded
        } else if self.succeeded == 0 {
            BatchOutcome::TotalFailure
        } else {
            BatchOutcome::PartialFailure
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.outcome() {
            BatchOutcome::AllSucceeded => exit_code::SUCCESS,
            _ => exit_code::PARTIAL_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::ServerName;
    use std::time::Duration;

    fn result(state: DeploymentState, no_op: bool) -> DeploymentResult {
        DeploymentResult {
            target: ServerName::new("x"),
            final_state: state,
            output: String::new(),
            error: None,
            no_op,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_outcomes() {
        let all = vec![
            result(DeploymentState::Succeeded, false),
            result(DeploymentState::Succeeded, true),
        ];
        let summary = BatchSummary::collect(&all);
        assert_eq!(summary.outcome(), BatchOutcome::AllSucceeded);
        assert_eq!(summary.no_op, 1);
        assert_eq!(summary.exit_code(), exit_code::SUCCESS);

        let partial = vec![
            result(DeploymentState::Succeeded, false),
            result(DeploymentState::Failed, false),
            result(DeploymentState::TimedOut, false),
        ];
        let summary = BatchSummary::collect(&partial);
        assert_eq!(summary.outcome(), BatchOutcome::PartialFailure);
        assert_eq!((summary.failed, summary.timed_out), (1, 1));
        assert_eq!(summary.exit_code(), exit_code::PARTIAL_FAILURE);

        let none = vec![result(DeploymentState::Cancelled, false)];
        assert_eq!(BatchSummary::collect(&none).outcome(), BatchOutcome::TotalFailure);
    }
}
