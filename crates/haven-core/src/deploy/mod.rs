//! 多目标部署

pub mod orchestrator;
pub mod payload;
pub mod summary;
pub mod task;

pub use orchestrator::{DeployOptions, DeploymentOrchestrator, DeploymentStream};
pub use payload::{DeploymentPayload, PayloadFile};
pub use summary::{BatchOutcome, BatchSummary};
pub use task::{DeploymentResult, DeploymentState, DeploymentTask};
