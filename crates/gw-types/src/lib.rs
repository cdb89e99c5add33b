pub mod error;
pub mod provider;
pub mod task;
pub mod usage;

pub use error::{ErrorBody, GatewayError};
pub use provider::{ModelAlias, ModelInfo};
pub use task::{FilesystemAccess, TaskError, TaskErrorKind, TaskOutcome, TaskState};
pub use usage::{Usage, UsageAggregate, UsageRecord, UsageSource};
