//! Process-local throttling for the command dispatch pipeline.
//!
//! - [`ThrottleEngine`]: token bucket per `(tenant, command)`, consulted by
//!   command intake before a row is written.
//! - [`TenantPublishThrottler`]: minimum spacing plus jitter between two
//!   broker publishes of the same tenant, applied by the outbox dispatcher.
//!
//! Neither is shared between processes; each dispatcher instance throttles
//! on its own.

mod publish;
mod token_bucket;

pub use publish::{PublishThrottleConfig, TenantPublishThrottler, SHARED_TENANT_KEY};
pub use token_bucket::{ThrottleEngine, ThrottleLimits};
