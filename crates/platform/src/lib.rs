//! Railway platform layer: the typed API client, per-target log stream
//! subscriptions, and the supervisor that owns them.

pub mod client;
pub mod error;
pub mod frames;
pub mod ingest;
pub mod rate_limit;
pub mod subscription;
pub mod supervisor;
pub mod types;

pub use client::{Deployment, RailwayClient, RAILWAY_API_URL};
pub use error::{PlatformError, PlatformResult};
pub use ingest::IngestQueue;
pub use rate_limit::RateLimiter;
pub use subscription::{
    backoff_for_attempts, Command, LogSubscription, SubscriptionConfig, RAILWAY_WS_URL,
};
pub use supervisor::{SubscriptionSupervisor, SupervisorConfig};
pub use types::{
    ConnectionStats, LogEvent, LogLevel, MonitoringTarget, SubscriptionState, SubscriptionStatus,
};
