//! Remediation coordination: turning `auto_fix_requested` intents into
//! bounded, at-most-once platform mutations with full bookkeeping.

pub mod coordinator;
pub mod recovery;

pub use coordinator::RemediationCoordinator;
pub use recovery::recover_stale_actions;
