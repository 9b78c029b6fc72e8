//! Incident detection: per-service sliding windows, a fast pattern lane,
//! and a batched single-flight LLM lane, feeding the incident store and
//! the pipeline broker.

pub mod classifier;
pub mod fingerprint;
pub mod patterns;
pub mod processor;
pub mod window;

pub use classifier::{IncidentClassifier, Judgment, LlmClassifier};
pub use fingerprint::{fingerprint, normalize_template};
pub use patterns::{PatternHit, PatternLane};
pub use processor::{DetectorConfig, LogProcessor};
pub use window::{ServiceWindow, DEFAULT_WINDOW_SIZE};
