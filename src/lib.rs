//! Qwen Translator Request Governance
//!
//! The layer between a translation pipeline and the provider APIs it calls.
//! Decides when a provider call may start, and what happens when one fails.
//!
//! # Features
//!
//! - **Admission Control**: Per-provider token buckets over requests and units,
//!   with a shared FIFO queue, drain task and queue expiry
//! - **Cost Estimation**: Script-aware unit estimates for translation text
//! - **Typed Errors**: A closed error taxonomy with codes, categories,
//!   severities and retry/recovery flags
//! - **Resilience**: Retry with exponential backoff, deadlines and pluggable
//!   recovery strategies
//! - **Observability**: `tracing` events throughout and an injectable log sink
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use qwen_governance::{GovernanceConfig, Governor, ProviderLimits, QwenError, RetryOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QwenError> {
//!     let config = GovernanceConfig::builder()
//!         .provider("qwen", ProviderLimits::new(60, 100_000, Duration::from_secs(60)))
//!         .build()?;
//!     let governor = Governor::new(&config)?;
//!
//!     let text = "Hello, world";
//!     let translated = governor
//!         .execute(
//!             "qwen",
//!             text,
//!             |_attempt| async { Ok::<_, QwenError>("你好，世界".to_string()) },
//!             RetryOptions::new(),
//!         )
//!         .await?;
//!
//!     println!("{translated}");
//!     governor.shutdown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod observability;
pub mod resilience;

// Re-exports for convenience
pub use config::{GovernanceConfig, GovernanceConfigBuilder, ProviderConfig, ProviderLimits};
pub use errors::{ErrorCategory, ErrorContext, ErrorKind, QwenError, QwenResult, Severity};
pub use resilience::{
    estimate_units, ErrorManager, Governor, ProviderUsage, RecoveryOutcome, RecoveryStrategy,
    RetryOptions, ThrottleManager, TimeoutKind, UnitCost,
};

/// Mock implementations for testing.
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
