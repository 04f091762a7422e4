//! Resilience helpers shared by the chat backend services
//!
//! - **Retry**: exponential backoff schedule with cap and optional jitter, used
//!   both for in-process retries and for computing redelivery delays
//! - **Timeout**: time limits on async work (startup checks, shutdown grace)
//!
//! # Example: redelivery delay for a failed record
//!
//! ```rust
//! use resilience::RetryConfig;
//! use std::time::Duration;
//!
//! let policy = RetryConfig::default();
//! assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
//! assert!(policy.is_exhausted(5));
//! ```
pub mod retry;
pub mod timeout;

pub use retry::{with_retry, RetryConfig, RetryError};
pub use timeout::{with_timeout, TimeoutError};
