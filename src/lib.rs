// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod cursor;
pub mod deliver;
pub mod error;
pub mod filter;
pub mod lock;
pub mod metrics;
pub mod pipeline;
pub mod post;
pub mod scheduler;
pub mod session;
pub mod summarize;

// ---- Re-exports for stable public API ----
pub use crate::error::{MonitorError, Result};
pub use crate::pipeline::{Pipeline, RunFailure, RunReport, RunState};
pub use crate::post::{Credentials, DeliveryReceipt, EnrichedPost, Post};
