//! CircleCI v1.1 API client and payload types.

pub mod client;
pub mod types;

pub use client::{BuildService, CircleClient, DEFAULT_BASE_URL};
pub use types::{Action, BuildDetail, BuildStatus, BuildSummary, Step};
