//! Database models.

pub mod job;

pub use job::{JobItem, JobStatus, StateTransition, StatusCounts};
