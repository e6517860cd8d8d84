//! Dependency graph built from task records.

pub mod dependency;

pub use self::dependency::{
    BlockReason, BlockingInfo, DEFAULT_MAX_DEPTH, DependencyGraph, DependencySummary, TaskSummary,
};
