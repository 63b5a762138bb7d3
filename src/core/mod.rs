//! Core domain models for batch orchestration.
//!
//! This module contains the work item model, per-item results and the
//! dependency graph analyzer that turns an item set into ordered stages.

pub mod graph;
pub mod item;
pub mod outcome;

pub use graph::{stage, DependencyGraph, Stage};
pub use item::{ItemId, ItemKind, Resource, WorkItem};
pub use outcome::{ItemError, ItemErrorKind, ItemMetrics, ItemResult, ItemStatus};
