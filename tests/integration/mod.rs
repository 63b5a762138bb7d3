//! Integration test suite for stagehand.
//!
//! These tests drive the public API end to end: staging an item set,
//! running it through the orchestrator with scripted task bodies, and
//! resuming from checkpoints.
//!
//! # Test Categories
//!
//! - `staging`: Stage partition properties and scenarios
//! - `orchestration`: Dispatch, failure propagation and critical aborts
//! - `resume`: Checkpoint replay and mismatch detection
//! - `recovery`: Stall detection and hard timeouts
//!
//! Time-dependent tests run on tokio's paused clock, so they finish
//! instantly and never depend on machine speed.


mod orchestration;
mod resume;
mod staging;
