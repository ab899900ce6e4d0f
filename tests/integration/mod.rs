//! Integration test suite for maestro.
//!
//! These tests drive the process engine, context compaction and repeat loops
//! end to end through the public API.
//!
//! # Test Categories
//!
//! - `sequential`: declaration-order dispatch and failure halting
//! - `hierarchical`: manager decisions and assignment validation
//! - `workflow`: dependency resolution, gates, loops and failure cascades
//! - `budget`: allocation properties and compaction during runs
//! - `repeat`: standalone loops and sub-workflow steps
//!
//! # CI Compatibility
//!
//! All agents are scripted in-process; no provider is ever called.


mod budget;
mod sequential;
mod workflow;
