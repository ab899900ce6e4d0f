pub mod agent;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod workflow;

pub use agent::{Agent, AgentId, AgentPool, AgentReply};
pub use core::{TaskGraph, TaskId, TaskSpec, TaskState};
pub use error::{Error, Result};
pub use orchestration::{Process, ProcessConfig, ProcessMode, RunReport};
pub use workflow::{Repeat, RepeatResult};
