//! Workflow primitives layered on the task graph.
//!
//! Gates and loops attach to tasks run by the process engine; [`Repeat`]
//! can also drive any [`Step`] on its own.

pub mod gate;
pub mod predicate;
pub mod repeat;
pub mod template;

pub use gate::{Gate, GateAction, GateContext, GateOutcome};
pub use predicate::Predicate;
pub use repeat::{
    AgentStep, FnStep, Repeat, RepeatConfig, RepeatContext, RepeatResult, Step, StopReason,
    DEFAULT_MAX_ITERATIONS,
};
pub use template::{has_previous, substitute_previous};
