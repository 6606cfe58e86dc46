//! Plan definitions.
//!
//! A plan is a declarative DAG of steps produced by an external planner and
//! submitted for execution.

mod types;
mod validate;

pub use types::{parse_plan, FinalSynthesis, Plan, RetryPolicy, Step};
pub use validate::validate_plan;
