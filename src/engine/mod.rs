//! Plan execution engine.

mod executor;

pub use executor::{PlanExecutor, PlanOutcome};
