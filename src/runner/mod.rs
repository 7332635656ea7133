//! Task execution: drives tasks through acquire → steps → confirm →
//! release, sequentially or with bounded parallelism.

pub mod executor;
pub mod steps;

pub use executor::{BatchReport, Executor};
pub use steps::{StepOutcome, StepSpec, Workflow};
