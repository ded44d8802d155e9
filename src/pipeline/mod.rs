//! Decision pipeline: rule engine, safety gating, orchestration.

pub mod processor;
pub mod rules;
pub mod types;

pub use processor::{DecisionPipeline, PipelineOptions, ProcessedDecision};
pub use rules::RuleTable;
