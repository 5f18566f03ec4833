use batchline_types::step::StepExecution;

use super::ItemError;

/// Supplies the exit status a decision element routes on.
///
/// Receives the executions that ran just before the decision: one for a
/// preceding step or flow, one per flow for a preceding split.
pub trait Decider: Send + Sync {
    fn decide(&self, executions: &[StepExecution]) -> Result<String, ItemError>;
}
