//! Structural validation of job definitions.
//!
//! Every check here runs before any unit of work starts. Failures are fatal
//! and never retried.

use std::collections::HashSet;

use batchline_types::definition::{
    CheckpointPolicy, ExecutionElement, JobDefinition, StepDefinition, StepTask, TransitionAction,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("job id must not be empty")]
    EmptyJobId,

    #[error("scope '{0}' has no elements")]
    NoElements(String),

    #[error("element id '{0}' is declared more than once")]
    DuplicateId(String),

    #[error("decision '{decision}' is the first element of scope '{scope}'")]
    DecisionFirst { scope: String, decision: String },

    #[error("element '{element}' in scope '{scope}' targets unknown element '{target}'")]
    UnknownTarget {
        scope: String,
        element: String,
        target: String,
    },

    #[error("step '{0}' has an item count below 1")]
    InvalidItemCount(String),

    #[error("step '{step}' has an invalid partition definition: {reason}")]
    InvalidPartition { step: String, reason: String },

    #[error("split '{0}' has no flows")]
    EmptySplit(String),

    #[error("job '{0}' is abstract and cannot be started")]
    AbstractJob(String),

    #[error("element '{0}' was entered twice in one execution")]
    TransitionLoop(String),

    #[error("decision '{0}' has no preceding execution to decide on")]
    NoPriorExecution(String),

    #[error("restart target '{0}' does not exist in the job")]
    UnknownRestartTarget(String),

    #[error("no job definition named '{0}'")]
    UnknownJob(String),

    #[error("job definition '{job}' could not be read: {reason}")]
    Malformed { job: String, reason: String },
}

/// Validate a job before starting it.
pub fn validate_job(job: &JobDefinition) -> Result<(), DefinitionError> {
    if job.id.trim().is_empty() {
        return Err(DefinitionError::EmptyJobId);
    }
    if job.is_abstract {
        return Err(DefinitionError::AbstractJob(job.id.clone()));
    }
    let mut seen = HashSet::new();
    validate_scope(&job.id, &job.elements, &mut seen)
}

fn validate_scope(
    scope: &str,
    elements: &[ExecutionElement],
    seen: &mut HashSet<String>,
) -> Result<(), DefinitionError> {
    let Some(first) = elements.first() else {
        return Err(DefinitionError::NoElements(scope.to_string()));
    };
    if let ExecutionElement::Decision(decision) = first {
        return Err(DefinitionError::DecisionFirst {
            scope: scope.to_string(),
            decision: decision.id.clone(),
        });
    }

    let siblings: HashSet<&str> = elements.iter().map(|e| e.id()).collect();

    for element in elements {
        if !seen.insert(element.id().to_string()) {
            return Err(DefinitionError::DuplicateId(element.id().to_string()));
        }

        let unknown = |target: &str| DefinitionError::UnknownTarget {
            scope: scope.to_string(),
            element: element.id().to_string(),
            target: target.to_string(),
        };

        if let Some(next) = element.next() {
            if !siblings.contains(next) {
                return Err(unknown(next));
            }
        }
        for transition in element.transitions() {
            let target = match &transition.action {
                TransitionAction::Next { to } => Some(to),
                TransitionAction::Stop { restart, .. } => restart.as_ref(),
                _ => None,
            };
            if let Some(target) = target {
                if !siblings.contains(target.as_str()) {
                    return Err(unknown(target));
                }
            }
        }

        match element {
            ExecutionElement::Step(step) => validate_step(step)?,
            ExecutionElement::Flow(flow) => validate_scope(&flow.id, &flow.elements, seen)?,
            ExecutionElement::Split(split) => {
                if split.flows.is_empty() {
                    return Err(DefinitionError::EmptySplit(split.id.clone()));
                }
                for flow in &split.flows {
                    if !seen.insert(flow.id.clone()) {
                        return Err(DefinitionError::DuplicateId(flow.id.clone()));
                    }
                    validate_scope(&flow.id, &flow.elements, seen)?;
                }
            }
            ExecutionElement::Decision(_) => {}
        }
    }
    Ok(())
}

fn validate_step(step: &StepDefinition) -> Result<(), DefinitionError> {
    if let StepTask::Chunk(chunk) = &step.task {
        if let CheckpointPolicy::Item {
            item_count: Some(count),
            ..
        } = chunk.checkpoint
        {
            if count < 1 {
                return Err(DefinitionError::InvalidItemCount(step.id.clone()));
            }
        }
    }

    if let Some(partition) = &step.partition {
        let invalid = |reason: &str| DefinitionError::InvalidPartition {
            step: step.id.clone(),
            reason: reason.to_string(),
        };
        match (&partition.plan, &partition.mapper) {
            (Some(_), Some(_)) => return Err(invalid("both a plan and a mapper are declared")),
            (None, None) => return Err(invalid("neither a plan nor a mapper is declared")),
            (Some(plan), None) if plan.partitions < 1 => {
                return Err(invalid("a static plan needs at least one partition"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whether `element` is, or (through flows and splits) contains, `id`.
pub fn contains_element(element: &ExecutionElement, id: &str) -> bool {
    if element.id() == id {
        return true;
    }
    match element {
        ExecutionElement::Flow(flow) => flow.elements.iter().any(|e| contains_element(e, id)),
        ExecutionElement::Split(split) => split
            .flows
            .iter()
            .any(|f| f.id == id || f.elements.iter().any(|e| contains_element(e, id))),
        _ => false,
    }
}
