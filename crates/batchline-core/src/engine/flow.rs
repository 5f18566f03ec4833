//! Element walker for execution scopes.
//!
//! A scope is the job's top-level element list or a flow's. The walker runs
//! one element at a time, resolves its transitions against sibling ids, and
//! stops at the first terminal rule, an unhandled failure, or the end of the
//! scope. Splits run each flow as a coordinator on the worker pool and fold
//! the flows into one outcome before their own transitions apply.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use batchline_types::definition::{DecisionDefinition, ExecutionElement, SplitDefinition};
use batchline_types::status::BatchStatus;
use batchline_types::step::StepExecution;

use super::context::JobContext;
use super::definition::{DefinitionError, contains_element};
use super::properties::PropertyResolver;
use super::transition::{self, ResolvedAction};
use super::{Engine, EngineError, artifact_context};
use crate::repository::JobRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    End,
    Stop,
    Fail,
}

impl TerminalKind {
    pub fn batch_status(&self) -> BatchStatus {
        match self {
            TerminalKind::End => BatchStatus::Completed,
            TerminalKind::Stop => BatchStatus::Stopped,
            TerminalKind::Fail => BatchStatus::Failed,
        }
    }

    fn priority(&self) -> u8 {
        match self {
            TerminalKind::End => 0,
            TerminalKind::Stop => 1,
            TerminalKind::Fail => 2,
        }
    }
}

/// A terminal transition (`end`, `stop` or `fail`) that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    pub kind: TerminalKind,
    pub exit_status: Option<String>,
    /// Restart target of a `stop` rule.
    pub restart: Option<String>,
}

/// How a scope finished.
#[derive(Debug, Clone)]
pub struct ScopeOutcome {
    pub batch_status: BatchStatus,
    /// Exit status of the last element, or the terminal override.
    pub exit_status: Option<String>,
    pub terminal: Option<Terminal>,
    /// Step executions of the last step, flow or split, for decisions.
    pub last_executions: Vec<StepExecution>,
}

impl ScopeOutcome {
    fn stopped(last_executions: Vec<StepExecution>) -> Self {
        Self {
            batch_status: BatchStatus::Stopped,
            exit_status: None,
            terminal: None,
            last_executions,
        }
    }

    fn failed() -> Self {
        Self {
            batch_status: BatchStatus::Failed,
            exit_status: None,
            terminal: None,
            last_executions: Vec::new(),
        }
    }
}

type ScopeFuture<'a> = Pin<Box<dyn Future<Output = Result<ScopeOutcome, EngineError>> + Send + 'a>>;

impl<R: JobRepository> Engine<R> {
    /// Walk `elements` from the first element, or from `start_at` on restart.
    /// `start_at` may name an element nested inside one of the scope's flows
    /// or splits.
    pub(crate) fn run_scope<'a>(
        &'a self,
        scope_id: &'a str,
        elements: &'a [ExecutionElement],
        start_at: Option<&'a str>,
        job: &'a Arc<JobContext>,
        resolver: &'a PropertyResolver,
    ) -> ScopeFuture<'a> {
        Box::pin(async move {
            let mut index = match start_at {
                None => 0,
                Some(target) => elements
                    .iter()
                    .position(|e| e.id() == target)
                    .or_else(|| elements.iter().position(|e| contains_element(e, target)))
                    .ok_or_else(|| DefinitionError::UnknownRestartTarget(target.to_string()))?,
            };
            let mut nested_start = start_at.filter(|target| elements[index].id() != *target);

            let mut visited: HashSet<&str> = HashSet::new();
            let mut last_executions: Vec<StepExecution> = Vec::new();

            loop {
                let element = &elements[index];
                if !visited.insert(element.id()) {
                    return Err(DefinitionError::TransitionLoop(element.id().to_string()).into());
                }
                if job.is_stop_requested() {
                    tracing::info!(scope = scope_id, element = element.id(), "scope stopped");
                    return Ok(ScopeOutcome::stopped(last_executions));
                }
                let child_start = nested_start.take();

                let (batch_status, exit_status) = match element {
                    ExecutionElement::Step(step) => {
                        let outcome = self.run_step(step, job, resolver).await?;
                        if outcome.skipped {
                            tracing::debug!(
                                scope = scope_id,
                                step = %step.id,
                                "routing on the prior completed execution"
                            );
                        }
                        last_executions = outcome.execution.into_iter().collect();
                        (outcome.batch_status, outcome.exit_status)
                    }
                    ExecutionElement::Flow(flow) => {
                        let inner = self
                            .run_scope(&flow.id, &flow.elements, child_start, job, resolver)
                            .await?;
                        if inner.terminal.is_some() {
                            return Ok(inner);
                        }
                        last_executions = inner.last_executions;
                        let exit = inner
                            .exit_status
                            .unwrap_or_else(|| inner.batch_status.to_string());
                        (inner.batch_status, exit)
                    }
                    ExecutionElement::Split(split) => {
                        let joined = self.run_split(split, child_start, job, resolver).await?;
                        last_executions = joined.last_executions;
                        let exit = joined
                            .exit_status
                            .unwrap_or_else(|| joined.batch_status.to_string());
                        (joined.batch_status, exit)
                    }
                    ExecutionElement::Decision(decision) => {
                        if last_executions.is_empty() {
                            return Err(DefinitionError::NoPriorExecution(decision.id.clone()).into());
                        }
                        self.decide(decision, &last_executions, job, resolver)
                    }
                };

                let resolution = transition::resolve(&exit_status, element.transitions(), element.next());
                tracing::debug!(
                    scope = scope_id,
                    element = element.id(),
                    kind = element.kind(),
                    status = %batch_status,
                    exit_status = %exit_status,
                    action = ?resolution.action,
                    "transition resolved"
                );

                // An unhandled failure or stop ends the scope; only an
                // explicit rule may route around it.
                if matches!(batch_status, BatchStatus::Failed | BatchStatus::Stopped)
                    && !resolution.matched()
                {
                    return Ok(ScopeOutcome {
                        batch_status,
                        exit_status: Some(exit_status),
                        terminal: None,
                        last_executions,
                    });
                }

                let terminal = match resolution.action {
                    ResolvedAction::Next(to) => {
                        index = elements.iter().position(|e| e.id() == to).ok_or_else(|| {
                            DefinitionError::UnknownTarget {
                                scope: scope_id.to_string(),
                                element: element.id().to_string(),
                                target: to.clone(),
                            }
                        })?;
                        continue;
                    }
                    ResolvedAction::Complete => {
                        return Ok(ScopeOutcome {
                            batch_status,
                            exit_status: Some(exit_status),
                            terminal: None,
                            last_executions,
                        });
                    }
                    ResolvedAction::End { exit_status } => Terminal {
                        kind: TerminalKind::End,
                        exit_status,
                        restart: None,
                    },
                    ResolvedAction::Fail { exit_status } => Terminal {
                        kind: TerminalKind::Fail,
                        exit_status,
                        restart: None,
                    },
                    ResolvedAction::Stop {
                        exit_status,
                        restart,
                    } => Terminal {
                        kind: TerminalKind::Stop,
                        exit_status,
                        restart,
                    },
                };
                tracing::info!(
                    scope = scope_id,
                    element = element.id(),
                    terminal = ?terminal.kind,
                    "terminal transition"
                );
                return Ok(ScopeOutcome {
                    batch_status: terminal.kind.batch_status(),
                    exit_status: terminal.exit_status.clone(),
                    terminal: Some(terminal),
                    last_executions,
                });
            }
        })
    }

    async fn run_split(
        &self,
        split: &SplitDefinition,
        start_at: Option<&str>,
        job: &Arc<JobContext>,
        resolver: &PropertyResolver,
    ) -> Result<ScopeOutcome, EngineError> {
        tracing::info!(split = %split.id, flows = split.flows.len(), "split started");
        let handles: Vec<_> = split
            .flows
            .iter()
            .map(|flow| {
                let engine = self.clone();
                let flow = flow.clone();
                let job = Arc::clone(job);
                let resolver = resolver.clone();
                let start = start_at
                    .filter(|target| flow.elements.iter().any(|e| contains_element(e, target)))
                    .map(str::to_string);
                self.pool
                    .spawn_coordinator(format!("{}/{}", split.id, flow.id), async move {
                        engine
                            .run_scope(&flow.id, &flow.elements, start.as_deref(), &job, &resolver)
                            .await
                    })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut structural = None;
        for (flow, result) in split.flows.iter().zip(self.pool.await_all(handles).await) {
            match result {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => {
                    structural.get_or_insert(e);
                }
                Err(e) => {
                    tracing::warn!(split = %split.id, flow = %flow.id, error = %e, "flow did not finish");
                    outcomes.push(ScopeOutcome::failed());
                }
            }
        }
        if let Some(e) = structural {
            return Err(e);
        }

        let joined = join_flows(outcomes);
        tracing::info!(split = %split.id, status = %joined.batch_status, "split finished");
        Ok(joined)
    }

    fn decide(
        &self,
        decision: &DecisionDefinition,
        executions: &[StepExecution],
        job: &Arc<JobContext>,
        resolver: &PropertyResolver,
    ) -> (BatchStatus, String) {
        let mut decider_ref = decision.decider.clone();
        for (key, value) in &decision.properties {
            decider_ref
                .properties
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        let ctx = artifact_context(&decider_ref, job, None, None, resolver);
        let decided = self
            .artifacts
            .load_decider(&ctx)
            .map_err(|e| e.to_string())
            .and_then(|decider| decider.decide(executions).map_err(|e| e.to_string()));
        match decided {
            Ok(exit_status) => (BatchStatus::Completed, exit_status),
            Err(e) => {
                tracing::warn!(decision = %decision.id, error = %e, "decider failed");
                (BatchStatus::Failed, BatchStatus::Failed.to_string())
            }
        }
    }
}

/// Fold the outcomes of a split's flows (in declaration order) into one.
fn join_flows(outcomes: Vec<ScopeOutcome>) -> ScopeOutcome {
    let batch_status = outcomes
        .iter()
        .map(|o| o.batch_status)
        .max_by_key(BatchStatus::severity)
        .unwrap_or(BatchStatus::Completed);

    // The flow whose outcome speaks for the split: the first one with the
    // strongest terminal rule, else the first one with the worst status.
    let mut representative: Option<&ScopeOutcome> = None;
    for outcome in outcomes.iter().filter(|o| o.terminal.is_some()) {
        let beats = match (representative.and_then(|r| r.terminal.as_ref()), &outcome.terminal) {
            (None, _) => true,
            (Some(current), Some(candidate)) => candidate.kind.priority() > current.kind.priority(),
            (Some(_), None) => false,
        };
        if beats {
            representative = Some(outcome);
        }
    }
    let representative = representative
        .filter(|r| r.batch_status.severity() == batch_status.severity())
        .or_else(|| outcomes.iter().find(|o| o.batch_status == batch_status));

    let exit_status = representative.and_then(|r| r.exit_status.clone());
    ScopeOutcome {
        batch_status,
        exit_status,
        terminal: None,
        last_executions: outcomes
            .into_iter()
            .flat_map(|o| o.last_executions)
            .collect(),
    }
}
