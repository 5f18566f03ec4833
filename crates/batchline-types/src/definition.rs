//! Job definition graph.
//!
//! The immutable in-memory representation of a job: an ordered list of
//! execution elements (steps, flows, splits, decisions) plus transition rules.
//! Deserializable from YAML or JSON with a plain serde mapping:
//!
//! ```yaml
//! id: payroll
//! elements:
//!   - type: step
//!     id: load
//!     next: report
//!     task:
//!       chunk:
//!         reader: { name: csv-reader }
//!         writer: { name: ledger-writer }
//!         checkpoint: { policy: item, item_count: 50 }
//!   - type: step
//!     id: report
//!     task:
//!       batchlet: { name: report-builder }
//!     transitions:
//!       - { on: "FAILED", action: stop, restart: report }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::partition::PartitionPlan;

/// Property set attached to jobs, steps, artifacts and partitions.
pub type Properties = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    /// Whether a failed or stopped execution of this job may be restarted.
    #[serde(default = "default_true")]
    pub restartable: bool,
    /// Abstract jobs are templates and can never be started.
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    /// Job listeners, fired in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ArtifactRef>,
    pub elements: Vec<ExecutionElement>,
}

fn default_true() -> bool {
    true
}

/// One node of an execution scope (the job itself or a flow).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionElement {
    Step(StepDefinition),
    Flow(FlowDefinition),
    Split(SplitDefinition),
    Decision(DecisionDefinition),
}

impl ExecutionElement {
    pub fn id(&self) -> &str {
        match self {
            ExecutionElement::Step(s) => &s.id,
            ExecutionElement::Flow(f) => &f.id,
            ExecutionElement::Split(s) => &s.id,
            ExecutionElement::Decision(d) => &d.id,
        }
    }

    /// Implicit successor when no transition rule matches.
    pub fn next(&self) -> Option<&str> {
        match self {
            ExecutionElement::Step(s) => s.next.as_deref(),
            ExecutionElement::Flow(f) => f.next.as_deref(),
            ExecutionElement::Split(s) => s.next.as_deref(),
            ExecutionElement::Decision(_) => None,
        }
    }

    pub fn transitions(&self) -> &[Transition] {
        match self {
            ExecutionElement::Step(s) => &s.transitions,
            ExecutionElement::Flow(f) => &f.transitions,
            ExecutionElement::Split(s) => &s.transitions,
            ExecutionElement::Decision(d) => &d.transitions,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionElement::Step(_) => "step",
            ExecutionElement::Flow(_) => "flow",
            ExecutionElement::Split(_) => "split",
            ExecutionElement::Decision(_) => "decision",
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Maximum number of starts across all executions of the instance (0 = unlimited).
    #[serde(default)]
    pub start_limit: u32,
    /// Re-run this step on restart even if it already completed.
    #[serde(default)]
    pub allow_start_if_complete: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    /// Step, chunk, skip and retry listeners, resolved by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ArtifactRef>,
    pub task: StepTask,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
}

/// What a step runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTask {
    Batchlet(ArtifactRef),
    Chunk(ChunkDefinition),
}

/// Read-process-write loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDefinition {
    pub reader: ArtifactRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<ArtifactRef>,
    pub writer: ArtifactRef,
    #[serde(default)]
    pub checkpoint: CheckpointPolicy,
    /// Maximum skips across the step (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_limit: Option<u32>,
    /// Maximum retries across the step (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    #[serde(default)]
    pub skippable: ExceptionFilter,
    #[serde(default)]
    pub retryable: ExceptionFilter,
}

/// When the chunk loop flushes its buffer and commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Commit every `item_count` items, or after `time_limit_secs` elapsed,
    /// whichever comes first. `None` item count uses the engine default.
    Item {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_limit_secs: Option<u64>,
    },
    /// A user-supplied checkpoint algorithm decides.
    Custom { algorithm: ArtifactRef },
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy::Item {
            item_count: None,
            time_limit_secs: None,
        }
    }
}

/// Error-kind lists for skip or retry classification.
///
/// Entries are dotted error-kind prefixes (e.g. `io` covers `io.remote.Timeout`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ExceptionFilter {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
    }
}

/// Partitioning of a step. Exactly one of `plan` or `mapper` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PartitionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapper: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<ArtifactRef>,
}

// ---------------------------------------------------------------------------
// Flow / Split / Decision
// ---------------------------------------------------------------------------

/// A linear sequence of elements with its own transition scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    pub elements: Vec<ExecutionElement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
}

/// Flows executed concurrently, joined before continuing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    pub flows: Vec<FlowDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,
}

/// Routes on the exit status returned by a user decider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionDefinition {
    pub id: String,
    pub decider: ArtifactRef,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

// ---------------------------------------------------------------------------
// Transitions and artifact references
// ---------------------------------------------------------------------------

/// Exit-status rule: when `on` matches, apply `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Glob pattern (`*` any run, `?` one character).
    pub on: String,
    #[serde(flatten)]
    pub action: TransitionAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransitionAction {
    Next {
        to: String,
    },
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
        /// Element to resume at when the job is restarted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restart: Option<String>,
    },
    Fail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
    },
    End {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
    },
}

/// Symbolic reference to a user artifact plus its declared properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

impl ArtifactRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
