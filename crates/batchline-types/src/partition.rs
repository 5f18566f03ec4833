//! Partition plans.

use serde::{Deserialize, Serialize};

use crate::definition::Properties;

/// How a partitioned step is fanned out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    /// Number of partitions (>= 1).
    pub partitions: u32,
    /// Maximum partitions running at once (`None` = as many as partitions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    /// Per-partition properties, index-aligned with partition numbers.
    #[serde(default, alias = "properties")]
    pub partition_properties: Vec<Properties>,
    /// Discard prior partition state on restart instead of reusing it.
    #[serde(default)]
    pub override_on_restart: bool,
}

impl PartitionPlan {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            threads: None,
            partition_properties: Vec::new(),
            override_on_restart: false,
        }
    }

    /// Properties for partition `index`, empty when the plan lists fewer.
    pub fn properties_for(&self, index: u32) -> Properties {
        self.partition_properties
            .get(index as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Effective concurrency bound.
    pub fn effective_threads(&self) -> u32 {
        self.threads
            .filter(|t| *t > 0)
            .unwrap_or(self.partitions)
            .max(1)
    }
}
