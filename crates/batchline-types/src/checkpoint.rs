//! Checkpoint records for chunk steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the checkpoint stream of one chunk loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub instance_id: Uuid,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
}

impl CheckpointKey {
    pub fn new(instance_id: Uuid, step_name: &str, partition: Option<u32>) -> Self {
        Self {
            instance_id,
            step_name: step_name.to_string(),
            partition,
        }
    }
}

impl std::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.partition {
            Some(p) => write!(f, "{}/{}#{}", self.instance_id, self.step_name, p),
            None => write!(f, "{}/{}", self.instance_id, self.step_name),
        }
    }
}

/// Durable progress marker. Only ever overwritten at a commit boundary, so it
/// always reflects fully-committed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub key: CheckpointKey,
    /// Opaque reader position (`ItemReader::checkpoint_info`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader: Option<serde_json::Value>,
    /// Opaque writer position (`ItemWriter::checkpoint_info`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<serde_json::Value>,
    /// Items read since the step first started (across restarts).
    #[serde(default)]
    pub items_since_start: u64,
    pub committed_at: DateTime<Utc>,
}
