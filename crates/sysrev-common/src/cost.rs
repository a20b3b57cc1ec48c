use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Actor, Phase, Tier, WorkflowId};

/// Token and price accounting reported by the judgment service for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// One accounted external call. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostUnit {
    pub workflow_id: WorkflowId,
    pub phase: Phase,
    pub tier: Tier,
    pub actor: Actor,
    pub item_id: Option<String>,
    pub usage: Usage,
    pub latency_ms: u64,
    pub recorded_at: DateTime<Utc>,
}
