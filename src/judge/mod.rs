//! Client boundary for the external judgment service.
//!
//! The engine only sees [`JudgmentClient`]. The shipped implementation,
//! [`CommandJudge`], pipes a prompt into an LLM CLI; tests substitute
//! scripted clients.

mod command;
mod prompt;

pub use command::CommandJudge;
pub use prompt::{build_judge_prompt, extract_json, parse_judgment};

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use sysrev_common::{Actor, Decision, Item, Phase, Usage};

use crate::errors::JudgeError;

/// Which seat a call fills in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeRole {
    JudgeA,
    JudgeB,
    Adjudicator,
}

impl JudgeRole {
    pub fn actor(&self) -> Actor {
        match self {
            Self::JudgeA => Actor::JudgeA,
            Self::JudgeB => Actor::JudgeB,
            Self::Adjudicator => Actor::Adjudicator,
        }
    }
}

impl fmt::Display for JudgeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.actor().as_str())
    }
}

/// An earlier reviewer's opinion, shown to the adjudicator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorOpinion {
    pub actor: Actor,
    /// `None` when that reviewer failed and gave no opinion.
    pub decision: Option<Decision>,
    pub confidence: f64,
    pub rationale: String,
}

impl PriorOpinion {
    pub fn unavailable(actor: Actor, reason: &str) -> Self {
        Self {
            actor,
            decision: None,
            confidence: 0.0,
            rationale: format!("no second opinion available: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub topic: String,
    pub stage: Phase,
    pub item: Item,
    pub role: JudgeRole,
    pub criteria: String,
    pub temperature: f64,
    /// Empty for the two independent judges.
    pub prior: Vec<PriorOpinion>,
}

/// One reviewer's verdict plus the service's accounting for the call.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub decision: Decision,
    pub confidence: f64,
    pub rationale: String,
    pub usage: Usage,
}

/// Must be safe to call concurrently.
#[async_trait]
pub trait JudgmentClient: Send + Sync {
    async fn judge(&self, request: &JudgeRequest) -> Result<Judgment, JudgeError>;
}
