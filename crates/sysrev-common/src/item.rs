//! Items (units of resumable work) and their durable outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ParseError, Phase, WorkflowId};

/// A candidate document as delivered by an upstream search connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    #[serde(default, rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Document {
    pub fn titled(title: &str) -> Self {
        Self {
            title: title.to_string(),
            abstract_text: None,
            authors: Vec::new(),
            year: None,
            doi: None,
            source: None,
        }
    }
}

/// One unit of work within an item phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub stage: Phase,
    pub payload: Document,
}

impl Item {
    pub fn new(id: &str, stage: Phase, payload: Document) -> Self {
        Self {
            id: id.to_string(),
            stage,
            payload,
        }
    }
}

/// A judge's verdict on one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Include,
    Exclude,
    Uncertain,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Include => "include",
            Self::Exclude => "exclude",
            Self::Uncertain => "uncertain",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "include" | "included" => Ok(Self::Include),
            "exclude" | "excluded" => Ok(Self::Exclude),
            "uncertain" | "unsure" | "maybe" => Ok(Self::Uncertain),
            other => Err(ParseError::UnknownDecision(other.to_string())),
        }
    }
}

/// Who produced an outcome.
///
/// `Final` is the binding consensus row; its presence marks the item as
/// processed for the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    JudgeA,
    JudgeB,
    Adjudicator,
    Human,
    Final,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JudgeA => "judge_a",
            Self::JudgeB => "judge_b",
            Self::Adjudicator => "adjudicator",
            Self::Human => "human",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actor {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "judge_a" => Ok(Self::JudgeA),
            "judge_b" => Ok(Self::JudgeB),
            "adjudicator" => Ok(Self::Adjudicator),
            "human" => Ok(Self::Human),
            "final" => Ok(Self::Final),
            other => Err(ParseError::UnknownActor(other.to_string())),
        }
    }
}

/// Durable, append-only result of one actor's work on one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub workflow_id: WorkflowId,
    pub stage: Phase,
    pub item_id: String,
    pub actor: Actor,
    pub decision: Decision,
    pub confidence: f64,
    pub rationale: String,
    pub recorded_at: DateTime<Utc>,
}

impl ItemOutcome {
    pub fn new(
        workflow_id: &WorkflowId,
        stage: Phase,
        item_id: &str,
        actor: Actor,
        decision: Decision,
        confidence: f64,
        rationale: &str,
    ) -> Self {
        Self {
            workflow_id: workflow_id.clone(),
            stage,
            item_id: item_id.to_string(),
            actor,
            decision,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_parse_accepts_synonyms() {
        assert_eq!("INCLUDE".parse::<Decision>(), Ok(Decision::Include));
        assert_eq!(" excluded ".parse::<Decision>(), Ok(Decision::Exclude));
        assert_eq!("maybe".parse::<Decision>(), Ok(Decision::Uncertain));
        assert!("accept".parse::<Decision>().is_err());
    }

    #[test]
    fn test_outcome_confidence_is_clamped() {
        let wf = WorkflowId::from("wf-1");
        let high = ItemOutcome::new(&wf, Phase::Screening, "p1", Actor::JudgeA, Decision::Include, 1.7, "");
        let low = ItemOutcome::new(&wf, Phase::Screening, "p1", Actor::JudgeB, Decision::Include, -0.2, "");
        assert_eq!(high.confidence, 1.0);
        assert_eq!(low.confidence, 0.0);
    }

    #[test]
    fn test_document_abstract_field_name() {
        let json = r#"{"title": "Statins", "abstract": "RCT of 400 adults"}"#;
        let doc: Document = serde_json::from_str(json).unwrap();
        assert_eq!(doc.abstract_text.as_deref(), Some("RCT of 400 adults"));
        assert!(doc.authors.is_empty());
    }

    #[test]
    fn test_actor_round_trip() {
        for actor in [Actor::JudgeA, Actor::JudgeB, Actor::Adjudicator, Actor::Human, Actor::Final] {
            assert_eq!(actor.as_str().parse::<Actor>().unwrap(), actor);
        }
    }
}
