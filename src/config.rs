//! Typed run configuration loaded from a TOML file.
//!
//! ```toml
//! topic = "statins and dementia risk"
//!
//! [input]
//! items = "candidates.jsonl"
//!
//! [judge]
//! command = "claude"
//! args = ["--print", "--output-format", "json"]
//! timeout_secs = 120
//!
//! [tiers.bulk]
//! requests_per_interval = 60
//! interval_secs = 60
//! max_in_flight = 8
//!
//! [screening]
//! concurrency = 5
//! criteria = "Adults; randomised or cohort design; dementia outcome"
//! include_threshold = 0.85
//! exclude_threshold = 0.80
//!
//! [budget]
//! max_cost_usd = 25.0
//! ```
//!
//! Layering is file, then environment (`SYSREV_JUDGE_CMD`, `SYSREV_DATA_DIR`),
//! then CLI flags. Unknown keys are rejected at parse time.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysrev_common::{Phase, Tier};

use crate::errors::ConfigError;

pub const ENV_JUDGE_CMD: &str = "SYSREV_JUDGE_CMD";
pub const ENV_DATA_DIR: &str = "SYSREV_DATA_DIR";
pub const DEFAULT_DATA_DIR: &str = ".sysrev";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReviewConfig {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub input: InputConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, TierConfig>,
    #[serde(default = "StageConfig::screening_default")]
    pub screening: StageConfig,
    #[serde(default = "StageConfig::extraction_default")]
    pub extraction: StageConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Directory relative paths are resolved against (the config file's directory).
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    /// JSONL file of candidate documents, one `{"id": .., "title": .., ...}` per line.
    pub items: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JudgeConfig {
    #[serde(default = "default_judge_cmd")]
    pub command: String,
    #[serde(default = "default_judge_args")]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature_a")]
    pub temperature_a: f64,
    #[serde(default = "default_temperature_b")]
    pub temperature_b: f64,
    #[serde(default = "default_temperature_a")]
    pub temperature_adjudicator: f64,
}

fn default_judge_cmd() -> String {
    "claude".to_string()
}

fn default_judge_args() -> Vec<String> {
    vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
    ]
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_temperature_a() -> f64 {
    0.0
}

fn default_temperature_b() -> f64 {
    0.7
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            command: default_judge_cmd(),
            args: default_judge_args(),
            timeout_secs: default_timeout_secs(),
            temperature_a: default_temperature_a(),
            temperature_b: default_temperature_b(),
            temperature_adjudicator: default_temperature_a(),
        }
    }
}

impl JudgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Admission limits for one external-service quota.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    pub requests_per_interval: u32,
    pub interval_secs: u64,
    pub max_in_flight: usize,
}

impl TierConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_tiers() -> BTreeMap<String, TierConfig> {
    let mut tiers = BTreeMap::new();
    tiers.insert(
        "bulk".to_string(),
        TierConfig {
            requests_per_interval: 60,
            interval_secs: 60,
            max_in_flight: 8,
        },
    );
    tiers.insert(
        "balanced".to_string(),
        TierConfig {
            requests_per_interval: 30,
            interval_secs: 60,
            max_in_flight: 4,
        },
    );
    tiers.insert(
        "premium".to_string(),
        TierConfig {
            requests_per_interval: 10,
            interval_secs: 60,
            max_in_flight: 2,
        },
    );
    tiers
}

/// Per-item-phase consensus and worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Two independent judges plus adjudication, or a single judge.
    #[serde(default = "default_true")]
    pub dual_review: bool,
    /// Agreement alone is not enough; both judges must clear the band.
    #[serde(default = "default_true")]
    pub require_confidence: bool,
    #[serde(default = "default_include_threshold")]
    pub include_threshold: f64,
    #[serde(default = "default_exclude_threshold")]
    pub exclude_threshold: f64,
    #[serde(default = "default_judge_tier")]
    pub judge_tier: String,
    #[serde(default = "default_adjudicator_tier")]
    pub adjudicator_tier: String,
    /// Attempts per judge call, including the first.
    #[serde(default = "default_judge_attempts")]
    pub judge_attempts: u32,
    #[serde(default = "default_adjudicator_attempts")]
    pub adjudicator_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default)]
    pub criteria: String,
}

fn default_concurrency() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_include_threshold() -> f64 {
    0.85
}

fn default_exclude_threshold() -> f64 {
    0.80
}

fn default_judge_tier() -> String {
    "bulk".to_string()
}

fn default_adjudicator_tier() -> String {
    "premium".to_string()
}

fn default_judge_attempts() -> u32 {
    2
}

fn default_adjudicator_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

impl StageConfig {
    pub fn screening_default() -> Self {
        Self {
            concurrency: default_concurrency(),
            dual_review: true,
            require_confidence: true,
            include_threshold: default_include_threshold(),
            exclude_threshold: default_exclude_threshold(),
            judge_tier: default_judge_tier(),
            adjudicator_tier: default_adjudicator_tier(),
            judge_attempts: default_judge_attempts(),
            adjudicator_attempts: default_adjudicator_attempts(),
            backoff_ms: default_backoff_ms(),
            criteria: String::new(),
        }
    }

    pub fn extraction_default() -> Self {
        Self {
            dual_review: false,
            require_confidence: false,
            judge_tier: "balanced".to_string(),
            ..Self::screening_default()
        }
    }

    pub fn judge_tier(&self) -> Tier {
        Tier::new(&self.judge_tier)
    }

    pub fn adjudicator_tier(&self) -> Tier {
        Tier::new(&self.adjudicator_tier)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    fn validate(&self, name: &str, tiers: &BTreeMap<String, TierConfig>) -> Result<(), ConfigError> {
        let field = |f: &str| format!("{}.{}", name, f);
        if self.concurrency == 0 {
            return Err(ConfigError::invalid(&field("concurrency"), "must be at least 1"));
        }
        for (key, value) in [
            ("include_threshold", self.include_threshold),
            ("exclude_threshold", self.exclude_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid(
                    &field(key),
                    format!("must be between 0.0 and 1.0, got {}", value),
                ));
            }
        }
        for (key, tier) in [
            ("judge_tier", &self.judge_tier),
            ("adjudicator_tier", &self.adjudicator_tier),
        ] {
            if !tiers.contains_key(tier) {
                return Err(ConfigError::invalid(
                    &field(key),
                    format!("unknown tier '{}'", tier),
                ));
            }
        }
        if self.judge_attempts == 0 || self.adjudicator_attempts == 0 {
            return Err(ConfigError::invalid(
                &field("judge_attempts"),
                "attempt counts must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BudgetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
}

/// The result-affecting subset of the config. Only these fields feed the hash.
#[derive(Serialize)]
struct HashedView<'a> {
    topic: &'a str,
    items: String,
    judge_command: &'a str,
    judge_args: &'a [String],
    screening: StageView<'a>,
    extraction: StageView<'a>,
}

#[derive(Serialize)]
struct StageView<'a> {
    dual_review: bool,
    require_confidence: bool,
    include_threshold: f64,
    exclude_threshold: f64,
    criteria: &'a str,
}

impl<'a> From<&'a StageConfig> for StageView<'a> {
    fn from(stage: &'a StageConfig) -> Self {
        Self {
            dual_review: stage.dual_review,
            require_confidence: stage.require_confidence,
            include_threshold: stage.include_threshold,
            exclude_threshold: stage.exclude_threshold,
            criteria: &stage.criteria,
        }
    }
}

impl ReviewConfig {
    /// Load, layer environment overrides, and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        // Absolute so the snapshot and the hash agree across working directories.
        let base_dir = std::path::absolute(path)
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::from_toml_str(&content, &base_dir).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse without touching the environment or validating.
    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut config: ReviewConfig =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source: Box::new(source),
            })?;
        config.base_dir = base_dir.to_path_buf();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(cmd) = std::env::var(ENV_JUDGE_CMD)
            && !cmd.trim().is_empty()
        {
            self.judge.command = cmd;
        }
        if let Ok(dir) = std::env::var(ENV_DATA_DIR)
            && !dir.trim().is_empty()
        {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::invalid("topic", "must not be empty"));
        }
        if self.judge.command.trim().is_empty() {
            return Err(ConfigError::invalid("judge.command", "must not be empty"));
        }
        if self.judge.timeout_secs == 0 {
            return Err(ConfigError::invalid("judge.timeout_secs", "must be positive"));
        }
        for (name, tier) in &self.tiers {
            if tier.requests_per_interval == 0 || tier.interval_secs == 0 || tier.max_in_flight == 0
            {
                return Err(ConfigError::invalid(
                    &format!("tiers.{}", name),
                    "requests_per_interval, interval_secs and max_in_flight must all be positive",
                ));
            }
        }
        if self.screening.criteria.trim().is_empty() {
            return Err(ConfigError::invalid(
                "screening.criteria",
                "must describe the inclusion criteria",
            ));
        }
        self.screening.validate("screening", &self.tiers)?;
        self.extraction.validate("extraction", &self.tiers)?;
        if let Some(limit) = self.budget.max_cost_usd
            && limit <= 0.0
        {
            return Err(ConfigError::invalid("budget.max_cost_usd", "must be positive"));
        }
        Ok(())
    }

    pub fn stage(&self, phase: Phase) -> Option<&StageConfig> {
        match phase {
            Phase::Screening => Some(&self.screening),
            Phase::Extraction => Some(&self.extraction),
            _ => None,
        }
    }

    pub fn items_path(&self) -> PathBuf {
        self.base_dir.join(&self.input.items)
    }

    /// Data directory from the file or environment, falling back to `.sysrev`
    /// next to the config file.
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => self.base_dir.join(dir),
            None => self.base_dir.join(DEFAULT_DATA_DIR),
        }
    }

    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = Some(dir);
    }

    /// SHA-256 over the result-affecting fields, hex encoded.
    ///
    /// Two configs with the same topic but different criteria, thresholds or
    /// input hash differently and therefore never share a workflow.
    pub fn config_hash(&self) -> String {
        let view = HashedView {
            topic: self.topic.trim(),
            items: self.items_path().to_string_lossy().to_string(),
            judge_command: &self.judge.command,
            judge_args: &self.judge.args,
            screening: (&self.screening).into(),
            extraction: (&self.extraction).into(),
        };
        let canonical = serde_json::to_string(&view).unwrap_or_default();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Self-contained TOML snapshot with absolute paths, stored next to the
    /// workflow state so `resume` needs no config argument.
    pub fn to_snapshot(&self) -> Result<String, ConfigError> {
        let mut snapshot = self.clone();
        snapshot.input.items = self.items_path();
        snapshot.data_dir = Some(self.data_dir());
        toml::to_string_pretty(&snapshot)
            .map_err(|e| ConfigError::invalid("snapshot", e.to_string()))
    }

    /// Read back a snapshot written by [`Self::to_snapshot`].
    pub fn load_snapshot(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content, Path::new("/"))?;
        config.validate()?;
        Ok(config)
    }
}
