//! Router configuration file parsing and validation.
//!
//! The config is a JSON document with two required top-level keys: `apps`
//! (the tool catalog) and `routing` (the rule table). Missing file or
//! missing required keys is fatal at construction time; routing itself
//! never fails at runtime.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterConfigError {
    #[error("router config not found: {0}")]
    ConfigNotFound(String),
    #[error("invalid router config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, RouterConfigError>;

/// Tool selection strategy for a routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Always the first candidate.
    Fixed,
    /// Per-rule rotation over the candidate list.
    RoundRobin,
    /// Highest running success rate, tie-broken by mean latency.
    Metrics,
    /// Alias for `metrics`.
    Auto,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::RoundRobin => "round_robin",
            Self::Metrics => "metrics",
            Self::Auto => "auto",
        }
    }
}

/// Global defaults applied when an app does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterDefaults {
    pub timeout_seconds: u32,
    pub max_retries: u32,
}

impl Default for RouterDefaults {
    fn default() -> Self {
        Self {
            timeout_seconds: 600,
            max_retries: 0,
        }
    }
}

/// Declared capabilities of a tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub task_kinds: Vec<String>,
    /// Empty means the tool accepts any domain.
    pub domains: Vec<String>,
}

/// Per-tool execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppLimits {
    pub max_parallel: u32,
    pub timeout_seconds: Option<u32>,
}

impl Default for AppLimits {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            timeout_seconds: None,
        }
    }
}

/// One configured tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub limits: AppLimits,
    #[serde(default)]
    pub safety_tier: Option<String>,
}

/// Match constraints for a routing rule. A constraint only participates
/// when it is present; an absent constraint never blocks a match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleMatch {
    pub task_kind: Vec<String>,
    pub risk_tier: Vec<String>,
    pub complexity: Option<String>,
}

/// One routing rule, evaluated in file order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    pub id: String,
    #[serde(rename = "match", default)]
    pub matcher: RuleMatch,
    pub select_from: Vec<String>,
    pub strategy: Strategy,
}

/// The routing rule table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    #[serde(default)]
    pub rules: Vec<RouteRule>,
}

/// Parsed and validated router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub defaults: RouterDefaults,
    /// Keyed by tool id; BTreeMap so fallback iteration is deterministic.
    pub apps: BTreeMap<String, AppConfig>,
    pub routing: RoutingTable,
}

impl RouterConfig {
    /// Load from a file. Missing file and malformed content are distinct
    /// fatal errors.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| RouterConfigError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&raw)
    }

    /// Parse and validate config JSON.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| RouterConfigError::InvalidConfig(e.to_string()))?;

        // Required top-level keys checked explicitly so the error names
        // the missing key rather than a serde field path.
        for key in ["apps", "routing"] {
            if value.get(key).is_none() {
                return Err(RouterConfigError::InvalidConfig(format!(
                    "missing required key: {key}"
                )));
            }
        }

        let config: Self = serde_json::from_value(value)
            .map_err(|e| RouterConfigError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen_rules: Vec<&str> = Vec::new();
        for rule in &self.routing.rules {
            if seen_rules.contains(&rule.id.as_str()) {
                return Err(RouterConfigError::InvalidConfig(format!(
                    "duplicate rule id: {}",
                    rule.id
                )));
            }
            seen_rules.push(&rule.id);

            if rule.select_from.is_empty() {
                return Err(RouterConfigError::InvalidConfig(format!(
                    "rule {} has an empty selectFrom list",
                    rule.id
                )));
            }
            for tool in &rule.select_from {
                if !self.apps.contains_key(tool) {
                    return Err(RouterConfigError::InvalidConfig(format!(
                        "rule {} selects unknown tool: {tool}",
                        rule.id
                    )));
                }
            }
        }
        Ok(())
    }
}
