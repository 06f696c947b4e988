//! Plan file parsing and load-time validation.
//!
//! A plan is a JSON document describing a DAG of external-process steps.
//! `${NAME}` placeholders are substituted against a caller-supplied map
//! before parsing; unresolved placeholders are left verbatim. Validation
//! rejects duplicate step ids, dangling dependency references, and cycles.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan file: {0}")]
    Io(String),
    #[error("invalid plan JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },
    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },
}

pub type Result<T> = std::result::Result<T, PlanError>;

/// Step failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Cancel every remaining pending step and abort the plan
    /// (only when the step is also marked `critical`).
    #[default]
    Abort,
    /// Mark all transitive dependents skipped; unrelated steps continue.
    SkipDependents,
    /// Leave dependents eligible to run.
    Continue,
}

impl OnFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::SkipDependents => "skip_dependents",
            Self::Continue => "continue",
        }
    }
}

/// Plan-wide defaults, overridable per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanGlobals {
    pub max_concurrency: usize,
    /// Seconds; 0 means no timeout.
    pub default_timeout_sec: u64,
    pub default_retries: u32,
    pub env: BTreeMap<String, String>,
}

impl Default for PlanGlobals {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_timeout_sec: 0,
            default_retries: 0,
            env: BTreeMap::new(),
        }
    }
}

/// One external-process step in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_sec: u64,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub consumes: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A validated execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub plan_id: String,
    pub version: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub globals: PlanGlobals,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Plan {
    /// Parse and validate plan JSON after variable substitution.
    pub fn parse(raw: &str, vars: &BTreeMap<String, String>) -> Result<Self> {
        let substituted = substitute_vars(raw, vars);
        let plan: Self = serde_json::from_str(&substituted)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Read a plan from disk, substitute variables, parse, and validate.
    pub fn from_file(path: &Path, vars: &BTreeMap<String, String>) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| PlanError::Io(e.to_string()))?;
        Self::parse(&raw, vars)
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Effective timeout for a step in seconds (0 = no timeout).
    pub fn timeout_for(&self, step: &PlanStep) -> u64 {
        step.timeout_sec.unwrap_or(self.globals.default_timeout_sec)
    }

    /// Effective retry count for a step.
    pub fn retries_for(&self, step: &PlanStep) -> u32 {
        step.retries.unwrap_or(self.globals.default_retries)
    }

    /// Merged environment for a step: plan globals overlaid by step overrides.
    pub fn env_for(&self, step: &PlanStep) -> BTreeMap<String, String> {
        let mut env = self.globals.env.clone();
        env.extend(step.env.clone());
        env
    }

    /// Load-time invariants: unique step ids, existing dependency
    /// references, and an acyclic dependency graph.
    pub fn validate(&self) -> Result<()> {
        let mut ids: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // DFS with an explicit recursion stack; raises on the first cycle
        // found, with the violating path. Start nodes in sorted order so
        // the reported cycle is deterministic.
        let deps: BTreeMap<&str, &[String]> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
            .collect();
        let mut visited: HashSet<&str> = HashSet::new();
        for start in deps.keys() {
            if visited.contains(start) {
                continue;
            }
            let mut stack: Vec<&str> = Vec::new();
            let mut on_stack: HashSet<&str> = HashSet::new();
            dfs_cycle(start, &deps, &mut visited, &mut stack, &mut on_stack)?;
        }
        Ok(())
    }
}

fn dfs_cycle<'a>(
    node: &'a str,
    deps: &BTreeMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
    on_stack: &mut HashSet<&'a str>,
) -> Result<()> {
    stack.push(node);
    on_stack.insert(node);

    if let Some(children) = deps.get(node) {
        for child in children.iter() {
            let child = child.as_str();
            if on_stack.contains(child) {
                let first = stack.iter().position(|n| *n == child).unwrap_or(0);
                let mut path: Vec<String> = stack[first..].iter().map(|s| (*s).to_string()).collect();
                path.push(child.to_string());
                return Err(PlanError::CircularDependency { path });
            }
            if !visited.contains(child) {
                dfs_cycle(child, deps, visited, stack, on_stack)?;
            }
        }
    }

    visited.insert(node);
    on_stack.remove(node);
    stack.pop();
    Ok(())
}

/// Replace `${NAME}` placeholders with values from `vars`.
/// Placeholders with no mapping are left as literal text.
pub fn substitute_vars(raw: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = raw[i + 2..].find('}') {
                let name = &raw[i + 2..i + 2 + end];
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                } else {
                    out.push_str(&raw[i..i + 2 + end + 1]);
                }
                i += 2 + end + 1;
                continue;
            }
        }
        // Advance one full UTF-8 character.
        let ch_len = raw[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&raw[i..i + ch_len]);
        i += ch_len;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn linear_plan() -> String {
        r#"{
            "planId": "demo",
            "version": 1,
            "globals": {"maxConcurrency": 2, "defaultTimeoutSec": 30, "defaultRetries": 1, "env": {"CI": "1"}},
            "steps": [
                {"id": "a", "command": "true"},
                {"id": "b", "command": "true", "dependsOn": ["a"]},
                {"id": "c", "command": "true", "dependsOn": ["b"]}
            ],
            "metadata": {}
        }"#
        .to_string()
    }

    #[test]
    fn parses_linear_plan_with_defaults() {
        let plan = Plan::parse(&linear_plan(), &BTreeMap::new()).unwrap();
        assert_eq!(plan.plan_id, "demo");
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.globals.max_concurrency, 2);

        let b = plan.step("b").unwrap();
        assert_eq!(b.depends_on, vec!["a".to_string()]);
        assert_eq!(plan.timeout_for(b), 30);
        assert_eq!(plan.retries_for(b), 1);
        assert_eq!(b.on_failure, OnFailure::Abort);
        assert!(!b.critical);
    }

    #[test]
    fn step_overrides_beat_globals() {
        let raw = r#"{
            "planId": "p", "version": 1,
            "globals": {"defaultTimeoutSec": 30, "defaultRetries": 1, "env": {"A": "global", "B": "global"}},
            "steps": [
                {"id": "s", "command": "true", "timeoutSec": 5, "retries": 3, "env": {"B": "step"}}
            ]
        }"#;
        let plan = Plan::parse(raw, &BTreeMap::new()).unwrap();
        let s = plan.step("s").unwrap();
        assert_eq!(plan.timeout_for(s), 5);
        assert_eq!(plan.retries_for(s), 3);

        let env = plan.env_for(s);
        assert_eq!(env.get("A").map(String::as_str), Some("global"));
        assert_eq!(env.get("B").map(String::as_str), Some("step"));
    }

    #[test]
    fn substitutes_known_variables() {
        let out = substitute_vars("run ${CMD} in ${DIR}", &vars(&[("CMD", "make"), ("DIR", "/tmp")]));
        assert_eq!(out, "run make in /tmp");
    }

    #[test]
    fn unresolved_placeholders_stay_verbatim() {
        let out = substitute_vars("echo ${KNOWN} ${UNKNOWN}", &vars(&[("KNOWN", "hi")]));
        assert_eq!(out, "echo hi ${UNKNOWN}");
    }

    #[test]
    fn unclosed_placeholder_is_literal() {
        let out = substitute_vars("echo ${OOPS", &vars(&[("OOPS", "x")]));
        assert_eq!(out, "echo ${OOPS");
    }

    #[test]
    fn substitution_happens_before_parsing() {
        let raw = r#"{"planId": "p", "version": 1, "steps": [{"id": "s", "command": "${TOOL}"}]}"#;
        let plan = Plan::parse(raw, &vars(&[("TOOL", "cargo")])).unwrap();
        assert_eq!(plan.step("s").unwrap().command, "cargo");
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let raw = r#"{"planId": "p", "version": 1, "steps": [
            {"id": "s", "command": "true"},
            {"id": "s", "command": "false"}
        ]}"#;
        let err = Plan::parse(raw, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateStep(id) if id == "s"));
    }

    #[test]
    fn rejects_dangling_dependency() {
        let raw = r#"{"planId": "p", "version": 1, "steps": [
            {"id": "s", "command": "true", "dependsOn": ["ghost"]}
        ]}"#;
        let err = Plan::parse(raw, &BTreeMap::new()).unwrap_err();
        match err {
            PlanError::UnknownDependency { step, dependency } => {
                assert_eq!(step, "s");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_cycle_with_violating_path() {
        let raw = r#"{"planId": "p", "version": 1, "steps": [
            {"id": "a", "command": "true", "dependsOn": ["c"]},
            {"id": "b", "command": "true", "dependsOn": ["a"]},
            {"id": "c", "command": "true", "dependsOn": ["b"]}
        ]}"#;
        let err = Plan::parse(raw, &BTreeMap::new()).unwrap_err();
        match err {
            PlanError::CircularDependency { path } => {
                // Path starts and ends on the repeated node.
                assert!(path.len() >= 4);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let raw = r#"{"planId": "p", "version": 1, "steps": [
            {"id": "a", "command": "true", "dependsOn": ["a"]}
        ]}"#;
        let err = Plan::parse(raw, &BTreeMap::new()).unwrap_err();
        match err {
            PlanError::CircularDependency { path } => {
                assert_eq!(path, vec!["a".to_string(), "a".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn on_failure_parses_all_variants() {
        for (raw, expected) in [
            ("\"abort\"", OnFailure::Abort),
            ("\"skip_dependents\"", OnFailure::SkipDependents),
            ("\"continue\"", OnFailure::Continue),
        ] {
            let parsed: OnFailure = serde_json::from_str(raw).unwrap();
            assert_eq!(parsed, expected);
        }
    }
}
