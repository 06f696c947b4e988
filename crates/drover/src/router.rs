//! Capability-based task router.
//!
//! Matches a task's kind/risk/complexity/domain against configured rules,
//! selects a tool via the rule's strategy, and records every decision in
//! an append-only log for audit and replay. Routing never fails at
//! runtime: a call with no capable tool returns `None` and the caller
//! decides whether that is fatal.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use drover_core::router_config::{RouteRule, RouterConfig, RouterConfigError, Strategy};
use drover_core::RoutingDecision;
use tracing::debug;

/// Running execution statistics for one tool, fed by
/// `record_execution_result` and consumed by the `metrics` strategy.
#[derive(Debug, Clone, Copy, Default)]
struct ToolStats {
    successes: u64,
    failures: u64,
    total_latency_ms: u64,
}

impl ToolStats {
    /// Tools with no history get a neutral prior rather than exclusion.
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.5
        } else {
            self.successes as f64 / total as f64
        }
    }

    fn mean_latency_ms(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            f64::INFINITY
        } else {
            self.total_latency_ms as f64 / total as f64
        }
    }
}

/// Arguments for one routing call. Omitted fields never block a rule match.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteQuery<'a> {
    pub kind: &'a str,
    pub risk_tier: Option<&'a str>,
    pub complexity: Option<&'a str>,
    pub domain: Option<&'a str>,
}

impl<'a> RouteQuery<'a> {
    pub fn new(kind: &'a str) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn risk_tier(mut self, risk: &'a str) -> Self {
        self.risk_tier = Some(risk);
        self
    }

    pub fn complexity(mut self, complexity: &'a str) -> Self {
        self.complexity = Some(complexity);
        self
    }

    pub fn domain(mut self, domain: &'a str) -> Self {
        self.domain = Some(domain);
        self
    }
}

/// Routes tasks to capable tools. Owned by a single control loop.
#[derive(Debug)]
pub struct TaskRouter {
    config: RouterConfig,
    /// Per-rule round-robin rotation indices, keyed by rule id.
    rotation: HashMap<String, usize>,
    metrics: HashMap<String, ToolStats>,
    decisions: Vec<RoutingDecision>,
}

impl TaskRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            rotation: HashMap::new(),
            metrics: HashMap::new(),
            decisions: Vec::new(),
        }
    }

    /// Construct from a config file. Missing or invalid config is fatal.
    pub fn from_file(path: &Path) -> Result<Self, RouterConfigError> {
        Ok(Self::new(RouterConfig::from_file(path)?))
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The append-only decision log, oldest first.
    pub fn decisions(&self) -> &[RoutingDecision] {
        &self.decisions
    }

    /// Route a task to a tool id, or `None` when no rule matches and no
    /// tool declares the capability. Every call appends a decision record.
    pub fn route_task(&mut self, query: RouteQuery<'_>) -> Option<String> {
        let matched = self
            .config
            .routing
            .rules
            .iter()
            .find(|rule| Self::rule_matches(rule, query))
            .cloned();

        let (selected, strategy, rule_id) = match matched {
            Some(rule) => {
                let tool = self.select_candidate(&rule);
                (tool, rule.strategy.as_str().to_string(), Some(rule.id))
            }
            None => {
                let tool = self.capability_fallback(query);
                let strategy = if tool.is_some() { "fallback" } else { "none" };
                (tool, strategy.to_string(), None)
            }
        };

        debug!(
            kind = query.kind,
            tool = selected.as_deref().unwrap_or("<none>"),
            strategy = %strategy,
            "routing decision"
        );

        self.decisions.push(RoutingDecision {
            timestamp: Utc::now(),
            task_kind: query.kind.to_string(),
            selected_tool: selected.clone(),
            strategy,
            rule_id,
            risk_tier: query.risk_tier.map(str::to_string),
            complexity: query.complexity.map(str::to_string),
            domain: query.domain.map(str::to_string),
        });

        selected
    }

    /// Feed an execution outcome into the metrics store.
    pub fn record_execution_result(&mut self, tool_id: &str, success: bool, latency_ms: u64) {
        let stats = self.metrics.entry(tool_id.to_string()).or_default();
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.total_latency_ms += latency_ms;
    }

    /// A constraint only blocks when both the constraint and the call
    /// argument are present.
    fn rule_matches(rule: &RouteRule, query: RouteQuery<'_>) -> bool {
        let m = &rule.matcher;
        if !m.task_kind.is_empty() && !m.task_kind.iter().any(|k| k == query.kind) {
            return false;
        }
        if let Some(risk) = query.risk_tier {
            if !m.risk_tier.is_empty() && !m.risk_tier.iter().any(|r| r == risk) {
                return false;
            }
        }
        if let (Some(want), Some(have)) = (&m.complexity, query.complexity) {
            if want != have {
                return false;
            }
        }
        true
    }

    fn select_candidate(&mut self, rule: &RouteRule) -> Option<String> {
        let candidates = &rule.select_from;
        if candidates.is_empty() {
            return None;
        }
        let chosen = match rule.strategy {
            Strategy::Fixed => candidates[0].clone(),
            Strategy::RoundRobin => {
                let index = self.rotation.entry(rule.id.clone()).or_insert(0);
                let chosen = candidates[*index % candidates.len()].clone();
                *index = (*index + 1) % candidates.len();
                chosen
            }
            Strategy::Metrics | Strategy::Auto => self.best_by_metrics(candidates),
        };
        Some(chosen)
    }

    /// Highest success rate wins; ties break to lower mean latency, then
    /// to candidate order.
    fn best_by_metrics(&self, candidates: &[String]) -> String {
        let mut best = candidates[0].clone();
        let mut best_rate = f64::MIN;
        let mut best_latency = f64::INFINITY;

        for candidate in candidates {
            let stats = self.metrics.get(candidate).copied().unwrap_or_default();
            let rate = stats.success_rate();
            let latency = stats.mean_latency_ms();
            if rate > best_rate || (rate == best_rate && latency < best_latency) {
                best = candidate.clone();
                best_rate = rate;
                best_latency = latency;
            }
        }

        best
    }

    /// No rule matched: first tool (sorted by id) whose declared task
    /// kinds include the requested kind and whose domains include the
    /// requested domain or declare none.
    fn capability_fallback(&self, query: RouteQuery<'_>) -> Option<String> {
        self.config
            .apps
            .iter()
            .find(|(_, app)| {
                if !app.capabilities.task_kinds.iter().any(|k| k == query.kind) {
                    return false;
                }
                match query.domain {
                    Some(domain) => {
                        app.capabilities.domains.is_empty()
                            || app.capabilities.domains.iter().any(|d| d == domain)
                    }
                    None => true,
                }
            })
            .map(|(id, _)| id.clone())
    }
}
