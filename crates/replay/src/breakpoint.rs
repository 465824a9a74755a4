// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Conditional breakpoints over replayed `(state, event)` pairs.
//!
//! Conditions compile when the breakpoint is added; evaluation order per
//! event is: enabled → filters → condition → skip budget → hit. A hit
//! past `max_hits` disables the breakpoint. Evaluation errors skip the
//! hit and leave the breakpoint enabled.

use crate::expr::{self, Expr, ExprError};
use regex::Regex;
use retrace_core::{AgentId, BreakpointId, EventId, EventKind, Phase, SystemState, TraceEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from breakpoint configuration and evaluation.
#[derive(Debug, Error)]
pub enum BreakpointError {
    #[error("expression error: {0}")]
    Expression(#[from] ExprError),
    #[error("invalid regex pattern: {0}")]
    Pattern(String),
    #[error("unknown breakpoint: {0}")]
    Unknown(BreakpointId),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Metric source for performance conditions, read from `event.performance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMetric {
    Duration,
    Memory,
    Cpu,
}

impl PerformanceMetric {
    fn key(&self) -> &'static str {
        match self {
            PerformanceMetric::Duration => "duration",
            PerformanceMetric::Memory => "memory",
            PerformanceMetric::Cpu => "cpu",
        }
    }
}

/// Threshold comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ThresholdOp {
    fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdOp::Lt => value < threshold,
            ThresholdOp::Le => value <= threshold,
            ThresholdOp::Gt => value > threshold,
            ThresholdOp::Ge => value >= threshold,
            ThresholdOp::Eq => value == threshold,
            ThresholdOp::Ne => value != threshold,
        }
    }
}

/// Breakpoint condition variants, as configured by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakpointCondition {
    /// Constrained predicate over `(event, state)`.
    Expression { source: String },
    /// Threshold on an `event.performance` metric.
    Performance {
        metric: PerformanceMetric,
        operator: ThresholdOp,
        threshold: f64,
    },
    /// Error-phase / error-kind events, optionally matching the message.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "errorPattern")]
        error_pattern: Option<String>,
    },
}

/// Compiled condition, built when the breakpoint is installed.
enum CompiledCondition {
    Expression(Expr),
    Performance {
        metric: PerformanceMetric,
        operator: ThresholdOp,
        threshold: f64,
    },
    Error { pattern: Option<PatternMatcher> },
}

/// `errorPattern` accepts a regex; a pattern that fails to compile is
/// treated as a plain substring.
enum PatternMatcher {
    Regex(Regex),
    Substring(String),
}

impl PatternMatcher {
    fn new(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => PatternMatcher::Regex(regex),
            Err(_) => PatternMatcher::Substring(pattern.to_string()),
        }
    }

    fn matches(&self, message: &str) -> bool {
        match self {
            PatternMatcher::Regex(regex) => regex.is_match(message),
            PatternMatcher::Substring(needle) => message.contains(needle.as_str()),
        }
    }
}

/// Operator-configured breakpoint definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: BreakpointCondition,
    /// Free-form action label (e.g. "pause", "log"), echoed in hits.
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_filter: Option<Vec<AgentId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_kind_filter: Option<Vec<EventKind>>,
    /// Inclusive `(start, end)` window on event timestamps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<(i64, i64)>,
    /// Matches to swallow before the first hit.
    #[serde(default)]
    pub skip_count: u32,
    /// Hits after which the breakpoint disables itself (0 = unlimited).
    #[serde(default)]
    pub max_hits: u32,
    /// Dotted paths (rooted at `event` / `state`) collected on each hit.
    #[serde(default)]
    pub data_paths: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// A recorded breakpoint hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub breakpoint_id: BreakpointId,
    pub event_id: EventId,
    pub timestamp: i64,
    pub trigger_reason: String,
    #[serde(default)]
    pub collected_data: BTreeMap<String, Value>,
}

/// Exchangeable breakpoint configuration bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointBundle {
    pub version: u32,
    pub breakpoints: Vec<Breakpoint>,
}

const BUNDLE_VERSION: u32 = 1;

/// Per-entry import result.
#[derive(Debug)]
pub enum BreakpointImportOutcome {
    Imported(BreakpointId),
    Replaced(BreakpointId),
    Invalid {
        id: BreakpointId,
        reason: String,
    },
}

/// Runtime bookkeeping per installed breakpoint.
struct Installed {
    spec: Breakpoint,
    compiled: CompiledCondition,
    skip_remaining: u32,
    hit_count: u32,
}

/// The breakpoint rule engine.
#[derive(Default)]
pub struct BreakpointEngine {
    installed: BTreeMap<BreakpointId, Installed>,
    hits: Vec<Hit>,
}

impl BreakpointEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) a breakpoint, compiling its condition.
    pub fn add(&mut self, spec: Breakpoint) -> Result<(), BreakpointError> {
        let compiled = compile_condition(&spec.condition)?;
        let installed = Installed {
            skip_remaining: spec.skip_count,
            hit_count: 0,
            spec,
            compiled,
        };
        self.installed.insert(installed.spec.id.clone(), installed);
        Ok(())
    }

    pub fn remove(&mut self, id: &BreakpointId) -> Result<Breakpoint, BreakpointError> {
        self.installed
            .remove(id)
            .map(|i| i.spec)
            .ok_or_else(|| BreakpointError::Unknown(id.clone()))
    }

    pub fn set_enabled(&mut self, id: &BreakpointId, enabled: bool) -> Result<(), BreakpointError> {
        let installed = self
            .installed
            .get_mut(id)
            .ok_or_else(|| BreakpointError::Unknown(id.clone()))?;
        installed.spec.enabled = enabled;
        Ok(())
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.installed.values().map(|i| &i.spec)
    }

    pub fn hits(&self) -> &[Hit] {
        &self.hits
    }

    /// Evaluate every installed breakpoint against one replayed pair.
    /// Returns the hits fired by this event.
    pub fn evaluate(&mut self, state: &SystemState, event: &TraceEvent) -> Vec<Hit> {
        // Serialize the event once; the state only if some breakpoint
        // actually reads it.
        let event_json = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to serialize event for breakpoint eval");
                return Vec::new();
            }
        };
        let mut state_json: Option<Value> = None;

        let mut fired = Vec::new();
        for installed in self.installed.values_mut() {
            if !installed.spec.enabled {
                continue;
            }
            if !passes_filters(&installed.spec, event) {
                continue;
            }

            let expr_reads_state = matches!(
                &installed.compiled,
                CompiledCondition::Expression(expr) if expr.references_state()
            );
            let needs_state = expr_reads_state
                || installed
                    .spec
                    .data_paths
                    .iter()
                    .any(|p| p == "state" || p.starts_with("state."));
            if needs_state && state_json.is_none() {
                match serde_json::to_value(state) {
                    Ok(value) => state_json = Some(value),
                    Err(e) => {
                        warn!(error = %e, "failed to serialize state for breakpoint eval");
                        continue;
                    }
                }
            }
            let state_view = state_json.as_ref().unwrap_or(&Value::Null);

            let (matched, reason) = match evaluate_condition(
                &installed.compiled,
                event,
                &event_json,
                state_view,
            ) {
                Ok(result) => result,
                Err(e) => {
                    // Eval errors skip the hit; the breakpoint stays enabled.
                    debug!(
                        breakpoint = %installed.spec.id,
                        error = %e,
                        "breakpoint evaluation error, hit skipped"
                    );
                    continue;
                }
            };
            if !matched {
                continue;
            }

            if installed.skip_remaining > 0 {
                installed.skip_remaining -= 1;
                continue;
            }

            installed.hit_count += 1;
            if installed.spec.max_hits > 0 && installed.hit_count >= installed.spec.max_hits {
                installed.spec.enabled = false;
            }

            let mut collected = BTreeMap::new();
            for path in &installed.spec.data_paths {
                let value = collect_path(path, &event_json, state_view);
                collected.insert(path.clone(), value);
            }

            let hit = Hit {
                breakpoint_id: installed.spec.id.clone(),
                event_id: event.id.clone(),
                timestamp: event.timestamp,
                trigger_reason: reason,
                collected_data: collected,
            };
            self.hits.push(hit.clone());
            fired.push(hit);
        }
        fired
    }

    /// Export the whole configuration.
    pub fn export(&self) -> BreakpointBundle {
        BreakpointBundle {
            version: BUNDLE_VERSION,
            breakpoints: self.installed.values().map(|i| i.spec.clone()).collect(),
        }
    }

    /// Import a bundle, validating each entry independently.
    pub fn import(&mut self, bundle: &BreakpointBundle) -> Vec<BreakpointImportOutcome> {
        let mut outcomes = Vec::new();
        for spec in &bundle.breakpoints {
            if spec.id.is_empty() {
                outcomes.push(BreakpointImportOutcome::Invalid {
                    id: spec.id.clone(),
                    reason: "empty breakpoint id".to_string(),
                });
                continue;
            }
            let existed = self.installed.contains_key(&spec.id);
            match self.add(spec.clone()) {
                Ok(()) => outcomes.push(if existed {
                    BreakpointImportOutcome::Replaced(spec.id.clone())
                } else {
                    BreakpointImportOutcome::Imported(spec.id.clone())
                }),
                Err(e) => outcomes.push(BreakpointImportOutcome::Invalid {
                    id: spec.id.clone(),
                    reason: e.to_string(),
                }),
            }
        }
        outcomes
    }
}

fn compile_condition(
    condition: &BreakpointCondition,
) -> Result<CompiledCondition, BreakpointError> {
    match condition {
        BreakpointCondition::Expression { source } => {
            Ok(CompiledCondition::Expression(expr::compile(source)?))
        }
        BreakpointCondition::Performance {
            metric,
            operator,
            threshold,
        } => Ok(CompiledCondition::Performance {
            metric: *metric,
            operator: *operator,
            threshold: *threshold,
        }),
        BreakpointCondition::Error { error_pattern } => Ok(CompiledCondition::Error {
            pattern: error_pattern.as_deref().map(PatternMatcher::new),
        }),
    }
}

fn passes_filters(spec: &Breakpoint, event: &TraceEvent) -> bool {
    if let Some(agents) = &spec.agent_filter {
        match &event.agent_id {
            Some(agent) if agents.contains(agent) => {}
            _ => return false,
        }
    }
    if let Some(kinds) = &spec.event_kind_filter {
        if !kinds.contains(&event.kind) {
            return false;
        }
    }
    if let Some((start, end)) = spec.time_window {
        if event.timestamp < start || event.timestamp > end {
            return false;
        }
    }
    true
}

fn evaluate_condition(
    compiled: &CompiledCondition,
    event: &TraceEvent,
    event_json: &Value,
    state_json: &Value,
) -> Result<(bool, String), BreakpointError> {
    match compiled {
        CompiledCondition::Expression(expr) => {
            let matched = expr.eval(event_json, state_json)?;
            Ok((matched, "expression matched".to_string()))
        }
        CompiledCondition::Performance {
            metric,
            operator,
            threshold,
        } => {
            let Some(value) = event.performance.get(metric.key()).and_then(Value::as_f64)
            else {
                return Ok((false, String::new()));
            };
            let matched = operator.apply(value, *threshold);
            Ok((
                matched,
                format!("performance.{} = {value} crossed threshold {threshold}", metric.key()),
            ))
        }
        CompiledCondition::Error { pattern } => {
            let is_error = event.phase == Phase::Error
                || matches!(event.kind, EventKind::Error | EventKind::TaskFail);
            if !is_error {
                return Ok((false, String::new()));
            }
            match pattern {
                None => Ok((true, "error event".to_string())),
                Some(matcher) => {
                    let message = event.error_message().unwrap_or("");
                    Ok((
                        matcher.matches(message),
                        format!("error message matched: {message}"),
                    ))
                }
            }
        }
    }
}

/// Resolve one configured data path against `{event, state}`.
fn collect_path(path: &str, event_json: &Value, state_json: &Value) -> Value {
    match path.split_once('.') {
        Some(("event", rest)) => expr::resolve_path(event_json, rest).clone(),
        Some(("state", rest)) => expr::resolve_path(state_json, rest).clone(),
        None if path == "event" => event_json.clone(),
        None if path == "state" => state_json.clone(),
        _ => json!(null),
    }
}

#[cfg(test)]
#[path = "breakpoint_tests.rs"]
mod tests;
