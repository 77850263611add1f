//! Declarative policies evaluated against agent state.
//!
//! A [`Policy`] matches an agent when all of its rules hold. Every enabled,
//! matching policy applies all of its actions, highest priority first.
//! `deny` is enforced at task creation and dispatch; `rate_limit` and
//! `throttle` defer dispatch; `log` and `alert` emit structured log lines.

use crate::rate_limit::RateLimiter;
use crate::types::Agent;
use maestro_core::Comparison;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Rate-limit buckets untouched for this long are dropped on reload.
const IDLE_BUCKET_TTL: Duration = Duration::from_secs(300);

/// An agent was registered or replaced.
pub const AGENT_REGISTER: &str = "agent.register";
/// An agent's status was set explicitly.
pub const AGENT_STATUS: &str = "agent.status";
/// A health probe updated an agent.
pub const AGENT_HEALTH: &str = "agent.health";
/// A task is being created for an agent.
pub const TASK_CREATE: &str = "task.create";
/// A task is about to be dispatched to an agent.
pub const TASK_DISPATCH: &str = "task.dispatch";

/// Kind of side effect a policy action has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Recorded as matched; no other effect.
    Allow,
    /// Reject task creation and dispatch.
    Deny,
    /// Token bucket on dispatch (`max_per_second`, `burst`).
    RateLimit,
    /// Minimum gap between dispatches (`delay_ms`).
    Throttle,
    /// Structured `info` log line.
    Log,
    /// Structured `warn` log line.
    Alert,
}

/// One action of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAction {
    /// What the action does.
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Action label this applies to: `*`, an exact label such as `task.dispatch`,
    /// or a prefix such as `task`.
    #[serde(default = "default_target")]
    pub target: String,
    /// Action-specific settings such as `reason` or `delay_ms`.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

fn default_target() -> String {
    "*".to_string()
}

impl PolicyAction {
    /// Action of `action_type` applying to every label.
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            target: default_target(),
            parameters: Map::new(),
        }
    }

    /// Restrict the action to `target`.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Set one parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Whether the action applies to the action label `label`.
    pub fn applies_to(&self, label: &str) -> bool {
        self.target == "*"
            || self.target == label
            || label
                .strip_prefix(self.target.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    }

    fn param_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(Value::as_f64)
    }

    fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// A named, prioritised rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique name; installing a policy with the same name replaces it.
    pub name: String,
    /// Free text for operators.
    #[serde(default)]
    pub description: String,
    /// Conjunction of rules over the agent document. Empty matches every agent.
    #[serde(default)]
    pub rules: Vec<Comparison>,
    /// Executed in order when the policy matches.
    #[serde(default)]
    pub actions: Vec<PolicyAction>,
    /// Higher priorities are evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// Disabled policies are never evaluated.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Policy {
    /// Enabled policy with no rules and no actions.
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            rules: Vec::new(),
            actions: Vec::new(),
            priority,
            enabled: true,
        }
    }

    /// Add a rule; all rules must hold.
    pub fn with_rule(mut self, rule: Comparison) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add an action.
    pub fn with_action(mut self, action: PolicyAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Mark the policy disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether every rule holds for the given agent document.
    pub fn matches(&self, agent_document: &Value) -> bool {
        self.rules.iter().all(|rule| rule.matches(agent_document))
    }
}

/// Admission decision for task creation or dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead.
    Allow,
    /// Keep the task queued and try again on a later tick.
    Defer {
        /// Policy that deferred the task.
        policy: String,
        /// Why, for logs.
        reason: String,
    },
    /// Reject the task.
    Deny {
        /// Policy that denied the task.
        policy: String,
        /// The action's `reason` parameter.
        reason: String,
    },
}

impl Admission {
    fn severity(&self) -> u8 {
        match self {
            Admission::Allow => 0,
            Admission::Defer { .. } => 1,
            Admission::Deny { .. } => 2,
        }
    }

    fn escalate(&mut self, other: Admission) {
        if other.severity() > self.severity() {
            *self = other;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TokenClaim {
    key: String,
    burst: f64,
    rate: f64,
}

/// Dispatch budget that `rate_limit` and `throttle` actions would use.
///
/// Evaluation only reads limiter state. Nothing is consumed until the
/// reservation is handed to [`PolicyEngine::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReservation {
    tokens: Vec<TokenClaim>,
    windows: Vec<String>,
}

impl DispatchReservation {
    /// True when no action claimed anything.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.windows.is_empty()
    }
}

/// Result of evaluating every policy for one agent and action label.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    /// Names of the matching policies, in evaluation order.
    pub matched: Vec<String>,
    /// Strictest decision across all matching policies.
    pub admission: Admission,
    /// Budget to commit if the dispatch goes ahead.
    pub reservation: DispatchReservation,
}

/// Evaluates policies and keeps the bookkeeping for enforcing actions.
pub struct PolicyEngine {
    policies: RwLock<Vec<Policy>>,
    limiter: RateLimiter,
    last_dispatch: Mutex<HashMap<String, Instant>>,
}

impl PolicyEngine {
    /// Empty engine: every action is allowed.
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(Vec::new()),
            limiter: RateLimiter::new(),
            last_dispatch: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a policy, replacing any policy with the same name, keeping the
    /// list sorted by descending priority (insertion order among equals).
    pub fn add_policy(&self, policy: Policy) {
        let mut policies = self.policies.write();
        policies.retain(|p| p.name != policy.name);
        let index = policies
            .iter()
            .position(|p| p.priority < policy.priority)
            .unwrap_or(policies.len());
        info!(policy = %policy.name, priority = policy.priority, "Policy installed");
        policies.insert(index, policy);
    }

    /// Remove a policy by name. Returns whether it was installed.
    pub fn remove_policy(&self, name: &str) -> bool {
        let mut policies = self.policies.write();
        let before = policies.len();
        policies.retain(|p| p.name != name);
        policies.len() != before
    }

    /// Replace the whole policy set.
    pub fn replace_all(&self, policies: Vec<Policy>) {
        let mut next: Vec<Policy> = Vec::with_capacity(policies.len());
        for policy in policies {
            next.retain(|p| p.name != policy.name);
            next.push(policy);
        }
        // Stable sort keeps file order among equal priorities.
        next.sort_by(|a, b| b.priority.cmp(&a.priority));
        info!(count = next.len(), "Policy set replaced");
        *self.policies.write() = next;
        self.limiter.cleanup(IDLE_BUCKET_TTL);
    }

    /// Installed policies in evaluation order.
    pub fn list(&self) -> Vec<Policy> {
        self.policies.read().clone()
    }

    /// Number of installed policies.
    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    /// True when no policy is installed.
    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }

    /// Evaluate every enabled policy against `agent` for `label` and execute
    /// the actions of each matching policy.
    ///
    /// Rate limits and throttles are checked but not consumed; pass the
    /// outcome's reservation to [`PolicyEngine::commit`] when the dispatch
    /// actually happens.
    pub fn apply_policies(&self, agent: &Agent, label: &str) -> PolicyOutcome {
        let document = agent.to_document();
        let policies = self.policies.read();
        let mut outcome = PolicyOutcome {
            matched: Vec::new(),
            admission: Admission::Allow,
            reservation: DispatchReservation::default(),
        };

        for policy in policies.iter().filter(|p| p.enabled) {
            if !policy.matches(&document) {
                continue;
            }
            outcome.matched.push(policy.name.clone());
            for action in policy.actions.iter().filter(|a| a.applies_to(label)) {
                if let Some(decision) =
                    self.execute_action(policy, action, agent, label, &mut outcome.reservation)
                {
                    outcome.admission.escalate(decision);
                }
            }
        }
        outcome
    }

    /// Consume the rate-limit tokens and start the throttle windows of a
    /// dispatch that went ahead.
    pub fn commit(&self, reservation: &DispatchReservation) {
        for claim in &reservation.tokens {
            self.limiter.take(&claim.key, claim.burst, claim.rate);
        }
        if !reservation.windows.is_empty() {
            let now = Instant::now();
            let mut last = self.last_dispatch.lock();
            for key in &reservation.windows {
                last.insert(key.clone(), now);
            }
        }
    }

    fn execute_action(
        &self,
        policy: &Policy,
        action: &PolicyAction,
        agent: &Agent,
        label: &str,
        reservation: &mut DispatchReservation,
    ) -> Option<Admission> {
        let enforcing = !agent.config.policy.exempt;
        match action.action_type {
            ActionType::Allow => {
                debug!(policy = %policy.name, agent_id = %agent.id, action = label, "Policy allows");
                None
            }
            ActionType::Log => {
                info!(
                    policy = %policy.name,
                    agent_id = %agent.id,
                    action = label,
                    message = action.param_str("message").unwrap_or(""),
                    "Policy matched"
                );
                None
            }
            ActionType::Alert => {
                warn!(
                    policy = %policy.name,
                    agent_id = %agent.id,
                    action = label,
                    severity = action.param_str("severity").unwrap_or("warning"),
                    message = action.param_str("message").unwrap_or(""),
                    "Policy alert"
                );
                None
            }
            ActionType::Deny if enforcing && (label == TASK_CREATE || label == TASK_DISPATCH) => {
                let reason = action.param_str("reason").unwrap_or("denied").to_string();
                warn!(policy = %policy.name, agent_id = %agent.id, action = label, %reason, "Policy denied");
                Some(Admission::Deny {
                    policy: policy.name.clone(),
                    reason,
                })
            }
            ActionType::RateLimit if enforcing && label == TASK_DISPATCH => {
                let rate = action.param_f64("max_per_second").unwrap_or(1.0).max(0.0);
                let burst = action.param_f64("burst").unwrap_or(rate.max(1.0));
                let key = format!("{}:{}", policy.name, agent.id);
                if self.limiter.available(&key, burst, rate) {
                    reservation.tokens.push(TokenClaim { key, burst, rate });
                    None
                } else {
                    debug!(policy = %policy.name, agent_id = %agent.id, "Dispatch rate limited");
                    Some(Admission::Defer {
                        policy: policy.name.clone(),
                        reason: format!("rate limited to {rate}/s"),
                    })
                }
            }
            ActionType::Throttle if enforcing && label == TASK_DISPATCH => {
                let delay_ms = action.param_f64("delay_ms").unwrap_or(1000.0).max(0.0) as u64;
                let delay = Duration::from_millis(delay_ms);
                let key = format!("{}:{}", policy.name, agent.id);
                let previous = self.last_dispatch.lock().get(&key).copied();
                match previous {
                    Some(previous) if previous.elapsed() < delay => {
                        debug!(policy = %policy.name, agent_id = %agent.id, "Dispatch throttled");
                        Some(Admission::Defer {
                            policy: policy.name.clone(),
                            reason: format!("throttled to one dispatch per {delay_ms}ms"),
                        })
                    }
                    _ => {
                        reservation.windows.push(key);
                        None
                    }
                }
            }
            ActionType::Deny | ActionType::RateLimit | ActionType::Throttle => {
                debug!(
                    policy = %policy.name,
                    agent_id = %agent.id,
                    action = label,
                    action_type = ?action.action_type,
                    "Enforcing action not applicable here"
                );
                None
            }
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}
