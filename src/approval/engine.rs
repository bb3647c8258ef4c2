//! Per-call approval decisions.
//!
//! Evaluation order for each call:
//!
//! 1. Approval disabled (bypass-all): approve, source `rule`.
//! 2. Tool approved earlier in this session: approve, source `session`.
//! 3. First enabled rule whose pattern matches: its verdict, source `rule`.
//! 4. Otherwise queue the call for a human. Calls decided together form one
//!    [`PendingBatch`]; each request is still answered individually.
//!
//! Every call that passes through produces exactly one [`ApprovalDecision`]
//! in the audit log.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::rules::{ApprovalRule, RuleScope, RuleType};
use super::store::{PreferencesError, PreferencesStore};
use crate::connector::ToolCall;
use crate::relock;

/// Preferences key holding [`ApprovalSettings`].
pub const PREFERENCES_KEY: &str = "toolbridge.approval";

/// Persisted approval configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSettings {
    /// `false` approves everything without looking at rules.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<ApprovalRule>,
}

fn default_enabled() -> bool {
    true
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Rule,
    Session,
    Interactive,
}

/// Audit entry for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub call_id: String,
    pub tool_name: String,
    pub connector_id: String,
    pub verdict: Verdict,
    pub source: DecisionSource,
    /// The rule that decided, when one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approved
    }
}

/// One call waiting for a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub call_id: String,
    pub tool_name: String,
    pub connector_id: String,
    pub arguments: Value,
}

/// Calls from one model turn, presented together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBatch {
    pub id: String,
    pub requests: Vec<ApprovalRequest>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Answer {
    Approve { remember: bool },
    Deny,
}

#[derive(Debug)]
struct Waiting {
    batch_id: String,
    tx: oneshot::Sender<Answer>,
}

#[derive(Debug, Default)]
struct PendingState {
    waiting: HashMap<String, Waiting>,
    batches: Vec<PendingBatch>,
}

impl PendingState {
    /// Drop answered or withdrawn requests from the published batches.
    fn prune(&mut self) {
        let waiting = &self.waiting;
        for batch in &mut self.batches {
            batch
                .requests
                .retain(|r| waiting.get(&r.call_id).is_some_and(|w| w.batch_id == batch.id));
        }
        self.batches.retain(|b| !b.requests.is_empty());
    }
}

/// Withdraws a batch's unanswered requests if the waiting caller goes away.
#[derive(Debug)]
struct BatchGuard<'a> {
    engine: &'a ApprovalEngine,
    batch_id: String,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let mut pending = relock(self.engine.pending.lock());
        let before = pending.waiting.len();
        pending.waiting.retain(|_, w| w.batch_id != self.batch_id);
        if pending.waiting.len() != before {
            debug!(batch_id = %self.batch_id, "withdrawing unanswered approval requests");
        }
        pending.prune();
        self.engine.publish(&pending);
    }
}

/// Rule evaluation, session memory, interactive queue and audit log.
#[derive(Debug)]
pub struct ApprovalEngine {
    store: Arc<dyn PreferencesStore>,
    settings: RwLock<ApprovalSettings>,
    session: Mutex<HashSet<String>>,
    audit: Mutex<Vec<ApprovalDecision>>,
    pending: Mutex<PendingState>,
    batches: watch::Sender<Vec<PendingBatch>>,
}

impl ApprovalEngine {
    /// Load settings from `store`; missing settings mean defaults.
    pub fn new(store: Arc<dyn PreferencesStore>) -> Result<Self, PreferencesError> {
        let settings = match store.get(PREFERENCES_KEY)? {
            Some(value) => serde_json::from_value(value)?,
            None => ApprovalSettings::default(),
        };
        let (batches, _) = watch::channel(Vec::new());
        Ok(Self {
            store,
            settings: RwLock::new(settings),
            session: Mutex::new(HashSet::new()),
            audit: Mutex::new(Vec::new()),
            pending: Mutex::new(PendingState::default()),
            batches,
        })
    }

    // ── Administration ─────────────────────────────────────────────────

    pub fn settings(&self) -> ApprovalSettings {
        relock(self.settings.read()).clone()
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), PreferencesError> {
        self.update(|s| {
            s.enabled = enabled;
        })
    }

    /// Append a rule; rules are evaluated in stored order.
    pub fn add_rule(
        &self,
        pattern: impl Into<String>,
        rule_type: RuleType,
        scope: RuleScope,
    ) -> Result<ApprovalRule, PreferencesError> {
        let rule = ApprovalRule::new(pattern, rule_type, scope);
        let stored = rule.clone();
        self.update(move |s| s.rules.push(stored))?;
        Ok(rule)
    }

    /// Returns whether a rule was removed.
    pub fn remove_rule(&self, id: &str) -> Result<bool, PreferencesError> {
        let mut removed = false;
        self.update(|s| {
            let before = s.rules.len();
            s.rules.retain(|r| r.id != id);
            removed = s.rules.len() != before;
        })?;
        Ok(removed)
    }

    /// Returns whether the rule exists.
    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<bool, PreferencesError> {
        let mut found = false;
        self.update(|s| {
            if let Some(rule) = s.rules.iter_mut().find(|r| r.id == id) {
                rule.enabled = enabled;
                found = true;
            }
        })?;
        Ok(found)
    }

    pub fn replace_rules(&self, rules: Vec<ApprovalRule>) -> Result<(), PreferencesError> {
        self.update(move |s| s.rules = rules)
    }

    /// Apply `f` and persist. In-memory settings change only if the write
    /// succeeds.
    fn update<F>(&self, f: F) -> Result<(), PreferencesError>
    where
        F: FnOnce(&mut ApprovalSettings),
    {
        let mut settings = relock(self.settings.write());
        let mut next = settings.clone();
        f(&mut next);
        self.store
            .set(PREFERENCES_KEY, serde_json::to_value(&next)?)?;
        *settings = next;
        Ok(())
    }

    // ── Session memory ─────────────────────────────────────────────────

    /// Approve `tool_name` for the rest of this session.
    pub fn remember(&self, tool_name: impl Into<String>) {
        relock(self.session.lock()).insert(tool_name.into());
    }

    pub fn forget(&self, tool_name: &str) -> bool {
        relock(self.session.lock()).remove(tool_name)
    }

    pub fn is_remembered(&self, tool_name: &str) -> bool {
        relock(self.session.lock()).contains(tool_name)
    }

    /// Clear session memory. Pending requests are unaffected.
    pub fn end_session(&self) {
        relock(self.session.lock()).clear();
        info!(name: "approval.session_ended", "Session approvals cleared");
    }

    // ── Audit ──────────────────────────────────────────────────────────

    pub fn audit_log(&self) -> Vec<ApprovalDecision> {
        relock(self.audit.lock()).clone()
    }

    fn record(&self, decision: &ApprovalDecision) {
        info!(
            name: "approval.decision",
            call_id = %decision.call_id,
            tool = %decision.tool_name,
            connector_id = %decision.connector_id,
            verdict = ?decision.verdict,
            source = ?decision.source,
            "Approval decided"
        );
        relock(self.audit.lock()).push(decision.clone());
    }

    // ── Decisions ──────────────────────────────────────────────────────

    /// Decide without asking a human, if policy allows.
    pub fn evaluate(&self, call: &ToolCall) -> Option<ApprovalDecision> {
        let connector_id = call.connector_id.as_deref().unwrap_or_default();
        let decided = |verdict, source, rule_id| ApprovalDecision {
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            connector_id: connector_id.to_string(),
            verdict,
            source,
            rule_id,
            timestamp: Utc::now(),
        };

        let settings = relock(self.settings.read());
        if !settings.enabled {
            return Some(decided(Verdict::Approved, DecisionSource::Rule, None));
        }
        if self.is_remembered(&call.tool_name) {
            return Some(decided(Verdict::Approved, DecisionSource::Session, None));
        }
        settings
            .rules
            .iter()
            .find(|r| r.matches(&call.tool_name, connector_id))
            .map(|rule| {
                let verdict = match rule.rule_type {
                    RuleType::Allow => Verdict::Approved,
                    RuleType::Deny => Verdict::Denied,
                };
                decided(verdict, DecisionSource::Rule, Some(rule.id.clone()))
            })
    }

    /// Decide a single call.
    pub async fn decide(&self, call: &ToolCall) -> ApprovalDecision {
        let mut decisions = self.decide_batch(std::slice::from_ref(call)).await;
        decisions.pop().unwrap_or_else(|| ApprovalDecision {
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            connector_id: call.connector_id.clone().unwrap_or_default(),
            verdict: Verdict::Denied,
            source: DecisionSource::Interactive,
            rule_id: None,
            timestamp: Utc::now(),
        })
    }

    /// Decide calls from one turn. Calls that policy cannot settle are
    /// presented as one batch and awaited with no timeout. Decisions come
    /// back in input order.
    pub async fn decide_batch(&self, calls: &[ToolCall]) -> Vec<ApprovalDecision> {
        let mut decisions: Vec<Option<ApprovalDecision>> = Vec::with_capacity(calls.len());
        let mut queued = Vec::new();

        for (idx, call) in calls.iter().enumerate() {
            match self.evaluate(call) {
                Some(decision) => {
                    self.record(&decision);
                    decisions.push(Some(decision));
                }
                None => {
                    decisions.push(None);
                    queued.push(idx);
                }
            }
        }

        if !queued.is_empty() {
            let batch_id = uuid::Uuid::new_v4().to_string();
            let receivers = self.enqueue(&batch_id, queued.iter().map(|&i| &calls[i]));
            let _guard = BatchGuard {
                engine: self,
                batch_id: batch_id.clone(),
            };

            info!(
                name: "approval.batch_pending",
                batch_id = %batch_id,
                count = queued.len(),
                "Waiting for interactive approval"
            );
            let answers = join_all(receivers.into_iter().map(|rx| async move {
                match rx {
                    Some(rx) => rx.await.ok(),
                    None => None,
                }
            }))
            .await;

            for (&idx, answer) in queued.iter().zip(answers) {
                let call = &calls[idx];
                let verdict = match answer {
                    Some(Answer::Approve { remember }) => {
                        if remember {
                            self.remember(call.tool_name.clone());
                        }
                        Verdict::Approved
                    }
                    Some(Answer::Deny) => Verdict::Denied,
                    None => {
                        warn!(call_id = %call.id, "no approval answer, denying");
                        Verdict::Denied
                    }
                };
                let decision = ApprovalDecision {
                    call_id: call.id.clone(),
                    tool_name: call.tool_name.clone(),
                    connector_id: call.connector_id.clone().unwrap_or_default(),
                    verdict,
                    source: DecisionSource::Interactive,
                    rule_id: None,
                    timestamp: Utc::now(),
                };
                self.record(&decision);
                decisions[idx] = Some(decision);
            }
        }

        decisions.into_iter().flatten().collect()
    }

    /// Publish `calls` as one batch. Answers are keyed by call id, so a call
    /// whose id is already pending gets no receiver and is denied.
    fn enqueue<'c, I>(&self, batch_id: &str, calls: I) -> Vec<Option<oneshot::Receiver<Answer>>>
    where
        I: Iterator<Item = &'c ToolCall>,
    {
        let mut pending = relock(self.pending.lock());
        let mut requests = Vec::new();
        let mut receivers = Vec::new();

        for call in calls {
            if pending.waiting.contains_key(&call.id) {
                warn!(call_id = %call.id, "duplicate pending call id, denying");
                receivers.push(None);
                continue;
            }
            let (tx, rx) = oneshot::channel();
            pending.waiting.insert(
                call.id.clone(),
                Waiting {
                    batch_id: batch_id.to_string(),
                    tx,
                },
            );
            requests.push(ApprovalRequest {
                call_id: call.id.clone(),
                tool_name: call.tool_name.clone(),
                connector_id: call.connector_id.clone().unwrap_or_default(),
                arguments: serde_json::to_value(&call.arguments).unwrap_or(Value::Null),
            });
            receivers.push(Some(rx));
        }

        if requests.is_empty() {
            return receivers;
        }
        pending.batches.push(PendingBatch {
            id: batch_id.to_string(),
            requests,
            created_at: Utc::now(),
        });
        self.publish(&pending);
        receivers
    }

    fn publish(&self, pending: &PendingState) {
        self.batches.send_replace(pending.batches.clone());
    }

    // ── Interactive answers ────────────────────────────────────────────

    /// Watch the pending batches. The current value is always the full set.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PendingBatch>> {
        self.batches.subscribe()
    }

    pub fn pending(&self) -> Vec<PendingBatch> {
        relock(self.pending.lock()).batches.clone()
    }

    /// Approve one request. Returns `false` if it is not pending.
    pub fn approve(&self, call_id: &str, remember: bool) -> bool {
        self.answer(call_id, Answer::Approve { remember })
    }

    /// Deny one request. Returns `false` if it is not pending.
    pub fn deny(&self, call_id: &str) -> bool {
        self.answer(call_id, Answer::Deny)
    }

    /// Approve every pending request; returns how many were answered.
    pub fn approve_all(&self, remember: bool) -> usize {
        self.answer_all(Answer::Approve { remember })
    }

    pub fn deny_all(&self) -> usize {
        self.answer_all(Answer::Deny)
    }

    /// The UI closed the prompt without choosing: deny everything pending.
    pub fn dismiss(&self) -> usize {
        self.deny_all()
    }

    fn answer(&self, call_id: &str, answer: Answer) -> bool {
        let mut pending = relock(self.pending.lock());
        let Some(waiting) = pending.waiting.remove(call_id) else {
            return false;
        };
        let delivered = waiting.tx.send(answer).is_ok();
        pending.prune();
        self.publish(&pending);
        delivered
    }

    fn answer_all(&self, answer: Answer) -> usize {
        let mut pending = relock(self.pending.lock());
        let delivered = pending
            .waiting
            .drain()
            .map(|(_, w)| w.tx.send(answer).is_ok())
            .filter(|delivered| *delivered)
            .count();
        pending.prune();
        self.publish(&pending);
        delivered
    }
}
