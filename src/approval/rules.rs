//! Approval rules and pattern matching.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Allow,
    Deny,
}

/// What a rule's pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    /// The tool's display name.
    Tool,
    /// The owning connector's id.
    Connector,
}

/// A pattern-based allow/deny policy statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRule {
    pub id: String,
    pub pattern: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub scope: RuleScope,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl ApprovalRule {
    pub fn new(pattern: impl Into<String>, rule_type: RuleType, scope: RuleScope) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: pattern.into(),
            rule_type,
            scope,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    /// Whether this rule applies to a call. Disabled rules never match.
    pub fn matches(&self, tool_name: &str, connector_id: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let subject = match self.scope {
            RuleScope::Tool => tool_name,
            RuleScope::Connector => connector_id,
        };
        glob_match(&self.pattern, subject)
    }
}

/// Case-insensitive glob: `*` matches any run (including empty), `?` exactly
/// one character. Everything else is literal.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let t: Vec<char> = text.to_lowercase().chars().collect();

    let (mut pi, mut ti) = (0, 0);
    // Last `*` seen and the text position it is currently absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        match p.get(pi) {
            Some('*') => {
                star = Some((pi, ti));
                pi += 1;
            }
            Some(&c) if c == '?' || c == t[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    pi = sp + 1;
                    ti = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}
