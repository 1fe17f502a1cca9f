use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AuthorizerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub role: String,
    pub action: String,
    pub resource: String,
    pub effect: Effect,
}

/// Policy bundle as served by the policy source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBundle {
    pub domain: String,
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

impl PolicyBundle {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AuthorizerError> {
        serde_json::from_slice(bytes).map_err(|e| AuthorizerError::PolicyParse(e.to_string()))
    }
}

struct CompiledRule {
    role: Regex,
    action: Regex,
    resource: Regex,
    effect: Effect,
}

impl CompiledRule {
    fn matches(&self, roles: &[String], action: &str, resource: &str) -> bool {
        self.action.is_match(action)
            && self.resource.is_match(resource)
            && roles.iter().any(|role| self.role.is_match(role))
    }
}

/// Immutable snapshot of the compiled policies for one domain.
pub struct PolicyCache {
    bundle: PolicyBundle,
    rules: Vec<CompiledRule>,
    loaded_at: DateTime<Utc>,
}

impl PolicyCache {
    pub fn compile(bundle: PolicyBundle, domain: &str) -> Result<Self, AuthorizerError> {
        if bundle.domain != domain {
            return Err(AuthorizerError::PolicyParse(format!(
                "bundle is for domain {}, expected {}",
                bundle.domain, domain
            )));
        }

        let rules = bundle
            .policies
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    role: glob_to_regex(&rule.role)?,
                    action: glob_to_regex(&rule.action)?,
                    resource: glob_to_regex(&rule.resource)?,
                    effect: rule.effect,
                })
            })
            .collect::<Result<Vec<_>, AuthorizerError>>()?;

        Ok(Self {
            bundle,
            rules,
            loaded_at: Utc::now(),
        })
    }

    /// A request is allowed when some allow rule matches one of `roles` and
    /// no deny rule does.
    pub fn is_allowed(&self, roles: &[String], action: &str, resource: &str) -> bool {
        let mut allowed = false;
        for rule in &self.rules {
            if !rule.matches(roles, action, resource) {
                continue;
            }
            match rule.effect {
                Effect::Deny => return false,
                Effect::Allow => allowed = true,
            }
        }
        allowed
    }

    pub fn domain(&self) -> &str {
        &self.bundle.domain
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "domain": self.bundle.domain,
            "loaded_at": self.loaded_at.to_rfc3339(),
            "policies": self.bundle.policies,
        })
    }
}

/// `*` matches any run of characters, `?` exactly one. Case-insensitive.
fn glob_to_regex(pattern: &str) -> Result<Regex, AuthorizerError> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push_str("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');

    Regex::new(&expr)
        .map_err(|e| AuthorizerError::PolicyParse(format!("invalid pattern {}: {}", pattern, e)))
}
