//! Access gate: admits exactly one capability and denies everything else.
//!
//! The decision is a pure function of the capability identifier. The gate
//! keeps no state between calls: no counters, no cache, no lockout after
//! repeated denials.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// The gate's verdict on one invocation.
///
/// Serialized as `{"outcome":"allow"}` or
/// `{"outcome":"deny","reason":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Allow => None,
            Decision::Deny { reason } => Some(reason),
        }
    }
}

/// An inbound capability request, as seen by the gate.
///
/// Hook payloads name the same fields `tool_name` / `tool_input`. A missing
/// identifier deserializes to the empty string, which is always denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Invocation {
    #[serde(default, alias = "tool_name")]
    pub capability_identifier: String,
    #[serde(default, alias = "tool_input")]
    pub arguments: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct AccessGate {
    allowed: String,
}

impl AccessGate {
    pub fn new(allowed: impl Into<String>) -> Self {
        Self {
            allowed: allowed.into(),
        }
    }

    pub fn allowed(&self) -> &str {
        &self.allowed
    }

    /// Exact, case-sensitive comparison against the allowed identifier.
    pub fn decide(&self, identifier: &str) -> Decision {
        if !identifier.is_empty() && identifier == self.allowed {
            debug!("Gate: allowed {identifier}");
            return Decision::Allow;
        }
        warn!("Gate: denied {identifier:?}");
        Decision::Deny {
            reason: self.denial_reason(identifier),
        }
    }

    /// Decides on an already-parsed invocation. Arguments are never read.
    pub fn decide_invocation(&self, invocation: &Invocation) -> Decision {
        self.decide(&invocation.capability_identifier)
    }

    /// Decides on a raw JSON envelope. Anything that does not parse as an
    /// invocation object is denied.
    pub fn decide_envelope(&self, raw: &str) -> Decision {
        match serde_json::from_str::<Invocation>(raw) {
            Ok(invocation) => self.decide_invocation(&invocation),
            Err(e) => {
                warn!("Gate: malformed invocation envelope: {e}");
                Decision::Deny {
                    reason: format!(
                        "{} Malformed invocation: {e}. Tool attempted: <unknown>",
                        self.policy_sentence()
                    ),
                }
            }
        }
    }

    fn policy_sentence(&self) -> String {
        format!(
            "Only the '{}' tool is available; all other tools are blocked.",
            self.allowed
        )
    }

    fn denial_reason(&self, identifier: &str) -> String {
        format!("{} Tool attempted: {identifier}", self.policy_sentence())
    }
}
