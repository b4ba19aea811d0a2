//! Step descriptors, response rules, and the address grammar
//!
//! A step names a target (`protocol[:params]` or `@member...#entry`),
//! carries an optional prompt (plain string or structured JSON), and an
//! ordered list of response rules that drive the engine's walk over the
//! asynchronous conversation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::envelope::Envelope;
use super::error::{AddressError, HandlerFailure, RuntimeError};

/// One executable step of a prompt program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Where to send the prompt. Empty means identity dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Prompt content: a string (template) or a structured value whose
    /// string leaves may contain interpolation markers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,

    /// Ordered rules applied to the step's response.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ResponseRule>,
}

impl StepDescriptor {
    /// A bare step addressing a protocol with no prompt or rules.
    pub fn to(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }
}

/// One entry of a step's ordered rule list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Condition. Absent means "response status is 0".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<RuleCondition>,

    /// Step to run when the condition matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub then: Option<StepRef>,

    /// Step to run when the condition does not match.
    #[serde(rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_: Option<StepRef>,

    /// Re-run this same rule against the branch result.
    #[serde(rename = "loop", default, skip_serializing_if = "std::ops::Not::not")]
    pub loop_: bool,

    /// Stop the walk after this rule's branch (boolean), or name an
    /// enclosing tag to break out to.
    #[serde(rename = "break", skip_serializing_if = "Option::is_none")]
    pub break_: Option<BreakDirective>,

    /// Label other rules may target with a tag-valued break.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// A rule condition: literal, expression shorthand, or a full nested step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleCondition {
    /// `true` always matches, `false` never does.
    Literal(bool),
    /// Shorthand for an `eval` step whose prompt is this string.
    Eval(String),
    /// A nested step; its settled response is semantically matched.
    Step(StepDescriptor),
}

/// A branch target: shorthand string or full descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRef {
    /// Shorthand: the string becomes the prompt of a default-protocol step.
    Shorthand(String),
    /// Full step descriptor.
    Full(StepDescriptor),
}

impl StepRef {
    /// Expand shorthand into a descriptor addressed at `default_protocol`.
    pub fn resolve(&self, default_protocol: &str) -> StepDescriptor {
        match self {
            StepRef::Shorthand(prompt) => StepDescriptor {
                address: Some(default_protocol.to_string()),
                prompt: Some(Value::String(prompt.clone())),
                rules: Vec::new(),
            },
            StepRef::Full(step) => step.clone(),
        }
    }
}

/// Value of a rule's `break` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BreakDirective {
    /// `true` jumps past the end of the rule list.
    Flag(bool),
    /// Break out to the rule carrying this tag.
    Tag(String),
}

/// A parsed step address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `protocol[:params]`
    Protocol {
        /// Registered protocol prefix.
        protocol: String,
        /// Everything after the first `:`, uninterpreted here.
        params: Option<String>,
    },
    /// `@member[@member...][#entry]` delegation through the actor tree.
    Delegate {
        /// Member names to walk, outermost first. An empty segment means
        /// the caller itself; `parent` is reserved.
        members: Vec<String>,
        /// Entry name on the final member's host. `None` means default.
        entry: Option<String>,
    },
}

impl Address {
    /// Parse a raw address string. A leading `:` has no protocol to look up
    /// and is rejected outright.
    pub fn parse(raw: &str) -> Result<Address, AddressError> {
        if let Some(rest) = raw.strip_prefix('@') {
            let (members_part, entry) = match rest.split_once('#') {
                Some((m, e)) => (m, Some(e.to_string())),
                None => (rest, None),
            };
            let members = members_part
                .split('@')
                .map(str::to_string)
                .collect::<Vec<_>>();
            return Ok(Address::Delegate { members, entry });
        }

        let (protocol, params) = match raw.split_once(':') {
            Some((p, rest)) => (p, Some(rest.to_string())),
            None => (raw, None),
        };
        if protocol.is_empty() {
            return Err(AddressError::EmptyProtocol(raw.to_string()));
        }
        Ok(Address::Protocol {
            protocol: protocol.to_string(),
            params,
        })
    }

    /// The registry key this address dispatches under.
    pub fn protocol_key(&self) -> &str {
        match self {
            Address::Protocol { protocol, .. } => protocol,
            Address::Delegate { .. } => "@",
        }
    }

    /// Parameter string after the protocol prefix, if any.
    pub fn params(&self) -> Option<&str> {
        match self {
            Address::Protocol { params, .. } => params.as_deref(),
            Address::Delegate { .. } => None,
        }
    }
}

/// A step descriptor after address parsing and prompt flattening, ready for
/// dispatch. Rules are shared so deferred re-attachment never clones them.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    /// Original address text, kept for error reporting.
    pub raw_address: Option<String>,
    /// Parsed address, `None` for identity dispatch.
    pub address: Option<Address>,
    /// Prompt flattened to text. Structured prompts are serialized to JSON.
    pub prompt: Option<String>,
    /// Whether the prompt came from a structured value.
    pub is_json: bool,
    /// Rules of the step, shared across resumptions.
    pub rules: Arc<Vec<ResponseRule>>,
}

impl PreparedStep {
    /// Prepare a descriptor for dispatch. Address parse failures are fatal.
    pub fn prepare(step: &StepDescriptor) -> Result<PreparedStep, RuntimeError> {
        let address = match step.address.as_deref() {
            Some(raw) if !raw.is_empty() => Some(Address::parse(raw)?),
            _ => None,
        };
        let (prompt, is_json) = match &step.prompt {
            Some(Value::String(text)) => (Some(text.trim().to_string()), false),
            Some(structured) => (Some(serde_json::to_string(structured)?), true),
            None => (None, false),
        };
        Ok(PreparedStep {
            raw_address: step.address.clone(),
            address,
            prompt,
            is_json,
            rules: Arc::new(step.rules.clone()),
        })
    }

    /// The address text used when recording dispatch failures.
    pub fn address_label(&self) -> &str {
        self.raw_address.as_deref().unwrap_or("")
    }
}

/// The request's payload as a single value: structured data when present,
/// otherwise the text as a JSON string, otherwise null.
pub fn request_data(env: &Envelope) -> Value {
    if let Some(data) = &env.data {
        return data.clone();
    }
    match &env.text {
        Some(text) => Value::String(text.clone()),
        None => Value::Null,
    }
}

/// Parse text as JSON, tolerating surrounding prose: on a direct parse
/// failure the outermost brace- or bracket-delimited slice is retried.
pub fn loose_json(text: &str) -> Result<Value, HandlerFailure> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Value::Null);
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }
    Err(HandlerFailure::bad_request(format!(
        "invalid JSON content: {trimmed}"
    )))
}
