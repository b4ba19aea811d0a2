//! The message envelope passed through every step
//!
//! An envelope carries free text, an optional structured payload, a status
//! code, a human-readable message, and an open options bag. Expected errors
//! are data on the envelope; only configuration defects escape as Rust errors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status: the step completed with a result.
pub const STATUS_OK: i32 = 0;
/// Status: the step is still processing; the result is delivered later.
pub const STATUS_PENDING: i32 = 1;
/// Status: the task terminated without a result.
pub const STATUS_TERMINATED: i32 = -1;

/// Options key recording the step address on which an envelope first failed.
pub const ERROR_STEP_KEY: &str = "error_step";

/// The request/response message passed through every step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Free-text content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Structured payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// 0 = success; >0 = still processing; <0 = terminated without result
    #[serde(default)]
    pub status: i32,

    /// Human-readable message, set on errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Open, forward-propagated extension data (suspend limits, quota
    /// counters, fixture replay lists...). Shallow-merged across dispatches.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

impl Envelope {
    /// A successful envelope carrying only text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// A successful envelope carrying only a structured payload.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Whether this envelope carries an error or termination status.
    pub fn is_error(&self) -> bool {
        self.status != STATUS_OK
    }

    /// Mark the envelope failed. Status and message are only written if still
    /// unset, so the first failure wins; the failing step's address is
    /// recorded once under [`ERROR_STEP_KEY`].
    pub fn fail(mut self, code: i32, message: impl Into<String>, step: Option<&str>) -> Self {
        if self.status == STATUS_OK {
            self.status = code;
        }
        if self.message.is_none() {
            self.message = Some(message.into());
        }
        if let Some(address) = step {
            self.options
                .entry(ERROR_STEP_KEY.to_string())
                .or_insert_with(|| Value::String(address.to_string()));
        }
        self
    }

    /// Shallow-merge the caller's options under this envelope's own: existing
    /// keys win, so option state threads through a whole rule walk without
    /// being re-specified at each step.
    pub fn merge_options_from(&mut self, caller: &Map<String, Value>) {
        for (key, value) in caller {
            if !self.options.contains_key(key) {
                self.options.insert(key.clone(), value.clone());
            }
        }
    }
}
