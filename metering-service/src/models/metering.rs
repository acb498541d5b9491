use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_ERROR_CODE: &str = "API_ERROR";
pub const RETRY_ERROR_CODE: &str = "RETRY_ERROR";
const DEFAULT_ERROR_MESSAGE: &str = "Unknown error";

/// One outbound metering line for a (contract, dimension, month).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteringRecord {
    pub cloud: String,
    pub contract_id: String,
    pub dimension: String,
    pub start_time: String,
    pub end_time: String,
    /// Integer quantity in text form.
    pub quantity: String,
}

/// Request body for `POST /metering/`. Stored verbatim with error entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub request: Vec<MeteringRecord>,
}

impl SubmissionPayload {
    pub fn new(request: Vec<MeteringRecord>) -> Self {
        Self { request }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// A list or a scalar, depending on the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResultEntry {
    pub fn success(message: &str) -> Self {
        Self {
            status: Some("success".to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub results: Vec<ResultEntry>,
}

/// Result of inspecting a submission response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOutcome {
    pub has_errors: bool,
    pub errors: Vec<String>,
    pub code: String,
    pub message: String,
    /// Results whose status is not `success` but which carry no errors.
    pub warnings: Vec<ResultEntry>,
}

impl SubmissionResponse {
    pub fn classify(&self) -> ResponseOutcome {
        let mut outcome = ResponseOutcome {
            has_errors: false,
            errors: Vec::new(),
            code: DEFAULT_ERROR_CODE.to_string(),
            message: DEFAULT_ERROR_MESSAGE.to_string(),
            warnings: Vec::new(),
        };

        for result in &self.results {
            match &result.errors {
                Some(errors) if is_truthy(errors) => {
                    outcome.has_errors = true;
                    match errors {
                        Value::Array(items) => outcome.errors.extend(items.iter().map(value_text)),
                        other => outcome.errors.push(value_text(other)),
                    }
                    outcome.code = result
                        .code
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ERROR_CODE.to_string());
                    outcome.message = result
                        .message
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string());
                }
                _ => {
                    if let Some(status) = &result.status {
                        if status != "success" {
                            outcome.warnings.push(result.clone());
                        }
                    }
                }
            }
        }

        outcome
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
