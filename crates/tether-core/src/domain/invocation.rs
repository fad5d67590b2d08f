//! Invocation - 1 回の request/response サイクル

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ids::{FunctionId, RequestId, WorkerId};

/// Lambda context values forwarded to the worker as `Lambda-Runtime-*` headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvocationContext {
    pub invoked_function_arn: Option<String>,
    /// Absolute deadline (epoch millis). `None` means "now + invocation timeout".
    pub deadline_ms: Option<i64>,
    pub client_context: Option<serde_json::Value>,
    pub identity: Option<serde_json::Value>,
    pub log_group_name: Option<String>,
    pub log_stream_name: Option<String>,
}

/// One dispatched invocation. Lives from `function.invoked` until a response or
/// error is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(rename = "workerID")]
    pub worker_id: WorkerId,
    #[serde(rename = "functionID")]
    pub function_id: FunctionId,
    #[serde(rename = "requestID")]
    pub request_id: RequestId,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub context: InvocationContext,
}

impl Invocation {
    pub fn new(
        function_id: impl Into<FunctionId>,
        worker_id: impl Into<WorkerId>,
        request_id: impl Into<RequestId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            function_id: function_id.into(),
            request_id: request_id.into(),
            payload,
            env: HashMap::new(),
            context: InvocationContext::default(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Structured error body of `POST .../error` and `POST .../init/error`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvocationError {
    pub error_message: String,
    pub error_type: String,
    #[serde(alias = "stackTrace")]
    pub trace: Vec<String>,
}

impl InvocationError {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            error_type: error_type.into(),
            trace: Vec::new(),
        }
    }
}

/// How an invocation ended, as observed by the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Success(serde_json::Value),
    Error(InvocationError),
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Success(_))
    }
}
