//! Per message scratch data.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::ResponseHandler;

/// A value of the [`ExecutionContext`] extension map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    Str(String),
    Bool(bool),
    Int(i64),
    List(Vec<String>),
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::Str(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::Str(value)
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Bool(value)
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        ContextValue::Int(value)
    }
}

/// Carries correlation data, and the handler of the responses, along with
/// a message across asynchronous boundaries.
///
/// The correlation id is what the `branch` of the proxy `Via` is made of,
/// so a response finds the context of its request.
#[derive(Clone)]
pub struct ExecutionContext {
    correlation_id: String,
    call_id: Option<String>,
    user_id: Option<String>,
    handler: Option<Arc<dyn ResponseHandler>>,
    error: Option<String>,
    executions: Vec<String>,
    extensions: HashMap<String, ContextValue>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::with_correlation_id(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            call_id: None,
            user_id: None,
            handler: None,
            error: None,
            executions: Vec::new(),
            extensions: HashMap::new(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    pub fn set_call_id(&mut self, call_id: impl Into<String>) {
        self.call_id = Some(call_id.into());
    }

    /// The user whose DNS overrides apply.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }

    pub fn handler(&self) -> Option<&Arc<dyn ResponseHandler>> {
        self.handler.as_ref()
    }

    pub fn set_handler(&mut self, handler: Arc<dyn ResponseHandler>) {
        self.handler = Some(handler);
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: impl fmt::Display) {
        self.error = Some(error.to_string());
    }

    /// Records that `name` ran, as `name[status][Nms]`.
    pub fn add_execution(&mut self, name: &str, status: &str, millis: u128) {
        self.executions.push(format!("{name}[{status}][{millis}ms]"));
    }

    pub fn execution_summary(&self) -> String {
        self.executions.join(", ")
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.extensions.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.extensions.get(key) {
            Some(ContextValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.extensions.get(key), Some(ContextValue::Bool(true)))
    }

    /// Sets `key`, or removes it when `value` is `None`.
    pub fn set(&mut self, key: impl Into<String>, value: Option<ContextValue>) {
        let key = key.into();
        match value {
            Some(value) => {
                self.extensions.insert(key, value);
            }
            None => {
                self.extensions.remove(&key);
            }
        }
    }

    pub fn set_flag(&mut self, key: impl Into<String>) {
        self.extensions.insert(key.into(), ContextValue::Bool(true));
    }

    /// A copy that evolves on its own.
    ///
    /// Every value is copied, only the response handler is shared.
    pub fn fork(&self) -> Self {
        self.clone()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("correlation_id", &self.correlation_id)
            .field("call_id", &self.call_id)
            .field("user_id", &self.user_id)
            .field("handler", &self.handler.is_some())
            .field("error", &self.error)
            .field("extensions", &self.extensions)
            .finish()
    }
}
