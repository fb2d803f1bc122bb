use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub type JsonMap = Map<String, Value>;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const MISSING_COMMAND_MESSAGE: &str = "You must provide a command name with the key \"cmd\"!";

/// One remote invocation, `POST`ed as `{"cmd", "args", "kwargs"}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: JsonMap,
}

impl RpcRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
            kwargs: JsonMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: JsonMap) -> Self {
        self.kwargs = kwargs;
        self
    }
}

pub fn unknown_command_message(cmd: &str) -> String {
    format!("No registered server method with the name {cmd}")
}

pub fn error_body(message: &str) -> Value {
    json!({ "error": message })
}

pub fn execution_error_body(message: &str, traceback: &str) -> Value {
    json!({ "error": message, "traceback": traceback })
}

/// True when a `Content-Type` header value names JSON, ignoring parameters
/// such as `charset`.
pub fn is_json_content_type(value: &str) -> bool {
    value
        .split(';')
        .next()
        .map(|media| media.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
        .unwrap_or(false)
}
