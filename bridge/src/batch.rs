//! The reserved `batch` command.
//!
//! Runs a sequence of `[name, args, kwargs]` calls in one round trip so a
//! caller pays the request overhead once. There is no atomicity: calls that
//! already ran keep their effects and results when a later one fails.

use serde_json::Value;
use tracing::warn;

use crate::descriptor::{MethodSignature, Param};
use crate::errors::{MethodError, MethodResult};
use crate::protocol::JsonMap;
use crate::registry::{MethodCall, MethodRegistry, BATCH_METHOD};

const COMMANDS_PARAM: &str = "batch_commands";

pub(crate) fn signature() -> MethodSignature {
    MethodSignature::new(
        "Run several server methods in a single request.\n\n\
         Args:\n\n    \
         batch_commands: a list whose entries are ['method_name', [args], {kwargs}]\n\n\
         Results are keyed '<index>: <method_name>'. Processing stops at the first \
         name that does not resolve, recording the problem under 'error'.",
    )
    .param(Param::required(COMMANDS_PARAM))
}

pub fn result_key(index: usize, name: &str) -> String {
    format!("{index}: {name}")
}

pub fn unrecognised_message(name: &str) -> String {
    format!("Unrecognised function name: {name}")
}

pub(crate) async fn run(
    registry: &MethodRegistry,
    args: Vec<Value>,
    kwargs: JsonMap,
) -> MethodResult {
    let call = MethodCall::bind(BATCH_METHOD, &signature(), args, kwargs)?;
    let commands = call.array(COMMANDS_PARAM)?;

    let mut results = JsonMap::new();
    for (index, entry) in commands.iter().enumerate() {
        let (name, args, kwargs) = parse_entry(index, entry)?;
        match registry.invoke_method(&name, args, kwargs).await {
            Some(result) => {
                results.insert(result_key(index, &name), Value::Object(result?));
            }
            None => {
                warn!(method = %name, index, "batch stopped at unrecognised method");
                results.insert(result_key(index, &name), Value::Object(JsonMap::new()));
                results.insert("error".to_string(), Value::String(unrecognised_message(&name)));
                break;
            }
        }
    }
    Ok(results)
}

fn parse_entry(index: usize, entry: &Value) -> Result<(String, Vec<Value>, JsonMap), MethodError> {
    let malformed = || {
        MethodError::type_error(format!(
            "batch entry {index} must be [name, [args], {{kwargs}}], got {entry}"
        ))
    };
    let parts = entry.as_array().ok_or_else(malformed)?;
    let [name, args, kwargs] = parts.as_slice() else {
        return Err(malformed());
    };
    let name = name.as_str().ok_or_else(malformed)?.to_string();
    let args = args.as_array().ok_or_else(malformed)?.clone();
    let kwargs = kwargs.as_object().ok_or_else(malformed)?.clone();
    Ok((name, args, kwargs))
}
