use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures observed on the host side of the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("engine server at {address} did not start within {timeout:?}")]
    ServerNotStarted { address: String, timeout: Duration },
    #[error(
        "failed to connect to the engine server at {address}; has it been shut down? \
         reconnect after restarting it"
    )]
    ConnectionRefused { address: String },
    #[error("engine server unreachable: {0}")]
    Unreachable(String),
    #[error("not connected to the engine server")]
    NotConnected,
    #[error("engine server does not advertise a method named '{0}'")]
    UnknownMethod(String),
    #[error("invalid arguments for '{method}': {message}")]
    InvalidArguments { method: String, message: String },
    #[error("engine server rejected '{command}': {message}")]
    Rejected { command: String, message: String },
    #[error("{message}; Server traceback: \n{traceback}")]
    Remote {
        command: String,
        message: String,
        traceback: String,
    },
    #[error("server returned a non-supported type, \"{0}\"; only \"application/json\" is allowed")]
    UnsupportedContentType(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("engine server could not be launched after {attempts} attempts")]
    LaunchFailed { attempts: usize },
    #[error(
        "this operation requires engine release {required}, but release {installed} is installed; \
         please update the engine installation"
    )]
    EngineTooOld { required: u64, installed: u64 },
    #[error("engine release is unknown; version_info did not succeed")]
    EngineVersionUnknown,
    #[error("nested scoped working directories are not supported")]
    NestedWorkDir,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl BridgeError {
    /// The remote command a protocol or execution failure refers to.
    pub fn command(&self) -> Option<&str> {
        match self {
            BridgeError::Rejected { command, .. } | BridgeError::Remote { command, .. } => {
                Some(command)
            }
            BridgeError::InvalidArguments { method, .. } => Some(method),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures raised by registered server methods.
///
/// Every variant maps onto a stable kind label which leads the last line of
/// the traceback sent back to the caller.
#[derive(Debug, Error)]
pub enum MethodError {
    #[error("{0}")]
    Value(String),
    #[error("{0}")]
    Type(String),
    #[error("{0}")]
    Engine(String),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl MethodError {
    pub fn value(message: impl Into<String>) -> Self {
        MethodError::Value(message.into())
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        MethodError::Type(message.into())
    }

    pub fn engine(message: impl Into<String>) -> Self {
        MethodError::Engine(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MethodError::Value(_) => "ValueError",
            MethodError::Type(_) => "TypeError",
            MethodError::Engine(_) | MethodError::Other(_) => "RuntimeError",
            MethodError::Io(_) => "OSError",
            MethodError::Json(_) => "JSONDecodeError",
        }
    }
}

pub type MethodResult = std::result::Result<serde_json::Map<String, serde_json::Value>, MethodError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_combines_message_and_traceback() {
        let err = BridgeError::Remote {
            command: "fit_ligand".to_string(),
            message: "bad input".to_string(),
            traceback: "ValueError: bad input".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "bad input; Server traceback: \nValueError: bad input"
        );
        assert_eq!(err.command(), Some("fit_ligand"));
    }

    #[test]
    fn method_error_kinds_are_stable() {
        assert_eq!(MethodError::value("x").kind(), "ValueError");
        assert_eq!(MethodError::type_error("x").kind(), "TypeError");
        assert_eq!(MethodError::engine("x").kind(), "RuntimeError");
        let io = MethodError::from(io::Error::new(io::ErrorKind::NotFound, "missing"));
        assert_eq!(io.kind(), "OSError");
        assert_eq!(io.to_string(), "missing");
    }
}
