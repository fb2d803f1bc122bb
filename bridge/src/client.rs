//! Host-side client whose callable surface is discovered from the server.
//!
//! Each advertised method becomes a [`RemoteStub`]: the descriptor plus the
//! logic to bind caller arguments into an [`RpcRequest`]. Stubs are looked
//! up by name at call time, so new methods appear after
//! [`DynamicClient::refresh_methods`] without any code generation.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::descriptor::{MethodDescriptor, RegistryDescription};
use crate::errors::{BridgeError, Result};
use crate::protocol::{is_json_content_type, JsonMap, RpcRequest};
use crate::registry::BATCH_METHOD;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 15010;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub address: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub startup_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

impl ClientConfig {
    pub fn new(port: u16) -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    fn url(&self) -> String {
        format!("http://{}/", self.server_address())
    }
}

/// Local stand-in for one advertised server method.
#[derive(Clone, Debug)]
pub struct RemoteStub {
    descriptor: MethodDescriptor,
}

impl RemoteStub {
    pub fn new(descriptor: MethodDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    pub fn docstring(&self) -> &str {
        &self.descriptor.docstring
    }

    /// Binds caller arguments the way the server method would: required
    /// parameters positionally or by name, extra positionals onto keyword
    /// parameters in advertised order, advertised defaults for the rest.
    pub fn build_request(&self, args: Vec<Value>, mut kwargs: JsonMap) -> Result<RpcRequest> {
        let required: Vec<&str> = self
            .descriptor
            .args
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        let capacity = required.len() + self.descriptor.kwargs.len();
        if args.len() > capacity {
            return Err(self.invalid(format!(
                "takes {capacity} positional arguments but {} were given",
                args.len()
            )));
        }

        let mut args = args.into_iter();
        let mut positional = Vec::with_capacity(required.len());
        for name in &required {
            let value = match args.next() {
                Some(value) => {
                    if kwargs.contains_key(*name) {
                        return Err(
                            self.invalid(format!("got multiple values for argument '{name}'"))
                        );
                    }
                    value
                }
                None => kwargs
                    .remove(*name)
                    .ok_or_else(|| self.invalid(format!("missing required argument: '{name}'")))?,
            };
            positional.push(value);
        }

        let mut bound = JsonMap::new();
        for (name, keyword) in self.descriptor.kwargs.iter() {
            let value = match args.next() {
                Some(value) => {
                    if kwargs.contains_key(name) {
                        return Err(
                            self.invalid(format!("got multiple values for argument '{name}'"))
                        );
                    }
                    value
                }
                None => kwargs
                    .remove(name)
                    .unwrap_or_else(|| keyword.default_value()),
            };
            bound.insert(name.clone(), value);
        }
        if let Some(name) = kwargs.keys().next() {
            return Err(self.invalid(format!("got an unexpected keyword argument '{name}'")));
        }

        Ok(RpcRequest::new(self.name())
            .with_args(positional)
            .with_kwargs(bound))
    }

    fn invalid(&self, message: String) -> BridgeError {
        BridgeError::InvalidArguments {
            method: self.name().to_string(),
            message,
        }
    }
}

pub struct DynamicClient {
    config: ClientConfig,
    http: Client,
    connected: bool,
    stubs: IndexMap<String, RemoteStub>,
}

impl DynamicClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| BridgeError::InvalidOperation(err.to_string()))?;
        Ok(Self {
            config,
            http,
            connected: false,
            stubs: IndexMap::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn server_address(&self) -> String {
        self.config.server_address()
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connects and installs stubs, retrying refused connections every
    /// `retry_interval` until `startup_timeout` has elapsed.
    #[instrument(skip(self), fields(address = %self.config.server_address()))]
    pub async fn connect(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.startup_timeout;
        let mut attempts = 0u32;
        let description = loop {
            attempts += 1;
            match self.fetch_registry().await {
                Ok(description) => break description,
                Err(Failure::Refused) => {
                    if Instant::now() >= deadline {
                        warn!(attempts, "engine server did not come up in time");
                        return Err(BridgeError::ServerNotStarted {
                            address: self.server_address(),
                            timeout: self.config.startup_timeout,
                        });
                    }
                    sleep(self.config.retry_interval).await;
                }
                Err(Failure::Fatal(err)) => return Err(err),
            }
        };
        self.install(description);
        self.connected = true;
        info!(attempts, methods = self.stubs.len(), "connected to engine server");
        Ok(())
    }

    /// Re-reads the registry. Existing stubs are kept, new names gain stubs
    /// and names the server no longer advertises are dropped.
    pub async fn refresh_methods(&mut self) -> Result<()> {
        let description = self.fetch_registry().await.map_err(|failure| match failure {
            Failure::Refused => self.refused(),
            Failure::Fatal(err) => err,
        })?;
        self.install(description);
        Ok(())
    }

    fn install(&mut self, description: RegistryDescription) {
        let stale: Vec<String> = self
            .stubs
            .keys()
            .filter(|name| description.get(name).is_none())
            .cloned()
            .collect();
        for name in stale {
            debug!(method = %name, "server no longer advertises method");
            self.stubs.shift_remove(&name);
        }
        for descriptor in description.descriptors() {
            if !self.stubs.contains_key(&descriptor.name) {
                self.stubs
                    .insert(descriptor.name.clone(), RemoteStub::new(descriptor.clone()));
            }
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = &RemoteStub> {
        self.stubs.values()
    }

    pub fn method(&self, name: &str) -> Option<&RemoteStub> {
        self.stubs.get(name)
    }

    /// Calls an advertised method and returns its result mapping.
    pub async fn call(&self, name: &str, args: Vec<Value>, kwargs: JsonMap) -> Result<JsonMap> {
        if !self.connected {
            return Err(BridgeError::NotConnected);
        }
        let stub = self
            .stubs
            .get(name)
            .ok_or_else(|| BridgeError::UnknownMethod(name.to_string()))?;
        let request = stub.build_request(args, kwargs)?;
        self.send(&request).await
    }

    /// Runs `(name, args, kwargs)` triples through the server's `batch`
    /// command.
    pub async fn call_batch(&self, commands: Vec<(String, Vec<Value>, JsonMap)>) -> Result<JsonMap> {
        let entries: Vec<Value> = commands
            .into_iter()
            .map(|(name, args, kwargs)| {
                Value::Array(vec![Value::String(name), Value::Array(args), Value::Object(kwargs)])
            })
            .collect();
        self.call(BATCH_METHOD, vec![Value::Array(entries)], JsonMap::new())
            .await
    }

    pub fn disconnect(&mut self) {
        if self.connected {
            info!(address = %self.server_address(), "disconnected from engine server");
        }
        self.connected = false;
    }

    async fn fetch_registry(&self) -> std::result::Result<RegistryDescription, Failure> {
        let response = self
            .http
            .get(self.config.url())
            .send()
            .await
            .map_err(|err| self.classify(err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Failure::Fatal(BridgeError::Protocol(format!(
                "registry request answered {status}"
            ))));
        }
        ensure_json(&content_type(&response)).map_err(Failure::Fatal)?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| Failure::Fatal(BridgeError::Unreachable(err.to_string())))?;
        serde_json::from_slice(&bytes).map_err(|err| Failure::Fatal(err.into()))
    }

    async fn send(&self, request: &RpcRequest) -> Result<JsonMap> {
        debug!(cmd = %request.cmd, "sending request");
        let response = self
            .http
            .post(self.config.url())
            .json(request)
            .send()
            .await
            .map_err(|err| match self.classify(err) {
                Failure::Refused => self.refused(),
                Failure::Fatal(err) => err,
            })?;
        handle_response(&request.cmd, response).await
    }

    fn classify(&self, err: reqwest::Error) -> Failure {
        if is_connection_refused(&err) {
            Failure::Refused
        } else {
            Failure::Fatal(BridgeError::Unreachable(err.to_string()))
        }
    }

    fn refused(&self) -> BridgeError {
        BridgeError::ConnectionRefused {
            address: self.server_address(),
        }
    }
}

enum Failure {
    Refused,
    Fatal(BridgeError),
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return io_err.kind() == io::ErrorKind::ConnectionRefused;
        }
        source = cause.source();
    }
    err.is_connect()
}

fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn ensure_json(content_type: &str) -> Result<()> {
    if is_json_content_type(content_type) {
        Ok(())
    } else {
        Err(BridgeError::UnsupportedContentType(content_type.to_string()))
    }
}

async fn handle_response(cmd: &str, response: reqwest::Response) -> Result<JsonMap> {
    let status = response.status();
    let content_type = content_type(&response);
    let bytes = response
        .bytes()
        .await
        .map_err(|err| BridgeError::Unreachable(err.to_string()))?;
    if status == StatusCode::BAD_REQUEST && bytes.is_empty() {
        return Err(BridgeError::Rejected {
            command: cmd.to_string(),
            message: "request refused with HTTP 400".to_string(),
        });
    }
    ensure_json(&content_type)?;
    let body = match serde_json::from_slice::<Value>(&bytes)? {
        Value::Object(body) => body,
        other => {
            return Err(BridgeError::Protocol(format!(
                "expected a JSON object from '{cmd}', got {other}"
            )))
        }
    };

    match body.get("error") {
        None => Ok(body),
        Some(error) => {
            let message = match error {
                Value::String(message) => message.clone(),
                other => other.to_string(),
            };
            match body.get("traceback").and_then(Value::as_str) {
                Some(traceback) => Err(BridgeError::Remote {
                    command: cmd.to_string(),
                    message,
                    traceback: traceback.to_string(),
                }),
                None => Err(BridgeError::Rejected {
                    command: cmd.to_string(),
                    message,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::KeywordArg;
    use serde_json::json;

    fn stub(descriptor: Value) -> RemoteStub {
        let description: RegistryDescription =
            serde_json::from_value(json!({ "m": descriptor })).unwrap();
        RemoteStub::new(description.get("m").unwrap().clone())
    }

    #[test]
    fn fills_advertised_defaults() {
        let stub = stub(json!({
            "docstring": null,
            "args": [["x", "str"]],
            "kwargs": {"y": {"default": 5}}
        }));
        let request = stub.build_request(vec![json!("hello")], JsonMap::new()).unwrap();
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"cmd": "m", "args": ["hello"], "kwargs": {"y": 5}})
        );
    }

    #[test]
    fn string_defaults_are_unquoted() {
        let mut descriptor = MethodDescriptor {
            name: "fit".to_string(),
            docstring: String::new(),
            args: vec![],
            kwargs: IndexMap::new(),
        };
        descriptor.kwargs.insert(
            "thoroughness".to_string(),
            KeywordArg {
                type_hint: "unspecified".to_string(),
                default: json!("\"medium\""),
            },
        );
        let request = RemoteStub::new(descriptor)
            .build_request(vec![], JsonMap::new())
            .unwrap();
        assert_eq!(request.kwargs["thoroughness"], json!("medium"));
    }

    #[test]
    fn binds_by_name_and_extra_positionals() {
        let stub = stub(json!({
            "docstring": "doc",
            "args": [["a", "unspecified"], ["b", "unspecified"]],
            "kwargs": {"c": {"default": 1}, "d": {"default": 2}}
        }));
        let mut kwargs = JsonMap::new();
        kwargs.insert("d".to_string(), json!(40));
        let request = stub
            .build_request(vec![json!(1), json!(2), json!(30)], kwargs)
            .unwrap();
        assert_eq!(request.args, vec![json!(1), json!(2)]);
        assert_eq!(request.kwargs["c"], json!(30));
        assert_eq!(request.kwargs["d"], json!(40));

        let mut kwargs = JsonMap::new();
        kwargs.insert("b".to_string(), json!("named"));
        let request = stub.build_request(vec![json!(1)], kwargs).unwrap();
        assert_eq!(request.args, vec![json!(1), json!("named")]);
    }

    #[test]
    fn binding_errors_stay_local() {
        let stub = stub(json!({
            "docstring": null,
            "args": [["x", "unspecified"]],
            "kwargs": {}
        }));
        assert!(matches!(
            stub.build_request(vec![], JsonMap::new()),
            Err(BridgeError::InvalidArguments { .. })
        ));
        assert!(stub
            .build_request(vec![json!(1), json!(2)], JsonMap::new())
            .is_err());
        let mut kwargs = JsonMap::new();
        kwargs.insert("z".to_string(), json!(0));
        let err = stub.build_request(vec![json!(1)], kwargs).unwrap_err();
        assert!(err.to_string().contains("unexpected keyword argument 'z'"));
    }

    #[tokio::test]
    async fn calls_require_a_connection() {
        let client = DynamicClient::new(ClientConfig::new(DEFAULT_PORT)).unwrap();
        let err = client
            .call("working_dir", vec![], JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
    }
}
