//! Bridge between a host application and an out-of-process engine server.
//!
//! The server side exposes registered methods over a small HTTP/JSON
//! protocol (`GET /` describes, `POST /` runs). The host side launches the
//! server, discovers its methods and calls them through [`DynamicClient`].

pub mod batch;
pub mod client;
pub mod context;
pub mod descriptor;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod launcher;
pub mod methods;
pub mod paths;
pub mod protocol;
pub mod registry;
pub mod workdir;

pub use client::{ClientConfig, DynamicClient, RemoteStub};
pub use context::{BridgeConfig, BridgeContext, ConnectOptions};
pub use descriptor::{MethodDescriptor, MethodSignature, Param, RegistryDescription};
pub use dispatcher::{bind_local, router, serve};
pub use engine::{EngineConfig, EngineRunner, EngineVersion};
pub use errors::{BridgeError, MethodError, MethodResult, Result};
pub use launcher::{LauncherConfig, ServerLauncher, ServerProcess};
pub use methods::register_builtin_methods;
pub use protocol::{JsonMap, RpcRequest};
pub use registry::{MethodCall, MethodRegistry, ServerMethod};
pub use workdir::{with_scoped_dir, JobScope, ScopedWorkDir};
