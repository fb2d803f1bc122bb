//! Host-side owner of the engine server process and its client.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::{ClientConfig, DynamicClient};
use crate::engine::{EngineVersion, MIN_SUPPORTED_RELEASE};
use crate::errors::{BridgeError, Result};
use crate::launcher::{LauncherConfig, ServerLauncher, ServerProcess};
use crate::methods::{FIND_CIF_FILE, VERSION_INFO};
use crate::paths::restraint_file_name;
use crate::protocol::JsonMap;

#[derive(Clone, Debug, Default)]
pub struct BridgeConfig {
    pub launcher: Option<LauncherConfig>,
    pub client: ClientConfig,
}

impl BridgeConfig {
    pub fn new(client: ClientConfig) -> Self {
        Self {
            launcher: None,
            client,
        }
    }

    /// Launch a server on first connect instead of using `client.port`.
    pub fn with_launcher(mut self, launcher: LauncherConfig) -> Self {
        self.launcher = Some(launcher);
        self
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ConnectOptions {
    pub reconnect: bool,
    pub warn_if_connected: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            reconnect: false,
            warn_if_connected: true,
        }
    }
}

pub struct BridgeContext {
    config: BridgeConfig,
    server: Option<ServerProcess>,
    launch_attempted: bool,
    client: Option<DynamicClient>,
    engine_version: Option<EngineVersion>,
}

impl BridgeContext {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            server: None,
            launch_attempted: false,
            client: None,
            engine_version: None,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn client(&self) -> Option<&DynamicClient> {
        self.client.as_ref()
    }

    pub fn server_port(&self) -> Option<u16> {
        self.server.as_ref().map(ServerProcess::port)
    }

    pub fn is_connected(&self) -> bool {
        self.client
            .as_ref()
            .map(DynamicClient::is_connected)
            .unwrap_or(false)
    }

    /// Connects to the engine server, launching it first when a launcher
    /// is configured and no server is running yet.
    pub async fn connect(&mut self, options: ConnectOptions) -> Result<&DynamicClient> {
        if self.is_connected() && !options.reconnect {
            if options.warn_if_connected {
                warn!(
                    address = %self.config.client.server_address(),
                    "already connected to the engine server; pass reconnect to force a new connection"
                );
            }
            return self.client.as_ref().ok_or(BridgeError::NotConnected);
        }
        if let Some(client) = self.client.as_mut() {
            client.disconnect();
        }

        let port = self.ensure_server()?;
        let mut client = DynamicClient::new(self.config.client.clone().with_port(port))?;
        client.connect().await?;
        self.engine_version = probe_version(&client).await;
        if let Some(version) = &self.engine_version {
            if version.release() < MIN_SUPPORTED_RELEASE {
                warn!(
                    release = version.release(),
                    minimum = MIN_SUPPORTED_RELEASE,
                    "engine release is older than the minimum supported release"
                );
            }
        }
        self.client = Some(client);
        self.client.as_ref().ok_or(BridgeError::NotConnected)
    }

    /// The connected client, connecting quietly first if needed.
    pub async fn connected_client(&mut self) -> Result<&DynamicClient> {
        self.connect(ConnectOptions {
            reconnect: false,
            warn_if_connected: false,
        })
        .await
    }

    fn ensure_server(&mut self) -> Result<u16> {
        if let Some(server) = self.server.as_mut() {
            if server.is_running() {
                return Ok(server.port());
            }
            warn!(port = server.port(), "engine server exited; launching a new one");
            self.server = None;
            self.launch_attempted = false;
        }
        let Some(launcher) = self.config.launcher.clone() else {
            return Ok(self.config.client.port);
        };
        if self.launch_attempted {
            return Err(BridgeError::LaunchFailed {
                attempts: launcher.retries,
            });
        }
        self.launch_attempted = true;
        let attempts = launcher.retries;
        match ServerLauncher::new(launcher).launch() {
            Some(server) => {
                let port = server.port();
                self.server = Some(server);
                Ok(port)
            }
            None => Err(BridgeError::LaunchFailed { attempts }),
        }
    }

    pub fn engine_version(&self) -> Option<&EngineVersion> {
        self.engine_version.as_ref()
    }

    pub fn engine_release(&self) -> Option<u64> {
        self.engine_version.as_ref().map(EngineVersion::release)
    }

    pub fn require_engine_release(&self, required: u64) -> Result<()> {
        let installed = self
            .engine_release()
            .ok_or(BridgeError::EngineVersionUnknown)?;
        if installed < required {
            return Err(BridgeError::EngineTooOld {
                required,
                installed,
            });
        }
        Ok(())
    }

    pub async fn call(&mut self, name: &str, args: Vec<Value>, kwargs: JsonMap) -> Result<JsonMap> {
        self.connected_client().await?.call(name, args, kwargs).await
    }

    /// Restraints for `ligand_id` in `dir`, asking the server only when
    /// the file is not already there.
    pub async fn fetch_restraints(&mut self, ligand_id: &str, dir: &Path) -> Result<PathBuf> {
        let existing = dir.join(restraint_file_name(ligand_id));
        if existing.is_file() {
            info!(path = %existing.display(), "using existing restraints");
            return Ok(existing);
        }
        let mut kwargs = JsonMap::new();
        kwargs.insert("code".to_string(), json!(ligand_id));
        kwargs.insert("working_dir".to_string(), json!(dir.to_string_lossy()));
        let result = self.call(FIND_CIF_FILE, Vec::new(), kwargs).await?;
        result
            .get("filename")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| {
                BridgeError::Protocol(format!("{FIND_CIF_FILE} did not return a filename"))
            })
    }

    /// Kills the owned server, if any, and marks the client disconnected.
    pub async fn stop_server(&mut self) -> Result<()> {
        if let Some(mut server) = self.server.take() {
            server.stop().await?;
            self.launch_attempted = false;
        }
        if let Some(client) = self.client.as_mut() {
            client.disconnect();
        }
        Ok(())
    }
}

async fn probe_version(client: &DynamicClient) -> Option<EngineVersion> {
    if client.method(VERSION_INFO).is_none() {
        return None;
    }
    match client.call(VERSION_INFO, Vec::new(), JsonMap::new()).await {
        Ok(result) => match serde_json::from_value::<EngineVersion>(Value::Object(result)) {
            Ok(version) => {
                info!(version = %version.version, tag = %version.tag, "engine version");
                Some(version)
            }
            Err(err) => {
                warn!(error = %err, "unexpected version_info result");
                None
            }
        },
        Err(err) => {
            warn!(error = %err, "could not determine the engine version");
            None
        }
    }
}
