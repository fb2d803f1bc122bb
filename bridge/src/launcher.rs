//! Starts the engine server as a child process on a random high port.
//!
//! The launcher only spawns; it does not wait for the server to accept
//! connections. That is left to the client's startup retry loop.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use rand::Rng;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::errors::Result;

pub const MIN_DYNAMIC_PORT: u16 = 49152;
pub const MAX_DYNAMIC_PORT: u16 = 65535;
pub const DEFAULT_LAUNCH_RETRIES: usize = 5;

#[derive(Clone, Debug)]
pub struct LauncherConfig {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub retries: usize,
    pub kill_on_exit: bool,
    pub env: Vec<(String, String)>,
}

impl LauncherConfig {
    /// `program` is started as `<program> <args...> <port>`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            retries: DEFAULT_LAUNCH_RETRIES,
            kill_on_exit: true,
            env: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn with_kill_on_exit(mut self, kill_on_exit: bool) -> Self {
        self.kill_on_exit = kill_on_exit;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Clone, Debug)]
pub struct ServerLauncher {
    config: LauncherConfig,
}

impl ServerLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Tries up to `retries` times with a fresh random port each time.
    /// Returns `None` after warning when every attempt failed to spawn.
    pub fn launch(&self) -> Option<ServerProcess> {
        let mut rng = rand::thread_rng();
        for attempt in 1..=self.config.retries {
            let port = rng.gen_range(MIN_DYNAMIC_PORT..=MAX_DYNAMIC_PORT);
            match self.spawn(port) {
                Ok(child) => {
                    info!(
                        program = %self.config.program.display(),
                        port,
                        pid = child.id(),
                        "launched engine server"
                    );
                    return Some(ServerProcess {
                        port,
                        child: Some(child),
                    });
                }
                Err(err) => warn!(
                    attempt,
                    port,
                    error = %err,
                    "failed to launch engine server"
                ),
            }
        }
        warn!(
            attempts = self.config.retries,
            program = %self.config.program.display(),
            "engine server could not be started; check the installation"
        );
        None
    }

    fn spawn(&self, port: u16) -> Result<Child> {
        let mut command = Command::new(&self.config.program);
        command.args(&self.config.args);
        command.arg(port.to_string());
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::inherit());
        command.kill_on_drop(self.config.kill_on_exit);
        for (key, value) in &self.config.env {
            command.env(key, value);
        }
        Ok(command.spawn()?)
    }
}

/// A launched server. Killed on drop when the launcher asked for it.
#[derive(Debug)]
pub struct ServerProcess {
    port: u16,
    child: Option<Child>,
}

impl ServerProcess {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Whether the child is still alive. A server that exited on its own
    /// reports `false` from here on.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if matches!(child.try_wait(), Ok(None)) {
            child.kill().await?;
            info!(port = self.port, "stopped engine server");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_follow_dynamic_port_range() {
        let config = LauncherConfig::new("engine-server");
        assert_eq!(config.retries, DEFAULT_LAUNCH_RETRIES);
        assert!(config.kill_on_exit);
        assert_eq!(LauncherConfig::new("x").with_retries(0).retries, 1);
    }

    #[tokio::test]
    async fn missing_program_gives_up_after_retries() {
        let temp = tempfile::tempdir().unwrap();
        let launcher = ServerLauncher::new(
            LauncherConfig::new(temp.path().join("no-such-server")).with_retries(3),
        );
        assert!(launcher.launch().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launches_on_a_dynamic_port_and_stops() {
        let launcher = ServerLauncher::new(
            LauncherConfig::new("/bin/sh")
                .with_arg("-c")
                .with_arg("sleep 30"),
        );
        let mut server = launcher.launch().expect("sh starts");
        assert!((MIN_DYNAMIC_PORT..=MAX_DYNAMIC_PORT).contains(&server.port()));
        assert!(server.id().is_some());
        assert!(server.is_running());

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(server.id().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_servers_are_not_running() {
        let launcher = ServerLauncher::new(
            LauncherConfig::new("/bin/sh")
                .with_arg("-c")
                .with_arg("exit 0"),
        );
        let mut server = launcher.launch().expect("sh starts");
        for _ in 0..50 {
            if !server.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!server.is_running());
    }
}
