use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bridge::{
    bind_local, register_builtin_methods, serve, EngineConfig, EngineRunner, MethodRegistry,
};
use tempfile::{tempdir, TempDir};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempdir()?)
}

/// An engine server running inside the test process.
pub struct LocalServer {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

impl LocalServer {
    pub async fn start(registry: MethodRegistry) -> Result<Self> {
        let listener = bind_local(0).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(listener, Arc::new(registry), shutdown.clone()));
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    /// Serves the built-in methods backed by `engine`.
    pub async fn with_engine(engine: EngineConfig) -> Result<Self> {
        let mut registry = MethodRegistry::new();
        register_builtin_methods(&mut registry, EngineRunner::new(engine));
        Self::start(registry).await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await??;
        Ok(())
    }
}

/// Installs stand-ins for the engine executables into `bin`: a version
/// reporter, a restraint generator writing `<code>.cif` and an interpreter
/// that writes whatever `fitted_ligand.pdb` path the driver script names.
#[cfg(unix)]
pub fn install_fake_engine(bin: &Path, release: &str) -> Result<()> {
    install_script(
        bin,
        "phenix.version",
        &format!("echo 'Version: 1.21-{release}'\necho 'Release tag: {release}'"),
    )?;
    install_script(bin, "phenix.elbow", r#"echo "data_$2" > "$2.cif""#)?;
    install_script(
        bin,
        "phenix.python",
        r#"out=$(grep -o '"[^"]*fitted_ligand.pdb"' "$1" | tr -d '"')
echo "HETATM    1  C1  LIG A   1" > "$out""#,
    )?;
    Ok(())
}

#[cfg(unix)]
fn install_script(dir: &Path, name: &str, body: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    let mut permissions = fs::metadata(&path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions)?;
    Ok(())
}
