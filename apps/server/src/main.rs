use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bridge::client::DEFAULT_PORT;
use bridge::engine::{
    EngineConfig, DEFAULT_PYTHON, ENGINE_BIN_DIR_ENV, ENGINE_PYTHON_ENV, RESTRAINT_LIBRARIES_ENV,
};
use bridge::{
    bind_local, register_builtin_methods, serve, EngineRunner, MethodRegistry, ScopedWorkDir,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{dispatcher, info, warn};
use tracing_subscriber::prelude::*;

/// Engine-side server answering bridge requests on the loopback interface.
#[derive(Parser, Debug)]
#[command(name = "engine-server", version)]
struct Args {
    /// Port to listen on.
    #[arg(env = "BRIDGE_SERVER_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory holding the engine executables; looked up on PATH otherwise.
    #[arg(long, env = ENGINE_BIN_DIR_ENV, value_name = "DIR")]
    bin_dir: Option<PathBuf>,

    /// Interpreter used to run generated engine scripts.
    #[arg(long, env = ENGINE_PYTHON_ENV, default_value = DEFAULT_PYTHON)]
    python: String,

    /// Restraint library roots searched before generating restraints.
    #[arg(
        long = "restraint-library",
        env = RESTRAINT_LIBRARIES_ENV,
        value_name = "DIR",
        value_delimiter = ':'
    )]
    restraint_libraries: Vec<PathBuf>,

    /// Stay in the launch directory instead of a private scratch directory.
    #[arg(long)]
    keep_cwd: bool,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default()
            .with_python(self.python.clone())
            .with_restraint_libraries(self.restraint_libraries.clone());
        if let Some(dir) = &self.bin_dir {
            config = config.with_bin_dir(dir);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let args = Args::parse();

    let scope = if args.keep_cwd {
        None
    } else {
        Some(ScopedWorkDir::enter().context("entering the server working directory")?)
    };
    if let Some(scope) = &scope {
        info!(dir = %scope.path().display(), "serving from scratch directory");
    }

    let mut registry = MethodRegistry::new();
    register_builtin_methods(&mut registry, EngineRunner::new(args.engine_config()));

    let listener = bind_local(args.port)
        .await
        .with_context(|| format!("binding 127.0.0.1:{}", args.port))?;
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));
    serve(listener, Arc::new(registry), shutdown).await?;

    drop(scope);
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested");
    shutdown.cancel();
}

fn init_tracing() -> anyhow::Result<()> {
    if dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
