//! Invocation of the external engine executables.
//!
//! Every engine process gets an explicit working directory; nothing here
//! changes the current directory of the server process.

use std::env;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::errors::MethodError;
use crate::workdir::JobScope;

pub const DEFAULT_PYTHON: &str = "phenix.python";
pub const DEFAULT_VERSION_COMMAND: &str = "phenix.version";
pub const DEFAULT_RESTRAINT_GENERATOR: &str = "phenix.elbow";

/// Release number assigned to development builds with a non-numeric tag.
pub const DEV_RELEASE: u64 = 1_000_000_000;
pub const MIN_SUPPORTED_RELEASE: u64 = 3964;

pub const ENGINE_BIN_DIR_ENV: &str = "BRIDGE_ENGINE_BIN_DIR";
pub const ENGINE_PYTHON_ENV: &str = "BRIDGE_ENGINE_PYTHON";
pub const RESTRAINT_LIBRARIES_ENV: &str = "BRIDGE_RESTRAINT_LIBRARIES";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub bin_dir: Option<PathBuf>,
    pub python: String,
    pub version_command: String,
    pub restraint_generator: String,
    pub restraint_libraries: Vec<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bin_dir: None,
            python: DEFAULT_PYTHON.to_string(),
            version_command: DEFAULT_VERSION_COMMAND.to_string(),
            restraint_generator: DEFAULT_RESTRAINT_GENERATOR.to_string(),
            restraint_libraries: Vec::new(),
            env: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env::var_os(ENGINE_BIN_DIR_ENV).filter(|value| !value.is_empty()) {
            config.bin_dir = Some(PathBuf::from(dir));
        }
        if let Ok(python) = env::var(ENGINE_PYTHON_ENV) {
            if !python.trim().is_empty() {
                config.python = python.trim().to_string();
            }
        }
        if let Some(paths) = env::var_os(RESTRAINT_LIBRARIES_ENV) {
            config.restraint_libraries = split_library_paths(paths);
        }
        config
    }

    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_restraint_libraries(mut self, libraries: Vec<PathBuf>) -> Self {
        self.restraint_libraries = libraries;
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Full path of an engine executable, looked up on `PATH` when no
    /// binary directory is configured.
    pub fn program(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}

fn split_library_paths(value: OsString) -> Vec<PathBuf> {
    env::split_paths(&value)
        .filter(|path| !path.as_os_str().is_empty())
        .collect()
}

#[derive(Debug)]
pub struct EngineOutput {
    pub stdout: String,
}

impl EngineOutput {
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout
            .trim()
            .lines()
            .map(|line| line.to_string())
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersion {
    pub version: String,
    pub tag: String,
}

impl EngineVersion {
    pub fn release(&self) -> u64 {
        release_number(&self.tag)
    }
}

pub fn release_number(tag: &str) -> u64 {
    let tag = tag.trim();
    if !tag.is_empty() && tag.chars().all(|c| c.is_ascii_digit()) {
        tag.parse().unwrap_or(DEV_RELEASE)
    } else {
        DEV_RELEASE
    }
}

/// Reads `Version: ...` and `Release ...: ...` lines from the output of the
/// engine's version executable.
pub fn parse_version_output(output: &str) -> Option<EngineVersion> {
    let mut version = None;
    let mut tag = None;
    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Version") {
            if let Some((_, value)) = rest.split_once(':') {
                version = Some(value.trim().to_string());
            }
        } else if line.starts_with("Release") {
            if let Some(value) = line.rsplit(':').next() {
                tag = Some(value.trim().to_string());
            }
        }
    }
    match (version, tag) {
        (None, None) => None,
        (version, tag) => Some(EngineVersion {
            version: version.unwrap_or_default(),
            tag: tag.unwrap_or_default(),
        }),
    }
}

#[derive(Clone, Debug)]
pub struct EngineRunner {
    config: EngineConfig,
}

impl EngineRunner {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[instrument(skip(self, args, workdir), fields(workdir = %workdir.display()))]
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        workdir: &Path,
    ) -> Result<EngineOutput, MethodError> {
        let executable = self.config.program(program);
        let command_line = format_command_line(&executable, args);

        let mut command = Command::new(&executable);
        command.current_dir(workdir);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        for (key, value) in &self.config.env {
            command.env(key, value);
        }
        command.args(args);

        info!(command = %command_line, "running engine command");
        let child = command.spawn().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => MethodError::engine(format!(
                "engine executable '{}' was not found; check the engine installation path",
                executable.display()
            )),
            _ => MethodError::Io(err),
        })?;

        let start = Instant::now();
        let output = child.wait_with_output().await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        let exit_code = output.status.code().ok_or_else(|| {
            MethodError::engine(format!(
                "engine command {command_line} was terminated by a signal"
            ))
        })?;
        if exit_code != 0 {
            return Err(MethodError::engine(format!(
                "Attempt to run the engine command {command_line} failed with the following error: {}",
                stderr.trim()
            )));
        }

        debug!(elapsed_ms, stderr = %stderr.trim(), "engine command finished");
        Ok(EngineOutput { stdout })
    }

    /// Runs a standalone engine command in a throwaway job directory and
    /// returns its stdout lines.
    pub async fn run_in_scratch(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Vec<String>, MethodError> {
        let scope = JobScope::new()?;
        let output = self.run(program, args, scope.path()).await?;
        scope.close()?;
        Ok(output.stdout_lines())
    }

    /// Writes `source` into `workdir` and runs it with the engine interpreter.
    pub async fn run_script(
        &self,
        workdir: &Path,
        source: &str,
    ) -> Result<EngineOutput, MethodError> {
        let mut contents = source.to_string();
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        let script_path = workdir.join(format!("script_{}.py", Uuid::new_v4().simple()));
        {
            let mut file = fs::File::create(&script_path).await?;
            file.write_all(contents.as_bytes()).await?;
            file.sync_all().await?;
        }

        let python = self.config.python.clone();
        let result = self
            .run(&python, &[script_path.to_string_lossy().to_string()], workdir)
            .await;
        if let Err(err) = fs::remove_file(&script_path).await {
            debug!(path = %script_path.display(), error = %err, "failed to remove engine script");
        }
        result
    }

    pub async fn version(&self) -> Result<EngineVersion, MethodError> {
        let command = self.config.version_command.clone();
        let lines = self.run_in_scratch(&command, &[]).await?;
        parse_version_output(&lines.join("\n")).ok_or_else(|| {
            MethodError::engine(format!(
                "could not read a version from the output of {command}"
            ))
        })
    }
}

fn format_command_line(executable: &Path, args: &[String]) -> String {
    let mut line = executable.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}
