use std::path::PathBuf;

use bridge::client::{DEFAULT_ADDRESS, DEFAULT_PORT};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "bridge-host",
    version,
    about = "Drive an engine server from the command line: launch or attach, list its methods and call them."
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Address of an already running engine server.
    #[arg(long, global = true, env = "BRIDGE_ADDRESS", default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Port of an already running engine server. Ignored with --server.
    #[arg(long, global = true, env = "BRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Launch this server executable on a random port instead of attaching.
    #[arg(long, global = true, env = "BRIDGE_SERVER_BIN", value_name = "PATH")]
    pub server: Option<PathBuf>,

    /// Extra arguments placed before the port when launching the server.
    #[arg(long = "server-arg", global = true, value_name = "ARG", allow_hyphen_values = true)]
    pub server_args: Vec<String>,

    /// Seconds to wait for the server to accept connections.
    #[arg(long, global = true, env = "BRIDGE_STARTUP_TIMEOUT", default_value_t = 30)]
    pub startup_timeout: u64,

    /// Per-request timeout in seconds.
    #[arg(long, global = true, env = "BRIDGE_REQUEST_TIMEOUT", default_value_t = 20)]
    pub request_timeout: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the methods the server advertises, with their signatures.
    Methods,
    /// Report the engine version installed on the server side.
    Version,
    /// Print the server's working directory.
    WorkingDir,
    /// Make sure restraints for a ligand exist in a directory.
    Restraints(RestraintsArgs),
    /// Fit a ligand into a density map.
    FitLigand(FitLigandArgs),
    /// Call any advertised method with JSON arguments.
    Call(CallArgs),
    /// Run a JSON array of [name, args, kwargs] entries in one request.
    Batch(BatchArgs),
}

#[derive(Args, Debug)]
pub struct RestraintsArgs {
    /// Chemical component id, e.g. ATP.
    pub ligand_id: String,

    /// Directory receiving <ID>_restraints.cif. Defaults to the current directory.
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct FitLigandArgs {
    /// Density map file.
    #[arg(long, value_name = "PATH")]
    pub map: PathBuf,

    /// Model fragment surrounding the ligand site.
    #[arg(long, value_name = "PATH")]
    pub model: PathBuf,

    /// Starting ligand coordinates.
    #[arg(long, value_name = "PATH")]
    pub ligand_coords: PathBuf,

    /// Chemical component id of the ligand.
    #[arg(long, value_name = "ID")]
    pub ligand_id: String,

    /// Map resolution in Angstrom.
    #[arg(long, default_value_t = 3.0)]
    pub resolution: f64,

    /// Treat the map as an X-ray map rather than a cryo-EM map.
    #[arg(long)]
    pub xray: bool,

    /// One of quick, medium, thorough, extra_thorough.
    #[arg(long, default_value = "medium")]
    pub thoroughness: String,

    /// Working directory for restraints and output. Defaults to the current directory.
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Method name.
    pub method: String,

    /// Positional arguments, each a JSON value (bare words are taken as strings).
    pub args: Vec<String>,

    /// Keyword argument as NAME=JSON.
    #[arg(long = "kwarg", value_name = "NAME=JSON")]
    pub kwargs: Vec<String>,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// File holding the JSON array of batch entries.
    pub file: PathBuf,
}
