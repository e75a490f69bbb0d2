use std::path::PathBuf;

use cas_p2p::DecoderKind;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cas",
    about = "Content-addressed storage node and object tool",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Storage root directory (overrides the config file)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a node: accept peers and store every message received
    Serve(ServeArgs),
    /// Dial a node and send one message
    Send(SendArgs),
    /// Store an object from a file or stdin
    Put(PutArgs),
    /// Print or save an object
    Get(GetArgs),
    /// Delete an object
    Rm(KeyArgs),
    /// Check whether an object exists
    Has(KeyArgs),
    /// Show where a key is stored on disk
    Path(KeyArgs),
    /// Count stored objects and bytes
    Stats(StatsArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    pub listen: Option<String>,
    /// Wire format (overrides the config file)
    #[arg(long)]
    pub decoder: Option<DecoderKind>,
}

#[derive(Args)]
pub struct SendArgs {
    pub addr: String,
    pub message: String,
    /// Wire format (overrides the config file)
    #[arg(long)]
    pub decoder: Option<DecoderKind>,
}

#[derive(Args)]
pub struct PutArgs {
    pub key: String,
    /// Read from this file instead of stdin
    pub file: Option<PathBuf>,
}

#[derive(Args)]
pub struct GetArgs {
    pub key: String,
    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct KeyArgs {
    pub key: String,
}

#[derive(Args)]
pub struct StatsArgs {}
