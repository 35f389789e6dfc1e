//! CLI module for orfleet
//!
//! Provides subcommands:
//! - `orfleet serve` - Run the room orchestrator API
//! - `orfleet render` - Print a room's descriptors without touching anything
//! - `orfleet commit|start|stop|status` - Drive a room on a running server

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

/// Server address used by the room subcommands unless overridden
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

#[derive(Parser, Debug)]
#[command(name = "orfleet")]
#[command(about = "Per-room medical device fleet orchestrator")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to settings file (default: ~/.orfleet/config.yaml)
    #[arg(long, global = true, env = "ORFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator API server
    Serve(ServeArgs),

    /// Render a room's descriptors and print them (dry run)
    Render(RenderArgs),

    /// Apply a room's current device assignment at zero replicas
    Commit(RoomArgs),

    /// Commit and start every workload of a room
    Start(RoomArgs),

    /// Scale every workload of a room down
    Stop(RoomArgs),

    /// Show a room's lifecycle state
    Status(RoomArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Bind address (overrides the settings file)
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Port to listen on (overrides the settings file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to a .env file loaded before settings are read
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Inventory of rooms and devices (overrides the settings file)
    #[arg(long, value_name = "FILE")]
    pub inventory: Option<PathBuf>,

    /// Log cluster calls instead of running kubectl
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the render command
#[derive(Parser, Debug)]
pub struct RenderArgs {
    /// Room id
    pub room_id: i64,

    /// Inventory of rooms and devices (overrides the settings file)
    #[arg(long, value_name = "FILE")]
    pub inventory: Option<PathBuf>,

    /// Template directory (overrides the settings file)
    #[arg(long, value_name = "DIR")]
    pub template_dir: Option<PathBuf>,

    /// Also write the descriptors into this directory
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,
}

/// Arguments for commands addressing one room on a running server
#[derive(Parser, Debug)]
pub struct RoomArgs {
    /// Room id
    pub room_id: i64,

    /// Orchestrator URL
    #[arg(long, env = "ORFLEET_SERVER", default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    /// Print the raw JSON response
    #[arg(long)]
    pub json: bool,
}
