use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use orfleet::cli::{
    format_commit, format_render, format_room_status, format_start, format_steps, format_stop,
    render_room, Cli, CommandError, Commands, RenderArgs, RoomArgs, RoomClient, ServeArgs,
};
use orfleet::cluster::ClusterBackend;
use orfleet::config::{load_settings, Settings};
use orfleet::server::{serve, AppState};
use orfleet::store::load_inventory_file;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        if let Some(CommandError::Server { steps, .. }) = e.downcast_ref::<CommandError>() {
            if !steps.is_empty() {
                eprint!("{}", format_steps(steps));
            }
        }
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve(cli.config.as_deref(), args).await,
        Commands::Render(args) => run_render(cli.config.as_deref(), args).await,
        Commands::Commit(args) => {
            RoomClient::new(&args.server).commit(args.room_id).await?;
            print!("{}", format_commit(args.room_id));
            Ok(())
        }
        Commands::Start(args) => run_start(args).await,
        Commands::Stop(args) => {
            let response = RoomClient::new(&args.server).stop(args.room_id).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print!("{}", format_stop(args.room_id, &response));
            }
            Ok(())
        }
        Commands::Status(args) => {
            let status = RoomClient::new(&args.server).status(args.room_id).await?;
            print!("{}", format_room_status(&status));
            Ok(())
        }
    }
}

async fn run_serve(config: Option<&std::path::Path>, args: ServeArgs) -> Result<()> {
    // Load .env file before settings so ORFLEET_* variables in it apply
    if let Some(ref env_file) = args.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let mut settings = load_settings(config).context("Failed to load settings")?;
    apply_serve_args(&mut settings, &args);

    let state = AppState::from_settings(&settings).await?;
    let addr = settings.listen_addr();

    info!("Starting orfleet on {}", addr);
    info!("Namespace: {}", settings.cluster.namespace);
    info!("Endpoints:");
    info!("  GET  /health                  - Health check");
    info!("  POST /rooms/commitChanges     - Commit a room");
    info!("  POST /rooms/{{id}}/startDevices - Start a room");
    info!("  POST /rooms/{{id}}/stopDevices  - Stop a room");
    info!("  GET  /rooms/{{id}}/status       - Room state");

    serve(state, &settings.server)
        .await
        .with_context(|| format!("Server on {} failed", addr))
}

fn apply_serve_args(settings: &mut Settings, args: &ServeArgs) {
    if let Some(ref bind_addr) = args.bind_addr {
        settings.server.bind_addr = bind_addr.clone();
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(ref inventory) = args.inventory {
        settings.rooms.inventory = Some(inventory.clone());
    }
    if args.dry_run {
        settings.cluster.backend = ClusterBackend::DryRun;
    }
}

async fn run_render(config: Option<&std::path::Path>, args: RenderArgs) -> Result<()> {
    let mut settings = load_settings(config).context("Failed to load settings")?;
    if let Some(dir) = args.template_dir {
        settings.rooms.template_dir = Some(dir);
    }

    let inventory_path = args
        .inventory
        .or_else(|| settings.rooms.inventory.clone())
        .context("No inventory given (use --inventory or rooms.inventory in settings)")?;
    let inventory = load_inventory_file(&inventory_path)?;

    let generator = settings.template_source().load().await?;
    let set = render_room(&inventory, args.room_id, settings.rooms.base_port, &generator)?;

    if let Some(dir) = args.output {
        let written = set.persist(&dir).await?;
        info!("Wrote {} descriptors to {}", written.len(), dir.display());
    }

    print!("{}", format_render(&set));
    Ok(())
}

async fn run_start(args: RoomArgs) -> Result<()> {
    let response = RoomClient::new(&args.server).start(args.room_id).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print!("{}", format_start(args.room_id, &response));
    }
    Ok(())
}
