use std::process;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use netlab::cli::{
    compute_descriptor, format_compute, format_compute_list, format_node_list,
    format_stream_item, format_validation_result, serve, validate_settings_file, watch,
    watch_url, Cli, Commands, ComputeAction, ControllerClient, NodeCommand,
};

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
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => {
            // Load .env file if specified
            if let Some(ref env_file) = args.env_file {
                dotenvy::from_path(env_file).with_context(|| {
                    format!("Failed to load env file {}", env_file.display())
                })?;
            }
            serve(&args).await?;
        }

        Commands::Compute(args) => {
            let client = ControllerClient::new(&cli.server);
            match args.action {
                ComputeAction::List => {
                    let computes = client.list_computes().await?;
                    print!("{}", format_compute_list(&computes));
                }
                ComputeAction::Add {
                    host,
                    port,
                    id,
                    name,
                    https,
                    user,
                    password,
                } => {
                    let descriptor = compute_descriptor(host, port, id, name, https, user, password);
                    let compute = client.add_compute(&descriptor).await?;
                    print!("{}", format_compute(&compute));
                }
                ComputeAction::Remove { id, force } => {
                    client.remove_compute(&id, force).await?;
                    println!("Compute '{}' removed", id);
                }
                ComputeAction::Probe { id } => {
                    let compute = client.probe_compute(&id).await?;
                    print!("{}", format_compute(&compute));
                }
            }
        }

        Commands::Node(args) => {
            let client = ControllerClient::new(&cli.server);
            match args.action {
                NodeCommand::List { project } => {
                    let nodes = client.list_nodes(project).await?;
                    print!("{}", format_node_list(&nodes));
                }
            }
        }

        Commands::Watch(args) => {
            let url = watch_url(&cli.server, args.project, args.resume_from);
            watch(&url, |item| println!("{}", format_stream_item(&item)))
                .await
                .with_context(|| format!("Notification stream {} failed", url))?;
        }

        Commands::Validate(args) => {
            let result = validate_settings_file(&args.file);
            print!("{}", format_validation_result(&result));
            if !result.valid {
                process::exit(1);
            }
        }
    }

    Ok(())
}
