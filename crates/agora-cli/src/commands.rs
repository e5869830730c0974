use std::path::Path;

use agora_node::{simulate, Node, NodeConfig, SimulationConfig, SimulationReport};
use agora_server::AgoraServer;
use agora_sync::LoopbackHub;
use anyhow::Context;
use colored::Colorize;

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Config(args) => cmd_config(args, &cli.format),
        Command::Serve(args) => cmd_serve(args).await,
        Command::Simulate(args) => cmd_simulate(args, &cli.format).await,
    }
}

/// File (if any), then `AGORA_*` overrides, then validation.
fn load_config(path: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let mut config = match path {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    config.apply_env();
    Ok(config.validate()?)
}

fn cmd_config(args: ConfigArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let config = load_config(args.path.as_deref())?;
    match format {
        OutputFormat::Text => print!("{}", config.to_toml_string()?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}

async fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    // No peer network is attached here; the node serves its own data and
    // anti-entropy idles until peers appear.
    let hub = LoopbackHub::new();
    let node = Node::join(config, &hub).context("starting node")?;
    let workers = node.start();

    let server = AgoraServer::new(node.clone());
    println!(
        "{} node {} serving on {}",
        "✓".green().bold(),
        node.id().as_str().bold(),
        server.bind_addr().to_string().cyan()
    );
    let served = server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    workers.shutdown().await;
    node.compact()?;
    served?;
    println!("{} stopped", "✓".green());
    Ok(())
}

async fn cmd_simulate(args: SimulateArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let config = SimulationConfig {
        nodes: args.nodes,
        ops: args.ops,
        loss: args.loss,
        seed: args.seed,
        max_rounds: args.rounds,
    };
    let report = simulate(&config).await?;
    match format {
        OutputFormat::Text => print_report(&config, &report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    if !report.converged {
        anyhow::bail!("replicas did not converge within {} rounds", config.max_rounds);
    }
    Ok(())
}

fn print_report(config: &SimulationConfig, report: &SimulationReport) {
    println!(
        "Simulated {} nodes, {} ops, loss {:.0}%, seed {}",
        report.nodes.to_string().bold(),
        config.ops.to_string().bold(),
        config.loss * 100.0,
        config.seed
    );
    println!(
        "  posts: {} created, {} updated, {} deleted; comments: {}",
        report.posts_created, report.posts_updated, report.posts_deleted, report.comments_created
    );
    println!("  anti-entropy rounds: {}", report.rounds.to_string().yellow());
    for (i, count) in report.entities.iter().enumerate() {
        println!("  node-{i}: {count} entities");
    }
    if report.converged {
        println!("{} all replicas converged", "✓".green().bold());
    } else {
        println!("{} replicas diverged", "✗".red().bold());
    }
}
