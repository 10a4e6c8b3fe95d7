//! infergridd — the InferGrid daemon.
//!
//! Assembles the serving pipeline from `infergrid.toml`:
//! - Priority scheduler
//! - Per-model rate limiter
//! - Tiered result cache
//! - Load balancer with health polling
//! - Metrics collector
//! - Autoscaling controller
//!
//! # Usage
//!
//! ```text
//! infergridd run --config infergrid.toml --requests 200
//! infergridd check-config --config infergrid.toml
//! ```

mod pipeline;
mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use infergrid_core::GridConfig;

use crate::pipeline::Pipeline;

const DEFAULT_FILTER: &str = "info,infergridd=debug,infergrid=debug";

#[derive(Parser)]
#[command(name = "infergridd", about = "InferGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline until Ctrl-C.
    Run {
        #[arg(long, default_value = "infergrid.toml")]
        config: PathBuf,

        /// Submit this many synthetic requests after startup.
        #[arg(long, default_value = "0")]
        requests: usize,

        /// Distinct prompts in the synthetic load; repeats hit the cache.
        #[arg(long, default_value = "16")]
        distinct_prompts: usize,

        /// Exit once the synthetic load has drained instead of waiting for Ctrl-C.
        #[arg(long)]
        once: bool,
    },
    /// Validate a config file and print it with defaults filled in.
    CheckConfig {
        #[arg(long, default_value = "infergrid.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            requests,
            distinct_prompts,
            once,
        } => run(config, requests, distinct_prompts, once).await,
        Command::CheckConfig { config } => {
            let grid = GridConfig::from_file(&config)?;
            print!("{}", grid.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(
    config_path: PathBuf,
    requests: usize,
    distinct_prompts: usize,
    once: bool,
) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "InferGrid daemon starting");
    let config = GridConfig::from_file(&config_path)?;

    let pipeline = Pipeline::build(&config).await?;
    let tasks = pipeline.start();

    if requests > 0 {
        let summary =
            simulate::generate_load(&pipeline.scheduler, &pipeline.models, requests, distinct_prompts)
                .await;
        let stats = pipeline.cache.stats().await;
        info!(
            completed = summary.completed,
            cached = summary.cached,
            failed = summary.failed,
            cache_hit_rate = stats.hit_rate(),
            "synthetic load finished"
        );
    }

    if !once {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
    }

    // Settle whatever the last window saw before the loops go away.
    pipeline.metrics.snapshot().await;
    pipeline.shutdown(tasks).await;

    for node in pipeline.balancer.nodes().await {
        let stats = pipeline.balancer.node_stats(&node.node_id).await;
        info!(
            node_id = %node.node_id,
            status = %node.status,
            distributed = stats.distributed,
            success_rate = ?stats.success_rate,
            "node summary"
        );
    }
    for model in &pipeline.models {
        info!(
            model_id = %model,
            replicas = ?pipeline.deployments.replicas(model).await,
            operations = pipeline.autoscaler.operation_history(model).await.len(),
            "model summary"
        );
    }

    info!("InferGrid daemon stopped");
    Ok(())
}
