use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};
use log::warn;

use poolscaler::config::DrainWorkerConfig;
use poolscaler::draining::mesos::LoggingOperatorApi;
use poolscaler::draining::queue::{process_queues, DrainingClient, InMemoryQueueClient};
use poolscaler::errors::SetupError;

#[derive(Parser)]
#[command(name = "poolscaler", about = "Capacity control tools for cluster pools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drain and terminate instances submitted to the draining queues
    Drain {
        #[arg(long)]
        cluster: String,
        #[arg(long, default_value = "config.yaml")]
        env_config_path: String,
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Drain {
            cluster,
            env_config_path,
            log_level,
        } => {
            if let Err(e) = run_drain_worker(&cluster, &env_config_path, &log_level) {
                eprintln!("drain worker failed: {}", e);
                process::exit(1);
            }
        }
    }
}

fn run_drain_worker(
    cluster: &str,
    env_config_path: &str,
    log_level: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw_config =
        std::fs::read_to_string(env_config_path).map_err(|e| SetupError::ConfigUnreadable {
            path: env_config_path.to_string(),
            reason: e.to_string(),
        })?;
    let config: DrainWorkerConfig =
        serde_yaml::from_str(&raw_config).map_err(|e| SetupError::ConfigUnreadable {
            path: env_config_path.to_string(),
            reason: e.to_string(),
        })?;
    init_logging(log_level, config.logs_filepath.as_deref());

    let cluster_config = config
        .mesos_clusters
        .get(cluster)
        .ok_or_else(|| SetupError::UnknownCluster(cluster.to_string()))?;

    // Real queue and operator transports are wired in by the deployment;
    // out of the box the worker runs against the in-process backends.
    warn!("No external transports linked; using in-process queue and logging operator backends");
    let draining_client =
        DrainingClient::new(cluster, &config, Arc::new(InMemoryQueueClient::new()))?;
    let operator = LoggingOperatorApi::new(&cluster_config.fqdn);

    process_queues(&draining_client, &operator)?;
    Ok(())
}

fn init_logging(log_level: &str, logs_filepath: Option<&str>) {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(log_level);
    if let Some(path) = logs_filepath {
        let log_file = FileRotate::new(
            path,
            AppendCount::new(3),
            ContentLimit::Lines(100_000),
            Compression::None,
            #[cfg(unix)]
            None,
        );
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
}
