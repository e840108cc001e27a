use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

use quotaflow::config::{BackendKind, LogFormat, QuotaflowConfig};
use quotaflow::ingress::{DEFAULT_BURST_COUNT, DEFAULT_BURST_KIND};
use quotaflow::pipeline::{Pipeline, PipelineBuilder};
use quotaflow::telemetry;

#[derive(Debug, Parser)]
#[command(name = "quotaflow", version, about = "Rate-limited event pipeline")]
struct Cli {
    /// YAML configuration file, layered under QUOTAFLOW__* environment overrides
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the primary and dead-letter consumers until interrupted
    Run {
        /// Publish a burst of events for ENTITY once the consumers are up (ENTITY or ENTITY=COUNT)
        #[arg(long = "burst", value_name = "ENTITY[=COUNT]")]
        bursts: Vec<String>,

        /// Event kind used for bursts
        #[arg(long, default_value = DEFAULT_BURST_KIND)]
        kind: String,

        /// Override the configured log format
        #[arg(long, value_enum)]
        log_format: Option<CliLogFormat>,
    },
    /// Print the effective configuration as YAML
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = QuotaflowConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Config => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Command::Run {
            bursts,
            kind,
            log_format,
        } => {
            if let Some(format) = log_format {
                config.logging.format = format.into();
            }
            telemetry::init_tracing(&config.logging);
            let bursts = bursts
                .iter()
                .map(|arg| parse_burst(arg))
                .collect::<anyhow::Result<Vec<_>>>()?;
            run(config, bursts, kind).await
        }
    }
}

async fn run(config: QuotaflowConfig, bursts: Vec<(String, u32)>, kind: String) -> anyhow::Result<()> {
    info!("Starting Quotaflow event pipeline");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        events = %config.streams.events,
        dead_letter = %config.streams.dead_letter,
        max_per_window = config.rate_limit.max_per_window,
        window_secs = config.rate_limit.window_secs,
        "Configuration loaded"
    );

    let pipeline = with_backends(Pipeline::builder(config.clone()), &config)
        .await?
        .build()?;
    let running = pipeline.start();

    let ingress = pipeline.ingress();
    for (entity, count) in &bursts {
        if let Err(e) = ingress.burst(entity, *count, &kind).await {
            warn!(entity_id = %entity, error = %e, "Burst aborted");
        }
    }

    shutdown_signal().await;
    running.shutdown().await?;

    for (entity, _) in &bursts {
        match ingress.quota_status(entity).await {
            Ok(status) => info!(
                entity_id = %status.entity_id,
                in_window = status.in_window,
                limit = status.limit,
                blocked = status.blocked,
                "Quota status"
            ),
            Err(e) => warn!(entity_id = %entity, error = %e, "Quota status unavailable"),
        }
    }

    let primary = pipeline.primary_stats();
    let dead_letter = pipeline.dead_letter_stats();
    info!(
        delivered = primary.delivered,
        dead_lettered = primary.dead_lettered,
        undecodable = primary.undecodable,
        audited = dead_letter.dead_lettered + dead_letter.undecodable,
        "Quotaflow event pipeline stopped"
    );
    Ok(())
}

async fn with_backends(
    builder: PipelineBuilder,
    config: &QuotaflowConfig,
) -> anyhow::Result<PipelineBuilder> {
    #[allow(unused_mut)]
    let mut builder = builder;

    if config.backend.store == BackendKind::External {
        #[cfg(feature = "redis-store")]
        {
            let store = quotaflow::ratelimit::RedisOrderedSetStore::connect(&config.backend.redis_url)
                .await
                .context("connecting to redis")?;
            builder = builder.store(std::sync::Arc::new(store));
        }
        #[cfg(not(feature = "redis-store"))]
        bail!("backend.store = external requires the `redis-store` feature");
    }

    if config.backend.transport == BackendKind::External {
        #[cfg(feature = "kafka")]
        {
            let transport = quotaflow::transport::KafkaTransport::connect(
                &config.backend.kafka_brokers,
                config.consumer.partition_queue_depth,
            )
            .context("connecting to kafka")?;
            builder = builder.transport(std::sync::Arc::new(transport));
        }
        #[cfg(not(feature = "kafka"))]
        bail!("backend.transport = external requires the `kafka` feature");
    }

    Ok(builder)
}

/// Parse `ENTITY` or `ENTITY=COUNT`.
fn parse_burst(arg: &str) -> anyhow::Result<(String, u32)> {
    let (entity, count) = match arg.split_once('=') {
        Some((entity, count)) => (
            entity,
            count
                .parse::<u32>()
                .with_context(|| format!("invalid burst count in {:?}", arg))?,
        ),
        None => (arg, DEFAULT_BURST_COUNT),
    };
    if entity.trim().is_empty() {
        bail!("burst entity must not be empty");
    }
    Ok((entity.to_string(), count))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_burst() {
        assert_eq!(parse_burst("u1").unwrap(), ("u1".to_string(), DEFAULT_BURST_COUNT));
        assert_eq!(parse_burst("u2=3").unwrap(), ("u2".to_string(), 3));
        assert!(parse_burst("u3=many").is_err());
        assert!(parse_burst("=4").is_err());
    }
}
