use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use stitch_core::{Settings, StaticSettingsRegistry};
use stitch_sessions::{DefaultIsolationFactory, EvictionStrategy, IsolationGuardFactory, NoIsolationFactory};
use tracing::info;

mod replay;

#[derive(Parser, Debug)]
#[command(name = "stitchctl", version, about = "Stitch proto-session driver")]
struct Cli {
    /// Property settings file (JSON array)
    #[arg(long = "settings", global = true)]
    settings: Option<PathBuf>,

    /// Session timeout for properties the settings file does not list
    #[arg(long = "session-timeout-secs", env = "STITCH_SESSION_TIMEOUT_SECS", default_value_t = 1800, global = true)]
    session_timeout_secs: u64,

    /// Use raw identifiers instead of property-scoped hashes
    #[arg(long = "no-isolation", action = ArgAction::SetTrue, global = true)]
    no_isolation: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Store { Memory, Sqlite }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Codec { Json, Cbor }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Eviction { Rewrite, EvictWhole }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Json, Log }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay JSONL hits and emit closed sessions
    Run {
        /// Input file; stdin when omitted
        input: Option<PathBuf>,
        #[arg(long = "store", value_enum, default_value_t = Store::Memory)]
        store: Store,
        /// SQLite database path (default ~/.stitch/stitch.db)
        #[arg(long = "db", env = "STITCH_DB_PATH")]
        db: Option<String>,
        #[arg(long = "codec", value_enum, default_value_t = Codec::Json)]
        codec: Codec,
        #[arg(long = "eviction", value_enum, default_value_t = Eviction::Rewrite)]
        eviction: Eviction,
        /// Collapse duplicate backend requests per call
        #[arg(long = "dedup", action = ArgAction::SetTrue)]
        dedup: bool,
        #[arg(long = "output", value_enum, default_value_t = Output::Json)]
        output: Output,
        #[arg(long = "tick-ms", env = "STITCH_TICK_MS", default_value_t = 1000)]
        tick_ms: u64,
        #[arg(long = "batch-size", env = "STITCH_BATCH_SIZE", default_value_t = 500)]
        batch_size: usize,
        /// Capacity of the requeue channel
        #[arg(long = "queue-cap", env = "STITCH_QUEUE_CAP", default_value_t = 2048)]
        queue_cap: usize,
        /// Closer shards
        #[arg(long = "shards", env = "STITCH_SHARDS", default_value_t = 1)]
        shards: usize,
        /// Suffix of the persisted wheel position key
        #[arg(long = "wheel-name", default_value = "")]
        wheel_name: String,
    },
    /// Print the isolated identifiers of each JSONL hit
    Ids {
        /// Input file; stdin when omitted
        input: Option<PathBuf>,
    },
}

/// One entry of the settings file; unset fields take the defaults.
#[derive(Debug, Deserialize)]
struct PropertyConfig {
    property_id: String,
    session_timeout_secs: Option<u64>,
    session_join_by_session_stamp: Option<bool>,
    session_join_by_user_id: Option<bool>,
}

impl PropertyConfig {
    fn into_settings(self, fallback: &Settings) -> Settings {
        Settings {
            property_id: self.property_id,
            session_timeout: self.session_timeout_secs.map(Duration::from_secs).unwrap_or(fallback.session_timeout),
            session_join_by_session_stamp: self
                .session_join_by_session_stamp
                .unwrap_or(fallback.session_join_by_session_stamp),
            session_join_by_user_id: self.session_join_by_user_id.unwrap_or(fallback.session_join_by_user_id),
        }
    }
}

/// Registry over the settings file plus the longest configured timeout.
fn load_registry(path: Option<&PathBuf>, timeout_secs: u64) -> Result<(StaticSettingsRegistry, Duration)> {
    let fallback = Settings { session_timeout: Duration::from_secs(timeout_secs), ..Settings::default() };
    let props: Vec<Settings> = match path {
        Some(p) => {
            let raw = std::fs::read_to_string(p).with_context(|| format!("reading settings {}", p.display()))?;
            let configs: Vec<PropertyConfig> =
                serde_json::from_str(&raw).with_context(|| format!("parsing settings {}", p.display()))?;
            configs.into_iter().map(|c| c.into_settings(&fallback)).collect()
        }
        None => Vec::new(),
    };
    let longest = props.iter().map(|s| s.session_timeout).fold(fallback.session_timeout, Duration::max);
    info!(properties = props.len(), default_timeout_secs = timeout_secs, "settings loaded");
    Ok((StaticSettingsRegistry::new(props).with_default(fallback), longest))
}

fn init_tracing() {
    let env = std::env::var("STITCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries closed sessions
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STITCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STITCH_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let (registry, longest_timeout) = load_registry(cli.settings.as_ref(), cli.session_timeout_secs)?;
    let guards: Arc<dyn IsolationGuardFactory> =
        if cli.no_isolation { Arc::new(NoIsolationFactory) } else { Arc::new(DefaultIsolationFactory) };

    match cli.command {
        Commands::Run {
            input,
            store,
            db,
            codec,
            eviction,
            dedup,
            output,
            tick_ms,
            batch_size,
            queue_cap,
            shards,
            wheel_name,
        } => {
            let opts = replay::Options {
                input,
                sqlite: match store {
                    Store::Memory => None,
                    Store::Sqlite => Some(db),
                },
                cbor: codec == Codec::Cbor,
                eviction: match eviction {
                    Eviction::Rewrite => EvictionStrategy::RewriteInPlace,
                    Eviction::EvictWhole => EvictionStrategy::EvictWholeProtosession,
                },
                dedup,
                log_sessions: output == Output::Log,
                tick: Duration::from_millis(tick_ms.max(1)),
                batch_size: batch_size.max(1),
                queue_cap: queue_cap.max(1),
                shards: shards.max(1),
                wheel_name,
                longest_timeout,
            };
            info!(?opts, "run invoked");
            replay::run(opts, Arc::new(registry), guards).await?;
        }
        Commands::Ids { input } => replay::print_ids(input, &registry, guards.as_ref()).await?,
    }
    Ok(())
}
