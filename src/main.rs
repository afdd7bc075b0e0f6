use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use filedock::inspect::{disk_space, num_keys};
use filedock::metastore::{Durability, Filter, Sort, SortKey};
use filedock::metrics::{PrometheusMetrics, SharedMetrics};
use filedock::{Config, FileHandle, FileStore, Metadata, Options};

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[arg(
        long,
        global = true,
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace). Can also be set via RUST_LOG env var"
    )]
    log_level: String,

    #[arg(long, global = true, help = "Print prometheus metrics after the command")]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StoreArgs {
    #[arg(long, global = true, help = "TOML config file; other store flags override it")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    storage_root: Option<PathBuf>,

    #[arg(long, global = true)]
    meta_root: Option<PathBuf>,

    #[arg(long, global = true, help = "Enables the local cache rooted here")]
    cache_root: Option<PathBuf>,

    #[arg(long, global = true, help = "Durability level (buffer, fsync, fdatasync)")]
    durability: Option<Durability>,

    #[arg(long, global = true, help = "Store content gzip compressed")]
    gzip: bool,

    #[arg(long, global = true, help = "Store directories as tar archives")]
    tar_directories: bool,
}

impl StoreArgs {
    fn resolve(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from_file(path)?,
            None => Config::new("data", "meta"),
        };
        if let Some(root) = &self.storage_root {
            config.storage_root = root.clone();
        }
        if let Some(root) = &self.meta_root {
            config.meta_root = root.clone();
        }
        if let Some(root) = &self.cache_root {
            config.cache_root = Some(root.clone());
        }
        if let Some(durability) = self.durability {
            config.durability = durability;
        }
        config.gzip |= self.gzip;
        config.tar_directories |= self.tar_directories;
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store a file or directory
    Put {
        id: String,
        path: PathBuf,

        #[arg(long = "meta", value_parser = parse_key_val, help = "Metadata entry key=value")]
        meta: Vec<(String, Value)>,

        #[arg(long, help = "Mirror the item into the cache")]
        cache: bool,
    },

    /// Fetch an item into a destination path
    Get {
        id: String,
        dest: PathBuf,

        #[arg(long, help = "Consult and populate the cache")]
        cache: bool,
    },

    /// List items by metadata
    Find {
        #[arg(
            long = "meta",
            value_parser = parse_key_val,
            help = "Required metadata entry key=value"
        )]
        meta: Vec<(String, Value)>,

        #[arg(long, help = "Sort by id, created or meta:<key>")]
        sort: Option<String>,

        #[arg(long)]
        desc: bool,
    },

    /// Inspect DB
    Inspect {
        #[command(subcommand)]
        command: InspectCommand,
    },
}

#[derive(Debug, Subcommand)]
enum InspectCommand {
    // number of keys
    NumKeys,
    DiskSpace,
}

/// Values that parse as JSON are kept typed, anything else is a string.
fn parse_key_val(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_sort(raw: &str, desc: bool) -> Result<Sort> {
    let key = match raw {
        "id" => SortKey::Id,
        "created" => SortKey::CreatedAt,
        other => match other.strip_prefix("meta:") {
            Some(key) if !key.is_empty() => SortKey::Metadata(key.to_string()),
            _ => bail!("unknown sort key '{raw}'"),
        },
    };
    Ok(if desc {
        Sort::descending(key)
    } else {
        Sort::ascending(key)
    })
}

/// Logs go to stderr; stdout carries command output.
fn setup_tracing(log_level: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level).unwrap_or_else(|e| {
            eprintln!("--log-level '{log_level}' rejected ({e}), using info");
            EnvFilter::new("info")
        }),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    setup_tracing(&cli.log_level);

    let config = cli.store.resolve()?;
    match cli.command {
        Command::Inspect { command } => match command {
            InspectCommand::NumKeys => {
                let num_keys = num_keys(config.meta_root)?;
                println!("Number of keys: {num_keys}");
            }
            InspectCommand::DiskSpace => {
                let disk_space = disk_space(config.meta_root)?;
                println!("Disk space: {disk_space}");
            }
        },
        command => run(config, command, cli.print_metrics)?,
    }
    Ok(())
}

#[tokio::main]
async fn run(config: Config, command: Command, print_metrics: bool) -> Result<()> {
    let prometheus = PrometheusMetrics::new()?;
    let metrics = SharedMetrics::new(Arc::new(prometheus.clone()));
    let store = FileStore::from_config(&config, metrics)?;
    info!(
        "using storage root {} and metadata at {}",
        config.storage_root.display(),
        config.meta_root.display()
    );

    match command {
        Command::Put { id, path, meta, cache } => {
            let metadata: Metadata = meta.into_iter().collect();
            let handle = FileHandle::from_path(id, path)
                .with_metadata(metadata)
                .allow_directories(config.tar_directories);
            let handle = store
                .write(handle, Options::new().cache_allowed(cache))
                .await?;
            let created = handle
                .created_at()
                .map(|at| at.to_rfc3339())
                .unwrap_or_default();
            println!("{}\t{}", handle.id(), created);
        }
        Command::Get { id, dest, cache } => {
            let handle = store
                .read(&id, &dest, Options::new().cache_allowed(cache))
                .await?;
            if let Some(path) = handle.path() {
                println!("{}", path.display());
            }
        }
        Command::Find { meta, sort, desc } => {
            let filter = meta
                .into_iter()
                .fold(Filter::new(), |filter, (key, value)| filter.meta(key, value));
            let sort = sort.map(|raw| parse_sort(&raw, desc)).transpose()?;
            for handle in store.find(&filter, sort.as_ref()).await? {
                let created = handle
                    .created_at()
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}",
                    handle.id(),
                    created,
                    Value::Object(handle.metadata().clone())
                );
            }
        }
        Command::Inspect { .. } => bail!("inspect does not open the store"),
    }

    if print_metrics {
        print!("{}", prometheus.encode()?);
    }
    Ok(())
}
