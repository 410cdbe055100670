use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use syncache::{
  CacheEntry, CacheStorage, ConflictPolicy, EngineConfig, Fingerprint, Selector, SqliteStorage, SyncEngine,
};

#[derive(Parser, Debug)]
#[command(name = "syncache")]
#[command(about = "Inspect and maintain a persisted syncache database")]
#[command(version)]
struct Cli {
  /// Path to config file (default: $XDG_CONFIG_HOME/syncache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Path to the cache database (default: from config, then $XDG_DATA_HOME/syncache/cache.db)
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List persisted entries
  Entries {
    /// Only entries carrying this tag
    #[arg(short, long)]
    tag: Option<String>,
  },
  /// Print one entry's payload as JSON
  Show { fingerprint: String },
  /// Mark persisted entries stale
  Invalidate(InvalidateArgs),
  /// Delete every persisted entry
  Purge,
  /// Print the fingerprint derived from a resource and its parameters
  Fingerprint {
    resource: String,
    /// Parameters as KEY=VALUE
    params: Vec<String>,
  },
  /// Print the effective configuration
  Config,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InvalidateArgs {
  #[arg(long)]
  key: Option<String>,
  #[arg(long)]
  tag: Option<String>,
}

type Payload = serde_json::Value;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let cli = Cli::parse();
  let config = EngineConfig::load(cli.config.as_deref())?;
  let _log_guard = init_logging();

  match cli.command {
    Command::Entries { tag } => {
      let storage = open_storage(cli.db.as_deref(), &config)?;
      list_entries(&storage, tag.as_deref())?;
    }
    Command::Show { fingerprint } => {
      let storage = open_storage(cli.db.as_deref(), &config)?;
      let fingerprint = Fingerprint::from_raw(fingerprint);
      let entry = restore(&storage)?
        .into_iter()
        .find(|(fp, _)| *fp == fingerprint)
        .map(|(_, entry)| entry)
        .ok_or_else(|| eyre!("No entry for fingerprint {}", fingerprint))?;
      println!("{}", serde_json::to_string_pretty(&entry)?);
    }
    Command::Invalidate(args) => {
      let storage = Arc::new(open_storage(cli.db.as_deref(), &config)?);
      let engine: SyncEngine<Payload> = SyncEngine::builder()
        .config(config)
        // Invalidation never reconciles queued writes
        .conflict_policy(ConflictPolicy::ClientWins)
        .storage(storage)
        .build()?;

      let selector = match (args.key, args.tag) {
        (Some(key), _) => Selector::key(Fingerprint::from_raw(key)),
        (None, Some(tag)) => Selector::tag(tag),
        (None, None) => return Err(eyre!("Either --key or --tag is required")),
      };
      let matched = engine.invalidate(&selector);
      engine.shutdown();
      println!("Invalidated {} entries matching {}", matched, selector);
    }
    Command::Purge => {
      let storage = open_storage(cli.db.as_deref(), &config)?;
      let removed = storage.clear()?;
      println!("Removed {} entries", removed);
    }
    Command::Fingerprint { resource, params } => {
      let params = params
        .iter()
        .map(|p| {
          p.split_once('=')
            .ok_or_else(|| eyre!("Invalid parameter '{}', expected KEY=VALUE", p))
        })
        .collect::<Result<Vec<_>>>()?;
      println!("{}", Fingerprint::new(&resource, params));
    }
    Command::Config => {
      print!("{}", config.to_yaml()?);
    }
  }

  Ok(())
}

/// Log to a daily file under the data directory. Logging is best effort: without a
/// data directory the CLI runs silently.
fn init_logging() -> Option<WorkerGuard> {
  let log_dir = dirs::data_dir()?.join("syncache").join("logs");
  let appender = tracing_appender::rolling::daily(log_dir, "syncache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("syncache=info"));
  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .try_init()
    .ok()?;

  Some(guard)
}

fn open_storage(db: Option<&Path>, config: &EngineConfig) -> Result<SqliteStorage> {
  let path = match db {
    Some(path) => path.to_path_buf(),
    None => config.database_path()?,
  };
  tracing::debug!(path = %path.display(), "opening cache database");
  SqliteStorage::open_at(&path)
}

fn restore(storage: &SqliteStorage) -> Result<Vec<(Fingerprint, CacheEntry<Payload>)>> {
  let mut entries = CacheStorage::<Payload>::restore(storage)?;
  entries.sort_by(|(a, _), (b, _)| a.cmp(b));
  Ok(entries)
}

fn list_entries(storage: &SqliteStorage, tag: Option<&str>) -> Result<()> {
  let entries = restore(storage)?;
  let mut shown = 0;
  for (fingerprint, entry) in &entries {
    if tag.is_some_and(|t| !entry.has_tag(t)) {
      continue;
    }
    let tags = entry.tags.iter().cloned().collect::<Vec<_>>().join(",");
    let expires = entry
      .expires_at
      .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
      .unwrap_or_else(|| "never".to_string());
    println!(
      "{}  {:<12} v{:<4} expires {}  [{}]",
      fingerprint,
      entry.state.to_string(),
      entry.version,
      expires,
      tags
    );
    shown += 1;
  }
  println!("{} of {} entries", shown, entries.len());
  Ok(())
}
