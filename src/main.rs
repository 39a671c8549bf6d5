mod cache;
mod config;
mod error;
mod http;
mod intercept;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cache::{ActivationOutcome, CacheGenerationManager, GenerationStore, Lifecycle, SqliteStorage};
use http::{HttpFetcher, Request};
use reqwest::header::{HeaderName, HeaderValue};
use intercept::{Interceptor, PolicySelector};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "An offline-first request interception cache for web application shells")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./shellcache.yaml or $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log at debug level unless RUST_LOG says otherwise
  #[arg(short, long)]
  verbose: bool,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the static generation from the manifest
  Boot,
  /// Install if needed, then delete generations that are not current
  Activate,
  /// Send requests through the cache
  Fetch {
    /// Absolute URLs, or paths resolved against the origin
    #[arg(required = true)]
    urls: Vec<String>,

    /// Request method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra request header, as 'Name: value'
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// List stored generations
  Generations {
    /// Also list the request keys stored in each generation
    #[arg(long)]
    entries: bool,
  },
}

type ShellInterceptor = Interceptor<SqliteStorage, HttpFetcher>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose, args.log_file.as_deref())?;

  let config = config::Config::load(args.config.as_deref())?;
  info!(origin = %config.origin, "Loaded configuration");

  let storage = Arc::new(SqliteStorage::open(config.cache.path.as_deref())?);
  let manager = CacheGenerationManager::new(
    storage,
    config.cache.static_generation.id(),
    config.cache.runtime_generation.id(),
  );
  let interceptor = Interceptor::new(
    config.origin.clone(),
    PolicySelector::new(config.api_prefix.clone()),
    Arc::new(manager),
    HttpFetcher::new(&config.network)?,
  );

  match args.command {
    Command::Boot => boot(&interceptor, &config.manifest).await,
    Command::Activate => {
      boot(&interceptor, &config.manifest).await?;
      activate(&interceptor).await
    }
    Command::Fetch {
      urls,
      method,
      headers,
    } => {
      let requests = build_requests(&config, &urls, &method, &headers)?;
      boot(&interceptor, &config.manifest).await?;
      activate(&interceptor).await?;
      fetch(&interceptor, &requests).await
    }
    Command::Generations { entries } => list_generations(&interceptor, entries),
  }
}

fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

  match log_file {
    Some(path) => {
      let dir = path.parent().unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
      tracing_subscriber::registry()
        .with(filter)
        .with(
          tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false),
        )
        .init();
      Ok(Some(guard))
    }
    None => {
      // stdout is reserved for response bodies
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
      Ok(None)
    }
  }
}

async fn boot(interceptor: &ShellInterceptor, manifest: &[String]) -> Result<()> {
  let report = interceptor.boot(manifest).await?;
  if report.reused {
    eprintln!("{}: already installed", report.generation);
  } else {
    eprintln!("{}: installed {} entries", report.generation, report.installed);
  }
  Ok(())
}

async fn activate(interceptor: &ShellInterceptor) -> Result<()> {
  match interceptor.activate().await? {
    ActivationOutcome::Activated { deleted } => {
      for name in &deleted {
        eprintln!("deleted {}", name);
      }
      eprintln!("ready ({} stale generations removed)", deleted.len());
    }
    ActivationOutcome::Skipped => match interceptor.manager().settled().await {
      Lifecycle::Ready => eprintln!("ready (activated concurrently)"),
      state => return Err(eyre!("Concurrent activation did not complete (state: {})", state)),
    },
  }
  Ok(())
}

fn build_requests(
  config: &config::Config,
  urls: &[String],
  method: &str,
  headers: &[String],
) -> Result<Vec<Request>> {
  let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;

  let headers = headers
    .iter()
    .map(|h| parse_header(h))
    .collect::<Result<Vec<_>>>()?;

  urls
    .iter()
    .map(|url| {
      let request = headers.iter().fold(
        Request::new(method.clone(), config.resolve(url)?),
        |request, (name, value)| request.with_header(name, value),
      );
      Ok::<_, color_eyre::Report>(request)
    })
    .collect()
}

/// Parse a `Name: value` header, rejecting anything the HTTP client would refuse to send.
fn parse_header(header: &str) -> Result<(String, String)> {
  let (name, value) = header
    .split_once(':')
    .ok_or_else(|| eyre!("Invalid header (expected 'Name: value'): {}", header))?;
  let (name, value) = (name.trim(), value.trim());

  HeaderName::from_bytes(name.as_bytes())
    .map_err(|e| eyre!("Invalid header name {:?}: {}", name, e))?;
  HeaderValue::from_str(value).map_err(|e| eyre!("Invalid value for header {}: {}", name, e))?;

  Ok((name.to_string(), value.to_string()))
}

async fn fetch(interceptor: &ShellInterceptor, requests: &[Request]) -> Result<()> {
  let all = futures::future::join_all(requests.iter().map(|r| interceptor.intercept(r)));

  let results = tokio::select! {
    results = all => results,
    _ = tokio::signal::ctrl_c() => {
      let dropped = interceptor.pending().abandon();
      warn!(dropped, "Interrupted, abandoning pending cache writes");
      return Err(eyre!("Interrupted"));
    }
  };

  let mut failures = 0;
  let mut stdout = std::io::stdout().lock();
  for (request, result) in requests.iter().zip(results) {
    match result {
      Ok(result) => {
        let cached = result
          .cached_at
          .map(|at| format!(", cached {}", at.format("%Y-%m-%d %H:%M:%S")))
          .unwrap_or_default();
        let content_type = result.data.header("content-type").unwrap_or("-");
        eprintln!(
          "{} {} -> {} {} ({}{})",
          request.method, request.url, result.data.status, content_type, result.source, cached
        );
        stdout.write_all(&result.data.body)?;
        if requests.len() > 1 {
          writeln!(stdout)?;
        }
      }
      Err(e) => {
        eprintln!("{} {} -> failed: {}", request.method, request.url, e);
        failures += 1;
      }
    }
  }
  stdout.flush()?;
  drop(stdout);

  let in_flight = interceptor.pending().len();
  let flushed = interceptor.pending().flush().await;
  debug!(in_flight, flushed, "Pending cache writes flushed");

  if failures > 0 {
    return Err(eyre!("{} of {} requests failed", failures, requests.len()));
  }
  Ok(())
}

fn list_generations(interceptor: &ShellInterceptor, show_entries: bool) -> Result<()> {
  let manager = interceptor.manager();
  let current = [
    manager.static_generation().storage_name(),
    manager.runtime_generation().storage_name(),
  ];

  let generations = manager.storage().generations()?;
  if generations.is_empty() {
    println!("no generations stored (state: {})", manager.state());
    return Ok(());
  }

  for generation in generations {
    let marker = if current.contains(&generation.name) {
      "*"
    } else {
      " "
    };
    println!(
      "{} {:<32} {:<20} {:<12} {:>6} entries  created {}",
      marker,
      generation.name,
      generation.label,
      generation.version,
      generation.entries,
      generation.created_at.format("%Y-%m-%d %H:%M:%S")
    );

    if show_entries {
      for key in manager.storage().keys(&generation.name)? {
        println!("    {}", key);
      }
    }
  }
  Ok(())
}
