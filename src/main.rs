use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;
use url::Url;

use slidecache::app::OfflineContext;
use slidecache::config::Config;
use slidecache::http::Request;
use slidecache::queue::{Action, ActionStatus, OfflineQueue};

#[derive(Parser, Debug)]
#[command(name = "slidecache")]
#[command(about = "Offline content cache and action queue for the slideshow client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/slidecache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the critical asset manifest
  Install,
  /// Delete namespaces left over from previous versions
  Activate,
  /// Enforce namespace budgets and purge expired images
  Sweep,
  /// Show cache and queue statistics
  Stats,
  /// Resolve a URL through the tiered cache
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Write the body to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Preload images into the image store
  Prefetch {
    #[arg(required = true)]
    urls: Vec<String>,
    #[arg(long)]
    playlist: Option<String>,
    /// Expiry in seconds (default from config)
    #[arg(long)]
    ttl: Option<u64>,
  },
  /// Inspect and drive the offline action queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Run the sweeper, reachability probe and reconnect drain until Ctrl-C
  Watch,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Queue an action, e.g. `queue add delete-image '{"image_id":"12"}'`
  Add { kind: String, payload: String },
  List,
  /// Process pending actions now
  Drain,
  /// Reset failed actions to pending
  RetryFailed,
  Clear {
    /// Only remove completed actions
    #[arg(long)]
    completed: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config.data_dir()?.join("logs"), args.verbose)?;

  let ctx = OfflineContext::open(config)?;

  match args.command {
    Command::Install => {
      let count = ctx.lifecycle.install().await?;
      println!("precached {} assets", count);
    }
    Command::Activate => {
      let deleted = ctx.lifecycle.activate()?;
      if deleted.is_empty() {
        println!("no stale namespaces");
      }
      for name in deleted {
        println!("deleted {}", name);
      }
    }
    Command::Sweep => {
      let evictions = ctx.lifecycle.enforce_budgets()?;
      if evictions.is_empty() {
        println!("all namespaces within budget");
      }
      for eviction in evictions {
        println!("{}: evicted {}", eviction.namespace, eviction.evicted);
      }
    }
    Command::Stats => print_stats(&ctx)?,
    Command::Fetch {
      url,
      navigate,
      output,
    } => fetch(&ctx, &url, navigate, output.as_deref()).await?,
    Command::Prefetch {
      urls,
      playlist,
      ttl,
    } => prefetch(&ctx, &urls, playlist.as_deref(), ttl).await?,
    Command::Queue(command) => run_queue_command(&ctx.queue, command).await?,
    Command::Watch => watch(&ctx).await?,
  }

  Ok(())
}

fn init_logging(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  use tracing_subscriber::{fmt, prelude::*, EnvFilter};

  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;
  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "slidecache.log"));

  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slidecache=info"));

  let file_layer = fmt::layer()
    .with_writer(writer)
    .with_ansi(false)
    .with_target(false);
  let stderr_layer = verbose.then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
  });

  tracing_subscriber::registry()
    .with(env_filter)
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn resolve(origin: &Url, url: &str) -> Result<Url> {
  origin
    .join(url)
    .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
}

fn ttl_from_secs(secs: u64) -> Result<chrono::Duration> {
  i64::try_from(secs)
    .ok()
    .and_then(chrono::Duration::try_seconds)
    .ok_or_else(|| eyre!("TTL out of range: {}", secs))
}

fn print_stats(ctx: &OfflineContext) -> Result<()> {
  let stats = ctx.stats()?;

  println!("{:<32} {:>8} {:>12} {:>12}", "NAMESPACE", "ENTRIES", "EST. BYTES", "BUDGET");
  for ns in &stats.namespaces {
    let budget = ns
      .budget
      .map(|b| b.to_string())
      .unwrap_or_else(|| "-".to_string());
    println!(
      "{:<32} {:>8} {:>12} {:>12}",
      ns.namespace, ns.entries, ns.estimated_bytes, budget
    );
  }
  println!();
  println!("images in store:  {}", stats.images);
  println!("pending actions:  {}", stats.pending_actions);
  println!("failed actions:   {}", stats.failed_actions);
  Ok(())
}

async fn fetch(ctx: &OfflineContext, url: &str, navigate: bool, output: Option<&Path>) -> Result<()> {
  let url = resolve(ctx.origin(), url)?;
  let request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  };

  let served = ctx
    .interceptor
    .handle(&request)
    .await
    .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;
  eprintln!(
    "{} from {:?} ({} bytes)",
    served.response.status,
    served.source,
    served.response.body.len()
  );

  match output {
    Some(path) => std::fs::write(path, &served.response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => std::io::stdout()
      .write_all(&served.response.body)
      .map_err(|e| eyre!("Failed to write response: {}", e))?,
  }
  Ok(())
}

async fn prefetch(
  ctx: &OfflineContext,
  urls: &[String],
  playlist: Option<&str>,
  ttl: Option<u64>,
) -> Result<()> {
  let urls = urls
    .iter()
    .map(|u| resolve(ctx.origin(), u))
    .collect::<Result<Vec<_>>>()?;
  let ttl = ttl.map(ttl_from_secs).transpose()?;

  let outcomes = match playlist {
    Some(playlist) => ctx.prefetcher.prefetch_playlist(playlist, &urls, ttl).await,
    None => {
      let mut outcomes = Vec::with_capacity(urls.len());
      for url in urls {
        let result = ctx.prefetcher.prefetch(&url, None, ttl).await;
        outcomes.push(slidecache::prefetch::PrefetchOutcome { url, result });
      }
      outcomes
    }
  };

  for outcome in outcomes {
    match outcome.result {
      Ok(id) => println!("stored {} as {}", outcome.url, id),
      Err(e) => println!("skipped {}: {}", outcome.url, e),
    }
  }
  Ok(())
}

async fn run_queue_command(queue: &OfflineQueue, command: QueueCommand) -> Result<()> {
  match command {
    QueueCommand::Add { kind, payload } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid payload JSON: {}", e))?;
      let action =
        Action::from_parts(&kind, payload).map_err(|e| eyre!("Invalid {} action: {}", kind, e))?;
      let id = queue.add_action(action)?;
      println!("queued {}", id);
      wait_until_settled(queue).await;
    }
    QueueCommand::List => {
      println!(
        "{:<40} {:<16} {:<11} {:>7}  {:<20} ERROR",
        "ID", "TYPE", "STATUS", "RETRIES", "CREATED"
      );
      for action in queue.actions() {
        println!(
          "{:<40} {:<16} {:<11} {:>7}  {:<20} {}",
          action.id,
          action.action.kind(),
          action.status.to_string(),
          format!("{}/{}", action.retries, action.max_retries),
          action.timestamp.format("%Y-%m-%d %H:%M:%S"),
          action.last_error.as_deref().unwrap_or("")
        );
      }
    }
    QueueCommand::Drain => {
      let report = queue.process_queue().await;
      if !report.ran {
        println!("drain skipped (offline or already running)");
        return Ok(());
      }
      wait_until_settled(queue).await;
      println!(
        "attempted {}, completed {}, failed {}, still pending {}",
        report.attempted,
        report.completed,
        queue.failed_count(),
        queue.pending_count()
      );
    }
    QueueCommand::RetryFailed => {
      println!("reset {} failed actions", queue.retry_failed_actions());
    }
    QueueCommand::Clear { completed } => {
      let removed = if completed {
        queue.clear_completed_actions()
      } else {
        queue.clear_all_actions()
      };
      println!("removed {} actions", removed);
    }
  }
  Ok(())
}

/// Wait for in-flight attempts and scheduled retries to finish.
async fn wait_until_settled(queue: &OfflineQueue) {
  loop {
    let busy = queue.is_processing()
      || queue
        .actions()
        .iter()
        .any(|a| a.status == ActionStatus::Processing);
    if !busy {
      break;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
  }
}

async fn watch(ctx: &OfflineContext) -> Result<()> {
  ctx.queue.set_failure_callback(|action| {
    eprintln!(
      "action {} failed after {} retries: {}",
      action.id,
      action.retries,
      action.last_error.as_deref().unwrap_or("unknown error")
    );
  });

  let mut events = ctx.queue.subscribe();
  let printer = tokio::spawn(async move {
    loop {
      match events.recv().await {
        Ok(event) => println!("{:?}", event),
        Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "queue events dropped"),
        Err(RecvError::Closed) => break,
      }
    }
  });

  let tasks = ctx.start();
  println!("watching {} (Ctrl-C to stop)", ctx.origin());

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  for task in tasks {
    task.abort();
  }
  printer.abort();
  Ok(())
}
