use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tabgate::config::{ConfigWatcher, HostConfig};
use tabgate::policy::decision_log::run_decision_logger;
use tabgate::policy::{fuzzy_url, GatePolicy, PolicyEngine, ResourceKind, Verdict};
use tabgate::session::{self, SessionLock, AUTOSAVE};
use tabgate::storage::Storage;
use tabgate::{crash, governor, HostContext};

#[derive(Parser)]
#[command(
    name = "tabgate",
    about = "tabgate — policy-gated browser tab and session host",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for sessions, policies, and the SQLite database
    #[arg(long, env = "TABGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TABGATE_LOG")]
    log: Option<String>,

    /// Log output format: pretty (default) or json
    #[arg(long, env = "TABGATE_LOG_FORMAT")]
    log_format: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TABGATE_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the host in the foreground (default when no subcommand given).
    ///
    /// Restores the last session lazily (no tab loads until focused),
    /// then runs the autosave and governor loops until Ctrl-C. A final
    /// snapshot is taken on clean shutdown.
    ///
    /// Examples:
    ///   tabgate serve
    ///   tabgate
    Serve,
    /// Inspect and prune saved sessions.
    ///
    /// Examples:
    ///   tabgate session list
    ///   tabgate session show work
    ///   tabgate session prune --keep 5
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Query and edit the resource-gate policy.
    ///
    /// `check` prints the verdict for one request and exits 0 (allow),
    /// 2 (block), or 3 (ask). `allow`/`block`/`rm` edit the rule files
    /// in place.
    ///
    /// Examples:
    ///   tabgate policy check example.org https://cdn.net/lib.js --kind script
    ///   tabgate policy block "*.tracker.net"
    ///   tabgate policy list
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// List recorded crash reports.
    ///
    /// Examples:
    ///   tabgate crash list
    Crash {
        #[command(subcommand)]
        action: CrashAction,
    },
    /// Run diagnostic checks on host prerequisites.
    ///
    /// Checks data-dir writability, database accessibility, and policy
    /// file health, and lists known upstream issues.
    ///
    /// Exit code 0 if all checks pass, 1 if any check fails.
    ///
    /// Examples:
    ///   tabgate doctor
    Doctor,
}

#[derive(Subcommand)]
enum SessionAction {
    /// List saved snapshots, newest first.
    List,
    /// Show the tabs of a snapshot (latest when no name given).
    Show { name: Option<String> },
    /// Keep only the newest N autosaves.
    Prune {
        #[arg(long, default_value_t = 10)]
        keep: u32,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Decide one request: origin, target URL, resource kind.
    Check {
        /// The requesting tab's origin (bare hosts get https://)
        origin: String,
        /// The resource URL being requested
        url: String,
        /// document|subframe|script|stylesheet|image|media|cookie|other
        #[arg(long, default_value = "other")]
        kind: ResourceKind,
    },
    /// Add a host pattern to the allow list.
    Allow { pattern: String },
    /// Add a host pattern to the block list.
    Block { pattern: String },
    /// Remove a host pattern from both lists.
    Rm { pattern: String },
    /// Print both rule lists.
    List,
}

#[derive(Subcommand)]
enum CrashAction {
    /// List crash reports, newest first.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Serve);

    let config = HostConfig::new(args.data_dir, args.log, args.log_format);

    // Utility commands keep quiet unless asked; serve logs at the
    // configured level.
    let level = match command {
        Command::Serve => config.log.clone(),
        _ => std::env::var("TABGATE_LOG").unwrap_or_else(|_| "warn".to_string()),
    };
    let _log_guard = init_tracing(&level, &config.log_format, args.log_file.as_deref());

    match command {
        Command::Serve => serve(config).await,
        Command::Session { action } => session_cmd(config, action).await,
        Command::Policy { action } => policy_cmd(config, action),
        Command::Crash { action } => crash_cmd(config, action).await,
        Command::Doctor => doctor(config).await,
    }
}

// ─── serve ────────────────────────────────────────────────────────────────────

async fn serve(config: HostConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "tabgate starting"
    );

    let ctx = HostContext::init(config).await?;

    // Crash marker: a stale lock means the previous run died.
    let (lock, stale) = SessionLock::acquire(&ctx.config.data_dir)?;
    if stale {
        ctx.reporter
            .record(None, "host did not shut down cleanly")
            .await;
    }

    crash::sync_known_issues(&ctx.storage, &ctx.config.data_dir).await?;
    let pruned = ctx
        .storage
        .prune_crash_reports(ctx.config.session.prune_days)
        .await?;
    if pruned > 0 {
        info!(pruned, "old crash reports pruned");
    }

    match ctx.session_manager.restore_latest().await? {
        Some(row) => info!(session = %row.name, tabs = row.tab_count, "last session restored (lazy)"),
        None => info!("no saved session — starting empty"),
    }

    let watcher = ConfigWatcher::start(&ctx.config.data_dir);
    let hot = watcher.as_ref().map(|w| w.hot.clone());

    tokio::spawn(run_decision_logger(
        ctx.bus.subscribe(),
        ctx.decision_log.clone(),
    ));
    tokio::spawn(governor::run_governor_loop(
        ctx.governor.clone(),
        ctx.registry.clone(),
        ctx.bus.clone(),
    ));
    tokio::spawn(session::run_autosave_loop(
        ctx.session_manager.clone(),
        hot,
    ));

    info!("tabgate ready");
    tokio::signal::ctrl_c().await?;
    info!(
        uptime_secs = ctx.started_at.elapsed().as_secs(),
        "shutting down"
    );

    if !ctx.registry.read().await.is_empty() {
        if let Err(e) = ctx.session_manager.save(AUTOSAVE, "autosave").await {
            warn!(err = %e, "final session save failed");
        }
    }
    lock.release();
    Ok(())
}

// ─── session ──────────────────────────────────────────────────────────────────

async fn session_cmd(config: HostConfig, action: SessionAction) -> Result<()> {
    let storage = Storage::new(&config.data_dir).await?;
    match action {
        SessionAction::List => {
            let sessions = storage.list_sessions().await?;
            if sessions.is_empty() {
                println!("no saved sessions");
                return Ok(());
            }
            for s in sessions {
                println!(
                    "{:<12} {:<10} {:>4} tabs  {}",
                    s.name, s.kind, s.tab_count, s.saved_at
                );
            }
        }
        SessionAction::Show { name } => {
            let row = match name {
                Some(n) => storage.get_session_named(&n).await?,
                None => storage.latest_session().await?,
            };
            let Some(row) = row else {
                println!("no such session");
                std::process::exit(1);
            };
            println!("{} ({}, saved {})", row.name, row.kind, row.saved_at);
            for (i, tab) in storage.session_tabs(&row.id).await?.iter().enumerate() {
                let marker = if i as i64 == row.focused_index { "*" } else { " " };
                println!(
                    "{marker} [{:<9}] {}  {}",
                    tab.state,
                    tab.url.as_deref().unwrap_or("-"),
                    tab.title
                );
            }
        }
        SessionAction::Prune { keep } => {
            let deleted = storage.prune_autosaves(keep).await?;
            println!("pruned {deleted} autosave snapshot(s)");
        }
    }
    Ok(())
}

// ─── policy ───────────────────────────────────────────────────────────────────

fn policy_cmd(config: HostConfig, action: PolicyAction) -> Result<()> {
    let engine = PolicyEngine::open(&config.data_dir, config.gate.to_policy());
    match action {
        PolicyAction::Check { origin, url, kind } => {
            let origin = fuzzy_url(&origin)
                .map_err(|e| anyhow::anyhow!("invalid origin {origin:?}: {e}"))?;
            let url =
                fuzzy_url(&url).map_err(|e| anyhow::anyhow!("invalid url {url:?}: {e}"))?;
            let request = tabgate::policy::ResourceRequest::new(url, kind);
            let decision = engine.decide(Some(&origin), &request);
            let party = if decision.third_party {
                "third-party"
            } else {
                "first-party"
            };
            println!("{} ({party}, {:?})", decision.verdict, decision.reason);
            std::process::exit(match decision.verdict {
                Verdict::Allow => 0,
                Verdict::Block => 2,
                Verdict::Ask => 3,
            });
        }
        PolicyAction::Allow { pattern } => {
            let p = engine.allow_host(&pattern)?;
            println!("allow += {p}");
        }
        PolicyAction::Block { pattern } => {
            let p = engine.block_host(&pattern)?;
            println!("block += {p}");
        }
        PolicyAction::Rm { pattern } => {
            if engine.remove_host(&pattern)? {
                println!("removed {pattern}");
            } else {
                println!("{pattern} was not on either list");
                std::process::exit(1);
            }
        }
        PolicyAction::List => {
            println!("# allow");
            for p in engine.allow_patterns() {
                println!("{p}");
            }
            println!("# block");
            for p in engine.block_patterns() {
                println!("{p}");
            }
        }
    }
    Ok(())
}

// ─── crash ────────────────────────────────────────────────────────────────────

async fn crash_cmd(config: HostConfig, action: CrashAction) -> Result<()> {
    let storage = Storage::new(&config.data_dir).await?;
    match action {
        CrashAction::List => {
            let reports = storage.list_crash_reports().await?;
            if reports.is_empty() {
                println!("no crash reports");
                return Ok(());
            }
            for r in reports {
                // Fingerprints are 64 hex chars; the first 12 are
                // plenty for eyeballing duplicates.
                let fp = r
                    .url_fingerprint
                    .as_deref()
                    .and_then(|h| h.get(..12))
                    .unwrap_or("-");
                println!("{}  url#{fp:<12}  {}", r.occurred_at, r.reason);
            }
        }
    }
    Ok(())
}

// ─── doctor ───────────────────────────────────────────────────────────────────

async fn doctor(config: HostConfig) -> Result<()> {
    let mut failed = false;

    // Data dir writable?
    let probe = config.data_dir.join(".doctor-probe");
    match std::fs::create_dir_all(&config.data_dir)
        .and_then(|_| std::fs::write(&probe, b"ok"))
    {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            println!("ok   data dir writable ({})", config.data_dir.display());
        }
        Err(e) => {
            failed = true;
            println!("FAIL data dir not writable: {e}");
        }
    }

    // Database opens?
    match Storage::new(&config.data_dir).await {
        Ok(storage) => {
            let sessions = storage.count_sessions().await.unwrap_or(0);
            println!("ok   database opens ({sessions} saved session(s))");

            let issues = storage.list_known_issues().await.unwrap_or_default();
            for issue in issues {
                println!("note known issue [{}]: {}", issue.component, issue.summary);
            }
        }
        Err(e) => {
            failed = true;
            println!("FAIL database: {e}");
        }
    }

    // Policy files parse? (Engine falls back on malformed lines; report counts.)
    let engine = PolicyEngine::open(&config.data_dir, GatePolicy::default());
    println!(
        "ok   policy lists load ({} allow, {} block)",
        engine.allow_patterns().len(),
        engine.block_patterns().len()
    );

    if failed {
        std::process::exit(1);
    }
    println!("all checks passed");
    Ok(())
}

// ─── tracing ──────────────────────────────────────────────────────────────────

fn init_tracing(
    log: &str,
    log_format: &str,
    log_file: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

    let filter = EnvFilter::try_new(log).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_writer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(|s| s.to_os_string())
                .unwrap_or_else(|| "tabgate.log".into());
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .with(file_writer.map(|w| {
                tracing_subscriber::fmt::layer().with_ansi(false).with_writer(w)
            }))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(file_writer.map(|w| {
                tracing_subscriber::fmt::layer().with_ansi(false).with_writer(w)
            }))
            .init();
    }
    guard
}
