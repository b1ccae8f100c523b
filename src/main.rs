//! speedtest-monitor - internet speed monitoring with Telegram reports.
//!
//! # Modes
//!
//! - `single`: run a speedtest on this host and notify chats.
//! - `node`: run a speedtest and report it to a master.
//! - `master`: collect node reports over HTTP and publish aggregated reports.
//!
//! Single and node modes perform one cycle and exit; schedule them with cron
//! or a systemd timer. Master mode runs until SIGINT or SIGTERM.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use speedtest_monitor::aggregation::AggregationSettings;
use speedtest_monitor::api::{AppState, router};
use speedtest_monitor::config::{Config, Mode, parse_level, resolve_config_path};
use speedtest_monitor::master::MasterService;
use speedtest_monitor::node::run_node;
use speedtest_monitor::notifier::ReportNotifier;
use speedtest_monitor::prefs::PrefsStore;
use speedtest_monitor::single::run_single;
use speedtest_monitor::telegram::TelegramClient;

/// Monitor internet speed and report it to Telegram.
#[derive(Parser, Debug)]
#[command(name = "speedtest-monitor", version, about)]
struct Cli {
    /// Configuration file (default: $CONFIG_PATH, then ./config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warning, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Override the configured mode
    #[arg(long, value_enum)]
    mode: Option<Mode>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref())?;
    let mut config = Config::load(&config_path)?;
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    config.validate()?;

    let level = match &cli.log_level {
        Some(level) => parse_level(level)?,
        None => config.logging.level_filter()?,
    };
    let _guard = setup_tracing(level, config.logging.file.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        mode = ?config.mode,
        "Speedtest monitor started"
    );

    match config.mode {
        Mode::Single => run_single(&config).await,
        Mode::Node => {
            let node = config.node.as_ref().context("node section is missing")?;
            run_node(node, &config.speedtest, &config.thresholds).await
        }
        Mode::Master => run_master(&config).await,
    }
}

/// Console logging, plus a daily-rotated file when `file` is set.
///
/// The returned guard flushes the file writer on drop.
fn setup_tracing(level: LevelFilter, file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::from_default_env().add_directive(format!("speedtest_monitor={level}").parse()?);

    let (file_layer, guard) = match file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .context("logging.file must name a file")?;
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

async fn run_master(config: &Config) -> anyhow::Result<()> {
    let master_config = config.master.as_ref().context("master section is missing")?;
    let schedule = master_config.effective_schedule();

    let prefs = PrefsStore::new(&master_config.prefs_database_url).await?;
    info!(db_url = %master_config.prefs_database_url, "Chat preferences database initialized");

    let telegram = TelegramClient::new(config.telegram.bot_token.clone())?;
    let notifier = ReportNotifier::new(telegram, prefs, master_config.telegram_targets.clone())
        .with_defaults(
            config.telegram.default_language,
            config.telegram.default_view_mode,
        );

    let master = Arc::new(
        MasterService::new(AggregationSettings::from_master(master_config), schedule)
            .with_notifier(notifier),
    );

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(Arc::clone(&master).run_scheduler(cancel.clone()));
    let polling = tokio::spawn(Arc::clone(&master).run_polling(cancel.clone()));

    let state = AppState {
        master,
        api_token: master_config.api_token.clone(),
    };
    let app = router(state);

    let addr = format!("{}:{}", master_config.listen_host, master_config.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot listen on {addr}"))?;

    info!(%addr, targets = master_config.telegram_targets.len(), "Master is listening");

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let server_token = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await?;

    cancel.cancel();
    for (name, task) in [("scheduler", scheduler), ("polling", polling)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    info!("Master stopped");
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
