pub mod cli;
pub mod clients;
pub mod config;
pub mod domain;
pub mod scheduler;
pub mod services;
pub mod state;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
pub use config::{Config, Credentials};
use scheduler::Scheduler;
use state::AppState;

/// Installs the tracing subscriber and, when enabled, the Prometheus recorder.
pub fn init_telemetry(
    config: &Config,
    serve_metrics: bool,
) -> anyhow::Result<Option<metrics_exporter_prometheus::PrometheusHandle>> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

    let mut log_level = config.general.log_level.clone();
    if config.general.suppress_connection_errors {
        log_level.push_str(",reqwest::retry=off,hyper_util=off");
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let fmt_layer = if config.general.json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if config.observability.loki_enabled {
        let url = url::Url::parse(&config.observability.loki_url).context("Invalid Loki URL")?;

        let mut builder = tracing_loki::builder();
        for (key, value) in &config.observability.loki_labels {
            builder = builder.label(key, value)?;
        }
        let (layer, task) = builder
            .extra_field("pid", std::process::id().to_string())?
            .build_url(url)?;

        tokio::spawn(task);

        registry.with(layer).init();
        info!(
            "Loki logging initialized at {}",
            config.observability.loki_url
        );
    } else {
        registry.init();
    }

    if !config.observability.metrics_enabled {
        return Ok(None);
    }

    let builder = PrometheusBuilder::new();
    let handle = match config.observability.metrics_port {
        Some(port) if serve_metrics => {
            builder
                .with_http_listener(([0, 0, 0, 0], port))
                .install()
                .context("Failed to install Prometheus exporter")?;
            info!("Prometheus metrics exposed on port {}", port);
            None
        }
        _ => Some(
            builder
                .install_recorder()
                .context("Failed to install Prometheus recorder")?,
        ),
    };

    Ok(handle)
}

/// Cancels `token` on SIGINT or SIGTERM.
pub fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Error listening for shutdown: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("Error installing SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {},
            () = terminate => {},
        }

        warn!("Shutdown signal received, finishing current step");
        token.cancel();
    });
}

pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let Some(command) = cli.command else {
        print_help();
        return Ok(());
    };

    if matches!(command, Commands::Init) {
        return cmd_init(cli.config.as_deref());
    }

    config.validate()?;
    let is_daemon = matches!(command, Commands::Daemon);
    let _prometheus = init_telemetry(&config, is_daemon)?;

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    let state = AppState::new(config, Credentials::from_env(), cancel)?;

    match command {
        Commands::Run(args) => {
            cli::cmd_run(&state, &args).await?;
            Ok(())
        }
        Commands::Scan { attribute, limit } => cli::cmd_scan(&state, attribute, limit).await,
        Commands::Create(args) => cli::cmd_create(&state, &args).await,
        Commands::Daemon => run_daemon(state).await,
        Commands::Init => Ok(()),
    }
}

async fn run_daemon(state: AppState) -> anyhow::Result<()> {
    info!(
        "companion-enricher v{} starting in daemon mode...",
        env!("CARGO_PKG_VERSION")
    );

    for attribute in &state.config.scheduler.attributes {
        state
            .strategy(*attribute)
            .with_context(|| format!("Invalid settings for scheduled {attribute} runs"))?;
    }

    let scheduler = Scheduler::new(state.clone(), state.config.scheduler.clone());

    info!("Daemon running. Press Ctrl+C to stop.");
    scheduler.start().await?;

    info!("Daemon stopped");
    Ok(())
}

fn cmd_init(path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let path = path.map_or_else(Config::default_config_path, std::path::Path::to_path_buf);

    if Config::create_default_if_missing(&path)? {
        println!("✓ Created default config at {}", path.display());
    } else {
        println!("Config already exists at {}", path.display());
    }

    println!();
    println!("Credentials are read from the environment (or a .env file):");
    println!("  {}, {}", config::STORE_BASE_ENV, config::STORE_TOKEN_ENV);
    println!(
        "  {} (avatars), {} (descriptions, greetings)",
        config::IMAGE_TOKEN_ENV,
        config::TEXT_TOKEN_ENV
    );
    println!("  {} (where avatars are stored)", config::ARTIFACT_DIR_ENV);

    Ok(())
}

fn print_help() {
    println!(
        "companion-enricher v{} - fills missing companion avatars, descriptions and greetings",
        env!("CARGO_PKG_VERSION")
    );
    println!();
    println!("USAGE:");
    println!("  companion-enricher <COMMAND> [--config PATH]");
    println!();
    println!("COMMANDS:");
    println!("  run <attribute>     Enrich avatar | description | greeting");
    println!("      --dry-run         Log actions without generating or writing");
    println!("      --limit N         Maximum companions to process");
    println!("      --batch-size N    Companions per batch before a pause");
    println!("      --test            Process only a small test subset");
    println!("      --json            Print the summary as JSON");
    println!("  scan <attribute>    List eligible companions");
    println!("  create --name NAME  Insert a new companion");
    println!("  daemon              Run scheduled enrichment until interrupted");
    println!("  init                Create default config file");
}
