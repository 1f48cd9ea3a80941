use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use kobold_gateway::backend::BackendClient;
use kobold_gateway::clock::SystemClock;
use kobold_gateway::config::{Args, Command, ConfigAction, Settings};
use kobold_gateway::handlers::router;
use kobold_gateway::health::{cache_sweeper, health_checker};
use kobold_gateway::state::AppState;

// how often expired cache entries are swept
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // parse cli arguments
    let args = Args::parse();
    let settings = Settings::load(&args).context("failed to load configuration")?;
    init_tracing(&args, &settings);

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        Command::Check { url } => check(settings, url).await,
        Command::Config { action } => config(settings, action),
    }
}

fn init_tracing(args: &Args, settings: &Settings) {
    let level = if args.verbose {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        settings.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(settings: Settings) -> Result<()> {
    settings.validate().context("invalid configuration")?;

    let state = Arc::new(AppState::from_settings(settings.clone()));
    let gateway = Arc::clone(&state.gateway);

    // spawn the background workers
    let interval = Duration::from_secs(settings.koboldcpp.health_interval_secs.max(1));
    tokio::spawn(health_checker(
        Arc::clone(gateway.health()),
        Arc::clone(gateway.client()),
        interval,
    ));
    if let Some(cache) = gateway.cache() {
        tokio::spawn(cache_sweeper(Arc::clone(cache), CACHE_SWEEP_INTERVAL));
    }

    let app = router(state);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %addr, "gateway listening on http://{addr}/mcp");
    info!(url = %settings.koboldcpp.url, "forwarding to KoboldCpp");
    info!(
        max_concurrent = settings.performance.max_concurrent_requests,
        queue = settings.performance.request_queue_size,
        caching = settings.performance.enable_caching,
        cache_ttl_secs = settings.performance.cache_ttl_secs,
        auth = settings.security.enable_auth,
        "dispatcher configured"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn check(mut settings: Settings, url: Option<String>) -> Result<()> {
    if let Some(url) = url {
        settings.koboldcpp.url = url;
    }
    let client = BackendClient::new(settings.koboldcpp.clone(), Arc::new(SystemClock));
    let status = client.status().await;

    if !status.online {
        bail!("KoboldCpp at {} is not reachable", settings.koboldcpp.url);
    }
    println!("{}", serde_json::to_string_pretty(&status)?);
    if !status.model_loaded {
        warn!("server is online but no model is loaded");
    }
    Ok(())
}

fn config(settings: Settings, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(&redacted(settings))?);
        }
        ConfigAction::Validate => {
            settings.validate().context("configuration is invalid")?;
            println!("configuration is valid");
        }
        ConfigAction::Init { path, overwrite } => write_default_config(&path, overwrite)?,
    }
    Ok(())
}

fn redacted(mut settings: Settings) -> Settings {
    if settings.security.auth_token.is_some() {
        settings.security.auth_token = Some("***".to_string());
    }
    settings
}

fn write_default_config(path: &Path, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        bail!("{} already exists, pass --overwrite to replace it", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_string_pretty(&Settings::default())?;
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote default configuration to {}", path.display());
    Ok(())
}
