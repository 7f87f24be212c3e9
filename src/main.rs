//! maskrelayd - the relay fleet daemon.

use maskrelay::cache::{Cache, CacheBacking, MemoryBacking, RedisBacking};
use maskrelay::config::{Config, LogFormat};
use maskrelay::db::Database;
use maskrelay::father::Father;
use maskrelay::fleet::Fleet;
use maskrelay::voice::PassthroughVoice;
use relay_sdk::ClientFactory;
use relay_sdk::http::BotApiFactory;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `config.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (before tracing, so we can use log_format).
    let config_path = resolve_config_path();

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: Failed to load config from {}: {}", config_path, e);
        e
    })?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    if let Err(errors) = maskrelay::config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    info!(basedir = %config.basedir, "Starting maskrelayd");

    std::fs::create_dir_all(&config.basedir)?;
    let db_path = Path::new(&config.basedir).join("maskrelay.db");
    let db = Database::new(&db_path.to_string_lossy()).await?;

    let backing: Arc<dyn CacheBacking> = match &config.redis {
        Some(redis) => {
            let backing = RedisBacking::connect(
                &redis.host,
                redis.port,
                redis.db,
                redis.password.as_deref(),
            )
            .await
            .map_err(|e| anyhow::anyhow!("cache backing unavailable: {e}"))?;
            info!(host = %redis.host, port = redis.port, "External cache backing connected");
            Arc::new(backing)
        }
        None => {
            warn!("No external cache configured; cached state is lost on restart");
            Arc::new(MemoryBacking::new())
        }
    };
    let cache = Cache::new(backing);

    let factory = Arc::new(BotApiFactory::new(
        &config.tele.api_base,
        config.proxy.clone(),
    ));
    let voice = Arc::new(PassthroughVoice);
    let shutdown = CancellationToken::new();

    let fleet = Fleet::new(
        db.clone(),
        cache.clone(),
        factory.clone(),
        voice,
        config.father.invite_award_days,
        shutdown.child_token(),
    );
    let monitor = Arc::clone(&fleet)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let father = Father::new(
        factory.create(&config.father.token),
        db,
        Arc::clone(&fleet),
        config.father.invite_award_days,
        shutdown.child_token(),
    );
    let father_task = tokio::spawn(Arc::clone(&father).run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
        result = father_task => {
            match result {
                Ok(Ok(())) => info!("Operator service exited"),
                Ok(Err(e)) => error!(error = %e, "Operator service failed"),
                Err(e) => error!(error = %e, "Operator task panicked"),
            }
        }
    }

    shutdown.cancel();
    fleet.stop_all().await;
    let _ = monitor.await;
    info!("Shutdown complete");
    Ok(())
}
