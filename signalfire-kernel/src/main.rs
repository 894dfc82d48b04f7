/**
 * SIGNALFIRE KERNEL - Point d'entrée de l'agrégateur de santé de flotte
 *
 * RÔLE : Orchestration de tous les modules : config, directors, cache, collator,
 * scheduler, HTTP. Toute erreur de démarrage est fatale avant de servir du trafic.
 *
 * ARCHITECTURE : Scheduler -> Cache -> (notification) -> Collator -> API REST.
 * UTILITÉ : Vue unique et toujours fraîche de l'inventaire de plusieurs directors BOSH.
 */

mod cache;
mod collator;
mod config;
mod director;
mod http;
mod logging;
mod models;
mod scheduler;
mod state;

use crate::cache::Cache;
use crate::collator::Collator;
use crate::config::{KernelConfig, LogLevel};
use crate::director::{connect_within, BoshClient};
use crate::http::AppState;
use crate::scheduler::{Director, Scheduler};
use crate::state::{shutdown_channel, shutdown_requested};

use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let cfg_path = config::config_path();
    let cfg = match config::load_config(&cfg_path).await {
        Ok(cfg) => cfg,
        Err(e) => {
            logging::init(LogLevel::Info);
            logging::fatal(format_args!("Error loading config at `{cfg_path}': {e}"));
        }
    };

    // niveau déjà validé au chargement
    logging::init(cfg.log_level().unwrap_or(LogLevel::Info));
    tracing::info!(path = %cfg_path, targets = cfg.targets.len(), "using configuration file");

    if let Err(e) = run(cfg).await {
        logging::fatal(format_args!("{e:#}"));
    }
}

async fn run(cfg: KernelConfig) -> anyhow::Result<()> {
    let cache = Arc::new(Cache::new());

    // directors : une connexion par cible, échec = config inutilisable
    let mut scheduler = Scheduler::new(cache.clone());
    let mut poll_intervals = HashMap::new();
    for target in &cfg.targets {
        let client = BoshClient::new(target)
            .with_context(|| format!("Error initializing director client for URL `{}'", target.url))?;
        connect_within(&client, target.fetch_timeout())
            .await
            .with_context(|| format!("Could not connect to director `{}'", target.id()))?;

        poll_intervals.insert(target.id(), target.poll_interval());
        scheduler.add_director(Director {
            id: target.id(),
            client: Arc::new(client),
            poll_interval: target.poll_interval(),
            fetch_timeout: target.fetch_timeout(),
        });
    }

    // collator : règles dans l'ordre du fichier
    let collator = Arc::new(Collator::with_rules(cfg.compile_rules()?));
    tracing::info!(rules = ?collator.rule_patterns(), "collation rules loaded");

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let mut background = vec![collator.watch_async(cache.clone(), shutdown_rx.clone())];
    background.extend(scheduler.start(shutdown_rx.clone()));

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        cache,
        collator,
        poll_intervals: Arc::new(poll_intervals),
        api_key: cfg.server.api_key.clone(),
    };
    if app_state.api_key.is_none() {
        tracing::warn!("server.api_key not set - API is open to anyone who can reach it");
    }
    let app = http::build_router(app_state);

    let addr = cfg.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Could not bind HTTP listener on {addr}"))?;
    tracing::info!("listening on http://{addr}");

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown requested, stopping background loops");
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_requested(&mut server_shutdown).await })
        .await
        .context("HTTP server exited")?;

    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    tracing::info!("kernel stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
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
}
