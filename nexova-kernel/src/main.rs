/**
 * NEXOVA KERNEL - Point d'entrée du simulateur de télémétrie industrielle
 *
 * RÔLE : Orchestration de tous les modules : config, store, hub, scheduler,
 * décisions autonomes, bridge MQTT, HTTP/WebSocket.
 *
 * ARRÊT (Ctrl-C) : HTTP s'arrête, le scheduler termine son tick en cours,
 * puis le superviseur de décisions draine dans le délai de grâce.
 */

mod anomaly_state;
mod classifier;
mod config;
mod decision;
mod generator;
mod health;
mod http;
mod hub;
mod models;
mod mqtt;
mod profiles;
mod scheduler;
mod store;
mod ws;

use crate::config::{load_config, DecisionMode, KernelConfig};
use crate::decision::dispatch::{spawn_decision_supervisor, DecisionDispatcher};
use crate::decision::http::HttpCollaborator;
use crate::decision::rules::RuleAdvisor;
use crate::decision::{DecisionCollaborator, DecisionInvoker, DecisionSinks};
use crate::generator::TelemetryGenerator;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::hub::BroadcastHub;
use crate::profiles::ProfileTable;
use crate::scheduler::TickScheduler;
use crate::store::JsonStore;

use anyhow::Context;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nexova_kernel=info")))
        .init();

    let cfg: KernelConfig = load_config().await;
    let health = HealthTracker::new();
    let profiles = Arc::new(ProfileTable::with_overrides(&cfg.profiles));

    // store : disque si possible, sinon mémoire seule
    let store = Arc::new(open_store(&cfg).await);

    let hub = Arc::new(BroadcastHub::new(Duration::from_secs(cfg.hub.heartbeat_seconds.max(1))));
    let heartbeat = hub.spawn_heartbeat();
    let reporter = health.spawn_health_reporter(hub.clone(), Duration::from_secs(cfg.hub.health_log_seconds.max(1)));

    let mqtt_bridge = cfg.mqtt.as_ref().map(|conf| {
        info!(host = %conf.host, port = conf.port, prefix = %conf.topic_prefix, "starting mqtt bridge");
        mqtt::spawn_mqtt_bridge(conf, hub.clone())
    });

    // décisions autonomes
    let collaborator = build_collaborator(&cfg).context("decision collaborator")?;
    let sinks = DecisionSinks {
        telemetry: store.clone(),
        statuses: store.clone(),
        alerts: store.clone(),
        audit: store.clone(),
    };
    let invoker = Arc::new(
        DecisionInvoker::new(collaborator, sinks, cfg.decision.timeout(), cfg.decision.history_limit).with_hub(hub.clone()),
    );
    let (dispatcher, requests) = DecisionDispatcher::channel(cfg.decision.max_in_flight, health.clone());
    let supervisor = spawn_decision_supervisor(invoker, requests, health.clone(), cfg.decision.shutdown_grace());

    // simulation
    let generator = match cfg.simulation.seed {
        Some(seed) => {
            info!(seed, "seeded telemetry generator");
            TelemetryGenerator::seeded(seed, cfg.simulation.probabilities())
        }
        None => TelemetryGenerator::from_entropy(cfg.simulation.probabilities()),
    };
    let mut scheduler = TickScheduler::new(
        store.clone(),
        store.clone(),
        hub.clone(),
        profiles.clone(),
        generator,
        dispatcher,
        health.clone(),
        cfg.simulation.tick_interval(),
    )
    .spawn();

    // HTTP
    let app_state = AppState {
        store,
        hub,
        health,
        profiles,
        outbound_buffer: cfg.hub.outbound_buffer,
    };
    let app = http::build_router(app_state);

    let addr: SocketAddr = cfg.server.bind.parse().with_context(|| format!("invalid bind address {}", cfg.server.bind))?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("bind {addr}"))?;
    info!(%addr, machines = cfg.machines.len(), mode = ?cfg.decision.mode, "nexova kernel listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).into_future();

    // un scheduler mort sans arrêt demandé arrête aussi le kernel
    let early_exit = tokio::select! {
        served = server => {
            served.context("http server")?;
            None
        }
        exited = scheduler.exited() => Some(exited),
    };

    // le scheduler rendu porte le dispatcher : le lâcher ferme la file de décisions
    let stopped = match early_exit {
        Some(exited) => {
            error!("tick scheduler exited without a stop request, shutting down");
            exited
        }
        None => scheduler.stop().await,
    };
    match stopped {
        Ok(stopped) => drop(stopped),
        Err(e) => error!(error = %e, "scheduler task ended abnormally"),
    }
    if let Err(e) = supervisor.await {
        warn!(error = %e, "decision supervisor ended abnormally");
    }

    heartbeat.abort();
    reporter.abort();
    if let Some(bridge) = mqtt_bridge {
        bridge.abort();
    }
    info!("nexova kernel stopped");
    Ok(())
}

async fn open_store(cfg: &KernelConfig) -> JsonStore {
    let capacity = cfg.storage.history_capacity;
    let Some(dir) = &cfg.storage.data_dir else {
        info!("no data dir configured, store kept in memory");
        return JsonStore::in_memory(capacity, &cfg.machines);
    };
    match JsonStore::open(dir, capacity, &cfg.machines).await {
        Ok(store) => {
            info!(data_dir = %dir, "json store opened");
            store
        }
        Err(e) => {
            warn!(data_dir = %dir, error = %e, "data dir unusable, store kept in memory");
            JsonStore::in_memory(capacity, &cfg.machines)
        }
    }
}

fn build_collaborator(cfg: &KernelConfig) -> anyhow::Result<Arc<dyn DecisionCollaborator>> {
    match (cfg.decision.mode, &cfg.decision.endpoint) {
        (DecisionMode::Remote, Some(endpoint)) => {
            let collaborator = HttpCollaborator::new(endpoint.clone(), cfg.decision.token.clone(), cfg.decision.timeout())?;
            info!(endpoint = %collaborator.endpoint(), authenticated = cfg.decision.token.is_some(), "remote decision service");
            Ok(Arc::new(collaborator))
        }
        (DecisionMode::Remote, None) => {
            warn!("remote decision mode without endpoint, falling back to rules");
            Ok(Arc::new(RuleAdvisor::new()))
        }
        (DecisionMode::Rules, _) => Ok(Arc::new(RuleAdvisor::new())),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
