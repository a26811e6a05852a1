//! Admission gate service
//!
//! This is the main entry point for the admission service.
//! It loads configuration, connects the counter store and starts the web
//! server with every route behind the admission middleware.

use std::sync::Arc;
use std::time::Duration;

use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;

use admission_gate::api::middleware::AdmissionGate;
use admission_gate::api::{self, ApiState};
use admission_gate::config::load_config;
use admission_gate::models::StoreBackend;
use admission_gate::store::{CounterStore, MemoryStore, RedisStore};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting admission gate...");

    let config = load_config().context("Failed to load configuration")?;

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let mut memory = None;
    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::new(&config.redis).context("Failed to create Redis client")?,
        ),
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            memory = Some(store.clone());
            store
        }
    };
    if let Err(err) = store.ping().await {
        // Admission fails open until the store answers
        warn!("Counter store not reachable at startup: {}", err);
    }
    info!("Using {} counter store", store.backend());

    if config.admin.enabled && config.admin.token.is_none() {
        warn!(
            "Admin routes are enabled without a token; anyone who can reach them can ban and reset"
        );
    }

    let bind = (config.server.host.clone(), config.server.port);
    let sweep_every = Duration::from_secs(config.store.sweep_interval_seconds);
    let state = web::Data::new(
        ApiState::new(config, store, Some(metrics)).context("Invalid policy configuration")?,
    );

    if let Some(memory) = memory {
        let max_window = state
            .controller
            .limiter()
            .policies()
            .max_window_seconds()
            .max(state.controller.detector().window_seconds());
        MemoryStore::spawn_sweeper(memory, max_window, sweep_every);
        info!("Sweeping the memory store every {:?}", sweep_every);
    }
    let gate = AdmissionGate::new(state.controller.clone());

    info!("Listening on {}:{}", bind.0, bind.1);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(gate.clone())
            .wrap(Logger::default())
            .configure(api::config)
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}
