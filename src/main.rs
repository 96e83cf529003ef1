//! powerd: embedded power-management controller.
//!
//! Assembles the runtime: hardware backend, relay authority, sensor
//! poller, rule engine, scheduler, configuration manager, command bus and
//! the HTTP/WebSocket server. Shutdown runs in dependency order: the
//! scheduler stops ticking first, stream connections close with a
//! normal-closure code, the sink flushes, and the GPIO handles are
//! released last.

use anyhow::{Context, Result};
use clap::Parser;
use powerd::api::{self, AppState, AuthContext};
use powerd::bus::{ControlHandle, Dispatcher};
use powerd::config::ConfigManager;
use powerd::hardware::{Hardware, Watchdog};
use powerd::relay::RelayAuthority;
use powerd::rules::{LatchStore, RuleEngine};
use powerd::schedule::Scheduler;
use powerd::sensor::{SensorCatalog, SensorPoller};
use powerd::settings::Settings;
use powerd::store::{connect_cache, influx::InfluxSettings, InfluxQuery, InfluxSink};
use powerd::stream::StreamHub;
use powerd::system::UsageSampler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "powerd", about = "Embedded power-management controller")]
struct Args {
    /// Listen address, overrides POWERD_LISTEN_ADDR.
    #[arg(long)]
    listen: Option<String>,

    /// Default configuration document, overrides POWERD_DEFAULT_CONFIG_PATH.
    #[arg(long)]
    default_config: Option<PathBuf>,

    /// Custom configuration document, overrides POWERD_CUSTOM_CONFIG_PATH.
    #[arg(long)]
    custom_config: Option<PathBuf>,
}

fn open_hardware() -> Result<Arc<dyn Hardware>> {
    #[cfg(feature = "raspi")]
    {
        let hw = powerd::hardware::rpi::RpiHardware::new()
            .context("opening GPIO chip; is this a Raspberry Pi?")?;
        info!("using rppal hardware backend");
        Ok(Arc::new(hw))
    }
    #[cfg(not(feature = "raspi"))]
    {
        warn!("built without the 'raspi' feature, using the mock hardware backend");
        Ok(Arc::new(powerd::hardware::MockHardware::new()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_env().context("reading environment settings")?;
    if let Some(listen) = args.listen {
        settings.listen_addr = listen;
    }
    if let Some(path) = args.default_config {
        settings.default_config_path = path;
    }
    if let Some(path) = args.custom_config {
        settings.custom_config_path = path;
    }
    info!(app = %settings.app_name, "starting");

    // Hardware first: a missing GPIO chip is fatal.
    let hardware = open_hardware()?;
    let watchdog = Watchdog::new(settings.watchdog_path.clone());

    // Configuration. An unreadable default document is fatal.
    let catalog = SensorCatalog::new(settings.sensors.clone());
    let config = Arc::new(
        ConfigManager::load(
            settings.default_config_path.clone(),
            settings.custom_config_path.clone(),
            catalog,
        )
        .await
        .context("loading configuration")?,
    );

    // External stores.
    let cache = connect_cache(settings.redis_url.as_deref()).await;
    let influx = InfluxSettings {
        url: settings.influxdb_url.clone(),
        org: settings.influxdb_org.clone(),
        bucket: settings.influxdb_bucket.clone(),
        token: settings.influxdb_token.clone(),
    };
    let (sink, sink_task) = InfluxSink::new(influx.clone()).spawn();
    let query = InfluxQuery::new(influx);

    // Relay authority, wired to follow config reloads.
    let authority = Arc::new(RelayAuthority::new(hardware.clone()));
    authority.apply_config(&config.effective().relays).await;
    {
        let authority = authority.clone();
        config
            .register_listener(Box::new(move |doc| {
                let authority = authority.clone();
                Box::pin(async move {
                    authority.apply_config(&doc.relays).await;
                })
            }))
            .await;
    }

    // Command bus.
    let (bus_tx, bus_rx) = tokio::sync::mpsc::channel(64);
    let bus = ControlHandle::new(bus_tx);

    // Rule engine with hydrated latches.
    let latches = Arc::new(LatchStore::new(cache.clone()));
    latches
        .hydrate(config.effective().tasks.iter().map(|r| r.id.clone()))
        .await;
    let engine = RuleEngine::new(
        config.clone(),
        latches.clone(),
        bus.clone(),
        cache.clone(),
        watchdog.clone(),
    );

    // Sensor poller.
    let poller = SensorPoller::new(
        hardware.clone(),
        settings.sensors.clone(),
        sink.clone(),
        engine.clone(),
    );

    // Dispatcher actor.
    let dispatcher = Dispatcher::new(
        authority.clone(),
        config.clone(),
        latches.clone(),
        cache.clone(),
        watchdog.clone(),
    );
    let dispatcher_task = tokio::spawn(dispatcher.run(bus_rx));

    // Periodic loops.
    let usage = Arc::new(UsageSampler::new());
    let usage_cache = usage.cache();
    let scheduler = Scheduler::new(
        config.clone(),
        poller.clone(),
        bus.clone(),
        authority.state_cache(),
        sink.clone(),
        usage,
    )
    .spawn();

    // HTTP/WebSocket surface.
    let hub = StreamHub::new(
        poller.latest_samples(),
        authority.state_cache(),
        usage_cache,
        config.clone(),
    );
    let auth = AuthContext::from_settings(&settings)?;
    let state = AppState {
        bus: bus.clone(),
        config: config.clone(),
        hub: hub.clone(),
        poller: poller.clone(),
        query,
        bucket: settings.influxdb_bucket.clone(),
        auth,
    };
    let router = api::router(state);

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("binding {}", settings.listen_addr))?;
    info!(addr = %settings.listen_addr, "listening");

    let (server_stop_tx, server_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_stop_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Ordered shutdown: stop ticks, close streams with a normal-closure
    // code, drain the sink, release hardware last.
    info!("shutting down");
    scheduler.shutdown().await;
    hub.close_all();
    let _ = server_stop_tx.send(());
    drop(poller);
    drop(engine);
    drop(bus);
    drop(sink);
    if tokio::time::timeout(Duration::from_secs(10), sink_task)
        .await
        .is_err()
    {
        warn!("sink did not flush within the shutdown deadline");
    }
    match tokio::time::timeout(Duration::from_secs(10), server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "server exited with an error"),
        Ok(Err(e)) => warn!(error = %e, "server task panicked"),
        Err(_) => warn!("server did not stop within the shutdown deadline"),
    }
    dispatcher_task.abort();
    drop(authority);
    drop(hardware);
    info!("goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
