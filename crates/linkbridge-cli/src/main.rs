//! `linkbridge` – runs the bridge.
//!
//! 1. Initialises tracing (see [`telemetry`]).
//! 2. Loads `~/.linkbridge/config.toml`, writing the defaults there on the
//!    first run, then applies `LINKBRIDGE_*` overrides.
//! 3. Builds the in-process bus, the protocol bridge and the notification
//!    engine.
//! 4. Binds the WebSocket and `/lrt` listeners, retrying every
//!    `retry_startup_delay_secs` until both bind or Ctrl-C arrives.
//! 5. Serves until Ctrl-C, then stops the notification engine.

mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use linkbridge_middleware::{AtomicCounter, Bridge, LocalBus};
use linkbridge_server::{BridgeHub, ResourceSurface, WsServer};
use linkbridge_types::BridgeError;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Config;

fn main() -> ExitCode {
    let _guard = telemetry::init_tracing("linkbridge");

    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bridge stopped with an error");
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Result<Config, String> {
    let path = config::config_path();
    if !path.exists() {
        match config::save(&Config::default()) {
            Ok(()) => info!(path = %path.display(), "wrote default configuration"),
            Err(e) => warn!(error = %e, "could not write default configuration"),
        }
    }
    let cfg = config::load()?;
    info!(?cfg, "configuration loaded");
    Ok(cfg)
}

async fn run(cfg: Config) -> Result<(), BridgeError> {
    let bridge = Bridge::new(
        Arc::new(LocalBus::new()),
        Arc::new(AtomicCounter::new()),
        cfg.protocol_settings()?,
    );
    let hub = BridgeHub::new(bridge, cfg.engine_config(), cfg.server_settings());
    let ws = WsServer::new(Arc::clone(&hub));
    let resource = ResourceSurface::new(Arc::clone(&hub));

    let Some((ws_listener, resource_listener)) = bind_with_retry(&ws, &resource, cfg.retry_startup_delay()).await
    else {
        info!("shutdown requested before the servers started");
        return Ok(());
    };

    hub.engine().start();
    let result = tokio::select! {
        () = ws.serve(ws_listener) => Ok(()),
        served = Arc::clone(&resource).serve(resource_listener) => served,
        signal = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            signal.map_err(|e| BridgeError::Channel(format!("signal handler: {e}")))
        }
    };
    hub.engine().stop().await;
    info!(
        delivered = hub.engine().delivered(),
        failed = hub.engine().failed(),
        "notification engine stopped"
    );
    result
}

/// Bind both listeners, retrying after `delay` until it works.  `None` when
/// Ctrl-C arrives first.
async fn bind_with_retry(
    ws: &WsServer,
    resource: &ResourceSurface,
    delay: Duration,
) -> Option<(TcpListener, TcpListener)> {
    loop {
        match bind_both(ws, resource).await {
            Ok(listeners) => return Some(listeners),
            Err(e) => warn!(error = %e, retry_in_secs = delay.as_secs_f64(), "unable to start server; retrying"),
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => return None,
        }
    }
}

async fn bind_both(ws: &WsServer, resource: &ResourceSurface) -> Result<(TcpListener, TcpListener), BridgeError> {
    let ws_listener = ws.bind().await?;
    let resource_listener = resource.bind().await?;
    Ok((ws_listener, resource_listener))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> Config {
        Config {
            address: "127.0.0.1".to_string(),
            port: 0,
            resource_port: 0,
            ..Config::default()
        }
    }

    fn hub_for(cfg: &Config) -> Result<Arc<BridgeHub>, BridgeError> {
        let bridge = Bridge::new(
            Arc::new(LocalBus::new()),
            Arc::new(AtomicCounter::new()),
            cfg.protocol_settings()?,
        );
        Ok(BridgeHub::new(bridge, cfg.engine_config(), cfg.server_settings()))
    }

    #[tokio::test]
    async fn both_listeners_bind() -> Result<(), Box<dyn std::error::Error>> {
        let cfg = ephemeral();
        let hub = hub_for(&cfg)?;
        let ws = WsServer::new(Arc::clone(&hub));
        let resource = ResourceSurface::new(hub);
        let (a, b) = bind_with_retry(&ws, &resource, Duration::from_millis(10))
            .await
            .ok_or("bind gave up")?;
        assert_ne!(a.local_addr()?.port(), 0);
        assert_ne!(b.local_addr()?.port(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn taken_port_is_retried() -> Result<(), Box<dyn std::error::Error>> {
        let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
        let cfg = Config {
            port: taken.local_addr()?.port(),
            ..ephemeral()
        };
        let hub = hub_for(&cfg)?;
        let ws = WsServer::new(Arc::clone(&hub));
        let resource = ResourceSurface::new(hub);

        let attempt = tokio::time::timeout(
            Duration::from_millis(100),
            bind_with_retry(&ws, &resource, Duration::from_millis(10)),
        )
        .await;
        assert!(attempt.is_err(), "bind should keep retrying while the port is taken");

        drop(taken);
        let listeners = bind_with_retry(&ws, &resource, Duration::from_millis(10)).await;
        assert!(listeners.is_some());
        Ok(())
    }
}
