use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bluelink_telemetry::collector::{AppState, Collector};
use bluelink_telemetry::config::AppConfig;
use bluelink_telemetry::vendor::{SimulatedVendor, VendorApi};
use bluelink_telemetry::{api, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = AppConfig::load()?;
    telemetry::init_tracing(&cfg.telemetry);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let run_once = args.iter().any(|a| a == "--once");
    let serve_only = args.iter().any(|a| a == "--serve-only");

    // The vendor SDK is an external collaborator; the bundled simulated
    // backend stands in for it here.
    let vehicle_id = cfg.api.vehicle_id.clone().unwrap_or_else(|| "SIMVIN001".to_string());
    let vendor: Arc<dyn VendorApi> = Arc::new(SimulatedVendor::new(vehicle_id));

    let state = AppState::new(cfg.clone(), vendor).await?;

    if run_once {
        let collector = Collector::new(Arc::new(state), CancellationToken::new());
        let ok = collector.run_once().await;
        std::process::exit(if ok { 0 } else { 1 });
    }

    let cancel = CancellationToken::new();
    if !serve_only {
        let collector = Collector::new(Arc::new(state.clone()), cancel.clone());
        tokio::spawn(async move {
            collector.run_forever().await;
        });
    }

    let app = api::router(state);
    let addr = cfg.server.socket_addr()?;
    info!(%addr, "starting bluelink-telemetry dashboard");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            telemetry::shutdown_signal().await;
            shutdown_cancel.cancel();
        })
        .await?;

    warn!("shutdown complete");
    Ok(())
}
