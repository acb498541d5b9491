use metering_service::config::MeteringConfig;
use metering_service::services::init_metrics;
use metering_service::startup::Application;
use metering_service::workers::CycleOutcome;
use service_core::observability::init_tracing;
use std::process::ExitCode;
use tokio::signal;

const SERVICE_NAME: &str = "metering-service";

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match MeteringConfig::load() {
        Ok(config) => config,
        Err(e) => {
            let _ = init_tracing(SERVICE_NAME, "info", None);
            tracing::error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(
        SERVICE_NAME,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    ) {
        eprintln!("Failed to initialize tracing: {}", e);
        return ExitCode::FAILURE;
    }

    // Initialize metrics registry (must be before any metrics are recorded)
    init_metrics();
    config.summary();

    let app = match Application::build(config).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("Failed to build application: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = app.preflight().await {
        tracing::error!("Startup checks failed: {}", e);
        return ExitCode::FAILURE;
    }

    if app.run_once() {
        tracing::info!("Running a single export cycle");
        return match app.run_cycle().await {
            Ok(CycleOutcome::Failed(month)) => {
                tracing::error!(month = %month, "Export cycle failed");
                ExitCode::FAILURE
            }
            Ok(_) => ExitCode::SUCCESS,
            Err(_) => ExitCode::FAILURE,
        };
    }

    app.run_until_stopped(shutdown_signal()).await;
    tracing::info!("Metering service stopped");
    ExitCode::SUCCESS
}
