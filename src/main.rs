use anyhow::{Context, Result};
use phantom_kyc::{
    router, AppState, InMemoryCounterStore, InMemoryKycStore, KycConfig, KycService, LogNotifier,
    OperatorAlerts, RateLimitManager, SignatureValidator, StatusReconciler, VeriffClient,
    WebhookProcessor,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Check if we should enable tokio-console
    if std::env::var("TOKIO_CONSOLE").is_ok() {
        console_subscriber::init();
        info!("tokio-console enabled on port 6669");
    } else {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,phantom_kyc=debug"));
        fmt().with_env_filter(env_filter).with_target(true).init();
    }

    let config = KycConfig::from_env();

    // Create task tracker and cancellation token for coordinated shutdown
    let cancellation_token = CancellationToken::new();
    let task_tracker = TaskTracker::new();

    let store = Arc::new(
        InMemoryKycStore::load_snapshot(&config.state_file)
            .with_context(|| format!("loading {}", config.state_file.display()))?,
    );
    let client = Arc::new(
        VeriffClient::new(config.veriff.clone()).context("building provider client")?,
    );
    let alerts = Arc::new(OperatorAlerts::default());
    let service = Arc::new(KycService::new(
        store.clone(),
        client,
        Arc::new(LogNotifier),
        alerts,
    ));

    let counters = Arc::new(InMemoryCounterStore::new());
    let rate_limiter = Arc::new(RateLimitManager::new(
        counters.clone(),
        config.rate_limits.clone(),
    ));
    let reconciler = Arc::new(StatusReconciler::new(
        service.clone(),
        config.reconciler.clone(),
        cancellation_token.clone(),
    ));
    let webhook = Arc::new(WebhookProcessor::new(
        service.clone(),
        rate_limiter.clone(),
        SignatureValidator::new(config.webhook_secret.clone()),
    ));

    // Spawn the reconciliation job
    let reconciler_clone = reconciler.clone();
    task_tracker.spawn(async move {
        info!("🔄 Starting KYC status reconciler...");
        reconciler_clone.run().await;
    });

    // Periodic state saving
    let snapshot_token = cancellation_token.clone();
    let snapshot_store = store.clone();
    let state_file = config.state_file.clone();
    let snapshot_interval = config.snapshot_interval;
    task_tracker.spawn(async move {
        let mut save_interval = tokio::time::interval(snapshot_interval);
        loop {
            tokio::select! {
                _ = snapshot_token.cancelled() => {
                    info!("Snapshot saver cancelled, exiting");
                    break;
                }
                _ = save_interval.tick() => {
                    if let Err(e) = snapshot_store.save_snapshot(&state_file).await {
                        error!("Failed to save KYC state: {}", e);
                    }
                }
            }
        }
    });

    // Expired rate limit counters
    task_tracker.spawn(counters.run_cleanup(Duration::from_secs(60), cancellation_token.clone()));

    let app = router(AppState {
        service,
        rate_limiter,
        reconciler,
        webhook,
        admin_token: Arc::from(config.admin_token.as_str()),
    });

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid BIND_ADDR {}", config.bind_addr))?;

    println!("\nPhantom KYC service starting");
    println!("HTTP: http://{addr}");
    println!("\nConfiguration:");
    println!("- Provider: {}", config.veriff.base_url);
    println!("- Poll interval: {:?}", config.reconciler.poll_interval);
    println!("- Session expiry: {:?}", config.reconciler.session_expiry);
    println!("- State: {}", config.state_file.display());

    // Handle shutdown signal
    let shutdown_token = cancellation_token.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutdown signal received, stopping services...");
        shutdown_token.cancel();
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run server with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    info!("Server stopped, shutting down services...");

    // Signal all services to shutdown
    cancellation_token.cancel();

    // Close the task tracker to prevent new tasks from being spawned
    task_tracker.close();

    info!("Waiting for background tasks...");
    match tokio::time::timeout(Duration::from_secs(30), task_tracker.wait()).await {
        Ok(()) => info!("All background tasks completed successfully"),
        Err(_) => {
            error!("Timeout waiting for background tasks to complete");
            std::process::exit(1);
        }
    }

    // Final save
    store
        .save_snapshot(&config.state_file)
        .await
        .context("saving final KYC state")?;

    info!("Clean shutdown complete");

    Ok(())
}
