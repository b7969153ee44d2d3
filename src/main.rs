//! Entitlement Sync Server - Main Application Entry Point
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool and run migrations
//! 3. Clear `pending_payment` flags left by an unclean shutdown
//! 4. Spawn the background loop (reconcile, prune, notify)
//! 5. Serve the feed and payment callbacks until Ctrl-C

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use entitlement_sync_server::{
    config::Config,
    db,
    delivery::{MessageSender, TelegramSender},
    handlers,
    panel::{PanelClient, XuiPanel},
    payments::yookassa::YooKassaApi,
    services::{
        notifier::Notifier,
        payment_gate::PaymentGate,
        provisioning::Provisioner,
        reconciler::Reconciler,
        scheduler::Scheduler,
        subscription_service::SubscriptionService,
    },
    state::AppState,
    store::{EntitlementStore, PgStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG, defaults to "info"
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn EntitlementStore> = Arc::new(PgStore::new(pool));
    let panel: Arc<dyn PanelClient> = Arc::new(XuiPanel::new(config.panel_timeout())?);
    let provisioner = Arc::new(Provisioner::new(
        store.clone(),
        panel.clone(),
        config.panel_timeout(),
    ));

    let gate = PaymentGate::new(store.clone(), provisioner.clone());
    gate.reset_pending().await?;

    let notifier = match config.telegram_bot_token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => {
            let sender: Arc<dyn MessageSender> =
                Arc::new(TelegramSender::new(token, config.panel_timeout())?);
            Some(Notifier::new(store.clone(), sender))
        }
        None => None,
    };

    let scheduler = Scheduler::new(
        store.clone(),
        Reconciler::new(
            store.clone(),
            panel.clone(),
            config.grace_period(),
            config.panel_timeout(),
        ),
        notifier,
        config.notification_retention(),
        config.sync_interval(),
        config.startup_delay(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = tokio::spawn(scheduler.run(shutdown_rx));

    let state = AppState {
        store: store.clone(),
        subscriptions: Arc::new(SubscriptionService::new(
            store,
            provisioner,
            config.traffic_timeout(),
        )),
        gate,
        yookassa: Arc::new(YooKassaApi::new(config.panel_timeout())?),
    };
    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Could not listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    background.await?;

    tracing::info!("Server stopped");
    Ok(())
}
