use std::process::ExitCode;
use std::sync::Arc;

use permit_api::config::Config;
use permit_api::db::{self, PgStore};
use permit_api::services::payments::{HttpPaymentGateway, PaymentGateway};
use permit_api::services::sms::HttpSmsNotifier;
use permit_api::state::AppState;
use permit_core::notify::{DisabledNotifier, Notifier};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Fatal error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    tracing::info!(addr = %config.listen_addr, "Starting permit portal API");

    let pool = db::create_pool(&config.database_url).await?;
    db::apply_schema(&pool).await?;
    tracing::info!("Connected to PostgreSQL");

    let store = Arc::new(PgStore::new(pool));
    let listener_task = store.spawn_change_listener().await?;

    let notifier: Arc<dyn Notifier> = match HttpSmsNotifier::from_config(&config.sms)? {
        Some(sms) => Arc::new(sms),
        None => {
            tracing::warn!("SMS_API_KEY not set; applicant notifications disabled");
            Arc::new(DisabledNotifier)
        }
    };
    let payments: Option<Arc<dyn PaymentGateway>> =
        match HttpPaymentGateway::from_config(&config.payment)? {
            Some(gateway) => Some(Arc::new(gateway)),
            None => {
                tracing::warn!("PAYMENT_API_KEY not set; checkout disabled");
                None
            }
        };
    if config.payment.webhook_secret.is_none() {
        tracing::warn!("PAYMENT_WEBHOOK_SECRET not set; payment webhooks will be refused");
    }

    let listen_addr = config.listen_addr;
    let state = AppState::new(config, store, notifier, payments);
    let app = permit_api::build_app(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    permit_api::serve(listener, app, shutdown_signal()).await?;

    listener_task.abort();
    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Received shutdown signal");
}
