use anyhow::Context;

use dual_control::app::{create_router, AppState};
use dual_control::config::AppConfig;
use dual_control::services::EscalationSweeper;
use dual_control::{db, docs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let config = AppConfig::from_env()?;
    let port = config.port;
    let sweep_interval = config.sweep_interval;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let pool = db::init(&database_url).await?;

    let state = AppState::bootstrap(pool, config)?;

    let sweeper = sweep_interval.map(|interval| EscalationSweeper::new(state.workflows.clone(), interval).spawn());
    if sweeper.is_none() {
        tracing::info!("escalation sweep disabled");
    }

    let openapi = docs::build_openapi(port)?;
    let app = create_router(state).merge(docs::swagger_routes(openapi));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some((handle, stop)) = sweeper {
        let _ = stop.send(true);
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "escalation sweep task ended abnormally");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn load_env() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    let _ = dotenvy::from_path(crate_env);
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
