use std::sync::Arc;

use forumchat::{
    AppState,
    broker::Broker,
    config::Config,
    db,
    history::SqliteHistoryStore,
    identity::SqliteIdentityResolver,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let db_pool = db::open(&config.database_url, config.db_max_connections).await?;
    db::migrate(&db_pool).await?;

    let history = Arc::new(SqliteHistoryStore::new(db_pool.clone()));
    let (broker, broker_handle) = Broker::new(Arc::new(SqliteIdentityResolver::new(db_pool)), history.clone());
    let broker_task = tokio::spawn(broker.run());

    let app_state = AppState {
        broker: broker_handle.clone(),
        history,
        heartbeat: config.heartbeat,
    };
    let app = forumchat::app(app_state, &config.cors_origins);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broker_handle.shutdown();
    broker_task.await?;
    tracing::info!("stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutting down");
}
