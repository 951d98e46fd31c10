use std::sync::Arc;

use anyhow::Context;

use datlake_infra::queue::{InMemoryQueueStore, LoggingProcessor, PgmqQueueStore, WorkQueueStore};
use datlake_infra::{CoreRuntime, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    datlake_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;

    let store: Arc<dyn WorkQueueStore> = match &settings.database_url {
        Some(url) => {
            let store = PgmqQueueStore::connect(url, settings.database_max_connections)
                .await
                .context("failed to connect to the queue database")?;
            store
                .ensure_queues(&[
                    settings.queue.queue_name.as_str(),
                    settings.queue.dead_letter_queue.as_str(),
                    settings.queue.notification_queue.as_str(),
                ])
                .await
                .context("failed to create queues")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory queue store");
            InMemoryQueueStore::arc()
        }
    };

    let runtime = Arc::new(CoreRuntime::start(&settings, store, LoggingProcessor));
    let app = datlake_api::app::build_app(runtime.clone());

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    let shutdown = runtime.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            // Ends every open event stream so the server can drain.
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    runtime.shutdown().await;
    Ok(())
}
