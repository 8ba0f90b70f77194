use anyhow::{Context, Result};
use futures::future::join_all;
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use core_ledger_outbox::application::{
    BulkImportConsumer, BulkImportProcessor, CompletionService, ConnectivityProbeConsumer,
    ProcessTransactionHandler, TransactionProcessingConsumer, UserNotifier,
};
use core_ledger_outbox::infrastructure::auth::AuthService;
use core_ledger_outbox::infrastructure::completion_client::{
    CallbackCredentials, CompletionCallbackTrait, HttpCompletionClient,
};
use core_ledger_outbox::infrastructure::consumer_runner::{ConsumerRunner, MessageHandler};
use core_ledger_outbox::infrastructure::health::{HealthRegistry, HealthService};
use core_ledger_outbox::infrastructure::idempotency::{IdempotencyGuardTrait, PostgresIdempotencyGuard};
use core_ledger_outbox::infrastructure::instrument_catalog::PostgresInstrumentCatalog;
use core_ledger_outbox::infrastructure::job_store::{JobStoreTrait, PostgresJobStore};
use core_ledger_outbox::infrastructure::kafka_consumer::KafkaMessageSource;
use core_ledger_outbox::infrastructure::kafka_dlq::{dlq_name, DeadLetterQueue};
use core_ledger_outbox::infrastructure::ledger_store::PostgresLedgerStore;
use core_ledger_outbox::infrastructure::logging::init_logging;
use core_ledger_outbox::infrastructure::shutdown::ShutdownManager;
use core_ledger_outbox::infrastructure::{
    AppConfig, KafkaConnection, KafkaPublisher, MessagePublisherTrait, OutboxPollingService,
    OutboxRepositoryTrait, PostgresOutboxRepository,
};
use core_ledger_outbox::web::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = AppConfig::from_env();

    let _log_guards = init_logging(config.logging.clone())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting ledger worker");
    info!(
        "Outbox: poll every {:?}, batch {}, max retries {}, fail fast on permanent errors: {}",
        config.outbox.poll_interval,
        config.outbox.batch_size,
        config.outbox.max_retry_count,
        config.outbox.fail_fast_permanent
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.pool_size)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Database migrations applied");

    let connection = Arc::new(KafkaConnection::new(config.kafka.clone()));
    let publisher: Arc<dyn MessagePublisherTrait> = Arc::new(KafkaPublisher::new(connection.clone()));
    for queue in config.queues.all() {
        for name in [queue.to_string(), dlq_name(queue)] {
            if let Err(e) = publisher.declare_queue(&name).await {
                // The processor declares again on first publish.
                warn!("Could not declare queue {} at startup: {}", name, e);
            }
        }
    }

    let outbox_repo: Arc<dyn OutboxRepositoryTrait> = Arc::new(PostgresOutboxRepository::new(
        pool.clone(),
        config.outbox.claim_lease,
    ));
    let ledger = Arc::new(PostgresLedgerStore::new(pool.clone()));
    let jobs: Arc<dyn JobStoreTrait> = Arc::new(PostgresJobStore::new(pool.clone()));
    let guard: Arc<dyn IdempotencyGuardTrait> = Arc::new(PostgresIdempotencyGuard::new(pool.clone()));
    let catalog = Arc::new(PostgresInstrumentCatalog::new(pool.clone()));

    let auth = Arc::new(AuthService::new(config.auth.clone()));
    let credentials = match config.callback.service_token.clone() {
        Some(token) => CallbackCredentials::Static(token),
        None => CallbackCredentials::Minted(auth.clone()),
    };
    let callback: Arc<dyn CompletionCallbackTrait> =
        Arc::new(HttpCompletionClient::new(&config.callback, credentials)?);

    let shutdown = ShutdownManager::new();
    let registry = HealthRegistry::new();
    let mut tasks: Vec<(String, JoinHandle<()>)> = Vec::new();

    let poller = OutboxPollingService::new(outbox_repo.clone(), publisher.clone(), config.outbox.clone())
        .with_health(registry.clone());
    tasks.push(("outbox-processor".to_string(), tokio::spawn(poller.run(shutdown.token()))));

    let transaction_consumer: Arc<dyn MessageHandler> = Arc::new(TransactionProcessingConsumer::new(
        config.queues.transaction_created.clone(),
        guard.clone(),
        ProcessTransactionHandler::new(ledger.clone()),
        callback,
    ));
    let bulk_import_consumer: Arc<dyn MessageHandler> = Arc::new(BulkImportConsumer::new(
        config.queues.bulk_import.clone(),
        guard.clone(),
        jobs.clone(),
        BulkImportProcessor::new(catalog, config.consumers.import_batch_size),
    ));
    let probe_consumer: Arc<dyn MessageHandler> = Arc::new(ConnectivityProbeConsumer::new(
        config.queues.test_connection.clone(),
        guard.clone(),
        jobs.clone(),
        config.consumers.probe_simulated_delay,
    ));

    for handler in [transaction_consumer, bulk_import_consumer, probe_consumer] {
        let source = KafkaMessageSource::new(
            connection.clone(),
            handler.queue(),
            DeadLetterQueue::new(publisher.clone()),
        )
        .with_context(|| format!("Failed to create consumer for {}", handler.queue()))?;
        let name = handler.name().to_string();
        let runner = ConsumerRunner::new(Box::new(source), handler)
            .with_health(registry.clone())
            .with_receive_wait(config.consumers.receive_wait);
        tasks.push((name, tokio::spawn(runner.run(shutdown.token()))));
    }

    let completions = Arc::new(CompletionService::new(ledger, UserNotifier::default()));
    let health = Arc::new(HealthService::new(registry, publisher, outbox_repo));
    let app = create_router(AppState {
        auth,
        completions,
        health,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    let server_token = shutdown.token();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("HTTP server error: {}", e);
        }
    });
    tasks.push(("http-server".to_string(), server));

    shutdown.wait_for_signal().await;
    info!("Shutting down, waiting for {} background tasks", tasks.len());

    let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
    for (name, result) in names.into_iter().zip(join_all(handles).await) {
        if let Err(e) = result {
            error!("Task {} ended abnormally: {}", name, e);
        }
    }

    pool.close().await;
    info!("Ledger worker stopped");
    Ok(())
}
