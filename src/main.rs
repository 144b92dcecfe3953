use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use chat_automator::calendar::{CalendarProvider, GoogleCalendarClient};
use chat_automator::channels::{HttpMessagingClient, MessagingTransport};
use chat_automator::config::AutomatorConfig;
use chat_automator::email::{EmailSender, SmtpEmailSender};
use chat_automator::executor::{ActionExecutor, Collaborators};
use chat_automator::ingest::{EventIngestor, ingest_routes};
use chat_automator::nlp::Extractor;
use chat_automator::pipeline::EventProcessor;
use chat_automator::queue::{ActionQueue, WorkerPool};
use chat_automator::rules::schedule::spawn_schedule_ticker;
use chat_automator::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AutomatorConfig::from_env()?;

    // Initialize tracing; the guard keeps the file writer flushing until exit.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "automator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("chat-automator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhooks: http://0.0.0.0:{}/webhook/events", config.webhook_port);
    eprintln!("   Database: {}", config.db_path);

    run(config).await?;
    Ok(())
}

async fn run(config: AutomatorConfig) -> chat_automator::error::Result<()> {
    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> =
        Arc::new(LibSqlBackend::new_local(std::path::Path::new(&config.db_path)).await?);

    let queue = ActionQueue::new(Arc::clone(&db), config.worker.max_attempts);

    // ── Collaborators ────────────────────────────────────────────────────
    let messaging: Option<Arc<dyn MessagingTransport>> = match &config.messaging {
        Some(cfg) => Some(Arc::new(HttpMessagingClient::new(
            cfg,
            config.executor.call_timeout,
        )?)),
        None => {
            tracing::warn!("MESSAGING_API_URL not set, outbound messages disabled");
            None
        }
    };
    let calendar: Option<Arc<dyn CalendarProvider>> = match &config.calendar {
        Some(cfg) => Some(Arc::new(GoogleCalendarClient::new(
            cfg,
            config.executor.call_timeout,
        )?)),
        None => None,
    };
    let email: Option<Arc<dyn EmailSender>> = config
        .email
        .clone()
        .map(|cfg| Arc::new(SmtpEmailSender::new(cfg)) as Arc<dyn EmailSender>);

    let mut services = Collaborators::new(Arc::clone(&db));
    services.messaging = messaging.clone();
    services.calendar = calendar;
    services.email = email;

    let executor = ActionExecutor::new(services, queue.clone(), config.executor.clone());
    let processor = Arc::new(EventProcessor::new(
        Arc::clone(&db),
        Extractor::new(config.extraction.clone()),
        executor,
        messaging.clone(),
    ));

    // ── Background loops ─────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = WorkerPool::new(queue.clone(), processor, config.worker.clone());
    let mut handles = pool.spawn(shutdown_rx.clone());
    handles.push(spawn_schedule_ticker(
        Arc::clone(&db),
        queue.clone(),
        config.worker.schedule_interval,
        shutdown_rx.clone(),
    ));

    // ── Webhook server ───────────────────────────────────────────────────
    let ingestor = EventIngestor::new(Arc::clone(&db), queue, messaging);
    let app = ingest_routes(ingestor);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.webhook_port)).await?;
    tracing::info!(port = config.webhook_port, "Webhook server started");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Webhook server failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    handles.push(server);
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
