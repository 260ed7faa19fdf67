use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use chat_checkout as app;
use chat_checkout::{
    services::payment_processor::StripeCheckoutProcessor,
    transport::{telegram::TelegramTransport, ChatTransport, InboundHandler, LoggingTransport},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = app::config::load_config().context("failed to load configuration")?;
    app::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = app::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if cfg.auto_migrate {
        app::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db_pool);
    let cfg = Arc::new(cfg);

    let secret_key = cfg.payment_secret_key.clone().unwrap_or_else(|| {
        warn!("No payment secret key configured; payment sessions will fail to open");
        String::new()
    });
    let processor = Arc::new(StripeCheckoutProcessor::new(
        cfg.payment_api_base.clone(),
        secret_key,
    )?);

    let telegram = match &cfg.bot_token {
        Some(token) => Some(TelegramTransport::new(token).context("failed to build Telegram client")?),
        None => {
            info!("No bot token configured; chat transport disabled");
            None
        }
    };
    let transport: Arc<dyn ChatTransport> = match &telegram {
        Some(telegram) => Arc::new(telegram.clone()),
        None => Arc::new(LoggingTransport),
    };

    let services = app::Services::build(Arc::clone(&db), Arc::clone(&cfg), processor, transport);

    tokio::spawn(app::events::process_events(services.event_receiver));
    tokio::spawn(services.notification_worker.run());

    let mode = cfg.resolution_mode();
    info!(?mode, "Payment resolution mode");
    if mode.accepts_poll() {
        tokio::spawn(
            services
                .state
                .gateway
                .clone()
                .run_reconciliation(cfg.payment_poll_interval()),
        );
    }

    if let Some(telegram) = telegram {
        let handler: Arc<dyn InboundHandler> = Arc::new(services.chat);
        tokio::spawn(telegram.run_polling(handler));
    }

    let router = app::build_router(services.state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;
    info!("chat-checkout listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
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

    info!("Shutdown signal received");
}
