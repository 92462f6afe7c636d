mod bot;
mod cli;
mod config;
mod handlers;
mod services;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use teloxide::Bot;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use vpnshop_db::db::init_db;
use vpnshop_db::memory::{InMemoryOrderStore, InMemoryPaymentStore, InMemoryWalletLedger};
use vpnshop_db::repositories::{
    order_repo::OrderRepository, payment_repo::PaymentRepository, wallet_repo::WalletRepository,
};
use vpnshop_db::store::{OrderStore, PaymentStore, WalletLedger};

use config::PanelConfig;
use services::fulfillment::{FulfillmentDispatcher, RetryPolicy};
use services::notification_service::{LogNotifier, Notifier, TelegramNotifier};
use services::orchestrator::Orchestrator;
use services::payment::PaymentGateway;
use services::payment::cryptomus::CryptomusGateway;
use services::payment::zarinpal::ZarinPalGateway;
use services::provisioning::ProvisioningAdapter;
use services::provisioning::xui::XuiPanel;
use services::reconciliation::ReconciliationService;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<PanelConfig>,
}

#[derive(Parser)]
#[command(name = "vpnshop-panel")]
#[command(about = "Payment verification and fulfillment for the VPN shop", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook server, internal API, bot and background jobs
    Serve {
        /// Keep all state in memory instead of PostgreSQL (local testing only)
        #[arg(long)]
        in_memory: bool,
    },
    /// Resume stalled intents once and exit
    Sweep,
    /// Compare every wallet balance with its ledger
    ReconcileLedger,
    /// Finalize an intent whose payment was confirmed with the gateway by hand
    Finalize {
        intent: Uuid,
        /// Gateway transaction reference
        #[arg(long)]
        reference: String,
    },
    /// Credit or debit a wallet outside of any payment
    Adjust {
        user: i64,
        #[arg(allow_negative_numbers = true)]
        delta: i64,
        #[arg(long)]
        note: Option<String>,
    },
    /// Remove an order's entitlement from the VPN panel
    Deactivate { order_id: i64 },
}

/// Everything the commands need, wired once.
struct Services {
    orchestrator: Arc<Orchestrator>,
    ledger: Arc<dyn WalletLedger>,
    orders: Arc<dyn OrderStore>,
    adapter: Arc<dyn ProvisioningAdapter>,
    bot: Option<Bot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        println!("⚠️  Warning: Failed to load .env file: {}", e);
    }

    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::never(".", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vpnshop_panel=debug,tower_http=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    let config = PanelConfig::load()?;

    match cli.command {
        Commands::Serve { in_memory } => {
            let services = build_services(&config, in_memory).await?;
            run_server(config, services).await?;
        }
        Commands::Sweep => {
            let services = build_services(&config, false).await?;
            let recon = ReconciliationService::new(services.orchestrator, config.reconciliation.clone());
            cli::sweep(&recon).await?;
        }
        Commands::ReconcileLedger => {
            let services = build_services(&config, false).await?;
            let recon = ReconciliationService::new(services.orchestrator, config.reconciliation.clone());
            cli::reconcile_ledger(&recon).await?;
        }
        Commands::Finalize { intent, reference } => {
            let services = build_services(&config, false).await?;
            cli::finalize(&services.orchestrator, intent, &reference).await?;
        }
        Commands::Adjust { user, delta, note } => {
            let services = build_services(&config, false).await?;
            cli::adjust(services.ledger.as_ref(), user, delta, note).await?;
        }
        Commands::Deactivate { order_id } => {
            let services = build_services(&config, false).await?;
            cli::deactivate(services.orders.as_ref(), services.adapter.as_ref(), order_id).await?;
        }
    }

    Ok(())
}

async fn build_services(config: &PanelConfig, in_memory: bool) -> Result<Services> {
    let (payments, ledger, orders): (Arc<dyn PaymentStore>, Arc<dyn WalletLedger>, Arc<dyn OrderStore>) =
        if in_memory {
            tracing::warn!("Running with in-memory storage; nothing survives a restart");
            let payments = InMemoryPaymentStore::new();
            let orders = InMemoryOrderStore::new(payments.clone());
            (
                Arc::new(payments),
                Arc::new(InMemoryWalletLedger::new()),
                Arc::new(orders),
            )
        } else {
            let pool = init_db(&config.database.url, config.database.max_connections).await?;
            tracing::info!("Database initialized successfully.");
            (
                Arc::new(PaymentRepository::new(pool.clone())),
                Arc::new(WalletRepository::new(pool.clone())),
                Arc::new(OrderRepository::new(pool)),
            )
        };

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let mut gateways: Vec<Arc<dyn PaymentGateway>> = Vec::new();
    if let Some(zp) = &config.gateways.zarinpal {
        gateways.push(Arc::new(ZarinPalGateway::new(
            http.clone(),
            zp.merchant_id.clone(),
            zp.sandbox,
            config.currency_scale,
        )));
    }
    if let Some(cm) = &config.gateways.cryptomus {
        gateways.push(Arc::new(CryptomusGateway::new(
            http.clone(),
            cm.merchant_id.clone(),
            cm.payment_key.clone(),
            cm.currency.clone(),
            config.currency_scale,
        )));
    }
    if gateways.is_empty() {
        tracing::warn!("No payment gateway configured; only wallet payments are possible");
    }

    let adapter: Arc<dyn ProvisioningAdapter> = Arc::new(XuiPanel::new(
        http,
        &config.panel.base_url,
        config.panel.username.clone(),
        config.panel.password.clone(),
        Duration::from_secs(config.panel.session_ttl_secs),
    ));

    let bot = config.telegram.bot_token.as_deref().map(Bot::new);
    let notifier: Arc<dyn Notifier> = match &bot {
        Some(bot) => Arc::new(TelegramNotifier::new(bot.clone())),
        None => {
            tracing::info!("BOT_TOKEN not set; outcomes are only logged");
            Arc::new(LogNotifier)
        }
    };

    let dispatcher = FulfillmentDispatcher::new(
        payments.clone(),
        ledger.clone(),
        orders.clone(),
        adapter.clone(),
        RetryPolicy::from(config.retry.clone()),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        payments,
        ledger.clone(),
        orders.clone(),
        gateways,
        dispatcher,
        notifier,
        &config.server.public_base_url,
        config.lease_ttl(),
    ));

    Ok(Services {
        orchestrator,
        ledger,
        orders,
        adapter,
        bot,
    })
}

fn router(state: AppState) -> Router {
    use handlers::api::internal;

    let mut app = Router::new()
        .route(
            "/payments/{gateway}",
            get(handlers::payments::gateway_callback).post(handlers::payments::gateway_callback),
        )
        .route("/api/intents", post(internal::create_intent))
        .route("/api/intents/{id}", get(internal::get_intent))
        .route("/api/intents/{id}/checkout", post(internal::begin_checkout))
        .route("/api/intents/{id}/wallet", post(internal::pay_with_wallet))
        .route("/api/intents/{id}/cancel", post(internal::cancel_intent))
        .route("/api/wallets/{user_id}", get(internal::get_wallet))
        .route("/api/admin/intents/{id}/finalize", post(internal::admin_finalize))
        .route("/api/gateways", get(internal::list_gateways))
        .route("/health", get(handlers::health::health));

    if let Some(legacy) = state.config.server.legacy_callback_path.as_deref() {
        let legacy = legacy.trim_end_matches('/');
        if legacy.starts_with('/') && legacy.len() > 1 {
            tracing::info!("Serving legacy callback path {}/{{gateway}}", legacy);
            app = app.route(
                &format!("{legacy}/{{gateway}}"),
                get(handlers::payments::gateway_callback).post(handlers::payments::gateway_callback),
            );
        } else {
            tracing::warn!("Ignoring legacy callback path {:?}: must start with '/'", legacy);
        }
    }

    app.with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(1024 * 1024))
}

async fn run_server(config: PanelConfig, services: Services) -> Result<()> {
    let config = Arc::new(config);
    let state = AppState {
        orchestrator: services.orchestrator.clone(),
        config: config.clone(),
    };

    let recon = Arc::new(ReconciliationService::new(
        services.orchestrator.clone(),
        config.reconciliation.clone(),
    ));
    let sweeper = recon.clone();
    tokio::spawn(async move { sweeper.start_sweep().await });
    let checker = recon.clone();
    tokio::spawn(async move {
        let err = checker.start_ledger_check().await;
        tracing::error!("Ledger check job stopped; manual review required: {}", err);
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    if let Some(bot) = services.bot {
        let rx = shutdown_tx.subscribe();
        let bot_state = state.clone();
        tokio::spawn(async move { bot::run_bot(bot, rx, bot_state).await });
    }

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.listen_port));
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
            let _ = shutdown_tx.send(());
        })
        .await?;

    Ok(())
}
