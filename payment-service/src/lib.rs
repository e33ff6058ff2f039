pub mod config;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use mongodb::{options::ClientOptions, Client};
use secrecy::ExposeSecret;
use service_core::middleware::{
    metrics::metrics_middleware, tracing::request_id_middleware,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use services::{DarajaClient, MongoOrderStore, OrderStore, Reconciler};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn OrderStore>,
    pub daraja: DarajaClient,
}

/// Assemble the router over a prepared state.
///
/// Separate from [`Application::build`] so tests can wire in their own
/// store and a mocked gateway.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route("/payments/stk-push", post(handlers::payments::initiate_stk_push))
        .route(
            "/payments/orders/:order_id",
            get(handlers::payments::get_order_payment),
        )
        .route(
            "/payments/mpesa/callback/:token",
            post(handlers::callback::mpesa_callback),
        )
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        // The storefront calls the initiation endpoint directly from the
        // browser; the original deployment was CORS-open.
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .with_state(state)
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Connect the store, index it, and bind the listener (port 0 picks a
    /// random free port, which the tests rely on).
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let mut client_options = ClientOptions::parse(config.database.url.expose_secret()).await?;
        client_options.app_name = Some(config.service_name.clone());

        let client = Client::with_options(client_options)?;
        let db = client.database(&config.database.db_name);

        let store = MongoOrderStore::new(&db);
        store.init_indexes().await?;

        let daraja = DarajaClient::new(config.daraja.clone())?;

        let state = AppState {
            config: config.clone(),
            store: Arc::new(store),
            daraja,
        };

        let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        tracing::info!("payment service listening on port {}", port);

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve HTTP and run the reconciliation sweeper until either stops.
    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        let router = app_router(self.state.clone());

        let reconciliation = self.state.config.reconciliation.clone();
        let reconciler = Reconciler::new(
            self.state.store.clone(),
            self.state.daraja.clone(),
            &reconciliation,
        );

        if reconciliation.enabled {
            tokio::select! {
                result = axum::serve(self.listener, router) => {
                    result?;
                }
                _ = reconciler.run() => {
                    // run() loops forever; reaching here means it stopped.
                    tracing::error!("reconciliation loop exited unexpectedly");
                }
            }
        } else {
            axum::serve(self.listener, router).await?;
        }

        Ok(())
    }
}
