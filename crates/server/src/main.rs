mod audit;
mod config;
mod directory;
mod messaging;
#[cfg(feature = "metrics")]
mod metrics;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

#[cfg(feature = "metrics")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use axum::{
    body::HttpBody,
    extract::{MatchedPath, State},
    http::{header::HeaderName, HeaderValue},
    routing::{get, post},
    Json, Router,
};
#[cfg(feature = "metrics")]
use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use dockside_core::{Boat, Booking, BookingStatus};
use dockside_storage::{connect, migrate, BookingRepository, StoragePool};

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::{CliOverrides, LogFormat, ServerConfig},
    messaging::MessagingService,
};

#[derive(Clone)]
struct StorageState {
    status: StorageStatus,
    pool: Option<StoragePool>,
}

#[derive(Clone)]
enum StorageStatus {
    Unconfigured,
    Connected,
    Error(String),
}

impl StorageState {
    fn unconfigured() -> Self {
        Self {
            status: StorageStatus::Unconfigured,
            pool: None,
        }
    }

    fn connected(pool: StoragePool) -> Self {
        Self {
            status: StorageStatus::Connected,
            pool: Some(pool),
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: StorageStatus::Error(message),
            pool: None,
        }
    }

    fn component(&self) -> ComponentStatus {
        match &self.status {
            StorageStatus::Unconfigured => ComponentStatus {
                name: "database",
                status: "pending",
                details: Some("database_url not configured; using in-memory bookings".to_string()),
            },
            StorageStatus::Connected => ComponentStatus {
                name: "database",
                status: "configured",
                details: Some("connection established".to_string()),
            },
            StorageStatus::Error(message) => ComponentStatus {
                name: "database",
                status: "error",
                details: Some(message.clone()),
            },
        }
    }

    fn readiness_status(&self) -> &'static str {
        match self.status {
            StorageStatus::Connected => "ready",
            StorageStatus::Unconfigured | StorageStatus::Error(_) => "degraded",
        }
    }

    fn pool(&self) -> Option<StoragePool> {
        self.pool.clone()
    }
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "dockside-server",
    version,
    about = "Dockside booking conversation gateway"
)]
struct Cli {
    /// Config file base path, without extension.
    #[arg(long = "config", default_value = ServerConfig::DEFAULT_PATH)]
    config_path: String,
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    burst_max_messages: Option<usize>,
    #[arg(long)]
    burst_window_secs: Option<u64>,
    #[arg(long)]
    sustained_max_messages: Option<usize>,
    #[arg(long)]
    sustained_window_secs: Option<u64>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
            database_url: self.database_url,
            burst_max_messages: self.burst_max_messages,
            burst_window_secs: self.burst_window_secs,
            sustained_max_messages: self.sustained_max_messages,
            sustained_window_secs: self.sustained_window_secs,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Insert or update a boat in the configured database.
    SeedBoat(SeedBoatCommand),
    /// Insert or update a booking in the configured database.
    SeedBooking(SeedBookingCommand),
}

#[derive(Args, Debug)]
struct SeedBoatCommand {
    #[arg(long)]
    boat_id: u64,
    /// User id of the captain who owns the boat.
    #[arg(long)]
    owner_id: u64,
    #[arg(long)]
    name: Option<String>,
}

#[derive(Args, Debug)]
struct SeedBookingCommand {
    #[arg(long)]
    booking_id: u64,
    #[arg(long)]
    customer_id: u64,
    #[arg(long)]
    boat_id: u64,
    /// Booking status, e.g. confirmed, cancelled, no-show.
    #[arg(long, default_value = "CONFIRMED")]
    status: BookingStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();
    let mut config = ServerConfig::load_from(&cli.config_path)?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    run(Arc::new(config)).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    let repository = seeding_repository(config).await?;
    match command {
        CliCommand::SeedBoat(cmd) => {
            let boat = Boat {
                id: cmd.boat_id,
                owner_id: cmd.owner_id,
                name: cmd.name,
            };
            repository.upsert_boat(&boat).await?;
            println!("Seeded boat {} owned by user {}", boat.id, boat.owner_id);
        }
        CliCommand::SeedBooking(cmd) => {
            let booking = Booking {
                id: cmd.booking_id,
                customer_id: cmd.customer_id,
                boat_id: cmd.boat_id,
                status: cmd.status,
            };
            repository.upsert_booking(&booking).await?;
            println!(
                "Seeded booking {} ({}) for customer {} on boat {}",
                booking.id, booking.status, booking.customer_id, booking.boat_id
            );
        }
    }
    Ok(())
}

async fn seeding_repository(config: &ServerConfig) -> Result<BookingRepository> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to seed records"))?;
    let pool = connect(database_url).await?;
    migrate(&pool).await?;
    Ok(BookingRepository::new(pool))
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no DOCKSIDE_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected DOCKSIDE_SERVER environment overrides");
    }

    let limits = &config.messaging.rate_limit;
    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        metrics_enabled = config.metrics.enabled,
        metrics_bind_addr = ?config.metrics.bind_addr,
        database_url_configured = config.database_url.is_some(),
        burst_max_messages = limits.burst.max_attempts,
        burst_window_secs = limits.burst.window_secs,
        sustained_max_messages = limits.sustained.max_attempts,
        sustained_window_secs = limits.sustained.window_secs,
        audit_capacity = config.messaging.audit_capacity,
        "resolved server configuration"
    );

    let storage = match config.database_url.as_deref() {
        Some(url) => match connect(url).await {
            Ok(pool) => match migrate(&pool).await {
                Ok(()) => {
                    info!("database connection established");
                    StorageState::connected(pool)
                }
                Err(err) => {
                    error!(?err, "database migrations failed");
                    StorageState::error(err.to_string())
                }
            },
            Err(err) => {
                error!(?err, "failed to establish database connection");
                StorageState::error(err.to_string())
            }
        },
        None => StorageState::unconfigured(),
    };

    let messaging = Arc::new(messaging::init_messaging_service(&config, storage.pool()));

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut state = AppState::new(config.clone(), storage, messaging);

    #[cfg(feature = "metrics")]
    {
        if config.metrics.enabled {
            state = state.with_metrics(Some(MetricsContext::init()?));
        }
        if let (true, Some(bind_addr)) = (config.metrics.enabled, &config.metrics.bind_addr) {
            let metrics_addr: SocketAddr = bind_addr
                .parse()
                .context("failed to parse metrics bind addr")?;
            let metrics_state = state.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_metrics(metrics_addr, metrics_state).await {
                    error!(?err, "metrics server terminated unexpectedly");
                }
            });
        }
    }

    let app = build_app(state);

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    config: Arc<ServerConfig>,
    storage: StorageState,
    messaging: Arc<MessagingService>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    fn new(
        config: Arc<ServerConfig>,
        storage: StorageState,
        messaging: Arc<MessagingService>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            config,
            storage,
            messaging,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn messaging(&self) -> Arc<MessagingService> {
        self.messaging.clone()
    }

    #[cfg(feature = "metrics")]
    fn metrics_enabled(&self) -> bool {
        self.config.metrics.enabled
    }

    #[cfg(feature = "metrics")]
    fn record_http_request(&self, route: &str, status: u16) {
        if let Some(metrics) = &self.metrics {
            let status_str = status.to_string();
            metrics
                .http_requests_total
                .with_label_values(&[route, status_str.as_str()])
                .inc();
        }
    }

    fn record_messaging_rejection(&self, reason: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.increment_messaging_rejection(reason);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = reason;
    }
}

async fn health(matched_path: MatchedPath, State(state): State<AppState>) -> &'static str {
    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), axum::http::StatusCode::OK.as_u16());
    #[cfg(not(feature = "metrics"))]
    let _ = (matched_path, state);
    "ok"
}

async fn readiness(
    matched_path: MatchedPath,
    State(state): State<AppState>,
) -> Json<ReadinessResponse> {
    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), axum::http::StatusCode::OK.as_u16());
    #[cfg(not(feature = "metrics"))]
    let _ = matched_path;

    Json(ReadinessResponse {
        status: state.storage.readiness_status(),
        uptime_seconds: state.uptime_seconds(),
        components: vec![state.storage.component()],
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version(
    matched_path: MatchedPath,
    State(state): State<AppState>,
) -> Json<VersionResponse> {
    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), axum::http::StatusCode::OK.as_u16());
    #[cfg(not(feature = "metrics"))]
    let _ = (matched_path, state);

    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

fn build_app(state: AppState) -> Router {
    #[cfg(feature = "metrics")]
    let expose_metrics_here =
        state.metrics_enabled() && state.config.metrics.bind_addr.is_none();

    let client_v1_routes = Router::new()
        .route(
            "/bookings/{booking_id}/messages",
            post(messaging::post_message),
        )
        .route(
            "/conversations/{conversation_id}/access",
            get(messaging::conversation_access),
        )
        .route("/security/events", get(messaging::security_events));

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version));

    #[cfg(feature = "metrics")]
    {
        if expose_metrics_here {
            router = router.route("/metrics", get(metrics_handler));
        }
    }

    // Unprefixed paths stay available alongside the versioned prefix.
    router = router.merge(client_v1_routes.clone());
    router = router.nest("/client/v1", client_v1_routes);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(HttpSpanMaker)
        .on_response(HttpOnResponse);

    let layers = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        .layer(PropagateHeaderLayer::new(request_id_header.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .into_inner();

    router.layer(layers).with_state(state)
}

#[derive(Clone, Default)]
struct HttpSpanMaker;

impl<B> tower_http::trace::MakeSpan<B> for HttpSpanMaker
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|rid| rid.header_value().to_str().ok())
            .unwrap_or("unknown")
            .to_owned();

        tracing::info_span!(
            "http.request",
            method = %request.method(),
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        )
    }
}

#[derive(Clone, Default)]
struct HttpOnResponse;

impl<B> tower_http::trace::OnResponse<B> for HttpOnResponse
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn on_response(
        self,
        response: &axum::http::Response<B>,
        latency: Duration,
        span: &tracing::Span,
    ) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let status = response.status().as_u16();

        span.record("status_code", tracing::field::display(status));
        span.record("latency_ms", tracing::field::display(latency_ms));

        tracing::debug!(parent: span, status, latency_ms, "request completed");
    }
}

fn init_tracing(config: &ServerConfig) {
    // RUST_LOG wins when set.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dockside_server=info,dockside=info"));

    let json = matches!(config.log_format(), LogFormat::Json);
    let subscriber = build_subscriber(json, env_filter, std::io::stderr);

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

/// JSON output carries the current span so every line has the request id.
fn build_subscriber<W>(
    json: bool,
    env_filter: EnvFilter,
    make_writer: W,
) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(make_writer),
            ),
        )
    } else {
        Box::new(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_writer(make_writer),
            ),
        )
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(metrics) = state.metrics.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
async fn serve_metrics(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state);
    let listener = TcpListener::bind(bind_addr).await?;
    info!("metrics listening on {}", listener.local_addr()?);
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
