mod config;
mod tasks;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get},
    Router,
};
use socket2::{Domain, Protocol, Socket, Type};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_api::limits::MessageRateLimiter;
use courier_api::messages;
use courier_api::middleware::{require_auth, JwtSecret};
use courier_api::{ApiState, ApiStateInner};
use courier_cache::{CacheCluster, CacheConfig};
use courier_gateway::{connection, GatewayContext, LocalDispatcher, MessageSender, PresenceManager};
use courier_push::{ApnSender, FcmSender, PushConfig, PushScheduler, PushSender, PushWorker};
use courier_queue::{MessagePersister, MessagesCache, MessagesManager, PersisterConfig};
use courier_types::accounts::InMemoryAccountDirectory;
use courier_types::metrics::Metrics;

use crate::config::Config;

/// Placeholder values that MUST NOT be used as the JWT secret.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

/// Cadence of the durable-table retention sweep.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    if config.jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&config.jwt_secret.as_str()) {
        eprintln!("FATAL: COURIER_JWT_SECRET is unset or still a placeholder.");
        eprintln!("       Generate a strong random value: openssl rand -base64 48");
        eprintln!("       Set it in your .env file and restart.");
        std::process::exit(1);
    }

    info!("starting courier instance {}", config.server_id);

    // Storage
    let db = Arc::new(courier_db::Database::open(&config.db_path)?);
    let cluster = Arc::new(CacheCluster::connect(&config.cache_urls, CacheConfig::default()).await?);

    // Shared context
    let metrics = Metrics::new();
    let cache = Arc::new(MessagesCache::new(
        Arc::clone(&cluster),
        config.server_id.clone(),
    ));
    let manager = Arc::new(MessagesManager::new(
        Arc::clone(&cache),
        Arc::clone(&db),
        Arc::clone(&metrics),
        config.message_retention.as_millis() as u64,
    ));

    let dispatcher = LocalDispatcher::new();
    let presence = Arc::new(PresenceManager::new(
        Arc::clone(&cluster),
        config.server_id.clone(),
    ));

    // Account/device lookups live outside this service; the in-process
    // directory stands in until the account subsystem is wired up.
    let directory = InMemoryAccountDirectory::new();

    let push_scheduler = Arc::new(PushScheduler::new(
        Arc::clone(&cluster),
        Arc::clone(&metrics),
        PushConfig::default(),
    ));

    let message_sender = Arc::new(MessageSender::new(
        dispatcher.clone(),
        Arc::clone(&presence),
        Arc::clone(&manager),
        Arc::clone(&push_scheduler),
    ));

    // Cross-instance event plumbing: queue wake events into availability
    // listeners, displacement/expiry events into local sessions.
    cache.start_event_dispatch();
    {
        let dispatcher = dispatcher.clone();
        presence.start_displacement_dispatch(
            Arc::clone(&metrics),
            Arc::new(move |addr| dispatcher.displace(&addr)),
        );
    }

    // Background workers
    let persister = MessagePersister::new(
        Arc::clone(&cluster),
        Arc::clone(&cache),
        Arc::clone(&manager),
        Arc::clone(&metrics),
        PersisterConfig {
            persist_delay: config.persist_delay,
            ..PersisterConfig::default()
        },
        config.server_id.clone(),
    );
    tokio::spawn(persister.run());

    let apn: Option<Arc<dyn PushSender>> = config.apn.as_ref().map(|apn| {
        Arc::new(ApnSender::new(
            apn.endpoint.clone(),
            apn.bearer_token.clone(),
            apn.topic.clone(),
        )) as Arc<dyn PushSender>
    });
    let fcm: Option<Arc<dyn PushSender>> = config.fcm.as_ref().map(|fcm| {
        Arc::new(FcmSender::new(fcm.endpoint.clone(), fcm.server_key.clone()))
            as Arc<dyn PushSender>
    });
    let push_worker = Arc::new(PushWorker::new(
        Arc::clone(&push_scheduler),
        apn,
        fcm,
        directory.clone(),
        Arc::clone(&metrics),
    ));
    tokio::spawn(push_worker.run());

    tokio::spawn(tasks::run_retention_sweep(
        Arc::clone(&db),
        RETENTION_SWEEP_INTERVAL,
    ));
    tokio::spawn(tasks::run_presence_heartbeat(
        Arc::clone(&presence),
        dispatcher.clone(),
    ));

    // Routes
    let api_state: ApiState = Arc::new(ApiStateInner {
        directory,
        manager: Arc::clone(&manager),
        sender: message_sender,
        limiter: MessageRateLimiter::new(config.rate_limit_per_minute, Duration::from_secs(60)),
        metrics: Arc::clone(&metrics),
    });

    let gateway_context = GatewayContext {
        dispatcher,
        presence,
        manager,
        push: push_scheduler,
        metrics: Arc::clone(&metrics),
        jwt_secret: config.jwt_secret.clone(),
    };

    let jwt_extension = JwtSecret(Arc::from(config.jwt_secret.as_str()));

    let message_routes = Router::new()
        .route("/v1/messages", get(messages::get_messages))
        .route(
            "/v1/messages/{id}",
            axum::routing::put(messages::send_messages).delete(messages::delete_message),
        )
        .route(
            "/v1/messages/{sender}/{timestamp}",
            delete(messages::delete_message_by_sender),
        )
        .layer(middleware::from_fn(require_auth))
        .with_state(api_state.clone());

    let ws_route = Router::new()
        .route("/v1/gateway", get(ws_upgrade))
        .with_state(gateway_context);

    let status_route = Router::new()
        .route("/v1/status", get(status))
        .with_state(api_state);

    let app = Router::new()
        .merge(message_routes)
        .merge(ws_route)
        .merge(status_route)
        .layer(axum::Extension(jwt_extension))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("courier listening on {}", addr);

    // Create listener via socket2 so we can set TCP_NODELAY on the listening
    // socket. Accepted connections inherit the NODELAY flag, eliminating
    // Nagle's algorithm latency for small WebSocket frames.
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(socket.into())?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(context): State<GatewayContext>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_frame_size(1_048_576) // 1 MB max frame
        .max_message_size(2_097_152) // 2 MB max message
        .on_upgrade(move |socket| connection::handle_connection(socket, context))
}

async fn status(State(state): State<ApiState>) -> String {
    state.metrics.render()
}
