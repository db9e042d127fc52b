//! # Kindred
//!
//! - `kindred relay` serves the signaling relay (in-process bus, or Redis
//!   when `KINDRED__REDIS__URL` is set so several nodes share rooms)
//! - `kindred demo` pairs two loopback sessions in one room and prints how
//!   they converged

use anyhow::Context;
use clap::{Parser, Subcommand};
use kindred_common::config::AppConfig;
use kindred_common::models::{ParticipantId, RoomId};
use kindred_relay::{RelayState, build_router};
use kindred_rtc::loopback::{LoopbackFactory, LoopbackMedia};
use kindred_rtc::{ConnectionState, CoordinatorHandle, CoordinatorRegistry, NegotiationConfig, SessionContext};
use kindred_signal::{LocalBus, RedisBus, RelayClient, RelayClientConfig, SignalTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "kindred", version, about = "Peer session negotiation and signaling relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the WebSocket signaling relay.
    Relay,
    /// Negotiate two loopback sessions and print their final state.
    Demo {
        #[arg(long, default_value = "demo-room")]
        room: String,
        #[arg(long, default_value = "userA")]
        first: String,
        #[arg(long, default_value = "userB")]
        second: String,
        /// Signal through a running relay (`relay_client.url`) instead of an
        /// in-process bus.
        #[arg(long)]
        via_relay: bool,
        /// Give up if the sessions have not connected within this many seconds.
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = kindred_common::config::init()?;
    init_tracing(config);

    match cli.command {
        Command::Relay => run_relay(config).await,
        Command::Demo {
            room,
            first,
            second,
            via_relay,
            timeout_secs,
        } => {
            let room = RoomId::new(room);
            let ids = [ParticipantId::new(first), ParticipantId::new(second)];
            run_demo(config, room, ids, via_relay, Duration::from_secs(timeout_secs)).await
        }
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kindred=debug,tower_http=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if config.log.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_relay(config: &AppConfig) -> anyhow::Result<()> {
    tracing::info!("Starting Kindred relay v{}", env!("CARGO_PKG_VERSION"));

    let bus: Arc<dyn SignalTransport> = match &config.redis.url {
        Some(url) => {
            let bus = RedisBus::connect(url).await.context("connecting to Redis")?;
            tracing::info!("Relay bus: Redis");
            Arc::new(bus)
        }
        None => {
            tracing::info!("Relay bus: in-process (single node)");
            Arc::new(LocalBus::new())
        }
    };

    let router = build_router(RelayState::new(bus));
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Relay listening on ws://{addr}/signal");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down relay");
        })
        .await?;
    Ok(())
}

async fn run_demo(
    config: &AppConfig,
    room: RoomId,
    ids: [ParticipantId; 2],
    via_relay: bool,
    timeout: Duration,
) -> anyhow::Result<()> {
    let local_bus = LocalBus::new();
    let negotiation = NegotiationConfig::from(config);

    let mut handles = Vec::with_capacity(ids.len());
    let mut registries = Vec::with_capacity(ids.len());
    for id in &ids {
        // Over a relay each participant gets its own connection, as two
        // browsers would.
        let transport: Arc<dyn SignalTransport> = if via_relay {
            Arc::new(RelayClient::spawn(RelayClientConfig::from(&config.relay_client)))
        } else {
            Arc::new(local_bus.clone())
        };
        let registry = CoordinatorRegistry::new(SessionContext {
            transport,
            factory: Arc::new(LoopbackFactory::new()),
            media: Arc::new(LoopbackMedia::audio_video(id.as_str())),
            config: negotiation.clone(),
        });
        let handle = registry
            .open(room.clone(), id.clone(), None)
            .await
            .with_context(|| format!("opening session for {id}"))?;
        let peer = id.clone();
        handle
            .on_connection_state_change(move |state| tracing::info!(peer = %peer, state = %state, "Connection state changed"))
            .await?;
        handles.push(handle);
        registries.push(registry);
    }

    // Without an explicit initiate, the auto-offer fallback starts the exchange.
    if negotiation.auto_offer.is_none() {
        handles[0].initiate().await?;
    }

    let outcome = tokio::time::timeout(timeout, async {
        for handle in &handles {
            wait_connected(handle).await;
        }
    })
    .await;

    for handle in &handles {
        println!("{}", serde_json::to_string_pretty(&handle.snapshot())?);
    }
    for registry in &registries {
        registry.close_room(&room).await;
    }

    outcome.map_err(|_| anyhow::anyhow!("sessions did not connect within {}s", timeout.as_secs()))
}

async fn wait_connected(handle: &CoordinatorHandle) {
    let mut watch = handle.watch();
    loop {
        let snapshot = watch.borrow_and_update().clone();
        if snapshot.session.connection_state == ConnectionState::Connected || snapshot.close_reason.is_some() {
            return;
        }
        if watch.changed().await.is_err() {
            return;
        }
    }
}
