//! Control plane wiring.
//!
//! Opens the state store, starts the agent gateway, and runs the engine's
//! background loops until a shutdown signal arrives:
//! 1. Agent event loop (session traffic → state transitions)
//! 2. Dispatcher (1 s tick: reclaim, sweep, push work)
//! 3. Stale-host sweeper (30 s tick: offline detection + recovery)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, watch};
use tonic::transport::{Identity, ServerTlsConfig};
use tracing::info;

use flotilla_engine::{Engine, EngineConfig};
use flotilla_session::{AgentGatewayService, SessionManager, tls};
use flotilla_state::StateStore;

/// Inbound agent events buffered between the session layer and the engine.
const EVENT_BUFFER: usize = 256;

/// Run the control plane until ctrl-c.
pub async fn run(grpc_port: u16, data_dir: PathBuf, tls_enabled: bool) -> anyhow::Result<()> {
    info!("flotilla control plane starting");
    std::fs::create_dir_all(&data_dir)?;

    // ── State store ──────────────────────────────────────────────
    let db_path = data_dir.join("flotilla.redb");
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Engine + session layer ───────────────────────────────────
    let config = EngineConfig::from_env();
    info!(?config, "engine configuration loaded");
    let sessions = SessionManager::new();
    let engine = Engine::new(state.clone(), sessions.clone(), config.clone());

    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let gateway =
        AgentGatewayService::new(state.clone(), sessions.clone(), event_tx, config.clock_skew);

    // ── Background loops ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let event_handle = tokio::spawn(
        engine
            .clone()
            .run_event_loop(event_rx, shutdown_rx.clone()),
    );
    let dispatch_handle = tokio::spawn(engine.clone().run_dispatcher(shutdown_rx.clone()));
    let sweep_handle = tokio::spawn(engine.clone().run_stale_sweeper(shutdown_rx.clone()));

    // ── Agent gateway (gRPC) ─────────────────────────────────────
    let addr: SocketAddr = format!("0.0.0.0:{grpc_port}").parse()?;
    let mut builder = tonic::transport::Server::builder();
    if tls_enabled {
        builder = builder.tls_config(load_or_generate_tls(&data_dir)?)?;
        info!("agent gateway TLS enabled");
    }
    info!(%addr, "agent gateway starting");

    let mut grpc_shutdown = shutdown_rx.clone();
    let grpc_handle = tokio::spawn(
        builder
            .add_service(gateway.into_service())
            .serve_with_shutdown(addr, async move {
                let _ = grpc_shutdown.changed().await;
            }),
    );

    // ── Shutdown ─────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    grpc_handle.await??;
    let _ = event_handle.await;
    let _ = dispatch_handle.await;
    let _ = sweep_handle.await;

    info!("control plane stopped");
    Ok(())
}

/// Load the gateway's TLS identity, generating a CA and server cert under
/// `{data_dir}/tls` on first boot.
fn load_or_generate_tls(data_dir: &Path) -> anyhow::Result<ServerTlsConfig> {
    let tls_dir = data_dir.join("tls");
    let cert_path = tls_dir.join("gateway.pem");
    let key_path = tls_dir.join("gateway.key");

    if !cert_path.exists() || !key_path.exists() {
        std::fs::create_dir_all(&tls_dir)?;
        let (ca_pair, ca_key, ca_cert) = tls::generate_ca()?;
        let gateway_pair = tls::generate_host_cert(
            &ca_key,
            &ca_cert,
            "flotilla-gateway",
            &["127.0.0.1".to_string(), "localhost".to_string()],
        )?;
        std::fs::write(tls_dir.join("ca.pem"), &ca_pair.cert_pem)?;
        std::fs::write(tls_dir.join("ca.key"), &ca_pair.key_pem)?;
        std::fs::write(&cert_path, &gateway_pair.cert_pem)?;
        std::fs::write(&key_path, &gateway_pair.key_pem)?;
        info!(path = ?tls_dir, "generated gateway TLS material");
    }

    let cert = std::fs::read_to_string(&cert_path)?;
    let key = std::fs::read_to_string(&key_path)?;
    Ok(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
}
