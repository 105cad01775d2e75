// src/hub/mod.rs

//! The hub `WebSocket` server: accepts role-process connections, performs
//! the token handshake, and routes frames between them. Staged startup
//! (bind, optionally wrap in TLS, spawn the presence loop, then accept)
//! with a biased `select!` so shutdown always wins over a pending accept.

pub mod connection;
pub mod presence;
pub mod state;
pub mod stream;

use crate::config::FleetConfig;
use crate::error::FleetError;
use rustls::ServerConfig as RustlsServerConfig;
use state::HubState;
use std::io::BufReader;
use std::sync::Arc;
use stream::AnyStream;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// Binds the listener, optionally wraps it in TLS, spawns the presence
/// broadcast task, and runs the accept loop until shutdown is requested.
pub async fn run(config: FleetConfig) -> Result<(), FleetError> {
    let state = Arc::new(HubState::new(config.token.clone()));
    let acceptor = match &config.certificate_path {
        Some(path) => Some(build_tls_acceptor(path)?),
        None => None,
    };

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(FleetError::from)?;
    info!(host = %config.host, port = config.port, tls = acceptor.is_some(), "hub listening");

    let presence_state = state.clone();
    let presence_shutdown = state.shutdown_tx.subscribe();
    tokio::spawn(presence::run(presence_state, presence_shutdown));

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("hub shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                spawn_connection(state.clone(), acceptor.clone(), socket, addr);
            }
        }
    }
}

fn spawn_connection(
    state: Arc<HubState>,
    acceptor: Option<TlsAcceptor>,
    socket: tokio::net::TcpStream,
    addr: std::net::SocketAddr,
) {
    let shutdown_rx = state.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let stream = match acceptor {
            Some(acceptor) => match acceptor.accept(socket).await {
                Ok(tls) => AnyStream::Tls(Box::new(tls)),
                Err(e) => {
                    warn!(%addr, error = %e, "tls handshake failed");
                    return;
                }
            },
            None => AnyStream::Tcp(socket),
        };
        connection::handle_connection(state, stream, addr, shutdown_rx).await;
    });
}

/// Loads a certificate chain and private key from one combined PEM file
/// given by a single `certificate_path` config value.
fn build_tls_acceptor(path: &str) -> Result<TlsAcceptor, FleetError> {
    let contents = std::fs::read(path)?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(contents.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FleetError::Config(format!("failed to parse certificates in {path}: {e}")))?;
    if certs.is_empty() {
        return Err(FleetError::Config(format!("no certificates found in {path}")));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(contents.as_slice()))
        .map_err(|e| FleetError::Config(format!("failed to parse private key in {path}: {e}")))?
        .ok_or_else(|| FleetError::Config(format!("no private key found in {path}")))?;

    let server_config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| {
            error!(error = %e, "invalid certificate/key pair");
            FleetError::Config(format!("invalid certificate/key pair: {e}"))
        })?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
