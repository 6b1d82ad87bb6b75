//! Admin HTTPS endpoint
//!
//! TLS-only, certificates resolved per-SNI by the certificate manager,
//! minimum TLS 1.2. The route surface is reserved; nothing is registered
//! yet, so every request is answered 404 over a properly negotiated
//! session.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, warn};

use tanq_adapters::{CertManager, CertResolver};

use crate::config::ApiConfig;
use crate::errors::InitError;

/// Grace period for in-flight connections on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Per-request service timeout, standing in for socket read/write
/// deadlines which hyper no longer exposes directly.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on a TLS handshake before the connection is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("bad TLS configuration: {reason}")]
    Tls { reason: String },
}

/// The admin API server.
pub struct AdminApi {
    addr: SocketAddr,
    resolver: Arc<CertResolver>,
}

impl AdminApi {
    /// Build the server. The API requires an active certificate manager;
    /// an active `[api]` without one is a wiring error.
    pub fn new(config: &ApiConfig, certs: &CertManager) -> Result<Self, InitError> {
        if !certs.is_active() {
            return Err(InitError::BadHandle(
                "admin API requires an active certificate manager".to_string(),
            ));
        }
        let ip: IpAddr = config
            .address
            .parse()
            .map_err(|_| InitError::BadParam(format!("bad listen address '{}'", config.address)))?;

        Ok(Self {
            addr: SocketAddr::new(ip, config.port),
            resolver: certs.resolver(),
        })
    }

    /// Serve until cancelled, then give in-flight connections a short grace
    /// period before aborting them.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ApiError> {
        let tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ApiError::Tls {
            reason: e.to_string(),
        })?
        .with_no_client_auth()
        .with_cert_resolver(self.resolver.clone());

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let router = Router::new().layer(TimeoutLayer::new(REQUEST_TIMEOUT));

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| ApiError::Bind {
                addr: self.addr,
                source,
            })?;
        info!(addr = %self.addr, "API server listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutting down API");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let service = TowerToHyperService::new(router.clone());
                    connections.spawn(async move {
                        let tls_stream = match tokio::time::timeout(
                            HANDSHAKE_TIMEOUT,
                            acceptor.accept(stream),
                        )
                        .await
                        {
                            Ok(Ok(tls_stream)) => tls_stream,
                            Ok(Err(e)) => {
                                debug!(peer = %peer, error = %e, "TLS handshake failed");
                                return;
                            }
                            Err(_) => {
                                debug!(peer = %peer, "TLS handshake timed out");
                                return;
                            }
                        };
                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(e) = builder
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .await
                        {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
            }
        }

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("In-flight connections outlived the grace period, aborting");
            connections.abort_all();
        }

        info!("API server shutdown done");
        Ok(())
    }
}
