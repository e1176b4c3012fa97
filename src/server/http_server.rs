//! The relay's HTTP front: listening, WebSocket upgrades, TLS.

use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use http::{
    header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE},
    HeaderMap, HeaderValue, Method, Request, Response, StatusCode,
};
use hyper::{body::Incoming, service::Service, upgrade::Upgraded};
use hyper_util::rt::TokioIo;
use tokio::{
    net::{TcpListener, TcpStream},
    time,
};
use tokio_rustls_acme::AcmeAcceptor;
use tokio_tungstenite::WebSocketStream;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, debug_span, info, info_span, trace, warn, Instrument};
use tungstenite::{handshake::derive_accept_key, protocol::Role};

use super::{
    session::{self, Slots},
    static_body,
    streams::MaybeTlsStream,
    ResponseBody,
};
use crate::{
    defaults::timeouts::{SLOT_TIMEOUT, TLS_HANDSHAKE_TIMEOUT},
    http::{RELAY_PATH_PREFIX, SUPPORTED_WEBSOCKET_VERSION, WEBSOCKET_UPGRADE_PROTOCOL},
};

/// A listening relay endpoint.
///
/// A background task accepts TCP (optionally TLS) connections and hands
/// each one to hyper; rendezvous upgrades then spawn their own session
/// tasks. Dropping this aborts the listener.
#[derive(Debug)]
pub(super) struct Server {
    addr: SocketAddr,
    listen_task: AbortOnDropHandle<()>,
    shutdown: CancellationToken,
}

impl Server {
    /// A clonable handle that can stop the listener from elsewhere.
    pub(super) fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Stops accepting connections.
    pub(super) fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The listener task; completes once the listener has stopped.
    pub(super) fn task_handle(&mut self) -> &mut AbortOnDropHandle<()> {
        &mut self.listen_task
    }

    /// The local address the listener is bound to.
    pub(super) fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Stops a [`Server`] without owning it.
#[derive(Debug, Clone)]
pub(super) struct ServerHandle {
    shutdown: CancellationToken,
}

impl ServerHandle {
    /// Stops accepting connections.
    pub(super) fn shutdown(&self) {
        self.shutdown.cancel()
    }
}

/// TLS material for the HTTPS listener.
#[derive(Debug, Clone)]
pub(super) struct TlsConfig {
    /// The rustls server configuration.
    pub(super) config: Arc<rustls::ServerConfig>,
    /// How handshakes are accepted.
    pub(super) acceptor: TlsAcceptor,
}

/// How incoming TLS handshakes are accepted.
#[derive(Clone, derive_more::Debug)]
pub(super) enum TlsAcceptor {
    /// Through the ACME state machine, which also answers TLS-ALPN-01
    /// validation handshakes itself.
    LetsEncrypt(#[debug("AcmeAcceptor")] AcmeAcceptor),
    /// With a fixed certificate chain. The tests use this.
    Manual(#[debug("TlsAcceptor")] tokio_rustls::TlsAcceptor),
}

/// Builder for the relay endpoint.
#[derive(Debug)]
pub(super) struct ServerBuilder {
    addr: SocketAddr,
    tls_config: Option<TlsConfig>,
    headers: HeaderMap,
    slot_timeout: Duration,
}

impl ServerBuilder {
    pub(super) fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            tls_config: None,
            headers: HeaderMap::new(),
            slot_timeout: SLOT_TIMEOUT,
        }
    }

    /// Serves with TLS when a config is given, plain HTTP otherwise.
    pub(super) fn tls_config(mut self, config: Option<TlsConfig>) -> Self {
        self.tls_config = config;
        self
    }

    /// Headers attached to every HTTP response.
    pub(super) fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Overrides the slot timeout.
    pub(super) fn slot_timeout(mut self, timeout: Duration) -> Self {
        self.slot_timeout = timeout;
        self
    }

    /// Binds the listener and spawns the accept task.
    pub(super) async fn spawn(self) -> Result<Server> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("binding {}", self.addr))?;
        let addr = listener.local_addr()?;
        let scheme = if self.tls_config.is_some() { "https" } else { "http" };
        info!("listening on {scheme}://{addr}");

        let service = RelayService::new(self.headers, self.slot_timeout);
        let tls_config = self.tls_config;
        let shutdown = CancellationToken::new();

        let stop = shutdown.clone();
        let listen_task = tokio::spawn(
            async move {
                loop {
                    let (stream, peer) = tokio::select! {
                        res = listener.accept() => match res {
                            Ok(accepted) => accepted,
                            Err(err) => {
                                warn!("accept failed: {err:#}");
                                continue;
                            }
                        },
                        _ = stop.cancelled() => break,
                    };
                    trace!(%peer, "accepted connection");
                    let service = service.clone();
                    let tls_config = tls_config.clone();
                    // Sessions carry their own deadline, so connection
                    // tasks need no supervision beyond it.
                    tokio::spawn(
                        service
                            .handle_connection(stream, tls_config)
                            .instrument(debug_span!("peer", addr = %peer)),
                    );
                }
                debug!("listener stopped");
            }
            .instrument(info_span!("relay-listen")),
        );

        Ok(Server {
            addr,
            listen_task: AbortOnDropHandle::new(listen_task),
            shutdown,
        })
    }
}

/// Hyper service for the relay: `GET /s/…` upgrades into a rendezvous
/// session, every other path is answered from the static pages.
#[derive(Clone, Debug)]
struct RelayService(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    slots: Slots,
    headers: HeaderMap,
    slot_timeout: Duration,
}

impl Service<Request<Incoming>> for RelayService {
    type Response = Response<ResponseBody>;
    type Error = http::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        // Everything under the rendezvous prefix is a slot request; the
        // rest of the path space belongs to the static pages.
        if req.method() == Method::GET {
            if let Some(slot) = req.uri().path().strip_prefix(RELAY_PATH_PREFIX) {
                let slot = slot.to_string();
                let res = self.upgrade_to_session(req, slot);
                return Box::pin(async move { res });
            }
        }
        let res = super::serve_page(req.method(), req.uri().path(), &self.0.headers);
        Box::pin(async move { res })
    }
}

/// Checks that `req` is a well-formed WebSocket upgrade and returns the
/// client's `Sec-WebSocket-Key`, or the reason it is not.
fn websocket_key(req: &Request<Incoming>) -> Result<&HeaderValue, &'static str> {
    let upgrade = req
        .headers()
        .get(UPGRADE)
        .ok_or("not a websocket upgrade")?;
    if upgrade.as_bytes() != WEBSOCKET_UPGRADE_PROTOCOL.as_bytes() {
        return Err("unsupported upgrade protocol");
    }
    let version = req
        .headers()
        .get(SEC_WEBSOCKET_VERSION)
        .ok_or("missing websocket version")?;
    if version.as_bytes() != SUPPORTED_WEBSOCKET_VERSION.as_bytes() {
        return Err("unsupported websocket version");
    }
    req.headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or("missing websocket key")
}

impl RelayService {
    fn new(headers: HeaderMap, slot_timeout: Duration) -> Self {
        Self(Arc::new(Inner {
            slots: Slots::new(),
            headers,
            slot_timeout,
        }))
    }

    /// Answers a rendezvous request: 101 plus a background task that picks
    /// up the upgraded stream, or 400 if the upgrade is malformed.
    fn upgrade_to_session(
        &self,
        mut req: Request<Incoming>,
        slot: String,
    ) -> Result<Response<ResponseBody>, http::Error> {
        let mut builder = Response::builder();
        for (name, value) in self.0.headers.iter() {
            builder = builder.header(name, value);
        }

        let accept = match websocket_key(&req) {
            Ok(key) => derive_accept_key(key.as_bytes()),
            Err(reason) => {
                debug!(%slot, "rejecting upgrade: {reason}");
                return builder
                    .status(StatusCode::BAD_REQUEST)
                    // Rejections carry the websocket version we do speak.
                    .header(SEC_WEBSOCKET_VERSION, SUPPORTED_WEBSOCKET_VERSION)
                    .body(static_body(reason.as_bytes()));
            }
        };

        debug!(%slot, "upgrading to websocket");

        // The upgraded IO only materialises once the 101 below has gone
        // out, so the session starts from its own task.
        let service = self.clone();
        tokio::spawn(
            async move {
                match hyper::upgrade::on(&mut req).await {
                    Ok(upgraded) => service.run_session(upgraded, &slot).await,
                    Err(err) => debug!("upgrade never completed: {err:#}"),
                }
            }
            .instrument(debug_span!("session")),
        );

        builder
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, WEBSOCKET_UPGRADE_PROTOCOL)
            .header(CONNECTION, "upgrade")
            .header(SEC_WEBSOCKET_ACCEPT, accept)
            .body(static_body(b""))
    }

    /// Runs the rendezvous session on the upgraded connection.
    async fn run_session(&self, upgraded: Upgraded, slot: &str) {
        let io = match upgraded.downcast::<TokioIo<MaybeTlsStream>>() {
            Ok(parts) if parts.read_buf.is_empty() => parts.io.into_inner(),
            Ok(parts) => {
                warn!(
                    "dropping peer that sent {} bytes before the upgrade settled",
                    parts.read_buf.len()
                );
                return;
            }
            Err(_) => {
                warn!("upgraded connection is not the stream we accepted");
                return;
            }
        };
        let conn = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
        session::run(conn, slot, &self.0.slots, self.0.slot_timeout).await;
    }

    /// Serves one accepted connection, TLS or plain.
    async fn handle_connection(self, stream: TcpStream, tls_config: Option<TlsConfig>) {
        let res = match tls_config {
            Some(tls) => self.serve_tls(stream, tls).await,
            None => self.serve(MaybeTlsStream::Plain(stream)).await,
        };
        if let Err(err) = res {
            // Peers that vanish mid-handshake are routine here, not
            // server faults.
            debug!("connection ended: {err:#}");
        }
    }

    async fn serve_tls(self, stream: TcpStream, tls: TlsConfig) -> Result<()> {
        let TlsConfig { config, acceptor } = tls;
        match acceptor {
            TlsAcceptor::LetsEncrypt(acceptor) => {
                match acceptor.accept(stream).await.context("acme accept")? {
                    None => debug!("answered acme validation handshake"),
                    Some(handshake) => {
                        let stream = handshake
                            .into_stream(config)
                            .await
                            .context("acme handshake")?;
                        self.serve(MaybeTlsStream::Tls(stream)).await?;
                    }
                }
            }
            TlsAcceptor::Manual(acceptor) => {
                let stream = time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                    .await
                    .context("tls handshake timed out")?
                    .context("tls handshake")?;
                self.serve(MaybeTlsStream::Tls(stream)).await?;
            }
        }
        Ok(())
    }

    async fn serve(self, io: MaybeTlsStream) -> Result<()> {
        hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), self)
            .with_upgrades()
            .await
            .context("http connection")
    }
}
