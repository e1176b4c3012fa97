//! A fully-fledged rendezvous relay server over HTTP or HTTPS.
//!
//! This module provides an API to run the relay server. It is primarily
//! used by the `rendezvous-relay` binary but can be embedded elsewhere.
//!
//! The long-lived pieces (the listener and the auxiliary tasks) are
//! attached to handles and abort when those are dropped. Per-connection
//! session tasks are detached instead: the slot deadline already bounds
//! their lifetime.
//!
//! The relay server hosts the following services:
//!
//! - `/s/<slot>`: the rendezvous endpoint. A WebSocket upgrade with an
//!   empty slot books a new slot; a non-empty slot joins an existing one.
//! - `/`: a short index page.
//! - `/robots.txt`: keeps crawlers away.
//!
//! Every response carries the signalling protocol version in the
//! `X-Version` header so clients can detect an incompatible server.

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use http::{
    header::CONTENT_TYPE, HeaderMap, HeaderValue, Method, Request, Response, StatusCode,
};
use hyper::body::Incoming;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls_acme::AcmeState;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info_span, instrument, warn, Instrument};

use crate::{
    defaults::timeouts::SLOT_TIMEOUT,
    http::{PROTOCOL_VERSION, VERSION_HEADER},
};

mod http_server;
mod session;
mod streams;

const NOTFOUND: &[u8] = b"Not Found";
const ROBOTS_TXT: &[u8] = b"User-agent: *\nDisallow: /\n";
const INDEX: &[u8] = br#"<html><body>
<h1>Rendezvous relay</h1>
<p>
  This is a signalling relay for a peer-to-peer file transfer protocol.
  Peers meet under <code>/s/&lt;slot&gt;</code> and have their messages
  piped together until they can talk directly.
</p>
"#;

/// Body type of the relay's plain HTTP responses.
type ResponseBody = http_body_util::Full<Bytes>;

fn static_body(content: &'static [u8]) -> ResponseBody {
    http_body_util::Full::new(Bytes::from_static(content))
}

/// Answers the handful of plain HTTP routes served next to the rendezvous
/// endpoint.
fn serve_page(
    method: &Method,
    path: &str,
    headers: &HeaderMap,
) -> Result<Response<ResponseBody>, http::Error> {
    let mut builder = Response::builder();
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    match (method, path) {
        (&Method::GET, "/" | "/index.html") => builder
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(static_body(INDEX)),
        (&Method::GET, "/robots.txt") => builder.body(static_body(ROBOTS_TXT)),
        _ => builder
            .status(StatusCode::NOT_FOUND)
            .body(static_body(NOTFOUND)),
    }
}

/// Configuration for the relay server.
///
/// Be aware the generic parameters are for when using the Let's Encrypt
/// TLS configuration. If not used, dummy ones need to be provided, e.g.
/// `ServerConfig::<(), ()>::default()`.
#[derive(Debug)]
pub struct ServerConfig<EC: fmt::Debug, EA: fmt::Debug = EC> {
    /// The socket address on which the plain HTTP server should bind.
    ///
    /// Normally you'd choose port `80`. If [`ServerConfig::tls`] is `None`
    /// then this serves the rendezvous endpoint as well; otherwise it only
    /// serves the index page and version header, and the rendezvous
    /// endpoint lives on the HTTPS address.
    pub http_bind_addr: SocketAddr,
    /// TLS configuration for the HTTPS server.
    pub tls: Option<TlsConfig<EC, EA>>,
    /// Maximum lifetime of a slot, measured from the WebSocket upgrade.
    ///
    /// Defaults to 30 minutes; tests shorten it.
    pub slot_timeout: Duration,
}

impl<EC: fmt::Debug, EA: fmt::Debug> Default for ServerConfig<EC, EA> {
    fn default() -> Self {
        Self {
            http_bind_addr: ([0, 0, 0, 0], crate::defaults::DEFAULT_HTTP_PORT).into(),
            tls: None,
            slot_timeout: SLOT_TIMEOUT,
        }
    }
}

/// TLS configuration for the relay server.
#[derive(Debug)]
pub struct TlsConfig<EC: fmt::Debug, EA: fmt::Debug = EC> {
    /// The socket address on which to serve the HTTPS server.
    ///
    /// Normally you'd choose port `443`.
    pub https_bind_addr: SocketAddr,
    /// Mode for getting a cert.
    pub cert: CertConfig<EC, EA>,
    /// The server configuration.
    pub server_config: rustls::ServerConfig,
}

/// TLS certificate configuration.
#[derive(derive_more::Debug)]
pub enum CertConfig<EC: fmt::Debug, EA: fmt::Debug = EC> {
    /// Use Let's Encrypt.
    LetsEncrypt {
        /// State for the Let's Encrypt certificates.
        #[debug("AcmeState")]
        state: AcmeState<EC, EA>,
    },
    /// Use a static TLS key and certificate chain.
    Manual {
        /// The TLS certificate chain.
        certs: Vec<rustls::pki_types::CertificateDer<'static>>,
    },
}

/// A running relay server.
///
/// Dropping this will stop the server.
#[derive(Debug)]
pub struct Server {
    /// The address of the plain HTTP server.
    http_addr: SocketAddr,
    /// The address of the HTTPS server, if the relay is using TLS.
    https_addr: Option<SocketAddr>,
    /// Handle to the relay server.
    relay_handle: http_server::ServerHandle,
    /// The main task running the server.
    supervisor: AbortOnDropHandle<Result<()>>,
    /// The certificate chain if the server has manual certificates
    /// configured; clients can use it to authenticate the server.
    certificates: Option<Vec<rustls::pki_types::CertificateDer<'static>>>,
}

impl Server {
    /// Starts the server.
    pub async fn spawn<EC, EA>(config: ServerConfig<EC, EA>) -> Result<Self>
    where
        EC: fmt::Debug + 'static,
        EA: fmt::Debug + 'static,
    {
        let mut aux = JoinSet::new();

        let mut headers = HeaderMap::new();
        headers.insert(VERSION_HEADER, HeaderValue::from_static(PROTOCOL_VERSION));

        let certificates = config.tls.as_ref().and_then(|tls| match tls.cert {
            CertConfig::LetsEncrypt { .. } => None,
            CertConfig::Manual { ref certs } => Some(certs.clone()),
        });

        let relay_bind_addr = match config.tls {
            Some(ref tls) => tls.https_bind_addr,
            None => config.http_bind_addr,
        };
        let mut builder = http_server::ServerBuilder::new(relay_bind_addr)
            .headers(headers.clone())
            .slot_timeout(config.slot_timeout);

        let http_addr = match config.tls {
            Some(tls_config) => {
                let server_tls_config = match tls_config.cert {
                    CertConfig::LetsEncrypt { mut state } => {
                        let acceptor = http_server::TlsAcceptor::LetsEncrypt(state.acceptor());
                        aux.spawn(
                            async move {
                                while let Some(event) = state.next().await {
                                    match event {
                                        Ok(ok) => debug!("acme event: {ok:?}"),
                                        Err(err) => error!("acme error: {err:?}"),
                                    }
                                }
                                Err(anyhow!("acme event stream finished"))
                            }
                            .instrument(info_span!("acme")),
                        );
                        http_server::TlsConfig {
                            config: Arc::new(tls_config.server_config),
                            acceptor,
                        }
                    }
                    CertConfig::Manual { .. } => {
                        let server_config = Arc::new(tls_config.server_config);
                        let acceptor = tokio_rustls::TlsAcceptor::from(server_config.clone());
                        http_server::TlsConfig {
                            config: server_config,
                            acceptor: http_server::TlsAcceptor::Manual(acceptor),
                        }
                    }
                };
                builder = builder.tls_config(Some(server_tls_config));

                // The index page and version header must stay reachable
                // over plain HTTP, so run a separate bare listener for
                // them next to the HTTPS server.
                let http_listener = TcpListener::bind(&config.http_bind_addr)
                    .await
                    .context("failed to bind http")?;
                let http_addr = http_listener.local_addr()?;
                aux.spawn(
                    serve_plain_pages(http_listener, headers)
                        .instrument(info_span!("http-service", addr = %http_addr)),
                );
                Some(http_addr)
            }
            None => None,
        };

        let relay_server = builder.spawn().await?;
        let relay_addr = relay_server.addr();
        let relay_handle = relay_server.handle();
        let task = tokio::spawn(supervise(aux, relay_server));

        Ok(Self {
            http_addr: http_addr.unwrap_or(relay_addr),
            https_addr: http_addr.map(|_| relay_addr),
            relay_handle,
            supervisor: AbortOnDropHandle::new(task),
            certificates,
        })
    }

    /// Requests graceful shutdown.
    ///
    /// Returns once all server tasks have stopped.
    pub async fn shutdown(self) -> Result<()> {
        self.relay_handle.shutdown();
        self.supervisor.await?
    }

    /// Returns the handle for the supervisor task.
    ///
    /// This allows waiting for the server to finish. Can be useful in case
    /// there is an error in the server before it is shut down.
    pub fn task_handle(&mut self) -> &mut AbortOnDropHandle<Result<()>> {
        &mut self.supervisor
    }

    /// The socket address the plain HTTP server is listening on.
    ///
    /// When TLS is not configured this is also the rendezvous endpoint.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// The socket address the HTTPS server is listening on, if TLS is
    /// configured.
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    /// The certificate chain if configured with manual TLS certificates.
    pub fn certificates(&self) -> Option<Vec<rustls::pki_types::CertificateDer<'static>>> {
        self.certificates.clone()
    }
}

/// Runs the server tasks until the first of them stops, then takes the
/// rest down with it.
#[instrument(skip_all)]
async fn supervise(mut aux: JoinSet<Result<()>>, mut relay: http_server::Server) -> Result<()> {
    let outcome = tokio::select! {
        res = relay.task_handle() => {
            res.map_err(|err| anyhow!("listener task died: {err}"))
        }
        Some(res) = aux.join_next() => match res {
            Ok(Ok(())) => Err(anyhow!("auxiliary task stopped unexpectedly")),
            Ok(Err(err)) => Err(err.context("auxiliary task failed")),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(anyhow!("auxiliary task aborted: {err}")),
        },
    };

    // Whichever task stopped first, the others follow it down.
    relay.shutdown();
    aux.shutdown().await;

    outcome
}

/// Keeps the index page and version header reachable over plain HTTP
/// while the rendezvous endpoint itself sits behind TLS. Never returns.
async fn serve_plain_pages(listener: TcpListener, headers: HeaderMap) -> Result<()> {
    let service = PageService(Arc::new(headers));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err:#}");
                continue;
            }
        };
        debug!(%peer, "accepted connection");
        let service = service.clone();
        tokio::spawn(async move {
            let served = hyper::server::conn::http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
                .await;
            if let Err(err) = served {
                debug!("connection ended: {err:#}");
            }
        });
    }
}

/// Hyper service that only answers the [`serve_page`] routes.
#[derive(Clone)]
struct PageService(Arc<HeaderMap>);

impl hyper::service::Service<Request<Incoming>> for PageService {
    type Response = Response<ResponseBody>;
    type Error = http::Error;
    type Future = std::pin::Pin<
        Box<
            dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>>
                + Send,
        >,
    >;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = serve_page(req.method(), req.uri().path(), &self.0);
        Box::pin(async move { res })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use futures_util::SinkExt;
    use rand::{distributions::Alphanumeric, Rng};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        time::timeout,
    };
    use tokio_tungstenite::{connect_async, WebSocketStream};
    use tungstenite::protocol::Message;

    use super::*;

    type Client = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    fn setup_logging() {
        use tracing_subscriber::{prelude::*, EnvFilter};
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env())
            .try_init();
    }

    async fn spawn_local_relay() -> Result<Server> {
        spawn_local_relay_with_timeout(SLOT_TIMEOUT).await
    }

    async fn spawn_local_relay_with_timeout(slot_timeout: Duration) -> Result<Server> {
        Server::spawn(ServerConfig::<(), ()> {
            http_bind_addr: (Ipv4Addr::LOCALHOST, 0).into(),
            tls: None,
            slot_timeout,
        })
        .await
    }

    async fn connect(addr: SocketAddr, slot: &str) -> Client {
        let (conn, _response) = connect_async(format!("ws://{addr}/s/{slot}"))
            .await
            .expect("websocket connect");
        conn
    }

    async fn recv_code(conn: &mut Client) -> String {
        match timeout(Duration::from_secs(5), conn.next())
            .await
            .expect("timeout")
            .expect("eos")
            .expect("read")
        {
            Message::Text(code) => code,
            msg => panic!("expected the slot code, got {msg:?}"),
        }
    }

    async fn recv_close(conn: &mut Client) -> (u16, String) {
        loop {
            match timeout(Duration::from_secs(5), conn.next())
                .await
                .expect("timeout")
                .expect("eos")
                .expect("read")
            {
                Message::Close(Some(frame)) => {
                    return (frame.code.into(), frame.reason.into_owned())
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                msg => panic!("expected a close frame, got {msg:?}"),
            }
        }
    }

    async fn recv_msg(conn: &mut Client) -> Message {
        loop {
            match timeout(Duration::from_secs(5), conn.next())
                .await
                .expect("timeout")
                .expect("eos")
                .expect("read")
            {
                Message::Ping(_) | Message::Pong(_) => continue,
                msg => return msg,
            }
        }
    }

    #[tokio::test]
    async fn test_book_join_relay() -> Result<()> {
        setup_logging();
        let server = spawn_local_relay().await?;
        let addr = server.http_addr();

        let mut a = connect(addr, "").await;
        let code = recv_code(&mut a).await;
        assert!(code.bytes().all(|b| b.is_ascii_digit()));

        let mut b = connect(addr, &code).await;

        a.send(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef])).await?;
        assert_eq!(
            recv_msg(&mut b).await,
            Message::Binary(vec![0xde, 0xad, 0xbe, 0xef])
        );

        b.send(Message::Text("hi".into())).await?;
        assert_eq!(recv_msg(&mut a).await, Message::Text("hi".into()));

        // Either side closing tears the pair down; the other side's next
        // read ends the stream.
        a.close(None).await?;
        loop {
            match timeout(Duration::from_secs(5), b.next())
                .await
                .expect("timeout")
            {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_slot() -> Result<()> {
        setup_logging();
        let server = spawn_local_relay().await?;

        let mut conn = connect(server.http_addr(), "12345").await;
        let (code, reason) = recv_close(&mut conn).await;
        assert_eq!(code, 4000);
        assert_eq!(reason, "no such slot");

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_booking_timeout() -> Result<()> {
        setup_logging();
        let server = spawn_local_relay_with_timeout(Duration::from_millis(100)).await?;
        let addr = server.http_addr();

        let mut a = connect(addr, "").await;
        let code = recv_code(&mut a).await;

        let (close_code, reason) = recv_close(&mut a).await;
        assert_eq!(close_code, 4001);
        assert_eq!(reason, "timed out");

        // The timed-out code was released; a late joiner finds nothing.
        let mut b = connect(addr, &code).await;
        let (close_code, _) = recv_close(&mut b).await;
        assert_eq!(close_code, 4000);

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_join_race() -> Result<()> {
        setup_logging();
        let server = spawn_local_relay().await?;
        let addr = server.http_addr();

        let mut a = connect(addr, "").await;
        let code = recv_code(&mut a).await;

        // Two joiners race for the same code. Each announces itself as its
        // first frame; only the winner's announcement reaches the booker.
        let mut b1 = connect(addr, &code).await;
        let mut b2 = connect(addr, &code).await;
        b1.send(Message::Text("one".into())).await?;
        b2.send(Message::Text("two".into())).await?;

        let winner = match recv_msg(&mut a).await {
            Message::Text(marker) if marker == "one" => 1,
            Message::Text(marker) if marker == "two" => 2,
            msg => panic!("expected a joiner marker, got {msg:?}"),
        };
        let (mut winner_conn, mut loser_conn) = if winner == 1 { (b1, b2) } else { (b2, b1) };

        let (close_code, reason) = recv_close(&mut loser_conn).await;
        assert_eq!(close_code, 4000);
        assert_eq!(reason, "no such slot");

        // The winning pair relays both ways.
        a.send(Message::Text("welcome".into())).await?;
        assert_eq!(
            recv_msg(&mut winner_conn).await,
            Message::Text("welcome".into())
        );

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_forwarding_fidelity() -> Result<()> {
        setup_logging();
        let server = spawn_local_relay().await?;
        let addr = server.http_addr();

        let mut a = connect(addr, "").await;
        let code = recv_code(&mut a).await;
        let mut b = connect(addr, &code).await;

        let mut rng = rand::thread_rng();
        for n in 0..256usize {
            let msg = if n % 2 == 0 {
                let len = rng.gen_range(1..512);
                let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                Message::Binary(payload)
            } else {
                let len = rng.gen_range(1..512);
                let payload: String = (&mut rng)
                    .sample_iter(Alphanumeric)
                    .take(len)
                    .map(char::from)
                    .collect();
                Message::Text(payload)
            };
            a.send(msg.clone()).await?;
            assert_eq!(recv_msg(&mut b).await, msg, "frame {n} was mangled");
        }

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_index_and_version_header() -> Result<()> {
        setup_logging();
        let server = spawn_local_relay().await?;
        let addr = server.http_addr();

        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        let response = String::from_utf8_lossy(&buf).to_lowercase();
        assert!(response.starts_with("http/1.1 200"));
        assert!(response.contains(&format!("{VERSION_HEADER}: {PROTOCOL_VERSION}")));
        assert!(response.contains("rendezvous relay"));

        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(b"GET /robots.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        let response = String::from_utf8_lossy(&buf);
        assert!(response.contains("Disallow: /"));

        server.shutdown().await?;
        Ok(())
    }

    fn make_tls_config() -> TlsConfig<(), ()> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("self-signed cert");
        let rustls_certificate = cert.cert.der().clone();
        let rustls_key =
            rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("protocols supported by ring")
        .with_no_client_auth()
        .with_single_cert(vec![rustls_certificate.clone()], rustls_key.into())
        .expect("cert is right");

        TlsConfig {
            https_bind_addr: (Ipv4Addr::LOCALHOST, 0).into(),
            cert: CertConfig::Manual {
                certs: vec![rustls_certificate],
            },
            server_config,
        }
    }

    #[derive(Debug)]
    struct NoCertVerification(Arc<rustls::crypto::CryptoProvider>);

    impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error>
        {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    async fn connect_tls(
        addr: SocketAddr,
        slot: &str,
    ) -> WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .expect("protocols supported by ring")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerification(provider)))
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(addr).await.expect("tcp connect");
        let domain =
            rustls::pki_types::ServerName::try_from("localhost".to_string()).expect("valid name");
        let tls = connector.connect(domain, tcp).await.expect("tls connect");
        let (conn, _response) = tokio_tungstenite::client_async(
            format!("wss://localhost:{}/s/{slot}", addr.port()),
            tls,
        )
        .await
        .expect("websocket connect");
        conn
    }

    #[tokio::test]
    async fn test_https_relay() -> Result<()> {
        setup_logging();
        let server = Server::spawn(ServerConfig::<(), ()> {
            http_bind_addr: (Ipv4Addr::LOCALHOST, 0).into(),
            tls: Some(make_tls_config()),
            slot_timeout: SLOT_TIMEOUT,
        })
        .await?;
        let addr = server.https_addr().expect("https enabled");

        let mut a = connect_tls(addr, "").await;
        let code = match timeout(Duration::from_secs(5), a.next())
            .await
            .expect("timeout")
            .expect("eos")
            .expect("read")
        {
            Message::Text(code) => code,
            msg => panic!("expected the slot code, got {msg:?}"),
        };

        let mut b = connect_tls(addr, &code).await;
        a.send(Message::Text("over tls".into())).await?;
        match timeout(Duration::from_secs(5), b.next())
            .await
            .expect("timeout")
            .expect("eos")
            .expect("read")
        {
            Message::Text(payload) => assert_eq!(payload, "over tls"),
            msg => panic!("expected text frame, got {msg:?}"),
        }

        // The plain HTTP listener still serves the version header.
        let mut stream = TcpStream::connect(server.http_addr()).await?;
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        let response = String::from_utf8_lossy(&buf).to_lowercase();
        assert!(response.contains(&format!("{VERSION_HEADER}: {PROTOCOL_VERSION}")));

        server.shutdown().await?;
        Ok(())
    }
}
