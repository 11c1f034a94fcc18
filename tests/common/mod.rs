#![allow(dead_code)]

use async_compression::tokio::bufread::GzipEncoder;
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::{CONNECTION, CONTENT_ENCODING, HOST},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use interloper::{
    Proxy,
    certificate_authority::{CertificateAuthority, IdentityConfig, LEAF_TTL, OpensslAuthority},
    monitor::Monitor,
    rustls::{
        self, ClientConfig, RootCertStore, ServerConfig,
        crypto::aws_lc_rs,
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
    },
};
use std::{
    convert::Infallible,
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::SystemTime,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot::{self, Sender},
};
use tokio_rustls::TlsAcceptor;

pub const HELLO_WORLD: &str = "Hello, World!";

fn header_value<T>(req: &Request<T>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

async fn test_server(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/hello") => Ok(Response::new(Full::from(HELLO_WORLD))),
        (&Method::GET, "/hello/gzip") => {
            let mut body = Vec::new();
            GzipEncoder::new(HELLO_WORLD.as_bytes())
                .read_to_end(&mut body)
                .await
                .unwrap();

            Ok(Response::builder()
                .header(CONTENT_ENCODING, "gzip")
                .status(StatusCode::OK)
                .body(Full::from(body))
                .unwrap())
        }
        (&Method::GET, "/inspect") => Ok(Response::new(Full::from(format!(
            "uri={} host={} connection={} proxy-connection={}",
            req.uri(),
            header_value(&req, HOST.as_str()),
            header_value(&req, CONNECTION.as_str()),
            header_value(&req, "proxy-connection"),
        )))),
        (&Method::POST, "/echo") => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Ok(Response::new(Full::new(body)))
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::default())
            .unwrap()),
    }
}

async fn serve<I>(io: I)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _ = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service_fn(test_server))
        .await;
}

async fn accept_loop<F, Fut>(listener: TcpListener, rx: oneshot::Receiver<()>, handle: F)
where
    F: Fn(TcpStream) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut rx = std::pin::pin!(rx);

    loop {
        tokio::select! {
            res = listener.accept() => {
                if let Ok((tcp, _)) = res {
                    tokio::spawn(handle(tcp));
                }
            }
            _ = rx.as_mut() => break,
        }
    }
}

pub async fn start_http_server() -> (SocketAddr, Sender<()>) {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(accept_loop(listener, rx, serve));

    (addr, tx)
}

#[derive(Debug)]
struct StaticResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for StaticResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// HTTPS origin for `localhost`, presenting a leaf issued by `ca`.
pub async fn start_https_server(ca: &OpensslAuthority) -> (SocketAddr, Sender<()>) {
    let leaf = ca
        .issue_leaf("localhost", SystemTime::now() + LEAF_TTL)
        .unwrap();

    let mut server_config =
        ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(StaticResolver(Arc::clone(
                leaf.certified_key(),
            ))));
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(accept_loop(listener, rx, move |tcp| {
        let acceptor = acceptor.clone();
        async move {
            if let Ok(stream) = acceptor.accept(tcp).await {
                serve(stream).await;
            }
        }
    }));

    (addr, tx)
}

/// Fake upstream proxy answering every request with `status_line` and closing.
pub async fn start_rejecting_upstream(status_line: &'static str) -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut tcp, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_head(&mut tcp).await;
                let res = format!("{status_line}\r\nContent-Length: 0\r\n\r\n");
                let _ = tcp.write_all(res.as_bytes()).await;
            });
        }
    });

    addr
}

/// Value of the `Content-Length` header in a message head read with [`read_head`].
pub fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().unwrap())
        })
        .unwrap()
}

/// Read an HTTP message head, up to and including the blank line.
pub async fn read_head<I: AsyncRead + Unpin>(io: &mut I) -> String {
    let mut head = Vec::new();
    let mut byte = [0; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if io.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }

    String::from_utf8(head).unwrap()
}

pub fn build_ca(dir: &Path) -> OpensslAuthority {
    let config = IdentityConfig::new(dir.join("ca-pk.pem"), dir.join("ca-cert.pem"));
    OpensslAuthority::ensure_identity(&config, aws_lc_rs::default_provider()).unwrap()
}

/// Client configuration trusting only `ca`.
pub fn client_config(ca: &OpensslAuthority) -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.add(ca.issuer_der().unwrap()).unwrap();

    ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

#[derive(Default)]
pub struct ProxyOptions {
    pub upstream: Option<String>,
    pub client_config: Option<rustls::ClientConfig>,
    pub monitor: Option<Monitor>,
}

pub async fn start_proxy<CA: CertificateAuthority>(
    ca: CA,
    options: ProxyOptions,
) -> (SocketAddr, Sender<()>) {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    let mut builder = Proxy::builder()
        .with_listener(listener)
        .with_ca(ca)
        .with_graceful_shutdown(async {
            rx.await.unwrap_or_default();
        });

    if let Some(upstream) = options.upstream {
        builder = builder.with_upstream(upstream);
    }
    if let Some(client_config) = options.client_config {
        builder = builder.with_client_tls_config(client_config);
    }
    if let Some(monitor) = options.monitor {
        builder = builder.with_monitor(monitor);
    }

    tokio::spawn(builder.build().unwrap().start());

    (addr, tx)
}

pub fn build_client(proxy: SocketAddr, ca: &OpensslAuthority) -> reqwest::Client {
    let proxy = reqwest::Proxy::all(format!("http://{proxy}")).unwrap();
    let ca_cert =
        reqwest::Certificate::from_pem(&ca.issuing_certificate().to_pem().unwrap()).unwrap();

    reqwest::Client::builder()
        .proxy(proxy)
        .add_root_certificate(ca_cert)
        .build()
        .unwrap()
}
