use interloper::{
    Error,
    certificate_authority::{CertificateAuthority, LeafCertificate, OpensslAuthority},
    rustls::pki_types::ServerName,
};
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};
use tokio_rustls::TlsConnector;
use x509_parser::prelude::*;

mod common;

#[tokio::test]
async fn https() {
    let dir = tempfile::tempdir().unwrap();
    let ca = common::build_ca(dir.path());
    let (server_addr, stop_server) = common::start_https_server(&ca).await;

    let (proxy_addr, stop_proxy) = common::start_proxy(
        common::build_ca(dir.path()),
        common::ProxyOptions {
            client_config: Some(common::client_config(&ca)),
            ..Default::default()
        },
    )
    .await;
    let client = common::build_client(proxy_addr, &ca);

    let res = client
        .get(format!("https://localhost:{}/hello", server_addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), common::HELLO_WORLD);

    stop_server.send(()).unwrap();
    stop_proxy.send(()).unwrap();
}

#[tokio::test]
async fn https_post() {
    let dir = tempfile::tempdir().unwrap();
    let ca = common::build_ca(dir.path());
    let (server_addr, stop_server) = common::start_https_server(&ca).await;

    let (proxy_addr, stop_proxy) = common::start_proxy(
        common::build_ca(dir.path()),
        common::ProxyOptions {
            client_config: Some(common::client_config(&ca)),
            ..Default::default()
        },
    )
    .await;
    let client = common::build_client(proxy_addr, &ca);

    let res = client
        .post(format!("https://localhost:{}/echo", server_addr.port()))
        .body("ping")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "ping");

    stop_server.send(()).unwrap();
    stop_proxy.send(()).unwrap();
}

#[tokio::test]
async fn presents_leaf_for_connect_target() {
    let dir = tempfile::tempdir().unwrap();
    let ca = common::build_ca(dir.path());
    let (proxy_addr, stop_proxy) =
        common::start_proxy(common::build_ca(dir.path()), Default::default()).await;

    let mut tcp = TcpStream::connect(proxy_addr).await.unwrap();
    tcp.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let head = common::read_head(&mut tcp).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");

    let connector = TlsConnector::from(Arc::new(common::client_config(&ca)));
    let tls = connector
        .connect(ServerName::try_from("example.com").unwrap(), tcp)
        .await
        .unwrap();

    let (_, session) = tls.get_ref();
    let leaf = session.peer_certificates().unwrap()[0].clone();
    let (_, leaf) = parse_x509_certificate(&leaf).unwrap();
    let issuer = ca.issuer_der().unwrap();
    let (_, issuer) = parse_x509_certificate(&issuer).unwrap();

    let cn = leaf.subject().iter_common_name().next().unwrap();
    assert_eq!(cn.as_str().unwrap(), "example.com");
    assert_eq!(leaf.issuer(), issuer.subject());

    stop_proxy.send(()).unwrap();
}

#[tokio::test]
async fn tunnels_non_tls_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let (server_addr, stop_server) = common::start_http_server().await;
    let (proxy_addr, stop_proxy) =
        common::start_proxy(common::build_ca(dir.path()), Default::default()).await;

    let mut tcp = TcpStream::connect(proxy_addr).await.unwrap();
    tcp.write_all(
        format!("CONNECT {server_addr} HTTP/1.1\r\nHost: {server_addr}\r\n\r\n").as_bytes(),
    )
    .await
    .unwrap();

    let head = common::read_head(&mut tcp).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");

    tcp.write_all(
        format!("GET /hello HTTP/1.1\r\nHost: {server_addr}\r\nConnection: close\r\n\r\n")
            .as_bytes(),
    )
    .await
    .unwrap();

    let mut res = String::new();
    tcp.read_to_string(&mut res).await.unwrap();

    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.ends_with(common::HELLO_WORLD), "{res}");

    stop_server.send(()).unwrap();
    stop_proxy.send(()).unwrap();
}

#[tokio::test]
async fn http() {
    let dir = tempfile::tempdir().unwrap();
    let ca = common::build_ca(dir.path());
    let (server_addr, stop_server) = common::start_http_server().await;
    let (proxy_addr, stop_proxy) =
        common::start_proxy(common::build_ca(dir.path()), Default::default()).await;
    let client = common::build_client(proxy_addr, &ca);

    let res = client
        .get(format!("http://{server_addr}/hello"))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), common::HELLO_WORLD);

    stop_server.send(()).unwrap();
    stop_proxy.send(()).unwrap();
}

#[tokio::test]
async fn rewrites_proxy_headers() {
    let dir = tempfile::tempdir().unwrap();
    let ca = common::build_ca(dir.path());
    let (server_addr, stop_server) = common::start_http_server().await;
    let (proxy_addr, stop_proxy) =
        common::start_proxy(common::build_ca(dir.path()), Default::default()).await;
    let client = common::build_client(proxy_addr, &ca);

    let body = client
        .get(format!("http://{server_addr}/inspect"))
        .header("proxy-connection", "keep-alive")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(
        body,
        format!("uri=/inspect host={server_addr} connection=Keep-Alive proxy-connection=")
    );

    stop_server.send(()).unwrap();
    stop_proxy.send(()).unwrap();
}

#[tokio::test]
async fn unreachable_origin() {
    let dir = tempfile::tempdir().unwrap();
    let ca = common::build_ca(dir.path());
    let (proxy_addr, stop_proxy) =
        common::start_proxy(common::build_ca(dir.path()), Default::default()).await;
    let client = common::build_client(proxy_addr, &ca);

    // Bind and drop to get a port nothing listens on.
    let closed = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let res = client
        .get(format!("http://{closed}/hello"))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 502);
    assert!(!res.text().await.unwrap().is_empty());

    stop_proxy.send(()).unwrap();
}

struct FailingAuthority;

impl CertificateAuthority for FailingAuthority {
    fn issue_leaf(&self, _host: &str, _valid_until: SystemTime) -> Result<LeafCertificate, Error> {
        Err(Error::IssuerExpired)
    }
}

#[tokio::test]
async fn failed_mint_rejects_connect() {
    let (proxy_addr, stop_proxy) = common::start_proxy(FailingAuthority, Default::default()).await;

    let mut tcp = TcpStream::connect(proxy_addr).await.unwrap();
    tcp.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let head = common::read_head(&mut tcp).await;
    assert!(head.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{head}");

    let len = common::content_length(&head);
    assert!(len > 0, "{head}");
    let mut body = vec![0; len];
    tcp.read_exact(&mut body).await.unwrap();
    assert_eq!(body, Error::IssuerExpired.to_string().as_bytes());

    stop_proxy.send(()).unwrap();
}

const MINT_DELAY: Duration = Duration::from_millis(500);

/// Takes [`MINT_DELAY`] to issue each leaf, blocking the calling thread.
struct SlowAuthority(OpensslAuthority);

impl CertificateAuthority for SlowAuthority {
    fn issue_leaf(&self, host: &str, valid_until: SystemTime) -> Result<LeafCertificate, Error> {
        std::thread::sleep(MINT_DELAY);
        self.0.issue_leaf(host, valid_until)
    }
}

// Runs on a single-threaded runtime, so a mint on the worker would stall every other task.
#[tokio::test]
async fn minting_does_not_stall_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let (proxy_addr, stop_proxy) = common::start_proxy(
        SlowAuthority(common::build_ca(dir.path())),
        Default::default(),
    )
    .await;

    let mut tcp = TcpStream::connect(proxy_addr).await.unwrap();
    tcp.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let started = Instant::now();
    let mut longest_tick = Duration::ZERO;
    let head = common::read_head(&mut tcp);
    tokio::pin!(head);

    let head = loop {
        let tick = Instant::now();
        tokio::select! {
            head = &mut head => break head,
            () = tokio::time::sleep(Duration::from_millis(10)) => {
                longest_tick = longest_tick.max(tick.elapsed());
            }
        }
    };

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(started.elapsed() >= MINT_DELAY);
    assert!(longest_tick < MINT_DELAY / 2, "{longest_tick:?}");

    stop_proxy.send(()).unwrap();
}
