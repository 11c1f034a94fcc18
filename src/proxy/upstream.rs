use crate::{Body, Error};
use http::uri::Authority;
use hyper::{
    Method, Request, StatusCode,
    client::conn::http1,
    header::HOST,
    upgrade::Upgraded,
};
use hyper_util::rt::TokioIo;
use std::{io, time::Duration};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream, rustls::pki_types::ServerName};
use tracing::{Instrument, Span, debug};

/// Bound on establishing any outbound TCP connection.
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Append `:port` to `host` unless it already ends in an explicit port.
///
/// A host ends in a port when the text after its last `:` is a non-empty run of ASCII digits.
pub(crate) fn with_default_port(host: &str, port: u16) -> String {
    match host.rsplit_once(':') {
        Some((_, p)) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => host.to_owned(),
        _ => format!("{host}:{port}"),
    }
}

/// Hostname of `authority` without port or IPv6 brackets.
pub(crate) fn bare_host(authority: &Authority) -> &str {
    authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
}

pub(crate) async fn dial(addr: &str) -> Result<TcpStream, Error> {
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(Error::Dial {
            addr: addr.to_owned(),
            source,
        }),
        Err(_) => Err(Error::Timeout(addr.to_owned())),
    }
}

/// Start a TLS session with the origin named by `authority` over `tcp`.
pub(crate) async fn connect_tls(
    connector: &TlsConnector,
    authority: &Authority,
    addr: &str,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>, Error> {
    let dial_error = |source| Error::Dial {
        addr: addr.to_owned(),
        source,
    };

    let domain = ServerName::try_from(bare_host(authority).to_owned())
        .map_err(|e| dial_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    match tokio::time::timeout(DIAL_TIMEOUT, connector.connect(domain, tcp)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(dial_error(source)),
        Err(_) => Err(Error::Timeout(addr.to_owned())),
    }
}

/// Open a tunnel to `target` through the proxy at `upstream`.
///
/// Sends `CONNECT <target> HTTP/1.1` and accepts nothing but `200`.
pub(crate) async fn connect_upstream(
    upstream: &str,
    target: &str,
) -> Result<TokioIo<Upgraded>, Error> {
    let tcp = dial(upstream).await?;

    let (mut sender, conn) = http1::Builder::new()
        .title_case_headers(true)
        .handshake(TokioIo::new(tcp))
        .await?;

    tokio::spawn(
        async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Upstream connection closed: {}", e);
            }
        }
        .instrument(Span::current()),
    );

    let req = Request::builder()
        .method(Method::CONNECT)
        .uri(target)
        .header(HOST, target)
        .header("Proxy-Connection", "keep-alive")
        .body(Body::empty())?;

    let mut res = sender.send_request(req).await?;

    if res.status() != StatusCode::OK {
        return Err(Error::UpstreamRejected(res.status()));
    }

    let upgraded = hyper::upgrade::on(&mut res).await?;
    Ok(TokioIo::new(upgraded))
}
