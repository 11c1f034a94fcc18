use crate::{
    Body, Error,
    cert_cache::LeafCertificateCache,
    certificate_authority::{CertificateAuthority, LeafCertificate},
    monitor::{Exchange, Monitor, dump_request},
    proxy::upstream::{self, with_default_port},
    relay::relay,
};
use http::uri::{Authority, Scheme};
use http_body_util::BodyExt;
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    client::conn::http1,
    header::{CONNECTION, CONTENT_TYPE, COOKIE, Entry, HOST, HeaderValue},
    upgrade::OnUpgrade,
};
use hyper_util::rt::TokioIo;
use std::{convert::Infallible, future::Future, io, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tokio_graceful::ShutdownGuard;
use tokio_rustls::{TlsConnector, rustls::ServerConfig};
use tracing::{Instrument, Span, debug, error, info_span, instrument};

pub(crate) const PROXY_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub(crate) fn bad_request() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Body::empty())
        .expect("Failed to build response")
}

pub(crate) fn bad_gateway(err: &Error) -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(err.to_string()))
        .expect("Failed to build response")
}

pub(crate) fn respond(res: Result<Response<Body>, Error>) -> Response<Body> {
    res.unwrap_or_else(|e| {
        error!("Failed to proxy request: {}", e);
        bad_gateway(&e)
    })
}

pub(crate) fn spawn_with_trace<T: Send + 'static>(
    fut: impl Future<Output = T> + Send + 'static,
    span: Span,
) -> JoinHandle<T> {
    tokio::spawn(fut.instrument(span))
}

/// State shared by every connection a proxy accepts.
pub(crate) struct Shared<CA> {
    pub certs: LeafCertificateCache<CA>,
    /// Template for intercepted TLS sessions. Cloned, never mutated.
    pub leaf_config: Arc<ServerConfig>,
    pub connector: TlsConnector,
    pub upstream: Option<String>,
    pub monitor: Option<Monitor>,
}

pub(crate) struct InternalProxy<CA> {
    pub shared: Arc<Shared<CA>>,
    pub client_addr: SocketAddr,
    /// Held by every task spawned for this connection, so shutdown waits for them.
    pub guard: ShutdownGuard,
}

impl<CA> Clone for InternalProxy<CA> {
    fn clone(&self) -> Self {
        InternalProxy {
            shared: Arc::clone(&self.shared),
            client_addr: self.client_addr,
            guard: self.guard.clone(),
        }
    }
}

impl<CA: CertificateAuthority> InternalProxy<CA> {
    #[instrument(
        skip_all,
        fields(
            version = ?req.version(),
            method = %req.method(),
            uri = %req.uri(),
            client_addr = %self.client_addr,
        )
    )]
    pub(crate) async fn proxy(self, req: Request<Incoming>) -> Result<Response<Body>, Infallible> {
        let is_connect = req.method() == Method::CONNECT;

        let res = match (self.shared.upstream.as_deref(), is_connect) {
            (Some(upstream), true) => {
                self.forward_connect(upstream, req)
                    .instrument(info_span!("forward_connect"))
                    .await
            }
            (Some(upstream), false) => {
                self.forward_request(upstream, req)
                    .instrument(info_span!("forward_request"))
                    .await
            }
            (None, true) => self.process_connect(req).await,
            (None, false) => {
                self.direct_request(req)
                    .instrument(info_span!("proxy_request"))
                    .await
            }
        };

        Ok(respond(res))
    }

    /// Mint the leaf for the CONNECT target and take over the connection once the client has
    /// been told the tunnel is open.
    async fn process_connect(&self, mut req: Request<Incoming>) -> Result<Response<Body>, Error> {
        let Some(authority) = req.uri().authority().cloned() else {
            return Ok(bad_request());
        };

        let leaf = self.mint(upstream::bare_host(&authority)).await?;

        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(Error::HijackUnsupported)?;

        let proxy = self.clone();
        let fut = async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    proxy
                        .intercept(TokioIo::new(upgraded), authority, leaf)
                        .await
                }
                Err(e) => error!("Upgrade error: {}", e),
            }
        };

        self.spawn_upgraded(fut, info_span!("process_connect"));
        Ok(Response::new(Body::empty()))
    }

    /// Fetch or mint the leaf for `host` on the blocking pool, keeping RSA signing off the
    /// connection workers.
    async fn mint(&self, host: &str) -> Result<LeafCertificate, Error> {
        let shared = Arc::clone(&self.shared);
        let host = host.to_owned();

        tokio::task::spawn_blocking(move || shared.certs.get_or_mint(&host))
            .await
            .map_err(io::Error::from)?
    }

    /// Run a task that owns an upgraded connection. It is tracked by the shutdown guard and
    /// dropped when shutdown begins.
    fn spawn_upgraded(&self, fut: impl Future<Output = ()> + Send + 'static, span: Span) {
        let guard = self.guard.clone();

        self.guard.spawn_task(
            async move {
                tokio::select! {
                    () = fut => {}
                    _ = guard.cancelled() => debug!("Closing upgraded connection for shutdown"),
                }
            }
            .instrument(span),
        );
    }

    /// Send a non-CONNECT request straight to its origin, over TLS when its scheme is `https`.
    pub(crate) async fn direct_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Body>, Error> {
        let Some(authority) = request_authority(&req) else {
            return Ok(bad_request());
        };

        let tls = req.uri().scheme() == Some(&Scheme::HTTPS);
        let addr = with_default_port(authority.as_str(), if tls { 443 } else { 80 });
        let tcp = upstream::dial(&addr).await?;

        if tls {
            let stream =
                upstream::connect_tls(&self.shared.connector, &authority, &addr, tcp).await?;
            self.exchange(stream, req, &authority).await
        } else {
            self.exchange(tcp, req, &authority).await
        }
    }

    async fn forward_connect(
        &self,
        upstream: &str,
        mut req: Request<Incoming>,
    ) -> Result<Response<Body>, Error> {
        let Some(authority) = req.uri().authority().cloned() else {
            return Ok(bad_request());
        };

        let target = with_default_port(authority.as_str(), 80);

        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(Error::HijackUnsupported)?;

        let tunnel = upstream::connect_upstream(upstream, &target).await?;

        let fut = async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = relay(TokioIo::new(upgraded), tunnel).await {
                        debug!("{}", e);
                    }
                }
                Err(e) => error!("Upgrade error: {}", e),
            }
        };

        self.spawn_upgraded(fut, info_span!("tunnel", %target));

        Ok(Response::builder()
            .header("Proxy-Agent", PROXY_AGENT)
            .body(Body::empty())?)
    }

    async fn forward_request(
        &self,
        upstream: &str,
        req: Request<Incoming>,
    ) -> Result<Response<Body>, Error> {
        let Some(authority) = request_authority(&req) else {
            return Ok(bad_request());
        };

        let target = with_default_port(authority.as_str(), 80);
        let tunnel = upstream::connect_upstream(upstream, &target).await?;

        self.exchange(tunnel, req, &authority).await
    }

    /// Perform one request/response round trip over `io`.
    async fn exchange<I>(
        &self,
        io: I,
        req: Request<Incoming>,
        authority: &Authority,
    ) -> Result<Response<Body>, Error>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let req = normalize_request(req, authority);

        let (mut sender, conn) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(io))
            .await?;

        spawn_with_trace(
            async move {
                if let Err(e) = conn.await {
                    debug!("Origin connection closed: {}", e);
                }
            },
            Span::current(),
        );

        let Some(monitor) = &self.shared.monitor else {
            let res = sender.send_request(req.map(Body::from)).await?;
            return Ok(res.map(Body::from));
        };

        let (parts, body) = req.into_parts();
        let req = Request::from_parts(parts, body.collect().await?.to_bytes());
        let request = dump_request(&req);

        let res = sender.send_request(req.map(Body::from)).await?;
        let (parts, body) = res.into_parts();
        let body = body.collect().await?.to_bytes();

        monitor.submit(Exchange {
            client_addr: self.client_addr,
            request,
            status: parts.status,
            headers: parts.headers.clone(),
            body: body.clone(),
        });

        Ok(Response::from_parts(parts, Body::from(body)))
    }
}

/// Target of a non-CONNECT request: the absolute URI's authority, else the `Host` header.
fn request_authority<T>(req: &Request<T>) -> Option<Authority> {
    req.uri().authority().cloned().or_else(|| {
        req.headers()
            .get(HOST)
            .and_then(|host| Authority::try_from(host.as_bytes()).ok())
    })
}

/// Rewrite a request read from an intercepted TLS session to target `https://<authority>`.
pub(crate) fn with_https_authority<T>(req: Request<T>, authority: Authority) -> Option<Request<T>> {
    let (mut parts, body) = req.into_parts();

    parts.uri = {
        let mut uri = parts.uri.into_parts();
        uri.scheme = Some(Scheme::HTTPS);
        uri.authority = Some(authority);
        if uri.path_and_query.is_none() {
            uri.path_and_query = Some("/".parse().ok()?);
        }
        Uri::from_parts(uri).ok()?
    };

    Some(Request::from_parts(parts, body))
}

#[instrument(skip_all)]
fn normalize_request<T>(mut req: Request<T>, authority: &Authority) -> Request<T> {
    let headers = req.headers_mut();
    headers.remove("proxy-connection");
    headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));

    if !headers.contains_key(HOST) {
        if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(HOST, host);
        }
    }

    // HTTP/2 supports multiple cookie headers, but HTTP/1.x only supports one.
    if let Entry::Occupied(mut cookies) = headers.entry(COOKIE) {
        let joined_cookies = bstr::join(b"; ", cookies.iter());
        if let Ok(joined_cookies) = HeaderValue::try_from(joined_cookies) {
            cookies.insert(joined_cookies);
        }
    }

    *req.uri_mut() = req
        .uri()
        .path_and_query()
        .cloned()
        .map_or_else(|| Uri::from_static("/"), Uri::from);
    *req.version_mut() = hyper::Version::HTTP_11;
    req
}
