mod intercept;
mod internal;
mod upstream;

pub mod builder;

use crate::{Error, certificate_authority::CertificateAuthority, deadline::Deadline};
use builder::{AddrOrListener, WantsAddr};
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use internal::{InternalProxy, Shared};
use std::{pin::pin, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_graceful::{Shutdown, ShutdownGuard};
use tokio_rustls::{TlsAcceptor, rustls::ServerConfig};
use tracing::{Instrument, debug, error, info, info_span, warn};

pub use builder::ProxyBuilder;

/// Longest a client connection may go without a read or write completing. Applies to tunnels and
/// intercepted sessions on that connection as well.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// How long in-flight connections get to finish after the shutdown signal.
const SHUTDOWN_LIMIT: Duration = Duration::from_secs(30);

/// A proxy server. This must be constructed with a [`ProxyBuilder`].
///
/// # Examples
///
/// ```rust,no_run
/// use interloper::{
///     Proxy,
///     certificate_authority::{IdentityConfig, OpensslAuthority},
///     rustls::crypto::aws_lc_rs,
/// };
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), interloper::Error> {
/// let ca = OpensslAuthority::ensure_identity(
///     &IdentityConfig::default(),
///     aws_lc_rs::default_provider(),
/// )?;
///
/// let (stop, done) = tokio::sync::oneshot::channel();
///
/// let proxy = Proxy::builder()
///     .with_addr(std::net::SocketAddr::from(([127, 0, 0, 1], 8080)))
///     .with_ca(ca)
///     .with_graceful_shutdown(async {
///         done.await.unwrap_or_default();
///     })
///     .build()?;
///
/// tokio::spawn(proxy.start());
///
/// // Do something else...
///
/// stop.send(()).unwrap();
/// # Ok(())
/// # }
/// ```
pub struct Proxy<CA, F> {
    addr_or_listener: AddrOrListener,
    shared: Arc<Shared<CA>>,
    inbound_tls: Option<Arc<ServerConfig>>,
    graceful_shutdown: F,
}

impl Proxy<(), ()> {
    /// Create a new [`ProxyBuilder`].
    pub fn builder() -> ProxyBuilder<WantsAddr> {
        ProxyBuilder::new()
    }
}

impl<CA, F> Proxy<CA, F>
where
    CA: CertificateAuthority,
    F: Future<Output = ()> + Send + 'static,
{
    /// Attempts to start the proxy server.
    ///
    /// Runs until the graceful shutdown signal resolves, then waits a bounded time for open
    /// connections to finish.
    ///
    /// # Errors
    ///
    /// This will return an error if the proxy server is unable to be started.
    pub async fn start(self) -> Result<(), Error> {
        let Proxy {
            addr_or_listener,
            shared,
            inbound_tls,
            graceful_shutdown,
        } = self;

        let listener = match addr_or_listener {
            AddrOrListener::Addr(addr) => TcpListener::bind(addr).await?,
            AddrOrListener::Listener(listener) => listener,
        };

        info!("Listening on {}", listener.local_addr()?);

        let shutdown = Shutdown::new(graceful_shutdown);
        let guard = shutdown.guard_weak();

        loop {
            tokio::select! {
                res = listener.accept() => {
                    let (tcp, client_addr) = match res {
                        Ok((tcp, client_addr)) => (tcp, client_addr),
                        Err(e) => {
                            error!("Failed to accept incoming connection: {}", e);
                            continue;
                        }
                    };

                    let _ = tcp.set_nodelay(true);
                    let tcp = Deadline::new(tcp, IDLE_TIMEOUT);

                    let shared = Arc::clone(&shared);
                    let inbound_tls = inbound_tls.clone();
                    let span = info_span!("connection", %client_addr);

                    shutdown.spawn_task_fn(move |guard| {
                        let proxy = InternalProxy {
                            shared,
                            client_addr,
                            guard: guard.clone(),
                        };

                        async move {
                            match inbound_tls {
                                Some(server_config) => {
                                    match TlsAcceptor::from(server_config).accept(tcp).await {
                                        Ok(stream) => serve_connection(stream, proxy, guard).await,
                                        Err(e) => debug!("Inbound TLS handshake failed: {}", e),
                                    }
                                }
                                None => serve_connection(tcp, proxy, guard).await,
                            }
                        }
                        .instrument(span)
                    });
                }
                _ = guard.cancelled() => {
                    break;
                }
            }
        }

        match shutdown.shutdown_with_limit(SHUTDOWN_LIMIT).await {
            Ok(elapsed) => info!("Shut down gracefully in {:?}", elapsed),
            Err(_) => warn!("Connections still open after {:?}", SHUTDOWN_LIMIT),
        }

        Ok(())
    }
}

async fn serve_connection<I, CA>(io: I, proxy: InternalProxy<CA>, guard: ShutdownGuard)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    CA: CertificateAuthority,
{
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(
            TokioIo::new(io),
            service_fn(move |req| proxy.clone().proxy(req)),
        )
        .with_upgrades();

    let mut conn = pin!(conn);

    let served = tokio::select! {
        res = conn.as_mut() => res,
        _ = guard.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    if let Err(e) = served {
        debug!("Connection closed with error: {}", e);
    }
}
