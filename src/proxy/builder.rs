use crate::{
    Error,
    cert_cache::LeafCertificateCache,
    certificate_authority::CertificateAuthority,
    monitor::Monitor,
    proxy::{Proxy, internal::Shared},
};
use hyper_rustls::ConfigBuilderExt;
use std::{
    future::{Pending, pending},
    net::SocketAddr,
    sync::Arc,
};
use tokio::net::TcpListener;
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, ServerConfig,
        crypto::{CryptoProvider, aws_lc_rs},
        server::ResolvesServerCertUsingSni,
    },
};

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// A builder for creating a [`Proxy`].
#[derive(Debug)]
pub struct ProxyBuilder<T>(T);

/// Builder state that needs either an address or a TCP listener.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WantsAddr(());

#[derive(Debug)]
pub(crate) enum AddrOrListener {
    Addr(SocketAddr),
    Listener(TcpListener),
}

impl ProxyBuilder<WantsAddr> {
    /// Create a new ProxyBuilder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to listen on.
    pub fn with_addr(self, addr: SocketAddr) -> ProxyBuilder<WantsCa> {
        ProxyBuilder(WantsCa {
            addr_or_listener: AddrOrListener::Addr(addr),
        })
    }

    /// Set a listener to use for the proxy server.
    pub fn with_listener(self, listener: TcpListener) -> ProxyBuilder<WantsCa> {
        ProxyBuilder(WantsCa {
            addr_or_listener: AddrOrListener::Listener(listener),
        })
    }
}

impl Default for ProxyBuilder<WantsAddr> {
    fn default() -> Self {
        ProxyBuilder(WantsAddr(()))
    }
}

/// Builder state that needs a certificate authority.
#[derive(Debug)]
pub struct WantsCa {
    addr_or_listener: AddrOrListener,
}

impl ProxyBuilder<WantsCa> {
    /// Set the certificate authority used to mint leaf certificates for intercepted hosts.
    pub fn with_ca<CA: CertificateAuthority>(
        self,
        ca: CA,
    ) -> ProxyBuilder<WantsOptions<CA, Pending<()>>> {
        ProxyBuilder(WantsOptions {
            addr_or_listener: self.0.addr_or_listener,
            ca,
            upstream: None,
            inbound_tls: None,
            client_tls: None,
            monitor: None,
            graceful_shutdown: pending(),
        })
    }
}

/// Builder state that can take additional options.
pub struct WantsOptions<CA, F> {
    addr_or_listener: AddrOrListener,
    ca: CA,
    upstream: Option<String>,
    inbound_tls: Option<ServerConfig>,
    client_tls: Option<ClientConfig>,
    monitor: Option<Monitor>,
    graceful_shutdown: F,
}

impl<CA, F> ProxyBuilder<WantsOptions<CA, F>>
where
    CA: CertificateAuthority,
{
    /// Send all traffic through the proxy at `addr` (`host:port`) instead of intercepting it.
    pub fn with_upstream(mut self, addr: impl Into<String>) -> Self {
        self.0.upstream = Some(addr.into());
        self
    }

    /// Require clients to speak TLS to the proxy itself.
    pub fn with_inbound_tls(mut self, server_config: ServerConfig) -> Self {
        self.0.inbound_tls = Some(server_config);
        self
    }

    /// TLS configuration for connections to origins. Defaults to trusting the webpki roots.
    pub fn with_client_tls_config(mut self, client_config: ClientConfig) -> Self {
        self.0.client_tls = Some(client_config);
        self
    }

    /// Hand every completed exchange to `monitor`.
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.0.monitor = Some(monitor);
        self
    }

    /// Stop accepting connections once `graceful_shutdown` resolves.
    pub fn with_graceful_shutdown<F2>(
        self,
        graceful_shutdown: F2,
    ) -> ProxyBuilder<WantsOptions<CA, F2>>
    where
        F2: Future<Output = ()> + Send + 'static,
    {
        ProxyBuilder(WantsOptions {
            addr_or_listener: self.0.addr_or_listener,
            ca: self.0.ca,
            upstream: self.0.upstream,
            inbound_tls: self.0.inbound_tls,
            client_tls: self.0.client_tls,
            monitor: self.0.monitor,
            graceful_shutdown,
        })
    }

    /// Build the proxy.
    ///
    /// # Errors
    ///
    /// This will return an error if the default TLS configurations cannot be created.
    pub fn build(self) -> Result<Proxy<CA, F>, Error> {
        let provider = Arc::new(aws_lc_rs::default_provider());

        let mut leaf_config = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(ResolvesServerCertUsingSni::new()));
        leaf_config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

        let mut client_config = match self.0.client_tls {
            Some(client_config) => client_config,
            None => default_client_config(provider)?,
        };
        client_config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

        let inbound_tls = self.0.inbound_tls.map(|mut server_config| {
            server_config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
            Arc::new(server_config)
        });

        let upstream = self
            .0
            .upstream
            .map(|upstream| upstream.trim().to_owned())
            .filter(|upstream| !upstream.is_empty());

        Ok(Proxy {
            addr_or_listener: self.0.addr_or_listener,
            shared: Arc::new(Shared {
                certs: LeafCertificateCache::new(self.0.ca),
                leaf_config: Arc::new(leaf_config),
                connector: TlsConnector::from(Arc::new(client_config)),
                upstream,
                monitor: self.0.monitor,
            }),
            inbound_tls,
            graceful_shutdown: self.0.graceful_shutdown,
        })
    }
}

fn default_client_config(provider: Arc<CryptoProvider>) -> Result<ClientConfig, Error> {
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_webpki_roots()
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate_authority::{IdentityConfig, OpensslAuthority};

    fn build_ca(dir: &tempfile::TempDir) -> OpensslAuthority {
        let config =
            IdentityConfig::new(dir.path().join("ca-pk.pem"), dir.path().join("ca-cert.pem"));
        OpensslAuthority::ensure_identity(&config, aws_lc_rs::default_provider()).unwrap()
    }

    #[test]
    fn builds_direct_proxy() {
        let dir = tempfile::tempdir().unwrap();

        let proxy = ProxyBuilder::new()
            .with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_ca(build_ca(&dir))
            .build()
            .unwrap();

        assert!(proxy.shared.upstream.is_none());
        assert!(proxy.inbound_tls.is_none());
        assert_eq!(
            proxy.shared.leaf_config.alpn_protocols,
            vec![ALPN_HTTP1.to_vec()]
        );
    }

    #[test]
    fn blank_upstream_means_direct() {
        let dir = tempfile::tempdir().unwrap();

        let proxy = ProxyBuilder::new()
            .with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_ca(build_ca(&dir))
            .with_upstream("  ")
            .build()
            .unwrap();

        assert!(proxy.shared.upstream.is_none());
    }

    #[test]
    fn keeps_upstream() {
        let dir = tempfile::tempdir().unwrap();

        let proxy = ProxyBuilder::new()
            .with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_ca(build_ca(&dir))
            .with_upstream("proxy.internal:3128")
            .build()
            .unwrap();

        assert_eq!(
            proxy.shared.upstream.as_deref(),
            Some("proxy.internal:3128")
        );
    }

    #[test]
    fn inbound_tls_from_issuer() {
        let dir = tempfile::tempdir().unwrap();
        let ca = build_ca(&dir);
        let server_config = ca.inbound_server_config().unwrap();

        let proxy = ProxyBuilder::new()
            .with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_ca(ca)
            .with_inbound_tls(server_config)
            .build()
            .unwrap();

        assert!(proxy.inbound_tls.is_some());
    }
}
