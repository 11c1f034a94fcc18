use crate::{
    certificate_authority::{CertificateAuthority, LeafCertificate},
    proxy::{
        internal::{InternalProxy, bad_request, respond, with_https_authority},
        upstream::{self, with_default_port},
    },
    relay::relay,
    rewind::Rewind,
};
use http::uri::Authority;
use hyper::{
    Request,
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use std::{convert::Infallible, io, sync::Arc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
    },
};
use tracing::{Instrument, debug, error, info_span};

/// Presents one leaf regardless of SNI.
#[derive(Debug)]
struct LeafResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Copy of `template` presenting `leaf`.
fn leaf_server_config(template: &ServerConfig, leaf: &LeafCertificate) -> Arc<ServerConfig> {
    let mut server_config = template.clone();
    server_config.cert_resolver = Arc::new(LeafResolver(Arc::clone(leaf.certified_key())));
    Arc::new(server_config)
}

fn is_tls_handshake(sniffed: &[u8]) -> bool {
    sniffed.starts_with(&[0x16, 0x03])
}

/// Read up to two bytes, fewer only if the stream ends first.
async fn sniff<I: AsyncRead + Unpin>(io: &mut I) -> io::Result<Bytes> {
    let mut buffer = [0; 2];
    let mut filled = 0;

    while filled < buffer.len() {
        let bytes_read = io.read(&mut buffer[filled..]).await?;
        if bytes_read == 0 {
            break;
        }
        filled += bytes_read;
    }

    Ok(Bytes::copy_from_slice(&buffer[..filled]))
}

impl<CA: CertificateAuthority> InternalProxy<CA> {
    /// Take over a connection the client believes is tunneled to `authority`.
    ///
    /// TLS is terminated with `leaf` and the decrypted requests are sent to the real origin over a
    /// fresh TLS connection. Anything that does not start with a TLS handshake is relayed to the
    /// origin untouched.
    pub(crate) async fn intercept<I>(
        self,
        mut upgraded: I,
        authority: Authority,
        leaf: LeafCertificate,
    ) where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let sniffed = match sniff(&mut upgraded).await {
            Ok(sniffed) if sniffed.is_empty() => return,
            Ok(sniffed) => sniffed,
            Err(e) => {
                error!("Failed to read from upgraded connection: {}", e);
                return;
            }
        };

        let tls = is_tls_handshake(&sniffed);
        let upgraded = Rewind::new_buffered(upgraded, sniffed);

        if !tls {
            debug!("Not a TLS handshake, tunneling to {}", authority);
            tunnel(upgraded, &authority).await;
            return;
        }

        let server_config = leaf_server_config(&self.shared.leaf_config, &leaf);
        let stream = match TlsAcceptor::from(server_config).accept(upgraded).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to establish TLS connection: {}", e);
                return;
            }
        };

        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = self.clone();
            let authority = authority.clone();

            async move {
                let Some(req) = with_https_authority(req, authority) else {
                    return Ok::<_, Infallible>(bad_request());
                };

                Ok(respond(
                    proxy
                        .direct_request(req)
                        .instrument(info_span!("proxy_request"))
                        .await,
                ))
            }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            debug!("Intercepted connection closed: {}", e);
        }
    }
}

async fn tunnel<I>(upgraded: I, authority: &Authority)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let addr = with_default_port(authority.as_str(), 443);

    let server = match upstream::dial(&addr).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };

    if let Err(e) = relay(upgraded, server).await {
        debug!("{}", e);
    }
}
