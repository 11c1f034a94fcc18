use hyper::StatusCode;
use openssl::error::ErrorStack;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("unable to generate private key: {0}")]
    KeyGeneration(#[source] ErrorStack),
    #[error("unable to generate self-signed issuing certificate: {0}")]
    CertGeneration(#[source] ErrorStack),
    #[error("invalid signing identity: {0}")]
    Identity(String),
    #[error("unable to issue certificate: {0}")]
    Issuance(#[source] ErrorStack),
    #[error("issuing certificate has expired")]
    IssuerExpired,
    #[error("unable to access underlying connection from client")]
    HijackUnsupported,
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out dialing {0}")]
    Timeout(String),
    #[error("upstream proxy rejected CONNECT with {0}")]
    UpstreamRejected(StatusCode),
    #[error("tunnel closed: {0}")]
    Relay(#[source] io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error("network error: {0}")]
    Network(#[from] hyper::Error),
    #[error("invalid http message: {0}")]
    Http(#[from] http::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unable to decode body")]
    Decode,
}
