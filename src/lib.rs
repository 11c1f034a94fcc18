//! Interloper is an intercepting HTTP/S proxy.
//!
//! - Plain HTTP requests are forwarded to their origin.
//! - CONNECT tunnels carrying TLS are terminated with a leaf certificate minted on the fly by a
//!   local certificate authority, and the decrypted requests are re-sent to the origin over a new
//!   TLS connection.
//! - Tunnels carrying anything else are relayed untouched.
//! - With an upstream proxy configured, all traffic is chained through it with CONNECT instead.
//!
//! Clients have to trust the authority's issuing certificate, written next to its private key by
//! [`certificate_authority::OpensslAuthority::ensure_identity`].

mod body;
mod deadline;
mod decoder;
mod error;
mod proxy;
mod rewind;

pub mod cert_cache;
pub mod certificate_authority;
pub mod config;
pub mod monitor;
pub mod relay;

pub use hyper;
pub use openssl;
pub use tokio_rustls::rustls;

pub use body::Body;
pub use decoder::decode_body;
pub use error::Error;
pub use proxy::*;
