use crate::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes between `a` and `b` in both directions until either direction stops.
///
/// Returns the result of whichever direction finished first. Both write halves are shut down and
/// both streams are dropped before returning, so the peer of the surviving direction observes the
/// close.
pub async fn relay<A, B>(a: A, b: B) -> Result<(), Error>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = tokio::select! {
        res = tokio::io::copy(&mut a_read, &mut b_write) => {
            res.inspect(|n| debug!("Relay closed after {} bytes forwarded", n))
        }
        res = tokio::io::copy(&mut b_read, &mut a_write) => {
            res.inspect(|n| debug!("Relay closed after {} bytes returned", n))
        }
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    result.map(drop).map_err(Error::Relay)
}
