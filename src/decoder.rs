use crate::Error;
use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder, ZstdDecoder};
use bstr::ByteSlice;
use hyper::{
    body::Bytes,
    header::{CONTENT_ENCODING, HeaderMap, HeaderValue},
};
use std::io::Cursor;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, BufReader};

enum Decoder {
    Bytes(Bytes),
    Decoder(Box<dyn AsyncRead + Send + Unpin>),
}

impl Decoder {
    fn decode(self, encoding: &[u8]) -> Result<Self, Error> {
        if encoding == b"identity" {
            return Ok(self);
        }

        let reader: Box<dyn AsyncBufRead + Send + Unpin> = match self {
            Self::Bytes(bytes) => Box::new(Cursor::new(bytes)),
            Self::Decoder(decoder) => Box::new(BufReader::new(decoder)),
        };

        let decoder: Box<dyn AsyncRead + Send + Unpin> = match encoding {
            b"gzip" | b"x-gzip" => Box::new(GzipDecoder::new(reader)),
            b"deflate" => Box::new(ZlibDecoder::new(reader)),
            b"br" => Box::new(BrotliDecoder::new(reader)),
            b"zstd" => Box::new(ZstdDecoder::new(reader)),
            _ => return Err(Error::Decode),
        };

        Ok(Self::Decoder(decoder))
    }

    async fn into_bytes(self) -> Result<Bytes, Error> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Decoder(mut decoder) => {
                let mut decoded = Vec::new();
                decoder.read_to_end(&mut decoded).await?;
                Ok(Bytes::from(decoded))
            }
        }
    }
}

fn extract_encodings(headers: &HeaderMap<HeaderValue>) -> impl Iterator<Item = &[u8]> {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .rev()
        .flat_map(|val| val.as_bytes().rsplit_str(b",").map(|v| v.trim()))
}

async fn decode_encodings<'a>(
    encodings: impl IntoIterator<Item = &'a [u8]>,
    body: Bytes,
) -> Result<Bytes, Error> {
    let mut decoder = Decoder::Bytes(body);

    for encoding in encodings {
        decoder = decoder.decode(encoding)?;
    }

    decoder.into_bytes().await
}

/// Undo every `content-encoding` listed in `headers` on a fully buffered body.
///
/// # Errors
///
/// Returns [`Error::Decode`] if one of the encodings is not supported, and [`Error::Io`] if the
/// body is not valid for its declared encoding.
pub async fn decode_body(headers: &HeaderMap<HeaderValue>, body: Bytes) -> Result<Bytes, Error> {
    if body.is_empty() {
        return Ok(body);
    }

    decode_encodings(extract_encodings(headers), body).await
}
