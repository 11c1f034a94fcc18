use crate::decoder::decode_body;
use http::{HeaderMap, Method, Request, StatusCode, Version};
use hyper::body::Bytes;
use percent_encoding::percent_decode_str;
use std::{fmt::Write as _, net::SocketAddr};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{Instrument, error, info_span, warn};

const QUEUE_CAPACITY: usize = 64;
const MAX_HEADERS: usize = 128;

const RESET: &str = "\x1b[0m";
const BLACK: &str = "\x1b[30m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";

fn paint(color: &str, text: impl std::fmt::Display) -> String {
    format!("{color}{text}{RESET}")
}

/// One completed request/response pair, as handed to the monitor.
#[derive(Clone, Debug)]
pub struct Exchange {
    pub client_addr: SocketAddr,
    /// The request as it was sent to the origin, serialized in HTTP/1.1 wire format.
    pub request: Bytes,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Response body as received, still content-encoded.
    pub body: Bytes,
}

/// Handle to the traffic dumper.
///
/// Exchanges are queued without waiting; when the queue is full they are dropped.
#[derive(Clone, Debug)]
pub struct Monitor {
    tx: mpsc::Sender<Exchange>,
}

impl Monitor {
    /// Spawns a consumer printing every exchange to standard output.
    pub fn spawn() -> Self {
        Self::with_writer(tokio::io::stdout())
    }

    /// Spawns a consumer printing every exchange to `writer`.
    pub fn with_writer<W>(mut writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Exchange>(QUEUE_CAPACITY);

        let fut = async move {
            while let Some(exchange) = rx.recv().await {
                let dump = render(&exchange).await;

                if let Err(e) = writer.write_all(dump.as_bytes()).await {
                    error!("Failed to write traffic dump: {}", e);
                    break;
                }

                let _ = writer.flush().await;
            }
        };

        tokio::spawn(fut.instrument(info_span!("monitor")));
        Self { tx }
    }

    pub(crate) fn submit(&self, exchange: Exchange) {
        if let Err(e) = self.tx.try_send(exchange) {
            warn!("Dropping traffic dump: {}", e);
        }
    }
}

/// Serialize `req` the way it goes over the wire.
pub(crate) fn dump_request(req: &Request<Bytes>) -> Bytes {
    let mut dump = Vec::with_capacity(256 + req.body().len());
    let target = req
        .uri()
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());

    dump.extend_from_slice(req.method().as_str().as_bytes());
    dump.push(b' ');
    dump.extend_from_slice(target.as_bytes());
    dump.extend_from_slice(b" HTTP/1.1\r\n");

    for (name, value) in req.headers() {
        dump.extend_from_slice(name.as_str().as_bytes());
        dump.extend_from_slice(b": ");
        dump.extend_from_slice(value.as_bytes());
        dump.extend_from_slice(b"\r\n");
    }

    dump.extend_from_slice(b"\r\n");
    dump.extend_from_slice(req.body());
    Bytes::from(dump)
}

fn status_color(status: StatusCode) -> &'static str {
    match status.as_u16() / 100 {
        2 => GREEN,
        3 => YELLOW,
        4 => MAGENTA,
        5 => RED,
        _ => RESET,
    }
}

fn decode_form(body: &[u8]) -> Vec<(String, String)> {
    let decode = |s: &str| {
        percent_decode_str(&s.replace('+', " "))
            .decode_utf8_lossy()
            .into_owned()
    };

    String::from_utf8_lossy(body)
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (decode(key), decode(value)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

/// Render a human readable summary of `exchange`.
pub async fn render(exchange: &Exchange) -> String {
    let mut out = String::new();
    let status = paint(
        status_color(exchange.status),
        format!("<--{}", exchange.status.as_u16()),
    );

    let _ = writeln!(out, "{}", String::from_utf8_lossy(&exchange.request));
    let _ = writeln!(out, "-----------------------");
    let _ = writeln!(out, "{} {}", paint(GREEN, "Request:"), status);

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(&exchange.request) {
        Ok(httparse::Status::Complete(body_offset)) => {
            let method = req.method.unwrap_or_default();
            let host = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .map(|h| String::from_utf8_lossy(h.value).into_owned())
                .unwrap_or_default();

            let _ = writeln!(
                out,
                "{} {}{} {}",
                paint(BLUE, method),
                host,
                req.path.unwrap_or_default(),
                status
            );
            let _ = writeln!(out, "{} {}", paint(BLUE, "RemoteAddr:"), exchange.client_addr);

            let mut form = false;
            for header in req.headers.iter() {
                let value = String::from_utf8_lossy(header.value);
                form |= header.name.eq_ignore_ascii_case("content-type")
                    && value.starts_with("application/x-www-form-urlencoded");
                let _ = writeln!(out, "{}: {}", paint(BLUE, header.name), value);
            }

            if method == Method::POST.as_str() {
                let _ = writeln!(out, "{}", paint(GREEN, "POST Param:"));
                if form {
                    for (key, value) in decode_form(&exchange.request[body_offset..]) {
                        let _ = writeln!(out, "\t{}: {}", paint(BLUE, key), value);
                    }
                }
            }
        }
        Ok(httparse::Status::Partial) => {
            let _ = writeln!(out, "{}", paint(RED, "incomplete request"));
        }
        Err(e) => {
            let _ = writeln!(out, "{} {}", paint(RED, "unparsable request:"), e);
        }
    }

    let _ = writeln!(out, "{}", paint(GREEN, "Response:"));
    let _ = writeln!(out, "{:?} {}", Version::HTTP_11, status);
    for (name, value) in &exchange.headers {
        let _ = writeln!(
            out,
            "{}: {}",
            paint(BLUE, name),
            String::from_utf8_lossy(value.as_bytes())
        );
    }

    match decode_body(&exchange.headers, exchange.body.clone()).await {
        Ok(body) => {
            let _ = writeln!(out, "{}", String::from_utf8_lossy(&body));
        }
        Err(e) => {
            let _ = writeln!(out, "{} {}", paint(RED, "unable to decode body:"), e);
        }
    }

    let _ = writeln!(
        out,
        "{}{}{}",
        paint(BLACK, "####################"),
        paint(CYAN, "END"),
        paint(BLACK, "####################")
    );
    out
}
