//! The request forwarder: bridges one HTTPS request onto a band.
//!
//! The dialogue per request: send `HttpReqHead`; if the cell answers
//! `HttpResWant`, stream the client body up to the requested cap; then the
//! cell must answer `HttpResHead` followed by body chunks and
//! `HttpResEnd`, which are piped back to the client as they arrive.

use std::collections::HashMap;
use std::io::Error as IoError;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cookie::Cookie;
use futures_util::SinkExt;
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Version, header};
use http_body_util::{BodyExt, StreamBody};
use hlhv_protocol::codec::parse_payload;
use hlhv_protocol::{FrameKind, HttpReqEnd, HttpReqHead, HttpResHead, HttpResWant};
use hyper::body::Frame;

use super::{BandGuard, Cell};
use crate::error::{ProvideError, RelayError};
use crate::srvhttps::{self, MountHandler, ReqBody, ResBody, handle};

/// Request body bytes are forwarded in frames of at most this size.
const BODY_CHUNK: usize = 1024;

#[async_trait]
impl MountHandler for Cell {
    async fn handle(&self, req: Request<ReqBody>, remote_addr: SocketAddr) -> Response<ResBody> {
        self.relay(req, remote_addr).await
    }
}

impl Cell {
    async fn relay(&self, req: Request<ReqBody>, remote_addr: SocketAddr) -> Response<ResBody> {
        tracing::debug!(uuid = %self.uuid(), "handling http request");
        let (parts, body) = req.into_parts();
        let head = build_req_head(&parts, remote_addr);

        // get a band and deliver the request head. a band that fails the
        // write is dead: close it and ask for another.
        let band = loop {
            let band = match self.provide().await {
                Ok(band) => band,
                Err(e @ ProvideError::ServerOverload) => {
                    tracing::error!(uuid = %self.uuid(), error = %e, "cannot provide band");
                    return handle::serv_unavail(&e);
                }
                Err(e @ ProvideError::BandwidthExceeded) => {
                    tracing::error!(uuid = %self.uuid(), error = %e, "cannot provide band");
                    return handle::bad_gateway(&e);
                }
            };
            match band.write_marshal(FrameKind::HttpReqHead, &head).await {
                Ok(()) => break band,
                Err(_) => {
                    band.close();
                    tracing::debug!(uuid = %self.uuid(), "detected closed band, asking for new one");
                }
            }
        };

        // the first frame back tells us whether the cell wants the body
        let (kind, data) = match band.read_frame().await {
            Ok(frame) => frame,
            Err(e) => return fail(band, RelayError::BandClosed(e)),
        };
        let (kind, data) = if kind == FrameKind::HttpResWant {
            let want: HttpResWant = match parse_payload(&data) {
                Ok(want) => want,
                Err(e) => return fail(band, RelayError::BandClosed(e)),
            };
            if let Err(e) = stream_req_body(&band, body, want.max_size, self.timeout_read()).await {
                return fail(band, e);
            }
            match band.read_frame().await {
                Ok(frame) => frame,
                Err(e) => return fail(band, RelayError::BandClosed(e)),
            }
        } else {
            (kind, data)
        };

        if kind != FrameKind::HttpResHead {
            return fail(band, RelayError::UnexpectedFrame(kind));
        }
        let res_head: HttpResHead = match parse_payload(&data) {
            Ok(head) => head,
            Err(e) => return fail(band, RelayError::BandClosed(e)),
        };
        if res_head.status_code < 200 {
            return fail(band, RelayError::BadStatus(res_head.status_code));
        }
        let status = match StatusCode::from_u16(res_head.status_code) {
            Ok(status) => status,
            Err(_) => return fail(band, RelayError::BadStatus(res_head.status_code)),
        };
        let headers = match build_res_headers(&res_head.headers) {
            Ok(headers) => headers,
            Err(e) => return fail(band, e),
        };

        // headers go out now; the body streams through a pump task that
        // owns the band for the rest of the request
        let (tx, rx) = futures_channel::mpsc::channel::<Result<Frame<Bytes>, IoError>>(8);
        tokio::spawn(pump_res_body(band, tx, self.timeout_write()));

        let mut res = Response::new(BodyExt::boxed(StreamBody::new(rx)));
        *res.status_mut() = status;
        *res.headers_mut() = headers;
        res
    }

    fn timeout_read(&self) -> Duration {
        self.conf.timeout_read()
    }

    fn timeout_write(&self) -> Duration {
        self.conf.timeout_write()
    }
}

/// Close the band and answer 502.
fn fail(band: BandGuard, err: RelayError) -> Response<ResBody> {
    band.close();
    tracing::error!(error = %err, "request failed");
    handle::bad_gateway(&err)
}

/// Forward the client body as `HttpReqBody` frames of at most
/// [`BODY_CHUNK`] bytes, stopping at `max_size` bytes total, then send
/// `HttpReqEnd`. A slow or failing client body ends the stream early;
/// bytes past the cap are discarded.
async fn stream_req_body(
    band: &BandGuard,
    mut body: ReqBody,
    max_size: u64,
    timeout_read: Duration,
) -> Result<(), RelayError> {
    let mut remaining = max_size;
    'body: while remaining > 0 {
        let frame = match tokio::time::timeout(timeout_read, body.frame()).await {
            Err(_) | Ok(None) | Ok(Some(Err(_))) => break 'body,
            Ok(Some(Ok(frame))) => frame,
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };
        let mut chunk = &data[..];
        while !chunk.is_empty() && remaining > 0 {
            let cap = remaining.min(BODY_CHUNK as u64) as usize;
            let take = chunk.len().min(cap);
            band.write_frame(FrameKind::HttpReqBody, &chunk[..take])
                .await?;
            remaining -= take as u64;
            chunk = &chunk[take..];
        }
    }
    band.write_marshal(FrameKind::HttpReqEnd, &HttpReqEnd {})
        .await?;
    Ok(())
}

/// Copy response frames to the client until `HttpResEnd`. Cell-side
/// anomalies close the band and surface as a body error (hyper aborts the
/// connection); a vanished or stalled client just ends the pump, leaving
/// the band open.
async fn pump_res_body(
    band: BandGuard,
    mut tx: futures_channel::mpsc::Sender<Result<Frame<Bytes>, IoError>>,
    timeout_write: Duration,
) {
    loop {
        match band.read_frame().await {
            Ok((FrameKind::HttpResEnd, _)) => {
                tracing::debug!("http request done");
                break;
            }
            Ok((FrameKind::HttpResBody, data)) => {
                match tokio::time::timeout(timeout_write, tx.send(Ok(Frame::data(data)))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        tracing::debug!("http request mysteriously died");
                        break;
                    }
                }
            }
            Ok((kind, _)) => {
                band.close();
                let err = RelayError::UnexpectedFrame(kind);
                tracing::error!(error = %err, "request failed mid-body");
                let _ = tx.send(Err(IoError::other(err))).await;
                break;
            }
            Err(e) => {
                band.close();
                let err = RelayError::BandClosed(e);
                tracing::error!(error = %err, "request failed mid-body");
                let _ = tx.send(Err(IoError::other(err))).await;
                break;
            }
        }
    }
}

/// Capture everything a cell needs to know about the request head.
fn build_req_head(parts: &Parts, remote_addr: SocketAddr) -> HttpReqHead {
    let raw_host = srvhttps::raw_host(&parts.uri, &parts.headers);
    let host = crate::srvhttps::mux::strip_host_port(&raw_host).to_owned();
    // a shorter stripped host means a ":port" came off the end
    let port = if raw_host.len() > host.len() {
        raw_host
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
            .unwrap_or(0)
    } else {
        0
    };

    // lowercase and merge header keys; the http layer already stores
    // canonical lowercase names, so collecting preserves multi-values
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in &parts.headers {
        headers
            .entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let mut cookies: HashMap<String, Vec<String>> = HashMap::new();
    for value in parts.headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for cookie in Cookie::split_parse(raw.to_owned()).flatten() {
            cookies
                .entry(cookie.name().to_owned())
                .or_default()
                .push(cookie.value().to_owned());
        }
    }

    let mut query: HashMap<String, Vec<String>> = HashMap::new();
    if let Some(raw) = parts.uri.query() {
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            query
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }

    let (proto, proto_major, proto_minor) = match parts.version {
        Version::HTTP_10 => ("HTTP/1.0", 1, 0),
        Version::HTTP_2 => ("HTTP/2.0", 2, 0),
        _ => ("HTTP/1.1", 1, 1),
    };

    HttpReqHead {
        remote_addr: remote_addr.to_string(),
        method: parts.method.as_str().to_owned(),
        scheme: "https".to_owned(),
        host,
        port,
        path: parts.uri.path().to_owned(),
        fragment: String::new(),
        query,
        proto: proto.to_owned(),
        proto_major,
        proto_minor,
        headers,
        cookies,
    }
}

/// Apply the cell's headers verbatim, multi-values preserved. Garbage
/// names or values are an upstream protocol violation.
fn build_res_headers(raw: &HashMap<String, Vec<String>>) -> Result<HeaderMap, RelayError> {
    let mut headers = HeaderMap::new();
    for (key, values) in raw {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| RelayError::BadHead(e.to_string()))?;
        for value in values {
            let value =
                HeaderValue::from_str(value).map_err(|e| RelayError::BadHead(e.to_string()))?;
            headers.append(&name, value);
        }
    }
    Ok(headers)
}
