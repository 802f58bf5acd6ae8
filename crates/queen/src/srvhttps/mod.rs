//! The HTTPS surface: TLS accept loop, per-connection HTTP service, and
//! request dispatch through the mount table.

pub mod handle;
pub mod mux;

use std::convert::Infallible;
use std::io::Error as IoError;
use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode, Uri, Version, header};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_util::sync::CancellationToken;

pub use mux::{Dispatch, HostMux};

use crate::conf::Conf;
use crate::tls::{self, Keycert};

/// Request body as handed to mounted handlers.
pub type ReqBody = BoxBody<Bytes, IoError>;
/// Response body produced by mounted handlers.
pub type ResBody = BoxBody<Bytes, IoError>;

/// Something a pattern can be mounted on. Implemented by cells; tests use
/// stubs.
#[async_trait]
pub trait MountHandler: Send + Sync + 'static {
    /// Produce the response for one request.
    async fn handle(&self, req: Request<ReqBody>, remote_addr: SocketAddr) -> Response<ResBody>;
}

/// The HTTPS listener.
#[derive(Debug)]
pub struct SrvHttps {
    conf: Arc<Conf>,
    mux: Arc<HostMux>,
    shutdown: CancellationToken,
    armed: Mutex<Option<Arc<ServerConfig>>>,
}

impl SrvHttps {
    #[must_use]
    pub fn new(conf: Arc<Conf>, mux: Arc<HostMux>) -> Self {
        Self {
            conf,
            mux,
            shutdown: CancellationToken::new(),
            armed: Mutex::new(None),
        }
    }

    /// Load TLS material and build the hardened server config.
    pub fn arm(&self) -> IoResult<()> {
        tracing::info!(port = self.conf.port_https(), "arming https server");
        let keycert = Keycert::load(&self.conf.cert_path(), &self.conf.key_path())?;
        let config = tls::https_config(&keycert)?;
        *self.armed.lock() = Some(Arc::new(config));
        Ok(())
    }

    /// Accept loop. Runs until [`SrvHttps::close`] is called; a bind
    /// failure is fatal and surfaces to the caller.
    pub async fn fire(&self) -> IoResult<()> {
        let config = self
            .armed
            .lock()
            .take()
            .ok_or_else(|| IoError::other("https server is not armed"))?;
        let port = self.conf.port_https();
        let listener = TcpListener::bind(format!("[::]:{port}")).await?;
        let acceptor = TlsAcceptor::from(config);
        tracing::info!(port, "https server listening");

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!(error = %e, "https accept");
                        continue;
                    }
                },
            };
            let acceptor = acceptor.clone();
            let mux = self.mux.clone();
            let header_timeout = self.conf.timeout_read_header();
            tokio::spawn(serve_conn(acceptor, mux, header_timeout, stream, remote_addr));
        }
        tracing::info!("https server closed");
        Ok(())
    }

    /// Stop accepting. In-flight requests drain naturally. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn serve_conn(
    acceptor: TlsAcceptor,
    mux: Arc<HostMux>,
    header_timeout: std::time::Duration,
    stream: TcpStream,
    remote_addr: SocketAddr,
) {
    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            tracing::debug!(error = %e, %remote_addr, "tls handshake failed");
            return;
        }
    };
    let service = service_fn(move |req: Request<Incoming>| {
        let mux = mux.clone();
        async move {
            let req = req.map(|body| body.map_err(IoError::other).boxed());
            Ok::<_, Infallible>(dispatch(&mux, req, remote_addr).await)
        }
    });
    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout);
    if let Err(e) = builder.serve_connection(TokioIo::new(tls), service).await {
        tracing::debug!(error = %e, %remote_addr, "connection error");
    }
}

/// Host the request names: the request-target authority when present
/// (CONNECT, absolute-form), otherwise the `Host` header.
pub(crate) fn raw_host(uri: &Uri, headers: &HeaderMap) -> String {
    uri.authority()
        .map(|a| a.as_str().to_owned())
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned)
        })
        .unwrap_or_default()
}

/// Route one request through the mount table and run its handler.
pub(crate) async fn dispatch(
    mux: &HostMux,
    req: Request<ReqBody>,
    remote_addr: SocketAddr,
) -> Response<ResBody> {
    let host = raw_host(req.uri(), req.headers());
    tracing::info!(
        "request for \"{host}{}\" by {remote_addr}",
        req.uri().path()
    );

    if req.uri().path() == "*" {
        let mut res = Response::new(handle::empty());
        *res.status_mut() = StatusCode::BAD_REQUEST;
        if req.version() >= Version::HTTP_11 {
            res.headers_mut()
                .insert(header::CONNECTION, header::HeaderValue::from_static("close"));
        }
        return res;
    }

    match mux.handler(req.method(), &host, req.uri().path(), req.uri().query()) {
        Dispatch::Handle { handler, .. } => handler.handle(req, remote_addr).await,
        Dispatch::Redirect { location } => handle::moved_permanently(&location),
        Dispatch::NotFound => handle::not_found(req.uri().path()),
    }
}
