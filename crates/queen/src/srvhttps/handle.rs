//! System message pages.
//!
//! Errors the queen generates itself (rather than passing through from a
//! cell) render as a small self-contained HTML page so they are clearly
//! distinguishable from cell output.

use std::fmt::Display;

use bytes::Bytes;
use http::{Response, StatusCode, header};
use http_body_util::{BodyExt, Full};

use super::ResBody;

/// Box a fixed string as a response body.
pub(crate) fn full(text: impl Into<Bytes>) -> ResBody {
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

/// An empty response body.
pub(crate) fn empty() -> ResBody {
    full(Bytes::new())
}

/// Render a system message page with the given status code.
#[must_use]
pub fn sysmsg(code: StatusCode, title: &str, content: &str) -> Response<ResBody> {
    let page = format!(
        r#"<!DOCTYPE html><html><head><title>{title}</title><meta name="viewport" content="width=device-width, initial-scale=1.0"><style>body{{font-family:monospace;max-width:512px;margin:4em auto;background-color:#2b303c;color:#eceff4}}hr{{border:1px solid #4c566a;width:128px;margin:0}}*::selection{{background-color:#4c566a}}</style></head><body><h1>{title}</h1><hr><p>hlhv system message:</p><p>{content}</p></body></html>"#,
    );
    let mut res = Response::new(full(page));
    *res.status_mut() = code;
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    res
}

#[must_use]
pub fn not_found(path: &str) -> Response<ResBody> {
    sysmsg(
        StatusCode::NOT_FOUND,
        "404 - not found",
        &format!("ERR there is no cell mounted on the path {path}"),
    )
}

#[must_use]
pub fn bad_gateway(err: &dyn Display) -> Response<ResBody> {
    sysmsg(
        StatusCode::BAD_GATEWAY,
        "502 - bad gateway",
        &format!("ERR cell couldn't handle http req: {err}"),
    )
}

#[must_use]
pub fn serv_unavail(err: &dyn Display) -> Response<ResBody> {
    sysmsg(
        StatusCode::SERVICE_UNAVAILABLE,
        "503 - service unavailable",
        &format!("ERR this page is unavailable right now: {err}"),
    )
}

/// Permanent redirect preserving nothing but the location.
#[must_use]
pub fn moved_permanently(location: &str) -> Response<ResBody> {
    let mut res = sysmsg(
        StatusCode::MOVED_PERMANENTLY,
        "301 - moved permanently",
        &format!("(i) this page now lives at {location}"),
    );
    if let Ok(value) = header::HeaderValue::from_str(location) {
        res.headers_mut().insert(header::LOCATION, value);
    }
    res
}
