//! Host-qualified request multiplexer.
//!
//! Patterns are opaque `host + path` strings; they are host scoped, so a
//! pattern may never begin with `/`. A pattern ending in `/` matches every
//! unregistered subpath under it, with the longest prefix winning. The
//! matching discipline (trailing-slash redirect, path canonicalisation,
//! longest prefix) follows the stock library mux it grew out of, with the
//! addition of host alias resolution.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::Method;
use parking_lot::RwLock;

use super::MountHandler;
use crate::conf::Conf;
use crate::error::MountError;

/// The mount table: an exact-match map plus prefix entries ordered from
/// longest pattern to shortest.
pub struct HostMux {
    conf: Arc<Conf>,
    state: RwLock<MuxState>,
}

#[derive(Default)]
struct MuxState {
    exact: HashMap<String, MuxEntry>,
    sorted: Vec<MuxEntry>,
}

#[derive(Clone)]
struct MuxEntry {
    pattern: String,
    handler: Arc<dyn MountHandler>,
}

/// Outcome of route resolution for one request.
pub enum Dispatch {
    /// Hand the request to a mounted handler.
    Handle {
        /// The matched handler.
        handler: Arc<dyn MountHandler>,
        /// The pattern that matched.
        pattern: String,
    },
    /// 301 to `location`.
    Redirect {
        /// Target of the redirect, query preserved.
        location: String,
    },
    /// Nothing is mounted here.
    NotFound,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle { pattern, .. } => f.debug_struct("Handle").field("pattern", pattern).finish(),
            Self::Redirect { location } => f.debug_struct("Redirect").field("location", location).finish(),
            Self::NotFound => f.write_str("NotFound"),
        }
    }
}

impl fmt::Debug for HostMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("HostMux")
            .field("patterns", &state.exact.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl HostMux {
    /// An empty mount table resolving aliases through `conf`.
    #[must_use]
    pub fn new(conf: Arc<Conf>) -> Self {
        Self {
            conf,
            state: RwLock::new(MuxState::default()),
        }
    }

    /// Register `handler` for `pattern`. Patterns ending in `/` also match
    /// every unregistered subpath.
    pub fn mount(&self, pattern: &str, handler: Arc<dyn MountHandler>) -> Result<(), MountError> {
        if pattern.is_empty() {
            return Err(MountError::EmptyPattern);
        }
        if pattern.starts_with('/') {
            return Err(MountError::HostlessPattern(pattern.to_owned()));
        }

        let mut state = self.state.write();
        if state.exact.contains_key(pattern) {
            return Err(MountError::AlreadyMounted(pattern.to_owned()));
        }

        let entry = MuxEntry {
            pattern: pattern.to_owned(),
            handler,
        };
        state.exact.insert(pattern.to_owned(), entry.clone());
        if pattern.ends_with('/') {
            // keep sorted by descending pattern length; equal lengths keep
            // insertion order
            let index = state
                .sorted
                .partition_point(|e| e.pattern.len() >= entry.pattern.len());
            state.sorted.insert(index, entry);
        }

        tracing::info!("mount on {pattern}");
        Ok(())
    }

    /// Remove a registration from both indexes.
    pub fn unmount(&self, pattern: &str) -> Result<(), MountError> {
        let mut state = self.state.write();
        if state.exact.remove(pattern).is_none() {
            return Err(MountError::NotMounted(pattern.to_owned()));
        }
        state.sorted.retain(|e| e.pattern != pattern);
        tracing::info!("unmount from {pattern}");
        Ok(())
    }

    /// Resolve the handler for a request.
    ///
    /// `CONNECT` requests use host and path unchanged; everything else has
    /// the port stripped from the host, aliases resolved, and the path
    /// canonicalised (with a redirect when that changes anything).
    #[must_use]
    pub fn handler(
        &self,
        method: &Method,
        raw_host: &str,
        path: &str,
        query: Option<&str>,
    ) -> Dispatch {
        if method == Method::CONNECT {
            let state = self.state.read();
            if should_redirect_to_slash(&state, raw_host, path) {
                return Dispatch::Redirect {
                    location: with_query(&format!("{path}/"), query),
                };
            }
            return match_entry(&state, raw_host, path);
        }

        let host = strip_host_port(raw_host);
        let host = self.conf.resolve_aliases(host);
        let clean = clean_path(path);
        tracing::debug!("resolved to \"{host}{clean}\"");

        let state = self.state.read();
        if should_redirect_to_slash(&state, &host, &clean) {
            return Dispatch::Redirect {
                location: with_query(&format!("{clean}/"), query),
            };
        }
        if clean != path {
            return Dispatch::Redirect {
                location: with_query(&clean, query),
            };
        }
        match_entry(&state, &host, path)
    }
}

/// Exact match first, then the longest registered prefix.
fn match_entry(state: &MuxState, host: &str, path: &str) -> Dispatch {
    let key = format!("{host}{path}");
    if let Some(entry) = state.exact.get(&key) {
        return Dispatch::Handle {
            handler: entry.handler.clone(),
            pattern: entry.pattern.clone(),
        };
    }
    for entry in &state.sorted {
        if key.starts_with(&entry.pattern) {
            return Dispatch::Handle {
                handler: entry.handler.clone(),
                pattern: entry.pattern.clone(),
            };
        }
    }
    Dispatch::NotFound
}

/// A handler for `path + "/"` exists but none for `path` itself.
fn should_redirect_to_slash(state: &MuxState, host: &str, path: &str) -> bool {
    if path.is_empty() || path.ends_with('/') {
        return false;
    }
    let key = format!("{host}{path}");
    !state.exact.contains_key(&key) && state.exact.contains_key(&format!("{key}/"))
}

fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{path}?{query}"),
        _ => path.to_owned(),
    }
}

/// Canonical form of `p`: rooted, `.` and `..` resolved, trailing slash
/// preserved unless the result is `/`.
pub(crate) fn clean_path(p: &str) -> String {
    if p.is_empty() {
        return "/".to_owned();
    }
    let trailing = p.ends_with('/');

    let mut kept: Vec<&str> = Vec::new();
    for segment in p.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                kept.pop();
            }
            segment => kept.push(segment),
        }
    }

    let mut cleaned = String::with_capacity(p.len());
    cleaned.push('/');
    cleaned.push_str(&kept.join("/"));
    if trailing && cleaned != "/" {
        cleaned.push('/');
    }
    cleaned
}

/// `h` without any trailing `":port"`. Returns `h` unchanged when it does
/// not parse as host:port.
pub(crate) fn strip_host_port(h: &str) -> &str {
    if !h.contains(':') {
        return h;
    }
    if h.starts_with('[') {
        // ipv6 literal, [host]:port
        if let Some((host, port)) = h.rsplit_once(':')
            && host.ends_with(']')
            && !port.is_empty()
            && port.bytes().all(|b| b.is_ascii_digit())
        {
            return &host[1..host.len() - 1];
        }
        return h;
    }
    match h.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => h,
    }
}
