//! JSON payload types for the control frames.
//!
//! Field names here are wire format; do not rename without versioning the
//! protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// What a new connection wants to become.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnKind {
    /// A new cell; this connection becomes its leash.
    Cell,
    /// An additional data channel for an existing cell.
    Band,
}

/// Logon request. `uuid` names the owning cell when `conn_kind` is
/// [`ConnKind::Band`]; `key` is the shared connection password for cells
/// and the cell's session key for bands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IAm {
    pub conn_kind: ConnKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub key: String,
}

/// Logon acknowledgement. `key` is the freshly minted session key and is
/// only present when a cell logged on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accept {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Mount request from a cell. The registered pattern is `host + path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub host: String,
    pub path: String,
}

/// Unmount request from a cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Unmount {}

/// Queen asks the cell to dial `count` more bands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeedBand {
    pub count: u32,
}

/// Everything a cell needs to know about an incoming HTTP request, short
/// of the body. Header keys are lowercased; headers, query parameters and
/// cookies are all multi-valued.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpReqHead {
    pub remote_addr: String,
    pub method: String,
    pub scheme: String,
    pub host: String,
    /// Zero when the request carried no explicit port.
    pub port: u16,
    pub path: String,
    pub fragment: String,
    pub query: HashMap<String, Vec<String>>,
    pub proto: String,
    pub proto_major: u8,
    pub proto_minor: u8,
    pub headers: HashMap<String, Vec<String>>,
    pub cookies: HashMap<String, Vec<String>>,
}

/// End of the forwarded request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpReqEnd {}

/// Cell requests the request body, up to `max_size` bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResWant {
    pub max_size: u64,
}

/// Status line and headers of the cell's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResHead {
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
}

/// End of the cell's response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpResEnd {}
