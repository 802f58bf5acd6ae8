//! The HLHV queen cell.
//!
//! A TLS-terminating HTTPS front door that forwards each incoming request
//! to one of many backend cells. Cells dial in: each holds one long-lived
//! control connection (its *leash*) and a pool of multiplexed data
//! connections (*bands*) that it opens toward the queen, so cells can live
//! behind NATs and firewalls.
//!
//! The moving parts:
//!
//! - [`wrangler::Wrangler`] accepts cell-facing TLS connections and
//!   classifies each one as a new cell or a band for an existing cell.
//! - [`cells::Cell`] owns a leash, a band pool, and at most one mount; it
//!   forwards HTTP requests over its bands.
//! - [`srvhttps::SrvHttps`] terminates HTTPS and routes requests through
//!   [`srvhttps::HostMux`], a host-qualified longest-prefix multiplexer.
//! - The gardener periodically evicts idle bands.

pub mod cells;
pub mod conf;
pub mod error;
pub mod options;
pub mod scribe;
pub mod srvhttps;
pub mod tls;
pub mod wrangler;

pub use cells::Cell;
pub use conf::Conf;
pub use options::Options;
pub use srvhttps::{HostMux, MountHandler, SrvHttps};
pub use wrangler::{CellStore, Wrangler};
